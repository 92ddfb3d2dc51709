//! Mirrors a configuration's assets into an event cache directory.
//!
//! Online loads wipe the staging root and refetch everything; there is no
//! per-file version diffing. Offline loads never touch the network and only
//! report whether a previous mirror exists. Per-file failures are logged,
//! counted and otherwise swallowed: the file is left empty and the content
//! server retries it lazily.
//!
//! Every write into a mirror goes through the owning session's
//! [`CacheWriter`]; once it is closed, late downloads are dropped on the floor.

use crate::address::EventContext;
use crate::fetch::Fetcher;
use crate::metrics::EngineMetrics;
use anyhow::Context;
use fplan_protocol::{AssetDescriptor, Configuration};
use parking_lot::RwLock;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncOutcome {
    /// Online refresh finished; every described file was attempted.
    Refreshed(SyncReport),
    /// Offline and a mirror already exists.
    CacheReady,
    /// Offline with nothing cached; the caller falls back to bundled content.
    CacheMissing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub fetched: usize,
    /// Cache paths whose download failed and were written empty.
    pub failed: Vec<String>,
    pub bytes: u64,
}

impl SyncReport {
    pub fn settled(&self) -> usize {
        self.fetched + self.failed.len()
    }

    fn record(&mut self, settled: FileSettled) {
        self.bytes += settled.bytes;
        if settled.fetched {
            self.fetched += 1;
        } else {
            self.failed.push(settled.cache_path);
        }
    }
}

/// Number of in-flight asset downloads for one session.
#[derive(Debug, Clone, Default)]
pub struct PendingDownloads(Arc<AtomicUsize>);

impl PendingDownloads {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn start(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Write gate for one session's mirror.
///
/// Writes hold the read side for their whole duration, so once
/// [`close`](Self::close) returns no write is in flight and none will start.
#[derive(Debug, Default)]
pub struct CacheWriter {
    closed: RwLock<bool>,
}

impl CacheWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Blocks until in-flight writes finished.
    pub fn close(&self) {
        *self.closed.write() = true;
    }

    /// Writes `body` to `path`, creating parents. `Ok(false)` once closed.
    pub async fn write(self: &Arc<Self>, path: &Path, body: Vec<u8>) -> io::Result<bool> {
        let gate = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || gate.write_blocking(&path, &body))
            .await
            .map_err(io::Error::other)?
    }

    fn write_blocking(&self, path: &Path, body: &[u8]) -> io::Result<bool> {
        let closed = self.closed.read();
        if *closed {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
        Ok(true)
    }
}

struct FileSettled {
    cache_path: String,
    fetched: bool,
    bytes: u64,
}

#[derive(Clone)]
pub struct AssetSyncEngine {
    fetcher: Arc<dyn Fetcher>,
    metrics: EngineMetrics,
}

impl AssetSyncEngine {
    pub fn new(fetcher: Arc<dyn Fetcher>, metrics: EngineMetrics) -> Self {
        Self { fetcher, metrics }
    }

    pub async fn sync(
        &self,
        config: &Configuration,
        ctx: &EventContext,
        online: bool,
        pending: &PendingDownloads,
        writer: &Arc<CacheWriter>,
    ) -> SyncOutcome {
        if !online {
            return if dir_exists(&ctx.cache_directory).await {
                SyncOutcome::CacheReady
            } else {
                SyncOutcome::CacheMissing
            };
        }

        if let Err(e) = self.wipe(ctx).await {
            self.metrics.record_filesystem_error();
            tracing::warn!(error = %e, dir = %ctx.cache_directory.display(), "cache wipe failed");
        }
        let report = self
            .fetch_all(&config.files, &ctx.cache_directory, pending, writer)
            .await;
        SyncOutcome::Refreshed(report)
    }

    /// Runs [`sync`](Self::sync) on the runtime; `on_complete` fires exactly once.
    pub fn spawn<F>(
        &self,
        config: Configuration,
        ctx: EventContext,
        online: bool,
        pending: PendingDownloads,
        writer: Arc<CacheWriter>,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(SyncOutcome) + Send + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.sync(&config, &ctx, online, &pending, &writer).await;
            on_complete(outcome);
        })
    }

    /// Fetch phase only, for callers that already wiped and wrote the bootstrap document.
    ///
    /// Aborting the returned task aborts every download it started.
    pub fn spawn_refresh<F>(
        &self,
        files: Vec<AssetDescriptor>,
        directory: PathBuf,
        pending: PendingDownloads,
        writer: Arc<CacheWriter>,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(SyncOutcome) + Send + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move {
            let report = engine
                .fetch_all(&files, &directory, &pending, &writer)
                .await;
            on_complete(SyncOutcome::Refreshed(report));
        })
    }

    /// Deletes the staging root and the event directory, then recreates the latter.
    pub async fn wipe(&self, ctx: &EventContext) -> io::Result<()> {
        remove_dir_if_present(&ctx.staging_root).await?;
        remove_dir_if_present(&ctx.cache_directory).await?;
        tokio::fs::create_dir_all(&ctx.cache_directory).await
    }

    /// Fetches every file concurrently; returns once all of them settled.
    pub async fn fetch_all(
        &self,
        files: &[AssetDescriptor],
        directory: &Path,
        pending: &PendingDownloads,
        writer: &Arc<CacheWriter>,
    ) -> SyncReport {
        // Dropping the set (the caller was aborted) aborts the downloads too.
        let mut tasks = JoinSet::new();
        for file in files.iter().cloned() {
            let fetcher = self.fetcher.clone();
            let metrics = self.metrics.clone();
            let writer = writer.clone();
            let path = directory.join(&file.cache_path);
            pending.start();
            tasks.spawn(async move {
                fetch_one(fetcher.as_ref(), &metrics, &writer, file, &path).await
            });
        }

        let mut report = SyncReport {
            total: files.len(),
            ..SyncReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            pending.finish();
            match joined {
                Ok(settled) => report.record(settled),
                Err(e) => tracing::warn!(error = %e, "asset download task failed"),
            }
        }
        tracing::info!(
            total = report.total,
            fetched = report.fetched,
            failed = report.failed.len(),
            bytes = report.bytes,
            dir = %directory.display(),
            "asset sync settled"
        );
        report
    }

    /// Copies a bundled asset tree into `target`. Returns the number of files copied.
    pub async fn seed_from(&self, bundled: &Path, target: &Path) -> anyhow::Result<usize> {
        let (src, dst) = (bundled.to_path_buf(), target.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst)).await?
    }
}

async fn fetch_one(
    fetcher: &dyn Fetcher,
    metrics: &EngineMetrics,
    writer: &Arc<CacheWriter>,
    file: AssetDescriptor,
    path: &Path,
) -> FileSettled {
    let body = match fetcher.fetch(&file.server_url).await {
        Ok(body) => {
            metrics.record_asset_fetched();
            Some(body)
        }
        Err(e) => {
            metrics.record_asset_failure();
            tracing::warn!(error = %e, asset = %file.name, "asset download failed");
            None
        }
    };
    let fetched = body.is_some();
    let body = body.unwrap_or_default();
    let bytes = body.len() as u64;
    match writer.write(path, body).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(asset = %file.name, "session closed, download discarded");
        }
        Err(e) => {
            metrics.record_filesystem_error();
            tracing::warn!(error = %e, path = %path.display(), "asset write failed");
        }
    }
    FileSettled {
        cache_path: file.cache_path,
        fetched,
        bytes,
    }
}

pub(crate) async fn write_file(path: &Path, body: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await
}

async fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn dir_exists(dir: &Path) -> bool {
    tokio::fs::metadata(dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<usize> {
    let mut copied = 0;
    for entry in jwalk::WalkDir::new(src).skip_hidden(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let from = entry.path();
        let to = dst.join(from.strip_prefix(src)?);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        std::fs::copy(&from, &to).with_context(|| format!("copy {}", from.display()))?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, StaticFetcher};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(files: &[(&str, &str)]) -> Configuration {
        Configuration {
            suppress_overlay: true,
            android_html_url: None,
            ios_html_url: None,
            files: files
                .iter()
                .map(|(url, path)| AssetDescriptor::new(*path, *url, *path, "1"))
                .collect(),
        }
    }

    fn engine(fetcher: Arc<dyn Fetcher>) -> (AssetSyncEngine, EngineMetrics) {
        let metrics = EngineMetrics::default();
        (AssetSyncEngine::new(fetcher, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn online_sync_replaces_previous_mirror() {
        let root = tempfile::tempdir().unwrap();
        let ctx = EventContext::from_url("https://acme.expofp.com", root.path()).unwrap();
        let other = EventContext::from_url("https://other.expofp.com", root.path()).unwrap();
        std::fs::create_dir_all(ctx.cache_directory.join("old")).unwrap();
        std::fs::write(ctx.cache_directory.join("old/stale.js"), "stale").unwrap();
        std::fs::create_dir_all(&other.cache_directory).unwrap();
        std::fs::write(other.cache_directory.join("x.js"), "x").unwrap();

        let fetcher = Arc::new(
            StaticFetcher::new()
                .with("https://cdn/expofp.js", "core")
                .with("https://cdn/fonts/a.woff2", vec![0u8, 1, 2]),
        );
        let (sync, metrics) = engine(fetcher.clone());
        let cfg = config(&[
            ("https://cdn/expofp.js", "expofp.js"),
            ("https://cdn/fonts/a.woff2", "fonts/a.woff2"),
            ("https://cdn/missing.js", "vendor/missing.js"),
        ]);
        let pending = PendingDownloads::default();

        let outcome = sync
            .sync(&cfg, &ctx, true, &pending, &CacheWriter::new())
            .await;

        let SyncOutcome::Refreshed(report) = outcome else {
            panic!("expected a refresh");
        };
        assert_eq!(report.total, 3);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.failed, vec!["vendor/missing.js".to_string()]);
        assert_eq!(pending.get(), 0);

        let dir = &ctx.cache_directory;
        assert_eq!(std::fs::read(dir.join("expofp.js")).unwrap(), b"core");
        assert_eq!(std::fs::read(dir.join("fonts/a.woff2")).unwrap(), vec![0u8, 1, 2]);
        assert_eq!(std::fs::read(dir.join("vendor/missing.js")).unwrap().len(), 0);
        assert!(!dir.join("old/stale.js").exists());
        assert!(!other.cache_directory.exists());
        assert_eq!(fetcher.request_count(), 3);
        assert_eq!(metrics.snapshot().asset_failures, 1);
    }

    #[tokio::test]
    async fn offline_sync_never_fetches_and_keeps_cache() {
        let root = tempfile::tempdir().unwrap();
        let ctx = EventContext::from_url("https://acme.expofp.com", root.path()).unwrap();
        let fetcher = Arc::new(StaticFetcher::new().with("https://cdn/a.js", "fresh"));
        let (sync, _) = engine(fetcher.clone());
        let cfg = config(&[("https://cdn/a.js", "a.js")]);
        let pending = PendingDownloads::default();

        assert_eq!(
            sync.sync(&cfg, &ctx, false, &pending, &CacheWriter::new()).await,
            SyncOutcome::CacheMissing
        );

        std::fs::create_dir_all(&ctx.cache_directory).unwrap();
        std::fs::write(ctx.cache_directory.join("a.js"), "cached").unwrap();
        assert_eq!(
            sync.sync(&cfg, &ctx, false, &pending, &CacheWriter::new()).await,
            SyncOutcome::CacheReady
        );
        assert_eq!(
            std::fs::read_to_string(ctx.cache_directory.join("a.js")).unwrap(),
            "cached"
        );
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn seeding_copies_bundled_tree() {
        let bundled = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(bundled.path().join("data")).unwrap();
        std::fs::write(bundled.path().join("expofp.js"), "core").unwrap();
        std::fs::write(bundled.path().join("data/data.js"), "data").unwrap();
        let target = tempfile::tempdir().unwrap();
        let dst = target.path().join("fplan/acme.expofp.com");

        let (sync, _) = engine(Arc::new(StaticFetcher::new()));
        let copied = sync.seed_from(bundled.path(), &dst).await.unwrap();
        assert_eq!(copied, 2);
        assert_eq!(std::fs::read_to_string(dst.join("data/data.js")).unwrap(), "data");
    }

    #[tokio::test]
    async fn closed_writer_discards_downloads() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("fplan/acme.expofp.com");
        let fetcher = Arc::new(StaticFetcher::new().with("https://cdn/a.js", "late"));
        let (sync, metrics) = engine(fetcher.clone());
        let writer = CacheWriter::new();
        writer.close();
        assert!(writer.is_closed());

        let cfg = config(&[("https://cdn/a.js", "a.js")]);
        let report = sync
            .fetch_all(&cfg.files, &dir, &PendingDownloads::default(), &writer)
            .await;
        assert_eq!(report.fetched, 1);
        assert_eq!(fetcher.request_count(), 1);
        assert!(!dir.exists());
        assert_eq!(metrics.snapshot().filesystem_errors, 0);
    }

    /// Answers after a per-URL delay and counts how many requests settled.
    struct JitterFetcher {
        delays: HashMap<String, u64>,
        settled: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for JitterFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let delay = self.delays.get(url).copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.settled.fetch_add(1, Ordering::SeqCst);
            if delay % 7 == 0 {
                return Err(FetchError::Unavailable(url.to_string()));
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_fires_once_after_all_files_settle_in_any_order() {
        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let files: Vec<(String, String)> = (0..50)
                .map(|i| (format!("https://cdn/{i}.js"), format!("chunk/{i}.js")))
                .collect();
            let delays = files
                .iter()
                .map(|(url, _)| (url.clone(), rng.gen_range(0..25)))
                .collect();
            let fetcher = Arc::new(JitterFetcher {
                delays,
                settled: AtomicUsize::new(0),
            });

            let root = tempfile::tempdir().unwrap();
            let ctx = EventContext::from_url("https://acme.expofp.com", root.path()).unwrap();
            let refs: Vec<(&str, &str)> = files
                .iter()
                .map(|(u, p)| (u.as_str(), p.as_str()))
                .collect();
            let cfg = config(&refs);
            let (sync, _) = engine(fetcher.clone());

            let fired = Arc::new(AtomicUsize::new(0));
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            let observed = fetcher.clone();
            let fired_in_callback = fired.clone();
            let handle = sync.spawn(
                cfg,
                ctx.clone(),
                true,
                PendingDownloads::default(),
                CacheWriter::new(),
                move |outcome| {
                    fired_in_callback.fetch_add(1, Ordering::SeqCst);
                    let _ = done_tx.send((outcome, observed.settled.load(Ordering::SeqCst)));
                },
            );
            handle.await.unwrap();

            let (outcome, settled_at_completion) = done_rx.await.unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 1, "seed {seed}");
            assert_eq!(settled_at_completion, 50, "seed {seed}");
            let SyncOutcome::Refreshed(report) = outcome else {
                panic!("seed {seed}: expected refresh");
            };
            assert_eq!(report.settled(), 50, "seed {seed}");
            for (_, path) in &files {
                assert!(ctx.cache_directory.join(path).is_file(), "seed {seed}: {path}");
            }
        }
    }
}
