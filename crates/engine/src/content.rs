//! Serves `<scheme>://<absolute cache path>` requests from the event mirror,
//! downloading absent files on demand.

use crate::address::EventContext;
use crate::fetch::Fetcher;
use crate::metrics::EngineMetrics;
use crate::mime;
use crate::sync::CacheWriter;
use fplan_protocol::Configuration;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentResponse {
    /// `None` when there is nothing to serve.
    pub mime: Option<&'static str>,
    pub body: Vec<u8>,
}

impl ContentResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }
}

/// Address for an absolute path, e.g. `fplan:///var/cache/fplan/acme.expofp.com`.
///
/// `prefix` is `<scheme>://`, or an origin (possibly empty) for hosts served
/// over plain HTTP.
pub fn content_address(prefix: &str, path: &Path) -> String {
    let mut out = prefix.to_string();
    for component in path.components() {
        if let Component::Normal(segment) = component {
            out.push('/');
            out.extend(utf8_percent_encode(&segment.to_string_lossy(), SEGMENT));
        }
    }
    out
}

/// Maps a content address back to the file it names.
///
/// Returns `None` for other schemes, undecodable paths and `..` segments.
pub fn address_to_path(scheme: &str, address: &str) -> Option<PathBuf> {
    let (found, rest) = address.split_once("://")?;
    if !found.eq_ignore_ascii_case(scheme) {
        return None;
    }
    let end = rest.find(['?', '#']).unwrap_or(rest.len());
    let decoded = percent_decode_str(&rest[..end]).decode_utf8().ok()?;
    if !decoded.starts_with('/') || decoded.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(PathBuf::from(decoded.into_owned()))
}

/// Content server bound to one event mirror.
#[derive(Clone)]
pub struct ContentServer {
    ctx: EventContext,
    /// `cachePath -> serverUrl` for every described asset.
    manifest: Arc<HashMap<String, String>>,
    fetcher: Arc<dyn Fetcher>,
    metrics: EngineMetrics,
    scheme: String,
    writer: Arc<CacheWriter>,
}

impl ContentServer {
    pub fn new(
        ctx: EventContext,
        config: &Configuration,
        fetcher: Arc<dyn Fetcher>,
        metrics: EngineMetrics,
        scheme: impl Into<String>,
    ) -> Self {
        let manifest = config
            .files
            .iter()
            .map(|f| (f.cache_path.clone(), f.server_url.clone()))
            .collect();
        Self {
            ctx,
            manifest: Arc::new(manifest),
            fetcher,
            metrics,
            scheme: scheme.into(),
            writer: CacheWriter::new(),
        }
    }

    pub fn context(&self) -> &EventContext {
        &self.ctx
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.ctx.cache_directory)
    }

    /// Gate for every write into this mirror, downloads included.
    pub fn writer(&self) -> &Arc<CacheWriter> {
        &self.writer
    }

    pub async fn respond(&self, address: &str) -> ContentResponse {
        let Some(path) = address_to_path(&self.scheme, address).filter(|p| self.contains(p))
        else {
            self.metrics.record_content_rejected();
            tracing::warn!(%address, "content request outside the event cache rejected");
            return ContentResponse::empty();
        };
        if path == self.ctx.cache_directory || is_dir(&path).await {
            self.metrics.record_content_rejected();
            tracing::warn!(%address, "content request names a directory");
            return ContentResponse::empty();
        }

        match tokio::fs::read(&path).await {
            Ok(body) if !body.is_empty() => {
                self.metrics.record_content_hit();
                return ContentResponse {
                    mime: Some(mime::from_path(&path)),
                    body,
                };
            }
            _ => self.metrics.record_content_miss(),
        }

        let remote = self.remote_url(&path);
        let body = match self.fetcher.fetch(&remote).await {
            Ok(body) if !body.is_empty() => body,
            Ok(_) => {
                self.metrics.record_on_demand_failure();
                tracing::warn!(url = %remote, "on-demand download returned no data");
                return ContentResponse::empty();
            }
            Err(e) => {
                self.metrics.record_on_demand_failure();
                tracing::warn!(error = %e, "on-demand download failed");
                return ContentResponse::empty();
            }
        };

        match self.writer.write(&path, body.clone()).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(path = %path.display(), "session closed, not cached"),
            Err(e) => {
                self.metrics.record_filesystem_error();
                tracing::warn!(error = %e, path = %path.display(), "on-demand write failed");
            }
        }
        ContentResponse {
            mime: Some(mime::from_path(&path)),
            body,
        }
    }

    fn remote_url(&self, path: &Path) -> String {
        let relative = path
            .strip_prefix(&self.ctx.cache_directory)
            .unwrap_or(path);
        let cache_path = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        match self.manifest.get(&cache_path) {
            Some(server_url) => server_url.clone(),
            None => self.ctx.remote_url_for(relative),
        }
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
