//! Renderer sessions and the registry that decides which one is live.

use crate::address::EventContext;
use crate::bridge::{BridgeHandlers, ScriptEvaluator, Selection, SyncState};
use crate::content::ContentServer;
use crate::metrics::EngineMetrics;
use crate::sync::{PendingDownloads, SyncOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

static GENERATION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    Reloading,
}

pub(crate) struct SessionState {
    pub(crate) phase: SessionPhase,
    pub(crate) sync: SyncState,
    pub(crate) last_sync: Option<SyncOutcome>,
}

pub struct Session {
    pub(crate) context: EventContext,
    pub(crate) generation: u64,
    pub(crate) auto_init: bool,
    pub(crate) state: Mutex<SessionState>,
    /// Held from taking a change until its script was evaluated, so the
    /// renderer sees commands in the order the state changed.
    pub(crate) eval_lock: Mutex<()>,
    pub(crate) retired: AtomicBool,
    refresh: Mutex<Option<AbortHandle>>,
    pub(crate) init_requested: AtomicBool,
    pub(crate) pending: PendingDownloads,
    pub(crate) evaluator: Arc<dyn ScriptEvaluator>,
    pub(crate) handlers: BridgeHandlers,
    pub(crate) content: ContentServer,
    pub(crate) metrics: EngineMetrics,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        context: EventContext,
        generation: u64,
        online: bool,
        auto_init: bool,
        evaluator: Arc<dyn ScriptEvaluator>,
        handlers: BridgeHandlers,
        content: ContentServer,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            context,
            generation,
            auto_init,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Loading,
                sync: SyncState {
                    online,
                    ..SyncState::default()
                },
                last_sync: None,
            }),
            eval_lock: Mutex::new(()),
            retired: AtomicBool::new(false),
            refresh: Mutex::new(None),
            init_requested: AtomicBool::new(false),
            pending: PendingDownloads::default(),
            evaluator,
            handlers,
            content,
            metrics,
        }
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn auto_init(&self) -> bool {
        self.auto_init
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn pending_downloads(&self) -> &PendingDownloads {
        &self.pending
    }

    pub fn content(&self) -> &ContentServer {
        &self.content
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn last_sync(&self) -> Option<SyncOutcome> {
        self.state.lock().last_sync.clone()
    }

    /// Records a sync completion. Returns `false` when it belongs to a
    /// superseded generation or the session was retired.
    pub fn complete_sync(&self, generation: u64, outcome: SyncOutcome) -> bool {
        if self.is_retired() || generation != self.generation {
            self.metrics.record_stale_completion();
            tracing::debug!(
                event = %self.context.event_address,
                generation,
                current = self.generation,
                "discarding stale sync completion"
            );
            return false;
        }
        tracing::info!(
            event = %self.context.event_address,
            generation,
            "sync complete"
        );
        self.state.lock().last_sync = Some(outcome);
        true
    }

    /// Ties the background asset refresh to this session's lifetime.
    pub(crate) fn track_refresh(&self, handle: AbortHandle) {
        let mut slot = self.refresh.lock();
        if self.is_retired() {
            handle.abort();
            return;
        }
        *slot = Some(handle);
    }

    /// Stops every write into the mirror before returning.
    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.content.writer().close();
        if let Some(refresh) = self.refresh.lock().take() {
            refresh.abort();
        }
        self.state.lock().phase = SessionPhase::Reloading;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            event_address: self.context.event_address.clone(),
            generation: self.generation,
            phase: state.phase,
            online: state.sync.online,
            auto_init: self.auto_init,
            pending_downloads: self.pending.get(),
            desired: state.sync.desired.clone(),
            applied: state.sync.applied.clone(),
            last_sync: state.last_sync.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub event_address: String,
    pub generation: u64,
    pub phase: SessionPhase,
    pub online: bool,
    pub auto_init: bool,
    pub pending_downloads: usize,
    pub desired: Selection,
    pub applied: Selection,
    pub last_sync: Option<SyncOutcome>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
    active: Option<String>,
}

/// `eventAddress -> Session`, with at most one active entry.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session` as the active one and retires whatever it replaces.
    pub fn begin(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let address = session.context.event_address.clone();
        let replaced = {
            let mut inner = self.inner.lock();
            let previous = inner
                .active
                .take()
                .and_then(|active| inner.sessions.remove(&active));
            let same_address = inner.sessions.remove(&address);
            inner.sessions.insert(address.clone(), session);
            inner.active = Some(address);
            previous.or(same_address)
        };
        if let Some(old) = &replaced {
            old.retire();
            tracing::info!(
                event = %old.context.event_address,
                generation = old.generation,
                "session retired"
            );
        }
        replaced
    }

    pub fn retire(&self, address: &str) -> Option<Arc<Session>> {
        let removed = {
            let mut inner = self.inner.lock();
            if inner.active.as_deref() == Some(address) {
                inner.active = None;
            }
            inner.sessions.remove(address)
        };
        if let Some(session) = &removed {
            session.retire();
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(address).cloned()
    }

    pub fn active(&self) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .active
            .as_ref()
            .and_then(|address| inner.sessions.get(address))
            .cloned()
    }

    /// The session whose cache directory contains `path`, preferring the deepest match.
    pub fn find_by_path(&self, path: &Path) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.content.contains(path))
            .max_by_key(|s| s.context.cache_directory.components().count())
            .cloned()
    }

    pub fn phase(&self) -> SessionPhase {
        self.active()
            .map(|s| s.phase())
            .unwrap_or(SessionPhase::Uninitialized)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bridge::ScriptQueue;
    use crate::fetch::StaticFetcher;
    use crate::sync::SyncReport;
    use fplan_protocol::Configuration;

    pub(crate) fn session(url: &str, root: &Path, online: bool) -> (Arc<Session>, Arc<ScriptQueue>) {
        let queue = Arc::new(ScriptQueue::new());
        (session_with(url, root, online, queue.clone()), queue)
    }

    pub(crate) fn session_with(
        url: &str,
        root: &Path,
        online: bool,
        evaluator: Arc<dyn ScriptEvaluator>,
    ) -> Arc<Session> {
        let ctx = EventContext::from_url(url, root).unwrap();
        let metrics = EngineMetrics::default();
        let config = Configuration {
            suppress_overlay: true,
            android_html_url: None,
            ios_html_url: None,
            files: Vec::new(),
        };
        let content = ContentServer::new(
            ctx.clone(),
            &config,
            Arc::new(StaticFetcher::new()),
            metrics.clone(),
            "fplan",
        );
        Arc::new(Session::new(
            ctx,
            next_generation(),
            online,
            online,
            evaluator,
            BridgeHandlers::default(),
            content,
            metrics,
        ))
    }

    #[test]
    fn generations_increase() {
        let a = next_generation();
        let b = next_generation();
        assert!(b > a);
    }

    #[test]
    fn loading_another_event_retires_the_previous_session() {
        let root = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        assert_eq!(registry.phase(), SessionPhase::Uninitialized);

        let (first, _) = session("https://acme.expofp.com", root.path(), true);
        assert!(registry.begin(first.clone()).is_none());
        assert_eq!(registry.phase(), SessionPhase::Loading);

        let (second, _) = session("https://other.expofp.com", root.path(), true);
        let replaced = registry.begin(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(first.is_retired());
        assert!(first.content().writer().is_closed());
        assert!(!second.content().writer().is_closed());
        assert_eq!(first.phase(), SessionPhase::Reloading);
        assert!(registry.get("acme.expofp.com").is_none());
        assert!(Arc::ptr_eq(&registry.active().unwrap(), &second));
    }

    #[test]
    fn late_completion_of_a_retired_session_is_discarded() {
        let root = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let (first, _) = session("https://acme.expofp.com", root.path(), true);
        let (second, _) = session("https://other.expofp.com", root.path(), true);
        registry.begin(first.clone());
        registry.begin(second.clone());

        let outcome = SyncOutcome::Refreshed(SyncReport::default());
        assert!(!first.complete_sync(first.generation(), outcome.clone()));
        assert!(first.last_sync().is_none());
        assert!(!second.complete_sync(first.generation(), outcome.clone()));
        assert!(second.complete_sync(second.generation(), outcome.clone()));
        assert_eq!(second.last_sync(), Some(outcome));
        assert_eq!(first.metrics.snapshot().stale_completions, 1);
        assert_eq!(second.metrics.snapshot().stale_completions, 1);
    }

    #[tokio::test]
    async fn retiring_aborts_the_tracked_refresh() {
        let root = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let (first, _) = session("https://acme.expofp.com", root.path(), true);
        registry.begin(first.clone());

        let refresh = tokio::spawn(std::future::pending::<()>());
        first.track_refresh(refresh.abort_handle());
        registry.retire("acme.expofp.com");
        assert!(refresh.await.unwrap_err().is_cancelled());

        let late = tokio::spawn(std::future::pending::<()>());
        first.track_refresh(late.abort_handle());
        assert!(late.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn paths_route_to_the_owning_session() {
        let root = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let (acme, _) = session("https://acme.expofp.com", root.path(), false);
        registry.begin(acme.clone());

        let inside = acme.context().cache_directory.join("data/data.js");
        assert!(Arc::ptr_eq(&registry.find_by_path(&inside).unwrap(), &acme));
        assert!(registry.find_by_path(Path::new("/etc/hosts")).is_none());

        assert!(registry.retire("acme.expofp.com").is_some());
        assert!(acme.is_retired());
        assert!(registry.active().is_none());
    }
}
