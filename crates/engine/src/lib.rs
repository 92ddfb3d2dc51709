//! Offline cache, content server and bridge for an embedded floor-plan renderer.
//!
//! [`Engine`] ties the pieces together: it resolves which assets back an
//! event, mirrors them into a per-event cache directory, writes the bootstrap
//! document the host web view loads, answers content requests from the mirror
//! and relays bridge traffic for the live session.

pub mod address;
pub mod bootstrap;
pub mod bridge;
pub mod content;
pub mod fetch;
pub mod metrics;
pub mod mime;
pub mod navigation;
pub mod resolver;
pub mod session;
pub mod sync;

pub use address::{normalize_event_address, AddressError, EventContext};
pub use bridge::{BridgeChannel, BridgeHandlers, ScriptEvaluator, ScriptQueue, Selection, SyncState};
pub use content::{ContentResponse, ContentServer};
pub use fetch::{FetchError, Fetcher, HttpFetcher, StaticFetcher};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use navigation::{NavigationDecision, NavigationPolicy};
pub use resolver::ConfigurationResolver;
pub use session::{Session, SessionPhase, SessionRegistry, SessionSnapshot};
pub use sync::{AssetSyncEngine, CacheWriter, PendingDownloads, SyncOutcome, SyncReport};

use anyhow::Context;
use fplan_protocol::{Configuration, Platform};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SCHEME: &str = "fplan";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Parent of the `fplan/` staging directory.
    pub cache_root: PathBuf,
    /// Private scheme content addresses use.
    pub scheme: String,
    /// When set, documents reference content as `<origin>/<abs path>` instead
    /// of `<scheme>:///<abs path>`. An empty origin yields path-absolute URLs.
    pub content_origin: Option<String>,
    pub platform: Platform,
    /// Used instead of the remote configuration document.
    pub configuration_override: Option<Configuration>,
    /// Asset tree copied into a missing cache on offline loads.
    pub bundled_dir: Option<PathBuf>,
    pub fetch_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(dirs::cache_dir().unwrap_or_else(std::env::temp_dir))
    }
}

impl Settings {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            scheme: DEFAULT_SCHEME.to_string(),
            content_origin: None,
            platform: Platform::default(),
            configuration_override: None,
            bundled_dir: None,
            fetch_timeout: Duration::from_secs(30),
        }
    }

    pub fn content_prefix(&self) -> String {
        self.content_origin
            .clone()
            .unwrap_or_else(|| format!("{}://", self.scheme))
    }
}

/// What the host should load after [`Engine::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPlan {
    pub event_address: String,
    #[serde(skip)]
    pub context: EventContext,
    pub document_address: String,
    /// `false` means the host must call [`BridgeChannel::document_loaded`].
    pub auto_init: bool,
    pub generation: u64,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: Settings,
    fetcher: Arc<dyn Fetcher>,
    metrics: EngineMetrics,
    resolver: ConfigurationResolver,
    sync: AssetSyncEngine,
    sessions: SessionRegistry,
    load_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(settings.fetch_timeout).context("build http client")?;
        Ok(Self::with_fetcher(settings, Arc::new(fetcher)))
    }

    pub fn with_fetcher(settings: Settings, fetcher: Arc<dyn Fetcher>) -> Self {
        let metrics = EngineMetrics::default();
        Self {
            inner: Arc::new(EngineInner {
                resolver: ConfigurationResolver::new(fetcher.clone(), metrics.clone()),
                sync: AssetSyncEngine::new(fetcher.clone(), metrics.clone()),
                sessions: SessionRegistry::new(),
                load_lock: tokio::sync::Mutex::new(()),
                settings,
                fetcher,
                metrics,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Prepares the cache and bootstrap document for `url` and makes it the live session.
    ///
    /// Online loads return once the document is written; assets keep
    /// downloading in the background. Loading the live address again returns
    /// the current plan untouched.
    pub async fn load(
        &self,
        url: &str,
        online: bool,
        evaluator: Arc<dyn ScriptEvaluator>,
        handlers: BridgeHandlers,
    ) -> anyhow::Result<LoadPlan> {
        let inner = &self.inner;
        let _loading = inner.load_lock.lock().await;

        let ctx = EventContext::from_url(url, &inner.settings.cache_root)
            .with_context(|| format!("load event {url}"))?;
        if let Some(current) = inner.sessions.get(&ctx.event_address) {
            if !current.is_retired() {
                tracing::debug!(event = %ctx.event_address, "event already loaded");
                return Ok(self.plan_for(&current));
            }
        }

        let override_config = inner.settings.configuration_override.as_ref();
        let config = if online {
            inner.resolver.resolve(&ctx.event_url, override_config).await
        } else {
            override_config
                .cloned()
                .unwrap_or_else(|| resolver::default_configuration(&ctx.event_url))
        };

        let generation = session::next_generation();
        let content = ContentServer::new(
            ctx.clone(),
            &config,
            inner.fetcher.clone(),
            inner.metrics.clone(),
            inner.settings.scheme.clone(),
        );
        let session = Arc::new(Session::new(
            ctx.clone(),
            generation,
            online,
            online,
            evaluator,
            handlers,
            content,
            inner.metrics.clone(),
        ));
        inner.sessions.begin(session.clone());
        tracing::info!(event = %ctx.event_address, online, generation, "loading event");

        let template = if online {
            if let Err(e) = inner.sync.wipe(&ctx).await {
                inner.metrics.record_filesystem_error();
                tracing::warn!(error = %e, dir = %ctx.cache_directory.display(), "cache wipe failed");
            }
            let override_url = config.html_override(inner.settings.platform);
            bootstrap::resolve_template(inner.fetcher.as_ref(), &inner.metrics, override_url).await
        } else {
            let outcome = self.prepare_offline(&config, &ctx, session.pending_downloads()).await;
            session.complete_sync(generation, outcome);
            bootstrap::DEFAULT_TEMPLATE.to_string()
        };

        let base_url = content::content_address(&inner.settings.content_prefix(), &ctx.cache_directory);
        let params = bootstrap::BootstrapParams {
            base_url: &base_url,
            event_id: &ctx.event_id,
            no_overlay: config.suppress_overlay,
            auto_init: online,
        };
        if let Err(e) = bootstrap::write_document(&ctx, &template, &params).await {
            inner.sessions.retire(&ctx.event_address);
            return Err(e).with_context(|| {
                format!("write bootstrap document: {}", ctx.index_path().display())
            });
        }

        if online {
            let completion = session.clone();
            let refresh = inner.sync.spawn_refresh(
                config.files,
                ctx.cache_directory.clone(),
                session.pending_downloads().clone(),
                session.content().writer().clone(),
                move |outcome| {
                    completion.complete_sync(generation, outcome);
                },
            );
            session.track_refresh(refresh.abort_handle());
        }

        Ok(self.plan_for(&session))
    }

    async fn prepare_offline(
        &self,
        config: &Configuration,
        ctx: &EventContext,
        pending: &PendingDownloads,
    ) -> SyncOutcome {
        let inner = &self.inner;
        let outcome = inner
            .sync
            .sync(config, ctx, false, pending, &CacheWriter::new())
            .await;
        if outcome != SyncOutcome::CacheMissing {
            return outcome;
        }
        let Some(bundled) = &inner.settings.bundled_dir else {
            tracing::warn!(event = %ctx.event_address, "offline with no cached assets");
            return outcome;
        };
        match inner.sync.seed_from(bundled, &ctx.cache_directory).await {
            Ok(0) => outcome,
            Ok(copied) => {
                tracing::info!(copied, from = %bundled.display(), "seeded cache from bundled assets");
                SyncOutcome::CacheReady
            }
            Err(e) => {
                inner.metrics.record_filesystem_error();
                tracing::warn!(error = %e, from = %bundled.display(), "seeding from bundled assets failed");
                outcome
            }
        }
    }

    fn plan_for(&self, session: &Session) -> LoadPlan {
        let ctx = session.context();
        LoadPlan {
            event_address: ctx.event_address.clone(),
            context: ctx.clone(),
            document_address: content::content_address(
                &self.inner.settings.content_prefix(),
                &ctx.index_path(),
            ),
            auto_init: session.auto_init(),
            generation: session.generation(),
        }
    }

    /// Answers a `<scheme>://` request from the session owning the path.
    pub async fn content(&self, address: &str) -> ContentResponse {
        let owner = content::address_to_path(&self.inner.settings.scheme, address)
            .and_then(|path| self.inner.sessions.find_by_path(&path));
        match owner {
            Some(session) => session.content().respond(address).await,
            None => {
                self.inner.metrics.record_content_rejected();
                tracing::warn!(%address, "content request matches no session");
                ContentResponse::empty()
            }
        }
    }

    /// Bridge of the live session, if any.
    pub fn bridge(&self) -> Option<BridgeChannel> {
        self.inner.sessions.active().map(BridgeChannel::new)
    }

    pub fn unload(&self) -> Option<Arc<Session>> {
        let active = self.inner.sessions.active()?;
        self.inner.sessions.retire(&active.context().event_address)
    }
}
