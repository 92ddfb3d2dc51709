//! Counters for the degraded paths that never surface as errors.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    configuration_fetches: AtomicU64,
    configuration_fallbacks: AtomicU64,
    template_fallbacks: AtomicU64,
    assets_fetched: AtomicU64,
    asset_failures: AtomicU64,
    filesystem_errors: AtomicU64,
    content_hits: AtomicU64,
    content_misses: AtomicU64,
    content_rejected: AtomicU64,
    on_demand_failures: AtomicU64,
    bridge_messages: AtomicU64,
    bridge_rejected: AtomicU64,
    commands_issued: AtomicU64,
    commands_skipped: AtomicU64,
    stale_completions: AtomicU64,
}

macro_rules! recorders {
    ($($method:ident => $field:ident),* $(,)?) => {
        impl EngineMetrics {
            $(
                pub fn $method(&self) {
                    self.inner.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

recorders! {
    record_configuration_fetch => configuration_fetches,
    record_configuration_fallback => configuration_fallbacks,
    record_template_fallback => template_fallbacks,
    record_asset_fetched => assets_fetched,
    record_asset_failure => asset_failures,
    record_filesystem_error => filesystem_errors,
    record_content_hit => content_hits,
    record_content_miss => content_misses,
    record_content_rejected => content_rejected,
    record_on_demand_failure => on_demand_failures,
    record_bridge_message => bridge_messages,
    record_bridge_rejected => bridge_rejected,
    record_command_issued => commands_issued,
    record_command_skipped => commands_skipped,
    record_stale_completion => stale_completions,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        MetricsSnapshot {
            configuration_fetches: load(&c.configuration_fetches),
            configuration_fallbacks: load(&c.configuration_fallbacks),
            template_fallbacks: load(&c.template_fallbacks),
            assets_fetched: load(&c.assets_fetched),
            asset_failures: load(&c.asset_failures),
            filesystem_errors: load(&c.filesystem_errors),
            content_hits: load(&c.content_hits),
            content_misses: load(&c.content_misses),
            content_rejected: load(&c.content_rejected),
            on_demand_failures: load(&c.on_demand_failures),
            bridge_messages: load(&c.bridge_messages),
            bridge_rejected: load(&c.bridge_rejected),
            commands_issued: load(&c.commands_issued),
            commands_skipped: load(&c.commands_skipped),
            stale_completions: load(&c.stale_completions),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub configuration_fetches: u64,
    pub configuration_fallbacks: u64,
    pub template_fallbacks: u64,
    pub assets_fetched: u64,
    pub asset_failures: u64,
    pub filesystem_errors: u64,
    pub content_hits: u64,
    pub content_misses: u64,
    pub content_rejected: u64,
    pub on_demand_failures: u64,
    pub bridge_messages: u64,
    pub bridge_rejected: u64,
    pub commands_issued: u64,
    pub commands_skipped: u64,
    pub stale_completions: u64,
}
