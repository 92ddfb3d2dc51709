//! Resolves which assets back an event, falling back to a built-in list.

use crate::fetch::Fetcher;
use crate::metrics::EngineMetrics;
use fplan_protocol::{AssetDescriptor, Configuration};
use std::sync::Arc;

/// Location of the configuration document relative to the event URL.
pub const CONFIGURATION_PATH: &str = "packages/master/configuration.json";

const PACKAGE_FILES: &[&str] = &[
    "expofp.js",
    "floorplan.js",
    "vendors~floorplan.js",
    "expofp-overlay.png",
    "free.js",
    "slider.js",
    "fonts/oswald-v17-cyrillic_latin-300.woff2",
    "fonts/oswald-v17-cyrillic_latin-500.woff2",
    "vendor/fa/css/fontawesome-all.min.css",
    "vendor/fa/webfonts/fa-brands-400.woff2",
    "vendor/fa/webfonts/fa-light-300.woff2",
    "vendor/fa/webfonts/fa-regular-400.woff2",
    "vendor/fa/webfonts/fa-solid-900.woff2",
    "vendor/perfect-scrollbar/css/perfect-scrollbar.css",
    "vendor/sanitize-css/sanitize.css",
];

const DATA_FILES: &[&str] = &["fp.svg.js", "data.js", "wf.data.js", "demo.png"];

const LOCALES: &[&str] = &[
    "ar", "de", "es", "fr", "it", "ko", "nl", "pt", "ru", "sv", "th", "tr", "vi", "zh",
];

/// The asset list used whenever the remote configuration is unusable.
pub fn default_configuration(event_url: &str) -> Configuration {
    let base = event_url.trim_end_matches('/');
    let descriptor = |server_path: String, cache_path: String| {
        let name = cache_path
            .rsplit('/')
            .next()
            .unwrap_or(&cache_path)
            .to_string();
        AssetDescriptor::new(name, format!("{base}/{server_path}"), cache_path, "1")
    };

    let data = DATA_FILES
        .iter()
        .map(|f| descriptor(format!("data/{f}"), format!("data/{f}")));
    let packages = PACKAGE_FILES
        .iter()
        .map(|f| descriptor(format!("packages/master/{f}"), f.to_string()));
    let locales = LOCALES.iter().map(|l| {
        descriptor(
            format!("packages/master/locales/{l}.json"),
            format!("locales/{l}.json"),
        )
    });

    Configuration {
        suppress_overlay: true,
        android_html_url: None,
        ios_html_url: None,
        files: data.chain(packages).chain(locales).collect(),
    }
}

#[derive(Clone)]
pub struct ConfigurationResolver {
    fetcher: Arc<dyn Fetcher>,
    metrics: EngineMetrics,
}

impl ConfigurationResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, metrics: EngineMetrics) -> Self {
        Self { fetcher, metrics }
    }

    /// Never fails: every failure path resolves to [`default_configuration`].
    pub async fn resolve(
        &self,
        event_url: &str,
        local_override: Option<&Configuration>,
    ) -> Configuration {
        if let Some(config) = local_override {
            return config.clone();
        }

        let url = format!("{}/{CONFIGURATION_PATH}", event_url.trim_end_matches('/'));
        self.metrics.record_configuration_fetch();
        let body = match self.fetcher.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                self.metrics.record_configuration_fallback();
                tracing::warn!(error = %e, "configuration unreachable, using built-in asset list");
                return default_configuration(event_url);
            }
        };

        match Configuration::from_json(&body) {
            Ok(config) => {
                tracing::debug!(files = config.files.len(), %url, "configuration resolved");
                config
            }
            Err(e) => {
                self.metrics.record_configuration_fallback();
                tracing::warn!(error = %e, %url, "configuration rejected, using built-in asset list");
                default_configuration(event_url)
            }
        }
    }
}
