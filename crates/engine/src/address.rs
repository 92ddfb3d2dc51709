//! Event address normalization and cache partitioning.

use std::path::{Path, PathBuf};
use url::Url;

/// Directory under the cache root that holds every event's mirror.
pub const STAGING_DIR: &str = "fplan";

/// Identity of one floor-plan instance and where its mirror lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Host + path without scheme, `www.`, query or trailing slash.
    pub event_address: String,
    /// Leading label of the host, e.g. `acme` for `acme.expofp.com`.
    pub event_id: String,
    /// Remote base URL every asset is resolved against. Keeps `http` when given, else `https`.
    pub event_url: String,
    pub staging_root: PathBuf,
    pub cache_directory: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid event url {url:?}: {source}")]
    Parse {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("event url has no host: {0}")]
    NoHost(String),
}

impl EventContext {
    pub fn from_url(url: &str, cache_root: &Path) -> Result<Self, AddressError> {
        let event_address = normalize_event_address(url)?;
        let scheme = if url.trim_start().to_ascii_lowercase().starts_with("http://") {
            "http"
        } else {
            "https"
        };
        let event_id = event_address
            .split_once('.')
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        let staging_root = cache_root.join(STAGING_DIR);
        let cache_directory = event_address
            .split('/')
            .fold(staging_root.clone(), |dir, segment| dir.join(segment));
        Ok(Self {
            event_url: format!("{scheme}://{event_address}"),
            event_address,
            event_id,
            staging_root,
            cache_directory,
        })
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_directory.join("index.html")
    }

    /// Remote URL for a path under the cache directory, built from its components.
    pub fn remote_url_for(&self, relative: &Path) -> String {
        let mut url = self.event_url.clone();
        for component in relative.components() {
            if let std::path::Component::Normal(segment) = component {
                url.push('/');
                url.push_str(&segment.to_string_lossy());
            }
        }
        url
    }
}

/// Reduces an event URL to its cache partition key.
///
/// `https://www.acme.expofp.com/floor/?x=1` and `acme.expofp.com/floor` both
/// normalize to `acme.expofp.com/floor`.
pub fn normalize_event_address(raw: &str) -> Result<String, AddressError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&with_scheme).map_err(|source| AddressError::Parse {
        url: raw.to_string(),
        source,
    })?;

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AddressError::NoHost(raw.to_string()))?
        .to_ascii_lowercase();
    let mut host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if let Some(port) = parsed.port() {
        host = format!("{host}:{port}");
    }

    let path: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if path.is_empty() {
        Ok(host)
    } else {
        Ok(format!("{host}/{}", path.join("/")))
    }
}
