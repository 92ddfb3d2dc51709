use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Information about one file mirrored into the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDescriptor {
    pub name: String,
    pub server_url: String,
    /// Relative to the event cache directory, unique within a configuration.
    pub cache_path: String,
    /// Carried for the server's bookkeeping; never compared locally.
    pub version: String,
}

impl AssetDescriptor {
    pub fn new(
        name: impl Into<String>,
        server_url: impl Into<String>,
        cache_path: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            server_url: server_url.into(),
            cache_path: cache_path.into(),
            version: version.into(),
        }
    }
}

/// Which host flavour is embedding the renderer. Selects the HTML override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Apple,
    #[default]
    Desktop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Hides the exhibitor information panel.
    #[serde(rename = "noOverlay", default)]
    pub suppress_overlay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android_html_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ios_html_url: Option<String>,
    pub files: Vec<AssetDescriptor>,
}

impl Configuration {
    /// Parses and validates a configuration document.
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let config: Configuration = serde_json::from_slice(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for file in &self.files {
            validate_cache_path(&file.cache_path)?;
            if !seen.insert(file.cache_path.as_str()) {
                return Err(ConfigError::DuplicateCachePath(file.cache_path.clone()));
            }
        }
        Ok(())
    }

    /// Bootstrap template override for the given platform, if any.
    pub fn html_override(&self, platform: Platform) -> Option<&str> {
        let url = match platform {
            Platform::Android => self.android_html_url.as_deref(),
            Platform::Apple | Platform::Desktop => self.ios_html_url.as_deref(),
        };
        url.filter(|u| !u.trim().is_empty())
    }

    pub fn find(&self, cache_path: &str) -> Option<&AssetDescriptor> {
        self.files.iter().find(|f| f.cache_path == cache_path)
    }
}

fn validate_cache_path(path: &str) -> Result<(), ConfigError> {
    if path.trim().is_empty() {
        return Err(ConfigError::EmptyCachePath);
    }
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(ConfigError::AbsoluteCachePath(path.to_string()));
    }
    if path.split(|c: char| c == '/' || c == '\\').any(|segment| segment == "..") {
        return Err(ConfigError::EscapingCachePath(path.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed configuration document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("asset with empty cache path")]
    EmptyCachePath,
    #[error("cache path must be relative: {0}")]
    AbsoluteCachePath(String),
    #[error("cache path escapes the cache directory: {0}")]
    EscapingCachePath(String),
    #[error("duplicate cache path: {0}")]
    DuplicateCachePath(String),
}

/// Bridge channel names. They must match the bootstrap document exactly.
pub mod channels {
    pub const READY: &str = "onFpConfiguredHandler";
    pub const BOOTH_CLICK: &str = "onBoothClickHandler";
    pub const DIRECTION: &str = "onDirectionHandler";

    pub const ALL: [&str; 3] = [READY, BOOTH_CLICK, DIRECTION];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub distance: String,
    #[serde(rename = "time")]
    pub duration_seconds: u64,
}

/// Events emitted by the renderer script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    Ready,
    BoothSelected { name: String },
    RouteBuilt(RouteInfo),
}

impl BridgeMessage {
    pub fn decode(channel: &str, payload: &str) -> Result<Self, DecodeError> {
        match channel {
            channels::READY => Ok(Self::Ready),
            channels::BOOTH_CLICK => Ok(Self::BoothSelected {
                name: payload.to_string(),
            }),
            channels::DIRECTION => serde_json::from_str::<RouteInfo>(payload)
                .map(Self::RouteBuilt)
                .map_err(DecodeError::Route),
            other => Err(DecodeError::UnknownChannel(other.to_string())),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            Self::Ready => channels::READY,
            Self::BoothSelected { .. } => channels::BOOTH_CLICK,
            Self::RouteBuilt(_) => channels::DIRECTION,
        }
    }
}

/// Single-string IPC wrapper: `{"channel": "...", "payload": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    pub channel: String,
    #[serde(default)]
    pub payload: String,
}

impl BridgeEnvelope {
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw).map_err(DecodeError::Envelope)
    }

    pub fn decode(&self) -> Result<BridgeMessage, DecodeError> {
        BridgeMessage::decode(&self.channel, &self.payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown bridge channel: {0}")]
    UnknownChannel(String),
    #[error("malformed route payload: {0}")]
    Route(#[source] serde_json::Error),
    #[error("malformed bridge envelope: {0}")]
    Envelope(#[source] serde_json::Error),
}

/// Blue-dot position. `z` names the floor layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: Option<String>,
    #[serde(default)]
    pub angle: Option<f64>,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            angle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub except_inaccessible: bool,
}

/// Commands evaluated against the renderer's global command surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SelectBooth(Option<String>),
    SelectRoute(Option<RouteRequest>),
    SelectCurrentPosition { point: Option<Point>, focus: bool },
    Init,
}

impl Command {
    pub fn to_script(&self) -> String {
        match self {
            Self::SelectBooth(name) => {
                format!("window.floorplan.selectBooth({});", js_arg(name))
            }
            Self::SelectRoute(Some(route)) => format!(
                "window.floorplan.selectRoute({}, {}, {});",
                js_arg(&route.from),
                js_arg(&route.to),
                route.except_inaccessible
            ),
            Self::SelectRoute(None) => "window.floorplan.selectRoute(null, null, false);".to_string(),
            Self::SelectCurrentPosition { point, focus } => format!(
                "window.floorplan.selectCurrentPosition({}, {});",
                js_arg(point),
                focus
            ),
            Self::Init => "init();".to_string(),
        }
    }
}

// JSON is a subset of JS expression syntax, so this also handles quoting.
fn js_arg<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}
