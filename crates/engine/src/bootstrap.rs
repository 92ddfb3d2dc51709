//! The HTML shell that loads the renderer script and wires the bridge.

use crate::address::EventContext;
use crate::fetch::Fetcher;
use crate::metrics::EngineMetrics;
use crate::sync::write_file;
use std::io;
use std::path::Path;

pub const URL: &str = "$url#";
pub const EVENT_ID: &str = "$eventId#";
pub const NO_OVERLAY: &str = "$noOverlay#";
pub const AUTO_INIT: &str = "$autoInit#";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapParams<'a> {
    /// Content address of the event cache directory, without trailing slash.
    pub base_url: &'a str,
    pub event_id: &'a str,
    pub no_overlay: bool,
    pub auto_init: bool,
}

/// Substitutes the four placeholders verbatim.
pub fn render(template: &str, params: &BootstrapParams<'_>) -> String {
    template
        .replace(URL, params.base_url)
        .replace(EVENT_ID, params.event_id)
        .replace(NO_OVERLAY, &params.no_overlay.to_string())
        .replace(AUTO_INIT, &params.auto_init.to_string())
}

/// Fetches the platform override template, falling back to the built-in one.
pub async fn resolve_template(
    fetcher: &dyn Fetcher,
    metrics: &EngineMetrics,
    override_url: Option<&str>,
) -> String {
    let Some(url) = override_url else {
        return DEFAULT_TEMPLATE.to_string();
    };
    match fetcher.fetch(url).await {
        Ok(body) => match String::from_utf8(body) {
            Ok(html) if !html.trim().is_empty() => return html,
            _ => tracing::warn!(%url, "html override is empty or not utf-8"),
        },
        Err(e) => tracing::warn!(error = %e, "html override unreachable"),
    }
    metrics.record_template_fallback();
    DEFAULT_TEMPLATE.to_string()
}

/// Renders the template and writes it to `<cache>/index.html`.
pub async fn write_document(
    ctx: &EventContext,
    template: &str,
    params: &BootstrapParams<'_>,
) -> io::Result<()> {
    write_at(&ctx.index_path(), template, params).await
}

async fn write_at(path: &Path, template: &str, params: &BootstrapParams<'_>) -> io::Result<()> {
    write_file(path, render(template, params).as_bytes()).await
}

pub const DEFAULT_TEMPLATE: &str = r###"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="user-scalable=no, initial-scale=1.0, maximum-scale=1.0, width=device-width" />
  <style>
    html, body {
      touch-action: none;
      margin: 0;
      padding: 0;
      height: 100%;
      width: 100%;
      background: #ebebeb;
      position: fixed;
      overflow: hidden;
    }
    @media (max-width: 820px) and (min-width: 500px) {
      html { font-size: 13px; }
    }
    .lds-grid { top: 42vh; margin: 0 auto; display: block; position: relative; width: 64px; height: 64px; }
    .lds-grid div {
      position: absolute; width: 13px; height: 13px; background: #aaa;
      border-radius: 50%; animation: lds-grid 1.2s linear infinite;
    }
    .lds-grid div:nth-child(1) { top: 6px; left: 6px; animation-delay: 0s; }
    .lds-grid div:nth-child(2) { top: 6px; left: 26px; animation-delay: -0.4s; }
    .lds-grid div:nth-child(3) { top: 6px; left: 45px; animation-delay: -0.8s; }
    .lds-grid div:nth-child(4) { top: 26px; left: 6px; animation-delay: -0.4s; }
    .lds-grid div:nth-child(5) { top: 26px; left: 26px; animation-delay: -0.8s; }
    .lds-grid div:nth-child(6) { top: 26px; left: 45px; animation-delay: -1.2s; }
    .lds-grid div:nth-child(7) { top: 45px; left: 6px; animation-delay: -0.8s; }
    .lds-grid div:nth-child(8) { top: 45px; left: 26px; animation-delay: -1.2s; }
    .lds-grid div:nth-child(9) { top: 45px; left: 45px; animation-delay: -1.6s; }
    @keyframes lds-grid { 0%, 100% { opacity: 1; } 50% { opacity: 0.5; } }
  </style>
</head>
<body>
<div id="floorplan">
  <div class="lds-grid"><div></div><div></div><div></div><div></div><div></div><div></div><div></div><div></div><div></div></div>
</div>
<script>
  // Native message handlers first, then single-string IPC, then the local HTTP bridge.
  function postBridge(channel, payload) {
    const handler = window.webkit?.messageHandlers?.[channel];
    if (handler) {
      handler.postMessage(payload);
      return;
    }
    if (window.ipc?.postMessage) {
      window.ipc.postMessage(JSON.stringify({ channel: channel, payload: payload }));
      return;
    }
    fetch("/bridge/" + channel, { method: "POST", body: payload }).catch(function () {});
  }

  function pollCommands() {
    if (window.webkit?.messageHandlers || window.ipc) return;
    setInterval(function () {
      fetch("/bridge/commands", { cache: "no-store" })
        .then(function (r) { return r.ok ? r.json() : []; })
        .then(function (scripts) { scripts.forEach(function (s) { (0, eval)(s); }); })
        .catch(function () {});
    }, 500);
  }

  function initFloorplan() {
    window.floorplan = new ExpoFP.FloorPlan({
      element: document.querySelector("#floorplan"),
      dataUrl: "$url#/data/",
      eventId: "$eventId#",
      noOverlay: $noOverlay#,
      onBoothClick: function (e) {
        postBridge("onBoothClickHandler", e.target.name);
      },
      onFpConfigured: function () {
        postBridge("onFpConfiguredHandler", "FLOOR PLAN CONFIGURED");
      },
      onDirection: function (e) {
        postBridge("onDirectionHandler", JSON.stringify(e));
      }
    });
  }

  function init() {
    if (window.floorplanScriptRequested) return;
    window.floorplanScriptRequested = true;
    const script = document.createElement("script");
    script.src = "$url#/expofp.js";
    script.crossOrigin = "anonymous";
    script.onload = initFloorplan;
    document.body.appendChild(script);
  }

  pollCommands();
  if ($autoInit#) {
    init();
  }
</script>
</body>
</html>
"###;
