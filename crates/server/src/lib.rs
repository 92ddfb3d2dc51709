use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use fplan_engine::{
    BridgeChannel, BridgeHandlers, Engine, LoadPlan, MetricsSnapshot, ScriptQueue, SessionPhase,
    SessionSnapshot, Settings,
};
use fplan_protocol::{Point, RouteRequest};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

type ApiError = (StatusCode, String);

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Scripts waiting for the page to poll `/bridge/commands`.
    pub queue: Arc<ScriptQueue>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            queue: Arc::new(ScriptQueue::new()),
        }
    }

    pub async fn load(&self, url: &str, online: bool) -> anyhow::Result<LoadPlan> {
        let previous = self.engine.sessions().active().map(|s| s.generation());
        let plan = self
            .engine
            .load(url, online, self.queue.clone(), logging_handlers())
            .await?;
        if previous.is_some_and(|generation| generation != plan.generation) {
            let stale = self.queue.drain();
            tracing::debug!(dropped = stale.len(), "cleared commands of the replaced session");
        }
        Ok(plan)
    }

    fn bridge(&self) -> Result<BridgeChannel, ApiError> {
        self.engine
            .bridge()
            .ok_or_else(|| (StatusCode::CONFLICT, "no event loaded".to_string()))
    }
}

fn logging_handlers() -> BridgeHandlers {
    BridgeHandlers::new()
        .on_ready(|| tracing::info!("floor plan configured"))
        .on_booth_selected(|name| tracing::info!(booth = %name, "booth selected"))
        .on_route_built(|route| {
            tracing::info!(
                distance = %route.distance,
                seconds = route.duration_seconds,
                "route built"
            )
        })
}

pub fn build_router(state: AppState) -> Router {
    let scheme = state.engine.settings().scheme.clone();
    Router::new()
        .route("/health", get(health))
        .route("/api/metrics", get(api_metrics))
        .route("/api/state", get(api_state))
        .route("/api/load", post(api_load))
        .route("/api/booth", post(api_booth))
        .route("/api/route", post(api_route))
        .route("/api/position", post(api_position))
        .route("/api/document-loaded", post(api_document_loaded))
        .route("/bridge", post(bridge_envelope))
        .route("/bridge/commands", get(bridge_commands))
        .route("/bridge/{channel}", post(bridge_message))
        .fallback(content)
        .with_state(Arc::new(state))
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // The bridge drives the embedded renderer; never answer with `*`.
        .layer(local_only_cors(scheme))
}

async fn health() -> &'static str {
    "ok"
}

async fn api_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics().snapshot())
}

#[derive(Debug, Serialize)]
struct StateView {
    phase: SessionPhase,
    session: Option<SessionSnapshot>,
}

async fn api_state(State(state): State<Arc<AppState>>) -> Json<StateView> {
    let session = state.engine.sessions().active();
    Json(StateView {
        phase: session
            .as_ref()
            .map(|s| s.phase())
            .unwrap_or(SessionPhase::Uninitialized),
        session: session.map(|s| s.snapshot()),
    })
}

#[derive(Debug, Deserialize)]
struct LoadInput {
    url: String,
    #[serde(default = "default_online")]
    online: bool,
}

fn default_online() -> bool {
    true
}

async fn api_load(
    State(state): State<Arc<AppState>>,
    Json(input): Json<LoadInput>,
) -> Result<Json<LoadPlan>, ApiError> {
    state
        .load(&input.url, input.online)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct CommandResult {
    /// `false` when buffered until ready or equal to the last applied value.
    issued: bool,
}

#[derive(Debug, Deserialize)]
struct BoothInput {
    #[serde(default)]
    name: Option<String>,
}

async fn api_booth(
    State(state): State<Arc<AppState>>,
    Json(input): Json<BoothInput>,
) -> Result<Json<CommandResult>, ApiError> {
    let issued = state.bridge()?.select_booth(input.name.as_deref());
    Ok(Json(CommandResult { issued }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteInput {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    except_inaccessible: bool,
}

async fn api_route(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RouteInput>,
) -> Result<Json<CommandResult>, ApiError> {
    let route = match (input.from, input.to) {
        (Some(from), Some(to)) => Some(RouteRequest {
            from,
            to,
            except_inaccessible: input.except_inaccessible,
        }),
        (None, None) => None,
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "route needs both `from` and `to`, or neither".to_string(),
            ))
        }
    };
    let issued = state.bridge()?.build_route(route);
    Ok(Json(CommandResult { issued }))
}

#[derive(Debug, Deserialize)]
struct PositionInput {
    #[serde(default)]
    point: Option<Point>,
    #[serde(default)]
    focus: bool,
}

async fn api_position(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PositionInput>,
) -> Result<Json<CommandResult>, ApiError> {
    let issued = state.bridge()?.set_position(input.point, input.focus);
    Ok(Json(CommandResult { issued }))
}

async fn api_document_loaded(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CommandResult>, ApiError> {
    let issued = state.bridge()?.document_loaded();
    Ok(Json(CommandResult { issued }))
}

async fn bridge_message(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    payload: String,
) -> Result<StatusCode, ApiError> {
    accepted(state.bridge()?.dispatch(&channel, &payload))
}

async fn bridge_envelope(
    State(state): State<Arc<AppState>>,
    raw: String,
) -> Result<StatusCode, ApiError> {
    accepted(state.bridge()?.dispatch_envelope(&raw))
}

fn accepted(handled: bool) -> Result<StatusCode, ApiError> {
    if handled {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::BAD_REQUEST, "message dropped".to_string()))
    }
}

async fn bridge_commands(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.queue.drain())
}

/// `GET /<abs path>?q` is answered as `<scheme>:///<abs path>?q`.
async fn content(State(state): State<Arc<AppState>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let address = format!("{}://{path_and_query}", state.engine.settings().scheme);
    let resp = state.engine.content(&address).await;
    match resp.mime {
        Some(mime) if !resp.is_empty() => {
            ([(header::CONTENT_TYPE, mime)], resp.body).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Event to load before accepting requests.
#[derive(Debug, Clone)]
pub struct Startup {
    pub event_url: String,
    pub online: bool,
}

pub async fn serve(
    addr: SocketAddr,
    settings: Settings,
    startup: Option<Startup>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, settings, startup, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    mut settings: Settings,
    startup: Option<Startup>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    // Pages are served over this listener, so they address content path-absolute.
    if settings.content_origin.is_none() {
        settings.content_origin = Some(String::new());
    }
    let state = AppState::new(Engine::new(settings)?);
    let addr = listener.local_addr()?;

    if let Some(startup) = startup {
        let plan = state.load(&startup.event_url, startup.online).await?;
        tracing::info!(
            event = %plan.event_address,
            online = startup.online,
            "open http://{addr}{}",
            plan.document_address
        );
    }

    let app = build_router(state);
    tracing::info!(%addr, "server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    tracing::warn!(%ip, "rejected non-local peer");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_v6) => false,
    }
}

fn local_only_cors(scheme: String) -> CorsLayer {
    use axum::http::HeaderValue;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin, &scheme)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue, scheme: &str) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };

    // Web views that load the bootstrap document through the private scheme.
    if s.get(..scheme.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        && s[scheme.len()..].starts_with("://")
    {
        return true;
    }

    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
