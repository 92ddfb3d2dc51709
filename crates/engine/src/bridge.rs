//! Typed channel between the renderer script and the host.
//!
//! Inbound messages arrive as `(channel, payload)` pairs and are decoded
//! into [`BridgeMessage`]s. Outbound calls record the desired selection and
//! only reach the renderer once it reported ready, and only when the value
//! differs from what was last applied. Per session, scripts are evaluated in
//! the order their state changes were taken.

use crate::session::{Session, SessionPhase};
use fplan_protocol::{BridgeEnvelope, BridgeMessage, Command, Point, RouteInfo, RouteRequest};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Evaluates a script in the host's web view. Must not block on the renderer
/// or call back into the bridge.
pub trait ScriptEvaluator: Send + Sync {
    fn evaluate(&self, script: &str);
}

/// Buffers scripts for hosts that poll for them.
#[derive(Debug, Default)]
pub struct ScriptQueue {
    scripts: Mutex<VecDeque<String>>,
}

impl ScriptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<String> {
        self.scripts.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.scripts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.lock().is_empty()
    }
}

impl ScriptEvaluator for ScriptQueue {
    fn evaluate(&self, script: &str) {
        self.scripts.lock().push_back(script.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BluePosition {
    pub point: Point,
    pub focus: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    pub booth: Option<String>,
    pub route: Option<RouteRequest>,
    pub position: Option<BluePosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    pub online: bool,
    pub desired: Selection,
    /// What the renderer was last told. Commands are skipped when equal.
    pub applied: Selection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Facet {
    Booth,
    Route,
    Position,
}

impl Facet {
    const ALL: [Facet; 3] = [Facet::Booth, Facet::Route, Facet::Position];
}

impl SyncState {
    /// Marks `facet` applied and returns its command if desired and applied differ.
    fn take_change(&mut self, facet: Facet) -> Option<Command> {
        let (desired, applied) = (&self.desired, &mut self.applied);
        match facet {
            Facet::Booth if desired.booth != applied.booth => {
                applied.booth = desired.booth.clone();
                Some(Command::SelectBooth(desired.booth.clone()))
            }
            Facet::Route if desired.route != applied.route => {
                applied.route = desired.route.clone();
                Some(Command::SelectRoute(desired.route.clone()))
            }
            Facet::Position if desired.position != applied.position => {
                applied.position = desired.position.clone();
                Some(match &desired.position {
                    Some(p) => Command::SelectCurrentPosition {
                        point: Some(p.point.clone()),
                        focus: p.focus,
                    },
                    None => Command::SelectCurrentPosition {
                        point: None,
                        focus: false,
                    },
                })
            }
            _ => None,
        }
    }
}

type ReadyFn = Box<dyn Fn() + Send + Sync>;
type BoothFn = Box<dyn Fn(&str) + Send + Sync>;
type RouteFn = Box<dyn Fn(&RouteInfo) + Send + Sync>;

/// Host callbacks. Each is optional.
#[derive(Default)]
pub struct BridgeHandlers {
    ready: Option<ReadyFn>,
    booth_selected: Option<BoothFn>,
    route_built: Option<RouteFn>,
}

impl BridgeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.ready = Some(Box::new(f));
        self
    }

    pub fn on_booth_selected(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.booth_selected = Some(Box::new(f));
        self
    }

    pub fn on_route_built(mut self, f: impl Fn(&RouteInfo) + Send + Sync + 'static) -> Self {
        self.route_built = Some(Box::new(f));
        self
    }
}

/// Handle on one renderer session's bridge.
#[derive(Clone)]
pub struct BridgeChannel {
    session: Arc<Session>,
}

impl BridgeChannel {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handles one inbound message. Returns `false` when it was dropped.
    pub fn dispatch(&self, channel: &str, payload: &str) -> bool {
        let session = &self.session;
        if session.is_retired() {
            tracing::debug!(%channel, "message for a retired session dropped");
            return false;
        }
        let message = match BridgeMessage::decode(channel, payload) {
            Ok(message) => message,
            Err(e) => {
                session.metrics.record_bridge_rejected();
                tracing::warn!(error = %e, %channel, "bridge message dropped");
                return false;
            }
        };
        session.metrics.record_bridge_message();

        match message {
            BridgeMessage::Ready => self.handle_ready(),
            BridgeMessage::BoothSelected { name } => {
                {
                    let mut state = session.state.lock();
                    state.sync.desired.booth = Some(name.clone());
                    state.sync.applied.booth = Some(name.clone());
                }
                if let Some(f) = &session.handlers.booth_selected {
                    f(&name);
                }
                true
            }
            BridgeMessage::RouteBuilt(info) => {
                if let Some(f) = &session.handlers.route_built {
                    f(&info);
                }
                true
            }
        }
    }

    /// Handles a `{"channel", "payload"}` string from single-string IPC.
    pub fn dispatch_envelope(&self, raw: &str) -> bool {
        match BridgeEnvelope::parse(raw) {
            Ok(envelope) => self.dispatch(&envelope.channel, &envelope.payload),
            Err(e) => {
                self.session.metrics.record_bridge_rejected();
                tracing::warn!(error = %e, "bridge envelope dropped");
                false
            }
        }
    }

    fn handle_ready(&self) -> bool {
        let session = &self.session;
        let ordered = session.eval_lock.lock();
        let commands: Vec<Command> = {
            let mut state = session.state.lock();
            if state.phase != SessionPhase::Loading {
                tracing::debug!(phase = ?state.phase, "duplicate ready ignored");
                return true;
            }
            state.phase = SessionPhase::Ready;
            Facet::ALL
                .iter()
                .filter_map(|facet| state.sync.take_change(*facet))
                .collect()
        };
        tracing::info!(
            event = %session.context.event_address,
            replayed = commands.len(),
            "renderer ready"
        );
        for command in &commands {
            self.evaluate(command);
        }
        drop(ordered);
        if let Some(f) = &session.handlers.ready {
            f();
        }
        true
    }

    pub fn select_booth(&self, name: Option<&str>) -> bool {
        self.update(Facet::Booth, |desired| {
            desired.booth = name.map(str::to_string);
        })
    }

    pub fn build_route(&self, route: Option<RouteRequest>) -> bool {
        self.update(Facet::Route, |desired| desired.route = route)
    }

    pub fn set_position(&self, point: Option<Point>, focus: bool) -> bool {
        self.update(Facet::Position, |desired| {
            desired.position = point.map(|point| BluePosition { point, focus });
        })
    }

    /// One-shot signal that the bootstrap document finished loading. Starts
    /// the renderer when the document was written without auto-init.
    pub fn document_loaded(&self) -> bool {
        let session = &self.session;
        if session.auto_init || session.is_retired() {
            return false;
        }
        if session.init_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ordered = session.eval_lock.lock();
        self.evaluate(&Command::Init);
        true
    }

    /// Records the desired value; returns whether a command was issued.
    fn update(&self, facet: Facet, apply: impl FnOnce(&mut Selection)) -> bool {
        let session = &self.session;
        let _ordered = session.eval_lock.lock();
        let command = {
            let mut state = session.state.lock();
            apply(&mut state.sync.desired);
            if state.phase != SessionPhase::Ready {
                return false;
            }
            state.sync.take_change(facet)
        };
        match command {
            Some(command) => {
                self.evaluate(&command);
                true
            }
            None => {
                session.metrics.record_command_skipped();
                false
            }
        }
    }

    fn evaluate(&self, command: &Command) {
        let script = command.to_script();
        tracing::debug!(%script, "evaluating renderer command");
        self.session.metrics.record_command_issued();
        self.session.evaluator.evaluate(&script);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{session, session_with};
    use fplan_protocol::channels;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    fn ready_channel() -> (BridgeChannel, Arc<ScriptQueue>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let (session, queue) = session("https://acme.expofp.com", root.path(), true);
        let bridge = BridgeChannel::new(session);
        assert!(bridge.dispatch(channels::READY, "FLOOR PLAN CONFIGURED"));
        (bridge, queue, root)
    }

    fn route(from: &str, to: &str) -> RouteRequest {
        RouteRequest {
            from: from.to_string(),
            to: to.to_string(),
            except_inaccessible: false,
        }
    }

    #[test]
    fn repeated_booth_selection_issues_one_command() {
        let (bridge, queue, _root) = ready_channel();
        assert!(bridge.select_booth(Some("A")));
        assert!(!bridge.select_booth(Some("A")));
        assert_eq!(queue.drain(), vec![r#"window.floorplan.selectBooth("A");"#]);
    }

    #[test]
    fn clearing_issues_the_explicit_clear_form() {
        let (bridge, queue, _root) = ready_channel();
        bridge.select_booth(Some("A"));
        bridge.select_booth(None);
        assert_eq!(
            queue.drain(),
            vec![
                r#"window.floorplan.selectBooth("A");"#,
                "window.floorplan.selectBooth(null);",
            ]
        );
    }

    #[test]
    fn clearing_the_booth_leaves_the_route_alone() {
        let (bridge, queue, _root) = ready_channel();
        bridge.build_route(Some(route("A", "B")));
        bridge.select_booth(Some("A"));
        queue.drain();

        bridge.select_booth(None);
        assert_eq!(queue.drain(), vec!["window.floorplan.selectBooth(null);"]);

        bridge.build_route(None);
        assert_eq!(
            queue.drain(),
            vec!["window.floorplan.selectRoute(null, null, false);"]
        );
    }

    #[test]
    fn calls_before_ready_are_buffered_and_replayed_once() {
        let root = tempfile::tempdir().unwrap();
        let (session, queue) = session("https://acme.expofp.com", root.path(), true);
        let bridge = BridgeChannel::new(session.clone());

        assert!(!bridge.select_booth(Some("B-12")));
        assert!(!bridge.build_route(Some(route("A", "B"))));
        assert!(!bridge.set_position(Some(Point::new(10.0, 20.0)), true));
        assert!(queue.is_empty());
        assert_eq!(session.phase(), SessionPhase::Loading);

        assert!(bridge.dispatch(channels::READY, ""));
        assert!(bridge.dispatch(channels::READY, ""));
        assert_eq!(session.phase(), SessionPhase::Ready);
        assert_eq!(
            queue.drain(),
            vec![
                r#"window.floorplan.selectBooth("B-12");"#,
                r#"window.floorplan.selectRoute("A", "B", false);"#,
                r#"window.floorplan.selectCurrentPosition({"x":10.0,"y":20.0,"z":null,"angle":null}, true);"#,
            ]
        );
    }

    #[test]
    fn ready_handler_runs_once_after_replay() {
        let root = tempfile::tempdir().unwrap();
        let ctx = crate::address::EventContext::from_url("https://acme.expofp.com", root.path())
            .unwrap();
        let queue = Arc::new(ScriptQueue::new());
        let ready_calls = Arc::new(AtomicUsize::new(0));
        let replayed_before_ready = Arc::new(AtomicUsize::new(0));
        let (calls, seen, observed) = (
            ready_calls.clone(),
            replayed_before_ready.clone(),
            queue.clone(),
        );
        let handlers = BridgeHandlers::new().on_ready(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.store(observed.len(), Ordering::SeqCst);
        });
        let metrics = crate::metrics::EngineMetrics::default();
        let content = crate::content::ContentServer::new(
            ctx.clone(),
            &crate::resolver::default_configuration(&ctx.event_url),
            Arc::new(crate::fetch::StaticFetcher::new()),
            metrics.clone(),
            "fplan",
        );
        let session = Arc::new(Session::new(
            ctx,
            crate::session::next_generation(),
            true,
            true,
            queue.clone(),
            handlers,
            content,
            metrics,
        ));
        let bridge = BridgeChannel::new(session);
        bridge.select_booth(Some("C"));

        bridge.dispatch(channels::READY, "FLOOR PLAN CONFIGURED");
        bridge.dispatch(channels::READY, "FLOOR PLAN CONFIGURED");

        assert_eq!(ready_calls.load(Ordering::SeqCst), 1);
        assert_eq!(replayed_before_ready.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn inbound_booth_click_updates_state_and_notifies() {
        let root = tempfile::tempdir().unwrap();
        let (session, queue) = session("https://acme.expofp.com", root.path(), true);
        let clicked = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = clicked.clone();
        let session = rebuild_with_handlers(
            &session,
            queue.clone(),
            BridgeHandlers::new().on_booth_selected(move |name| sink.lock().push(name.to_string())),
        );
        let bridge = BridgeChannel::new(session.clone());
        bridge.dispatch(channels::READY, "");

        assert!(bridge.dispatch(channels::BOOTH_CLICK, "B-12"));
        assert_eq!(*clicked.lock(), vec!["B-12".to_string()]);
        assert!(!bridge.select_booth(Some("B-12")));
        assert!(queue.is_empty());
        assert_eq!(session.snapshot().applied.booth.as_deref(), Some("B-12"));
    }

    #[test]
    fn malformed_route_payload_never_reaches_the_host() {
        let root = tempfile::tempdir().unwrap();
        let (session, queue) = session("https://acme.expofp.com", root.path(), true);
        let routes = Arc::new(Mutex::new(Vec::<RouteInfo>::new()));
        let sink = routes.clone();
        let session = rebuild_with_handlers(
            &session,
            queue,
            BridgeHandlers::new().on_route_built(move |info| sink.lock().push(info.clone())),
        );
        let bridge = BridgeChannel::new(session.clone());

        assert!(!bridge.dispatch(channels::DIRECTION, "{\"distance\": \"12 m\""));
        assert!(!bridge.dispatch(channels::DIRECTION, r#"{"distance":"12 m","time":"soon"}"#));
        assert!(!bridge.dispatch("onUnknownHandler", "x"));
        assert!(!bridge.dispatch_envelope("not an envelope"));
        assert!(routes.lock().is_empty());

        assert!(bridge.dispatch_envelope(
            r#"{"channel":"onDirectionHandler","payload":"{\"distance\":\"12 m\",\"time\":42}"}"#
        ));
        assert_eq!(
            *routes.lock(),
            vec![RouteInfo {
                distance: "12 m".to_string(),
                duration_seconds: 42,
            }]
        );
        let snap = session.metrics.snapshot();
        assert_eq!(snap.bridge_rejected, 4);
        assert_eq!(snap.bridge_messages, 1);
    }

    #[test]
    fn offline_document_load_starts_the_renderer_once() {
        let root = tempfile::tempdir().unwrap();
        let (offline, queue) = session("https://acme.expofp.com", root.path(), false);
        let bridge = BridgeChannel::new(offline);
        assert!(bridge.document_loaded());
        assert!(!bridge.document_loaded());
        assert_eq!(queue.drain(), vec!["init();"]);

        let (online, queue) = session("https://acme.expofp.com", root.path(), true);
        assert!(!BridgeChannel::new(online).document_loaded());
        assert!(queue.is_empty());
    }

    fn rebuild_with_handlers(
        template: &Arc<Session>,
        queue: Arc<ScriptQueue>,
        handlers: BridgeHandlers,
    ) -> Arc<Session> {
        Arc::new(Session::new(
            template.context().clone(),
            template.generation(),
            true,
            template.auto_init(),
            queue,
            handlers,
            template.content().clone(),
            template.metrics.clone(),
        ))
    }

    /// Records scripts; stalls on the first booth "A" command.
    #[derive(Default)]
    struct StallingEvaluator {
        scripts: Mutex<Vec<String>>,
        stalled: AtomicBool,
    }

    impl ScriptEvaluator for StallingEvaluator {
        fn evaluate(&self, script: &str) {
            if script.contains(r#"("A")"#) && !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }
            self.scripts.lock().push(script.to_string());
        }
    }

    #[test]
    fn concurrent_commands_reach_the_renderer_in_state_order() {
        let root = tempfile::tempdir().unwrap();
        let evaluator = Arc::new(StallingEvaluator::default());
        let bridge = BridgeChannel::new(session_with(
            "https://acme.expofp.com",
            root.path(),
            true,
            evaluator.clone(),
        ));
        assert!(bridge.dispatch(channels::READY, ""));

        let first = {
            let bridge = bridge.clone();
            std::thread::spawn(move || bridge.select_booth(Some("A")))
        };
        while !evaluator.stalled.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(bridge.select_booth(Some("B")));
        assert!(first.join().unwrap());

        assert_eq!(
            *evaluator.scripts.lock(),
            vec![
                r#"window.floorplan.selectBooth("A");"#.to_string(),
                r#"window.floorplan.selectBooth("B");"#.to_string(),
            ]
        );
        assert_eq!(
            bridge.session().snapshot().applied.booth.as_deref(),
            Some("B")
        );
        assert!(!bridge.select_booth(Some("B")));
        assert!(bridge.select_booth(Some("A")));
    }
}
