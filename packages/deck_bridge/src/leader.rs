//! Leader Server
//!
//! Owns the shared loopback endpoint. Serves the device-facing HTTP API and
//! push socket, accepts follower connections on `/ws/internal`, and routes
//! each run/cancel to the window named in the slot's composite id.
//!
//! ```text
//!   device ──HTTP──▶ /handshake /list /run /cancel ─┐
//!   device ◀──WS─── /ws (refresh, activate, ...)    │
//!                                                    ▼
//!                          own window → ProviderRegistry
//!                          other window → follower RPC over /ws/internal
//! ```

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Request, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, CommandError};
use crate::protocol::{
    CancelResult, DeviceMessage, FollowerMessage, HandshakeResponse, LeaderMessage, ListResponse,
    RunResult, Slot, SlotRequest, window_of,
};
use crate::registry::ProviderRegistry;
use crate::token::{TokenManager, extract_bearer_token};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// A registered follower's outbound queue. `connection_id` tells a stale
/// socket's cleanup apart from the connection that replaced it.
struct FollowerLink {
    tx: mpsc::Sender<LeaderMessage>,
    connection_id: u64,
}

struct PendingRequest {
    window_id: String,
    reply: oneshot::Sender<FollowerReply>,
}

#[derive(Debug)]
enum FollowerReply {
    Slots(Vec<Slot>),
    Run(RunResult),
    Cancel(CancelResult),
}

pub(crate) struct LeaderState {
    window_id: String,
    registry: ProviderRegistry,
    rpc_timeout: Duration,
    tokens: TokenManager,
    followers: Mutex<HashMap<String, FollowerLink>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    current_window: Mutex<Option<String>>,
    /// Last activate/deactivate sent to devices. Held for the whole
    /// recomputation so concurrent updates cannot interleave.
    last_activate: Mutex<Option<bool>>,
    device_tx: broadcast::Sender<DeviceMessage>,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
}

impl LeaderState {
    pub(crate) fn new(window_id: String, registry: ProviderRegistry, rpc_timeout: Duration) -> Self {
        let (device_tx, _) = broadcast::channel(64);
        Self {
            window_id,
            registry,
            rpc_timeout,
            tokens: TokenManager::new(),
            followers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            current_window: Mutex::new(None),
            last_activate: Mutex::new(None),
            device_tx,
            shutdown: CancellationToken::new(),
            next_connection_id: AtomicU64::new(0),
        }
    }

    fn notify_devices(&self, message: DeviceMessage) {
        debug!(?message, "device broadcast");
        let _ = self.device_tx.send(message);
    }

    async fn current_window(&self) -> Option<String> {
        self.current_window.lock().await.clone()
    }

    async fn follower_tx(&self, window_id: &str) -> Option<mpsc::Sender<LeaderMessage>> {
        self.followers
            .lock()
            .await
            .get(window_id)
            .map(|link| link.tx.clone())
    }

    // -- focus & activation ---------------------------------------------------

    async fn notify_focus(&self, window_id: &str) {
        info!(window_id, "focus");
        *self.current_window.lock().await = Some(window_id.to_string());
        self.update_activate_state().await;
        self.notify_devices(DeviceMessage::Refresh);
    }

    async fn notify_blur(&self, window_id: &str) {
        info!(window_id, "blur");
        {
            let mut current = self.current_window.lock().await;
            if current.as_deref() == Some(window_id) {
                *current = None;
            }
        }
        self.update_activate_state().await;
    }

    /// Recompute "some window is focused and it has slots" and broadcast
    /// activate/deactivate only when that value changes.
    async fn update_activate_state(&self) {
        let mut last = self.last_activate.lock().await;
        let current = self.current_window().await;
        let has_slots = !self.current_slots_for(current.as_deref()).await.is_empty();
        let should_activate = current.is_some() && has_slots;

        if *last != Some(should_activate) {
            *last = Some(should_activate);
            if should_activate {
                info!(current_window = ?current, has_slots, "sending activate");
                self.notify_devices(DeviceMessage::Activate);
            } else {
                info!(current_window = ?current, has_slots, "sending deactivate");
                self.notify_devices(DeviceMessage::Deactivate);
            }
        }
    }

    async fn should_activate(&self) -> bool {
        let current = self.current_window().await;
        current.is_some() && !self.current_slots_for(current.as_deref()).await.is_empty()
    }

    // -- slot access ----------------------------------------------------------

    async fn current_slots(&self) -> Vec<Slot> {
        let current = self.current_window().await;
        self.current_slots_for(current.as_deref()).await
    }

    async fn current_slots_for(&self, window_id: Option<&str>) -> Vec<Slot> {
        match window_id {
            Some(window_id) => self.fetch_slots(window_id).await,
            None => Vec::new(),
        }
    }

    /// Slots of one window. Unknown or unresponsive followers yield an empty list.
    async fn fetch_slots(&self, window_id: &str) -> Vec<Slot> {
        if window_id == self.window_id {
            return self.registry.get_aggregated_slots(&self.window_id).await;
        }
        let Some(tx) = self.follower_tx(window_id).await else {
            return Vec::new();
        };
        match self
            .request_from_follower(window_id, tx, |request_id| LeaderMessage::GetSlots {
                request_id,
            })
            .await
        {
            Ok(FollowerReply::Slots(items)) => items,
            Ok(other) => {
                warn!(window_id, ?other, "mismatched reply to getSlots");
                Vec::new()
            }
            Err(e) => {
                warn!(window_id, error = %e, "failed to fetch slots from follower");
                Vec::new()
            }
        }
    }

    async fn run_command(&self, slot_data_id: &str) -> RunResult {
        let Some(target) = window_of(slot_data_id) else {
            return CommandError::MalformedId.into();
        };
        if target == self.window_id {
            return self.registry.run_command(slot_data_id).await;
        }
        let Some(tx) = self.follower_tx(target).await else {
            return CommandError::WindowNotFound.into();
        };
        let slot_data_id = slot_data_id.to_string();
        match self
            .request_from_follower(target, tx, |request_id| LeaderMessage::Run {
                request_id,
                slot_data_id,
            })
            .await
        {
            Ok(FollowerReply::Run(result)) => result,
            Ok(other) => {
                warn!(window_id = target, ?other, "mismatched reply to run");
                CommandError::RunForward.into()
            }
            Err(e) => {
                warn!(window_id = target, error = %e, "failed to run command on follower");
                CommandError::RunForward.into()
            }
        }
    }

    async fn cancel_command(&self, slot_data_id: &str) -> CancelResult {
        let Some(target) = window_of(slot_data_id) else {
            return CommandError::MalformedId.into();
        };
        if target == self.window_id {
            return self.registry.cancel_command(slot_data_id).await;
        }
        let Some(tx) = self.follower_tx(target).await else {
            return CommandError::WindowNotFound.into();
        };
        let slot_data_id = slot_data_id.to_string();
        match self
            .request_from_follower(target, tx, |request_id| LeaderMessage::Cancel {
                request_id,
                slot_data_id,
            })
            .await
        {
            Ok(FollowerReply::Cancel(result)) => result,
            Ok(other) => {
                warn!(window_id = target, ?other, "mismatched reply to cancel");
                CommandError::CancelForward.into()
            }
            Err(e) => {
                warn!(window_id = target, error = %e, "failed to cancel command on follower");
                CommandError::CancelForward.into()
            }
        }
    }

    // -- follower RPC ---------------------------------------------------------

    async fn request_from_follower(
        &self,
        window_id: &str,
        tx: mpsc::Sender<LeaderMessage>,
        build: impl FnOnce(String) -> LeaderMessage,
    ) -> Result<FollowerReply, BridgeError> {
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingRequest {
                window_id: window_id.to_string(),
                reply: reply_tx,
            },
        );

        // The deadline covers enqueueing too: a stalled writer leaves the queue full.
        let message = build(request_id.clone());
        let exchange = async {
            tx.send(message).await.map_err(|_| BridgeError::FollowerGone)?;
            reply_rx.await.map_err(|_| BridgeError::FollowerGone)
        };
        match tokio::time::timeout(self.rpc_timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.pending.lock().await.remove(&request_id);
                Err(e)
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(window_id, request_id = %request_id, "follower request timed out");
                Err(BridgeError::RpcTimeout)
            }
        }
    }

    async fn resolve_pending(&self, request_id: &str, reply: FollowerReply) {
        match self.pending.lock().await.remove(request_id) {
            Some(pending) => {
                let _ = pending.reply.send(reply);
            }
            None => debug!(request_id, "response for unknown or expired request"),
        }
    }

    /// Drop every in-flight request to `window_id`; callers see `FollowerGone`.
    async fn fail_pending_for(&self, window_id: &str) {
        self.pending
            .lock()
            .await
            .retain(|_, pending| pending.window_id != window_id);
    }

    // -- follower lifecycle ---------------------------------------------------

    async fn register_follower(
        &self,
        window_id: &str,
        connection_id: u64,
        tx: mpsc::Sender<LeaderMessage>,
    ) {
        info!(window_id, connection_id, "registered follower");
        let ack = LeaderMessage::Registered {
            window_id: window_id.to_string(),
        };
        if tx.try_send(ack).is_err() {
            warn!(window_id, "could not queue registration ack");
        }
        self.followers
            .lock()
            .await
            .insert(window_id.to_string(), FollowerLink { tx, connection_id });
    }

    async fn handle_follower_disconnect(&self, window_id: &str, connection_id: u64) {
        let removed = {
            let mut followers = self.followers.lock().await;
            match followers.get(window_id) {
                Some(link) if link.connection_id == connection_id => {
                    followers.remove(window_id);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            return;
        }
        info!(window_id, "follower disconnected");
        self.fail_pending_for(window_id).await;

        let was_focused = {
            let mut current = self.current_window.lock().await;
            if current.as_deref() == Some(window_id) {
                *current = None;
                true
            } else {
                false
            }
        };
        if was_focused {
            self.update_activate_state().await;
            self.notify_devices(DeviceMessage::Refresh);
        }
    }

    /// Follower control frames, processed in arrival order per connection.
    async fn handle_follower_event(&self, message: FollowerMessage, connection_id: u64) {
        match message {
            FollowerMessage::Focus { window_id } => self.notify_focus(&window_id).await,
            FollowerMessage::Blur { window_id } => self.notify_blur(&window_id).await,
            FollowerMessage::Change { window_id } => {
                if self.current_window().await.as_deref() == Some(window_id.as_str()) {
                    debug!(window_id = %window_id, "change from focused follower");
                    self.update_activate_state().await;
                    self.notify_devices(DeviceMessage::Refresh);
                }
            }
            FollowerMessage::Disconnect { window_id } => {
                self.handle_follower_disconnect(&window_id, connection_id)
                    .await
            }
            FollowerMessage::TaskCompleteForward {
                window_id,
                slot_data_id,
                result,
            } => self.notify_devices(DeviceMessage::TaskComplete {
                slot_data_id: format!("{window_id}:{slot_data_id}"),
                result,
            }),
            FollowerMessage::Register { .. }
            | FollowerMessage::SlotsResponse { .. }
            | FollowerMessage::RunResponse { .. }
            | FollowerMessage::CancelResponse { .. } => {
                debug!("connection frame routed to event queue; ignoring")
            }
        }
    }
}

/// The running leader. Dropping it without [`LeaderServer::stop`] leaves the
/// server task running until the runtime shuts down.
pub struct LeaderServer {
    state: Arc<LeaderState>,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
    watchers: Vec<JoinHandle<()>>,
}

impl LeaderServer {
    /// Bind `127.0.0.1:<port>` and start serving. Bind failure means another
    /// process already leads on this port.
    pub async fn start(
        window_id: impl Into<String>,
        registry: ProviderRegistry,
        config: &BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port))
            .await
            .map_err(|source| BridgeError::Bind {
                port: config.port,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BridgeError::Bind {
            port: config.port,
            source,
        })?;

        let state = Arc::new(LeaderState::new(
            window_id.into(),
            registry,
            config.rpc_timeout,
        ));
        let watchers = spawn_registry_watchers(&state);

        let app = router(state.clone());
        let shutdown = state.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
            if let Err(e) = result {
                error!("leader server error: {}", e);
            }
        });

        info!(window_id = %state.window_id, addr = %local_addr, "leader listening");
        Ok(Self {
            state,
            local_addr,
            server,
            watchers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn window_id(&self) -> &str {
        &self.state.window_id
    }

    pub async fn notify_focus(&self, window_id: &str) {
        self.state.notify_focus(window_id).await
    }

    pub async fn notify_blur(&self, window_id: &str) {
        self.state.notify_blur(window_id).await
    }

    /// Windows currently registered as followers.
    pub async fn follower_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.followers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list_slots(&self) -> Vec<Slot> {
        self.state.current_slots().await
    }

    pub async fn run_command(&self, slot_data_id: &str) -> RunResult {
        self.state.run_command(slot_data_id).await
    }

    pub async fn cancel_command(&self, slot_data_id: &str) -> CancelResult {
        self.state.cancel_command(slot_data_id).await
    }

    /// Close every socket, release the port and forget the token.
    pub async fn stop(self) {
        info!(window_id = %self.state.window_id, "leader stopping");
        self.state.shutdown.cancel();
        for watcher in &self.watchers {
            watcher.abort();
        }
        self.state.followers.lock().await.clear();
        self.state.pending.lock().await.clear();
        self.state.tokens.clear();

        let mut server = self.server;
        if tokio::time::timeout(Duration::from_secs(2), &mut server)
            .await
            .is_err()
        {
            warn!("leader server did not shut down in time, aborting");
            server.abort();
            let _ = server.await;
        }
    }
}

/// Forward this window's own registry feeds to devices.
fn spawn_registry_watchers(state: &Arc<LeaderState>) -> Vec<JoinHandle<()>> {
    let mut changes = state.registry.subscribe_changes();
    let change_state = state.clone();
    let change_task = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
            let own = change_state.window_id.as_str();
            if change_state.current_window().await.as_deref() == Some(own) {
                change_state.update_activate_state().await;
                change_state.notify_devices(DeviceMessage::Refresh);
            }
        }
    });

    let mut tasks = state.registry.subscribe_task_complete();
    let task_state = state.clone();
    let task_task = tokio::spawn(async move {
        loop {
            match tasks.recv().await {
                Ok(event) => task_state.notify_devices(DeviceMessage::TaskComplete {
                    slot_data_id: format!("{}:{}", task_state.window_id, event.slot_id),
                    result: event.result,
                }),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "task completion feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    vec![change_task, task_task]
}

// =============================================================================
// HTTP surface
// =============================================================================

pub(crate) fn router(state: Arc<LeaderState>) -> Router {
    let authed = Router::new()
        .route("/list", get(list_handler))
        .route("/run", post(run_handler))
        .route("/cancel", post(cancel_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    let sockets = Router::new()
        .route("/ws", get(device_ws_handler))
        .route("/ws/internal", get(follower_ws_handler))
        .route_layer(middleware::from_fn(loopback_only));

    Router::new()
        .route("/handshake", get(handshake_handler))
        .merge(authed)
        .merge(sockets)
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(CatchPanicLayer::custom(internal_error))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

async fn require_token(
    State(state): State<Arc<LeaderState>>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match extract_bearer_token(header) {
        Some(token) if state.tokens.validate(token) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response(),
    }
}

/// The listener is bound to loopback already; this rejects anything that
/// somehow arrives from elsewhere.
async fn loopback_only(request: Request, next: Next) -> Response {
    let is_loopback = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .is_some_and(|ci| ci.0.ip().is_loopback());
    if is_loopback {
        return next.run(request).await;
    }
    (StatusCode::FORBIDDEN, Json(json!({ "error": "Forbidden" }))).into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

fn internal_error(_panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    error!("request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn invalid_request(rejection: JsonRejection) -> Response {
    debug!(error = %rejection, "rejecting malformed request body");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "message": "Invalid request" })),
    )
        .into_response()
}

async fn handshake_handler(State(state): State<Arc<LeaderState>>) -> Json<HandshakeResponse> {
    Json(HandshakeResponse {
        token: state.tokens.generate(),
    })
}

async fn list_handler(State(state): State<Arc<LeaderState>>) -> Json<ListResponse> {
    Json(ListResponse {
        items: state.current_slots().await,
    })
}

async fn run_handler(
    State(state): State<Arc<LeaderState>>,
    payload: Result<Json<SlotRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(req)) => Json(state.run_command(&req.slot_data_id).await).into_response(),
        Err(rejection) => invalid_request(rejection),
    }
}

async fn cancel_handler(
    State(state): State<Arc<LeaderState>>,
    payload: Result<Json<SlotRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(req)) => Json(state.cancel_command(&req.slot_data_id).await).into_response(),
        Err(rejection) => invalid_request(rejection),
    }
}

// =============================================================================
// Device push socket (/ws)
// =============================================================================

async fn device_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<LeaderState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state))
}

async fn handle_device_socket(socket: WebSocket, state: Arc<LeaderState>) {
    info!("device connected");
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the initial check so nothing between the two is missed.
    let mut device_rx = state.device_tx.subscribe();

    if state.should_activate().await {
        debug!("sending initial activate to new device");
        if let Ok(json) = serde_json::to_string(&DeviceMessage::Activate) {
            let _ = sender.send(Message::Text(json.into())).await;
        }
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            event = device_rx.recv() => match event {
                Ok(message) => {
                    let Ok(json) = serde_json::to_string(&message) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "device client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    info!("device disconnected");
}

// =============================================================================
// Follower socket (/ws/internal)
// =============================================================================

async fn follower_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<LeaderState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_follower_socket(socket, state))
}

async fn handle_follower_socket(socket: WebSocket, state: Arc<LeaderState>) {
    let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    debug!(connection_id, "follower connection opened");
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<LeaderMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Control frames may trigger follower RPCs, so they run off the reader;
    // responses must keep flowing while they wait.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<FollowerMessage>();
    let event_state = state.clone();
    let events = tokio::spawn(async move {
        while let Some(message) = event_rx.recv().await {
            event_state
                .handle_follower_event(message, connection_id)
                .await;
        }
    });

    let mut registered: Option<String> = None;
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(connection_id, error = %e, "follower socket error");
                break;
            }
            Some(Ok(_)) => continue,
        };
        let message = match serde_json::from_str::<FollowerMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id, error = %e, "failed to parse follower message");
                continue;
            }
        };
        match message {
            FollowerMessage::Register { window_id } => {
                state
                    .register_follower(&window_id, connection_id, out_tx.clone())
                    .await;
                registered = Some(window_id);
            }
            FollowerMessage::SlotsResponse { request_id, items } => {
                state
                    .resolve_pending(&request_id, FollowerReply::Slots(items))
                    .await
            }
            FollowerMessage::RunResponse { request_id, result } => {
                state
                    .resolve_pending(&request_id, FollowerReply::Run(result))
                    .await
            }
            FollowerMessage::CancelResponse { request_id, result } => {
                state
                    .resolve_pending(&request_id, FollowerReply::Cancel(result))
                    .await
            }
            other => {
                let _ = event_tx.send(other);
            }
        }
    }

    // With the writer gone, RPCs to this follower fail at once instead of
    // waiting out the timeout while queued control frames drain.
    writer.abort();
    let _ = writer.await;
    if let Some(window_id) = &registered {
        state.fail_pending_for(window_id).await;
    }
    drop(event_tx);
    let _ = events.await;
    if let Some(window_id) = registered {
        state
            .handle_follower_disconnect(&window_id, connection_id)
            .await;
    }
    debug!(connection_id, "follower connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvidersConfig;
    use crate::test_helpers::{StaticProvider, register_static};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    async fn test_state() -> Arc<LeaderState> {
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        register_static(&registry, StaticProvider::new("npm", &["build", "test"])).await;
        Arc::new(LeaderState::new(
            "w1".into(),
            registry,
            Duration::from_secs(5),
        ))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, token: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_returns_same_token() {
        let state = test_state().await;
        let app = router(state);

        let first = body_json(app.clone().oneshot(get("/handshake", None)).await.unwrap()).await;
        let second = body_json(app.oneshot(get("/handshake", None)).await.unwrap()).await;
        assert!(first["token"].as_str().is_some_and(|t| !t.is_empty()));
        assert_eq!(first["token"], second["token"]);
    }

    #[tokio::test]
    async fn test_list_requires_token() {
        let app = router(test_state().await);
        let resp = app.clone().oneshot(get("/list", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({"error": "Unauthorized"}));

        let resp = app.oneshot(get("/list", Some("forged"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let app = router(test_state().await);
        let resp = app.clone().oneshot(get("/nope", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({"error": "Not found"}));

        // Wrong method on a known path is also "not found".
        let resp = app.oneshot(get("/run", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_empty_without_focus_then_populated() {
        let state = test_state().await;
        let token = state.tokens.generate();
        let app = router(state.clone());

        let resp = app.clone().oneshot(get("/list", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"items": []}));

        state.notify_focus("w1").await;
        let json = body_json(app.oneshot(get("/list", Some(&token))).await.unwrap()).await;
        let ids: Vec<&str> = json["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["scriptId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["w1:npm:build", "w1:npm:test"]);
        assert_eq!(json["items"][0]["status"], "idle");
    }

    #[tokio::test]
    async fn test_run_on_own_window_and_unknown_window() {
        let state = test_state().await;
        let token = state.tokens.generate();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(post_json("/run", &token, r#"{"slotDataId":"w1:npm:build"}"#))
            .await
            .unwrap();
        assert_eq!(
            body_json(resp).await,
            json!({"success": true, "taskId": "build"})
        );

        let resp = app
            .oneshot(post_json(
                "/run",
                &token,
                r#"{"slotDataId":"w9:buildProvider:build"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"success": false, "message": "Window not found"})
        );
    }

    #[tokio::test]
    async fn test_run_with_malformed_body_is_400() {
        let state = test_state().await;
        let token = state.tokens.generate();
        let app = router(state);
        let resp = app
            .oneshot(post_json("/run", &token, "not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            json!({"success": false, "message": "Invalid request"})
        );
    }

    #[tokio::test]
    async fn test_cancel_routes_to_registry() {
        let state = test_state().await;
        let token = state.tokens.generate();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(post_json("/cancel", &token, r#"{"slotDataId":"w1:npm:build"}"#))
            .await
            .unwrap();
        assert_eq!(
            body_json(resp).await,
            json!({"success": false, "message": "Cancel not supported by this provider"})
        );

        let resp = app
            .oneshot(post_json("/cancel", &token, r#"{"slotDataId":"nowindow"}"#))
            .await
            .unwrap();
        assert_eq!(
            body_json(resp).await,
            json!({"success": false, "message": "Invalid slotDataId format"})
        );
    }

    #[tokio::test]
    async fn test_activate_is_edge_triggered() {
        let state = test_state().await;
        let mut devices = state.device_tx.subscribe();

        state.notify_focus("w1").await;
        state.notify_focus("w1").await;
        state.notify_focus("w1").await;

        let mut frames = Vec::new();
        while let Ok(frame) = devices.try_recv() {
            frames.push(frame);
        }
        let activates = frames
            .iter()
            .filter(|f| **f == DeviceMessage::Activate)
            .count();
        assert_eq!(activates, 1);
        assert_eq!(
            frames
                .iter()
                .filter(|f| **f == DeviceMessage::Refresh)
                .count(),
            3
        );

        state.notify_blur("w1").await;
        assert_eq!(devices.try_recv().unwrap(), DeviceMessage::Deactivate);
        state.notify_blur("w1").await;
        assert!(devices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blur_of_other_window_keeps_focus() {
        let state = test_state().await;
        state.notify_focus("w1").await;
        state.notify_blur("w2").await;
        assert_eq!(state.current_window().await.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_follower_rpc_fails_fast_when_follower_leaves() {
        let state = test_state().await;
        let (tx, mut rx) = mpsc::channel(8);
        state.register_follower("w2", 7, tx).await;
        assert!(matches!(
            rx.recv().await,
            Some(LeaderMessage::Registered { .. })
        ));

        let rpc_state = state.clone();
        let run = tokio::spawn(async move { rpc_state.run_command("w2:npm:build").await });
        // Wait for the run request to reach the "socket".
        assert!(matches!(rx.recv().await, Some(LeaderMessage::Run { .. })));

        state.handle_follower_disconnect("w2", 7).await;
        let result = run.await.unwrap();
        assert_eq!(result.message.as_deref(), Some("Failed to execute command"));
    }

    #[tokio::test]
    async fn test_follower_rpc_times_out_when_queue_is_full() {
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        let state = Arc::new(LeaderState::new(
            "w1".into(),
            registry,
            Duration::from_millis(200),
        ));
        // Capacity one, taken by the ack, and nobody drains it.
        let (tx, _rx) = mpsc::channel(1);
        state.register_follower("w2", 3, tx).await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            state.run_command("w2:npm:build"),
        )
        .await
        .expect("run blocked on a full follower queue");
        assert_eq!(result.message.as_deref(), Some("Failed to execute command"));
        assert!(state.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_connection_does_not_remove_replacement() {
        let state = test_state().await;
        let (old_tx, _old_rx) = mpsc::channel(8);
        let (new_tx, _new_rx) = mpsc::channel(8);
        state.register_follower("w2", 1, old_tx).await;
        state.register_follower("w2", 2, new_tx).await;

        state.handle_follower_disconnect("w2", 1).await;
        assert!(state.followers.lock().await.contains_key("w2"));
        state.handle_follower_disconnect("w2", 2).await;
        assert!(!state.followers.lock().await.contains_key("w2"));
    }

    #[tokio::test]
    async fn test_registry_task_completion_reaches_devices() {
        let registry = ProviderRegistry::new(ProvidersConfig::new());
        let notifiers = Arc::new(std::sync::OnceLock::new());
        let captured = notifiers.clone();
        registry
            .register(|n| async move {
                let _ = captured.set(n);
                Ok(crate::registry::ProviderRegistration::new(Arc::new(
                    StaticProvider::new("npm", &["build"]),
                )))
            })
            .await
            .unwrap();
        let state = Arc::new(LeaderState::new(
            "w1".into(),
            registry,
            Duration::from_secs(5),
        ));
        let mut devices = state.device_tx.subscribe();
        let watchers = spawn_registry_watchers(&state);

        notifiers
            .get()
            .unwrap()
            .notify_task_complete("build", crate::protocol::TaskResult::Success);
        let frame = tokio::time::timeout(Duration::from_secs(1), devices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            DeviceMessage::TaskComplete {
                slot_data_id: "w1:npm:build".into(),
                result: crate::protocol::TaskResult::Success,
            }
        );
        for w in watchers {
            w.abort();
        }
    }
}
