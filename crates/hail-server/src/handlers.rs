//! Connection handlers for the hail server.
//!
//! This module handles the connection lifecycle on both transports and hands
//! every inbound event to the core router.

use crate::config::Config;
use crate::gateway;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hail_core::{ConnectionId, Maintenance, Router as HailRouter, Session};
use hail_protocol::{codec, codes, Frame, ProtocolError, PROTOCOL_VERSION};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// A long-poll client between requests.
pub struct PollSession {
    outbox: Mutex<mpsc::Receiver<Arc<hail_core::Message>>>,
    _metrics: ConnectionMetricsGuard,
}

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: Arc<HailRouter>,
    /// Server configuration.
    pub config: Config,
    polls: DashMap<ConnectionId, Arc<PollSession>>,
}

impl AppState {
    #[must_use]
    pub fn new(router: Arc<HailRouter>, config: Config) -> Self {
        Self {
            router,
            config,
            polls: DashMap::new(),
        }
    }

    fn connected_frame(&self, id: &ConnectionId) -> Frame {
        let heartbeat = u32::try_from(self.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
        Frame::connected(id.as_str(), PROTOCOL_VERSION.wire(), heartbeat)
    }

    /// Drop long-poll sessions that stopped polling.
    fn reap_polls(&self) -> usize {
        let mut reaped = 0;
        for id in self.router.registry().stale(self.config.heartbeat.timeout()) {
            if self.polls.remove(&id).is_some() {
                self.router.disconnect(&id);
                debug!(connection = %id, "Long-poll session timed out");
                reaped += 1;
            }
        }
        reaped
    }
}

/// Build the HTTP application for the given state.
pub fn app(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    let mut app = Router::new().route("/health", get(health_handler));

    if transport.websocket {
        app = app.route(&transport.websocket_path, get(ws_handler));
    }
    if transport.long_polling {
        app = app
            .route(&transport.poll_path, post(poll_open))
            .route(
                &format!("{}/:id", transport.poll_path),
                post(poll_send).get(poll_receive).delete(poll_close),
            );
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the gateway cannot be built or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let gateway = gateway::build(&config.gateway)?;
    let router = Arc::new(HailRouter::with_config(gateway, config.router_config()));
    let _maintenance = Maintenance::new(
        Arc::clone(router.registry()),
        Arc::clone(router.schedules()),
        config.maintenance_config(),
    )
    .spawn();

    let state = Arc::new(AppState::new(router, config.clone()));
    let _background = BackgroundTasks::spawn(&state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("hail server listening on {}", addr);
    if config.transport.websocket {
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, config.transport.websocket_path
        );
    }
    if config.transport.long_polling {
        info!(
            "Long-poll endpoint: http://{}{}",
            addr, config.transport.poll_path
        );
    }

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Stats reporting and the long-poll reaper.
struct BackgroundTasks {
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn spawn(state: &Arc<AppState>) -> Self {
        let period = state.config.heartbeat.interval();

        let reporter = {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(period);
                loop {
                    ticks.tick().await;
                    metrics::record_stats(state.router.stats());
                }
            })
        };

        let reaper = {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(period);
                loop {
                    ticks.tick().await;
                    state.reap_polls();
                }
            })
        };

        Self {
            tasks: vec![reporter, reaper],
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "negotiations": stats.negotiation_count,
    }))
}

/// Handle one decoded client frame, returning the direct response if any.
///
/// Application replies and broadcasts travel through the connection's outbox,
/// never through the return value.
async fn handle_frame(state: &AppState, connection_id: &ConnectionId, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::Event { id, event, data } => {
            let start = Instant::now();
            let outcome = match state.router.dispatch(connection_id, &event, data).await {
                Ok(_) => "ok",
                Err(_) => {
                    metrics::record_error("dispatch");
                    "error"
                }
            };
            metrics::record_event(&event, outcome);
            metrics::record_latency(start.elapsed().as_secs_f64());

            // Failures are already on the outbox; the ack only confirms receipt.
            id.map(Frame::ack)
        }

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => {
            state.router.registry().touch(connection_id);
            None
        }

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            Some(Frame::error(
                0,
                codes::UNEXPECTED_FRAME,
                format!("{:?} frames are not accepted", other.frame_type()),
            ))
        }
    }
}

fn outbound_frame(message: &hail_core::Message) -> Frame {
    Frame::event(message.channel.clone(), message.payload.as_ref().clone())
}

fn malformed(err: &ProtocolError) -> Frame {
    Frame::error(0, codes::MALFORMED_FRAME, err.to_string())
}

/// How frames are written to a WebSocket client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Encoding {
    /// JSON text messages.
    #[default]
    Text,
    /// Length-prefixed MessagePack in binary messages.
    Binary,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(default)]
    encoding: Encoding,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, params.encoding))
}

struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
    encoding: Encoding,
}

impl WsWriter {
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let message = match self.encoding {
            Encoding::Text => Message::Text(codec::encode_text(frame)?),
            Encoding::Binary => Message::Binary(codec::encode(frame)?.to_vec()),
        };
        let len = match &message {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            _ => 0,
        };
        metrics::record_message(len, "outbound");
        self.sink.send(message).await?;
        Ok(())
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, encoding: Encoding) {
    let (sink, mut receiver) = socket.split();
    let mut writer = WsWriter { sink, encoding };

    let Session {
        id: connection_id,
        mut outbox,
    } = match state.router.connect() {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            metrics::record_rejection();
            let _ = writer
                .send(&Frame::error(0, codes::CAPACITY_EXCEEDED, e.to_string()))
                .await;
            let _ = writer.sink.close().await;
            return;
        }
    };
    let _metrics_guard = ConnectionMetricsGuard::new();

    debug!(connection = %connection_id, ?encoding, "WebSocket connected");

    if writer.send(&state.connected_frame(&connection_id)).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        state.router.disconnect(&connection_id);
        return;
    }

    let heartbeat = &state.config.heartbeat;
    let max_message_size = state.config.limits.max_message_size;
    let mut ticks = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat.interval(),
        heartbeat.interval(),
    );
    let mut last_seen = Instant::now();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            // Replies and broadcasts for this connection
            message = outbox.recv() => {
                let Some(message) = message else {
                    debug!(connection = %connection_id, "Outbox closed");
                    break;
                };
                if writer.send(&outbound_frame(&message)).await.is_err() {
                    break;
                }
            }

            _ = ticks.tick() => {
                if last_seen.elapsed() > heartbeat.timeout() {
                    debug!(connection = %connection_id, "Heartbeat timeout");
                    break;
                }
                if writer.send(&Frame::ping()).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let frames: Vec<Result<Frame, ProtocolError>> = match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if read_buffer.len() > max_message_size {
                            warn!(connection = %connection_id, size = read_buffer.len(), "Message too large");
                            let _ = writer
                                .send(&Frame::error(0, codes::MALFORMED_FRAME, "Message too large"))
                                .await;
                            break;
                        }

                        let mut frames = Vec::new();
                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => frames.push(Ok(frame)),
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    frames.push(Err(e));
                                    break;
                                }
                            }
                        }
                        frames
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        metrics::record_message(text.len(), "inbound");
                        vec![codec::decode_text(&text)]
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if writer.sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                state.router.registry().touch(&connection_id);

                let mut closed = false;
                for decoded in frames {
                    let response = match decoded {
                        Ok(frame) => {
                            trace!(connection = %connection_id, frame_type = ?frame.frame_type(), "Frame received");
                            handle_frame(&state, &connection_id, frame).await
                        }
                        Err(e) => {
                            debug!(connection = %connection_id, error = %e, "Malformed frame");
                            metrics::record_error("protocol");
                            Some(malformed(&e))
                        }
                    };

                    if let Some(response) = response {
                        if writer.send(&response).await.is_err() {
                            closed = true;
                            break;
                        }
                    }
                }
                if closed {
                    break;
                }
            }
        }
    }

    state.router.disconnect(&connection_id);
    debug!(connection = %connection_id, "WebSocket disconnected");
}

fn unknown_session(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(Frame::error(
            0,
            codes::UNKNOWN_SESSION,
            format!("Unknown session {id}"),
        )),
    )
        .into_response()
}

/// Open a long-poll session.
async fn poll_open(State(state): State<Arc<AppState>>) -> Response {
    match state.router.connect() {
        Ok(session) => {
            let connected = state.connected_frame(&session.id);
            state.polls.insert(
                session.id.clone(),
                Arc::new(PollSession {
                    outbox: Mutex::new(session.outbox),
                    _metrics: ConnectionMetricsGuard::new(),
                }),
            );
            debug!(connection = %session.id, "Long-poll session opened");
            Json(connected).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejecting long-poll session");
            metrics::record_rejection();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Frame::error(0, codes::CAPACITY_EXCEEDED, e.to_string())),
            )
                .into_response()
        }
    }
}

/// Submit one JSON frame on a long-poll session.
async fn poll_send(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let connection_id = ConnectionId::from(id);
    if !state.polls.contains_key(&connection_id) {
        return unknown_session(connection_id.as_str());
    }
    state.router.registry().touch(&connection_id);

    if body.len() > state.config.limits.max_message_size {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(Frame::error(0, codes::MALFORMED_FRAME, "Message too large")),
        )
            .into_response();
    }
    metrics::record_message(body.len(), "inbound");

    let frame = match codec::decode_text(&body) {
        Ok(frame) => frame,
        Err(e) => {
            metrics::record_error("protocol");
            return (StatusCode::BAD_REQUEST, Json(malformed(&e))).into_response();
        }
    };

    match handle_frame(&state, &connection_id, frame).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Wait for pending frames on a long-poll session.
///
/// Returns as soon as at least one frame is queued, or an empty list when the
/// poll timeout elapses.
async fn poll_receive(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let connection_id = ConnectionId::from(id);
    let Some(session) = state
        .polls
        .get(&connection_id)
        .map(|entry| Arc::clone(entry.value()))
    else {
        return unknown_session(connection_id.as_str());
    };
    state.router.registry().touch(&connection_id);

    let wait = Duration::from_millis(state.config.transport.poll_timeout_ms);
    let mut outbox = session.outbox.lock().await;
    let mut frames = Vec::new();

    match tokio::time::timeout(wait, outbox.recv()).await {
        Ok(Some(message)) => {
            frames.push(outbound_frame(&message));
            while let Ok(message) = outbox.try_recv() {
                frames.push(outbound_frame(&message));
            }
        }
        Ok(None) => {
            drop(outbox);
            if state.polls.remove(&connection_id).is_some() {
                state.router.disconnect(&connection_id);
            }
            debug!(connection = %connection_id, "Long-poll outbox closed");
            return unknown_session(connection_id.as_str());
        }
        Err(_) => {}
    }
    drop(outbox);

    state.router.registry().touch(&connection_id);
    trace!(connection = %connection_id, count = frames.len(), "Long-poll delivered");
    Json(frames).into_response()
}

/// Close a long-poll session.
async fn poll_close(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let connection_id = ConnectionId::from(id);
    if state.polls.remove(&connection_id).is_none() {
        return unknown_session(connection_id.as_str());
    }
    state.router.disconnect(&connection_id);
    debug!(connection = %connection_id, "Long-poll session closed");
    StatusCode::NO_CONTENT.into_response()
}
