//! # Client WebSocket Relay Handler
//!
//! Audio clients connect to the configured `ws_path` (default `/ws`) and stream raw
//! audio as binary frames. Recognized text comes back as plain text frames.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Origin and capacity are checked before the upgrade; query
//!    parameters (`model`, `sample_rate`, `language_hints`) may override the
//!    configured recognition parameters
//! 2. **Audio Streaming**: Every binary message is forwarded upstream unmodified
//! 3. **Results**: Each recognized sentence text is sent as one text message
//! 4. **End**: The server closes the socket with `1000` when the task finished or
//!    `1011` plus a short reason when the session failed
//!
//! ## Message Format:
//! - **Client → Server**: Binary audio (format as configured, PCM 16kHz by default)
//! - **Server → Client**: Plain text, no JSON

use crate::error::{AppError, RelayError};
use crate::relay::{
    AudioSource, CloseStatus, DashScopeConnector, RecognitionParams, ResultSink, SessionCoordinator,
};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Control frame payloads are limited to 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Which browser origins may open a relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    AllowAny,
    AllowList(Vec<String>),
}

impl OriginPolicy {
    /// `["*"]` (or any list containing `*`) allows every origin.
    pub fn from_origins(origins: &[String]) -> Self {
        if origins.iter().any(|origin| origin.trim() == "*") {
            OriginPolicy::AllowAny
        } else {
            OriginPolicy::AllowList(
                origins
                    .iter()
                    .map(|origin| origin.trim().trim_end_matches('/').to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect(),
            )
        }
    }

    /// Requests without an `Origin` header come from non-browser clients and are allowed.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (_, None) | (OriginPolicy::AllowAny, _) => true,
            (OriginPolicy::AllowList(allowed), Some(origin)) => {
                let origin = origin.trim_end_matches('/');
                allowed.iter().any(|candidate| candidate == origin)
            }
        }
    }

    pub fn is_allow_any(&self) -> bool {
        matches!(self, OriginPolicy::AllowAny)
    }
}

/// Per-connection overrides taken from the upgrade request's query string.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
    /// Comma-separated, e.g. `zh,en`
    pub language_hints: Option<String>,
}

impl SessionQuery {
    pub fn apply(&self, mut params: RecognitionParams) -> Result<RecognitionParams, AppError> {
        if let Some(model) = &self.model {
            let model = model.trim();
            if model.is_empty() {
                return Err(AppError::BadRequest("model cannot be empty".to_string()));
            }
            params.model = model.to_string();
        }

        if let Some(rate) = self.sample_rate {
            if rate == 0 {
                return Err(AppError::BadRequest("sample_rate must be greater than 0".to_string()));
            }
            params.parameters.sample_rate = rate;
        }

        if let Some(hints) = &self.language_hints {
            let hints: Vec<String> = hints
                .split(',')
                .map(str::trim)
                .filter(|hint| !hint.is_empty())
                .map(str::to_string)
                .collect();
            if hints.is_empty() {
                return Err(AppError::BadRequest("language_hints cannot be empty".to_string()));
            }
            params.parameters.language_hints = hints;
        }

        Ok(params)
    }
}

/// Actor owning one client WebSocket.
///
/// Binary frames are pushed into a bounded queue read by the session coordinator.
/// When the queue is full the actor stops reading the socket until there is room.
/// Results and the final close arrive as actor messages from the session task.
pub struct ClientSocket {
    connection_id: String,

    /// Sender side of the audio queue; dropped when the socket stops
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Dropped when the socket stops, telling the session the client is gone
    disconnect_tx: Option<oneshot::Sender<()>>,

    state: AppState,

    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Last ping/pong (or any frame) from the client
    last_heartbeat: Instant,

    backpressure_waits: u64,
}

impl ClientSocket {
    pub fn new(
        connection_id: String,
        audio_tx: mpsc::Sender<Vec<u8>>,
        disconnect_tx: oneshot::Sender<()>,
        state: AppState,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            connection_id,
            audio_tx: Some(audio_tx),
            disconnect_tx: Some(disconnect_tx),
            state,
            heartbeat_interval,
            client_timeout,
            last_heartbeat: Instant::now(),
            backpressure_waits: 0,
        }
    }

    fn handle_audio(&mut self, data: Vec<u8>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(audio_tx) = &self.audio_tx else {
            return;
        };

        match audio_tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(pending)) => {
                let audio_tx = audio_tx.clone();
                self.backpressure_waits += 1;
                debug!(
                    session_id = %self.connection_id,
                    bytes = pending.len(),
                    "Audio queue full, pausing client reads"
                );

                // No other frame is read until this one is queued
                ctx.wait(
                    async move { audio_tx.send(pending).await.is_ok() }
                        .into_actor(self)
                        .map(|queued, act, _ctx| {
                            // Waiting on the session is not client silence
                            act.last_heartbeat = Instant::now();
                            if !queued {
                                debug!(session_id = %act.connection_id, "Session no longer reading audio");
                            }
                        }),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = %self.connection_id, "Session no longer reading audio");
            }
        }
    }
}

/// Send one result text to the client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct EmitText(pub String);

/// Close the client socket with the session's final status.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseClient(pub CloseStatus);

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.connection_id, "Client WebSocket connected");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.connection_id, "Client heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Closing the queue ends the coordinator's read side
        self.audio_tx.take();
        self.disconnect_tx.take();
        if self.backpressure_waits > 0 {
            self.state.record_backpressure_waits(self.backpressure_waits);
        }
        info!(
            session_id = %self.connection_id,
            backpressure_waits = self.backpressure_waits,
            "Client WebSocket disconnected"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(data.to_vec(), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                warn!(
                    session_id = %self.connection_id,
                    bytes = text.len(),
                    "Ignoring text frame from client; audio must be sent as binary"
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.connection_id, "Client closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<EmitText> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: EmitText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseClient> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: CloseClient, ctx: &mut Self::Context) {
        ctx.close(Some(close_reason(&msg.0)));
        ctx.stop();
    }
}

fn close_reason(status: &CloseStatus) -> ws::CloseReason {
    match status {
        CloseStatus::Completed => ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: None,
        },
        CloseStatus::Failed(reason) => ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some(truncate_reason(reason)),
        },
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Audio read side of a client connection.
pub struct ClientAudioSource {
    rx: mpsc::Receiver<Vec<u8>>,
    disconnect_rx: oneshot::Receiver<()>,
    gone: bool,
}

impl ClientAudioSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, disconnect_rx: oneshot::Receiver<()>) -> Self {
        Self {
            rx,
            disconnect_rx,
            gone: false,
        }
    }
}

#[async_trait]
impl AudioSource for ClientAudioSource {
    /// A live client never ends its input gracefully: when the socket goes away
    /// the queue closes and the read fails.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        match self.rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None => Err(RelayError::DownstreamClosed),
        }
    }

    async fn disconnected(&mut self) {
        if !self.gone {
            let _ = (&mut self.disconnect_rx).await;
            self.gone = true;
        }
    }
}

/// Result side of a client connection, backed by the actor's address.
#[derive(Clone)]
pub struct ClientResultSink {
    addr: Addr<ClientSocket>,
}

impl ClientResultSink {
    pub fn new(addr: Addr<ClientSocket>) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl ResultSink for ClientResultSink {
    async fn emit_result(&self, text: &str) -> Result<(), RelayError> {
        if !self.addr.connected() {
            return Err(RelayError::DownstreamClosed);
        }
        self.addr.do_send(EmitText(text.to_string()));
        Ok(())
    }

    async fn close(&self, status: CloseStatus) {
        if self.addr.connected() {
            self.addr.do_send(CloseClient(status));
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Rejections happen on the plain HTTP request: 403 for a disallowed origin,
/// 400 for invalid query overrides, 503 when every session place is taken.
/// After the upgrade the session runs on its own task; its failure only closes
/// this client's socket.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();
    let peer = req.connection_info().peer_addr().unwrap_or("unknown").to_string();

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or_default());
    let policy = OriginPolicy::from_origins(&config.server.allowed_origins);
    if !policy.allows(origin) {
        warn!(peer = %peer, origin = ?origin, "Rejected WebSocket origin");
        let origin = origin.unwrap_or_default();
        return Err(AppError::Forbidden(format!("origin {} is not allowed", origin)).into());
    }

    let query = web::Query::<SessionQuery>::from_query(req.query_string())
        .map_err(|e| AppError::BadRequest(format!("invalid query parameters: {}", e)))?;
    let params = query.apply(RecognitionParams::from_config(&config.upstream))?;

    let slot = state.try_acquire_session().ok_or_else(|| {
        AppError::Unavailable(format!(
            "all {} relay sessions are in use",
            config.performance.max_concurrent_sessions
        ))
    })?;

    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(
        session_id = %connection_id,
        peer = %peer,
        model = %params.model,
        "New relay connection"
    );

    let (audio_tx, audio_rx) = mpsc::channel(config.performance.audio_queue_capacity);
    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let socket = ClientSocket::new(
        connection_id.clone(),
        audio_tx,
        disconnect_tx,
        state.get_ref().clone(),
        Duration::from_secs(config.server.heartbeat_interval_secs),
        Duration::from_secs(config.server.client_timeout_secs),
    );
    let (addr, response) = ws::WsResponseBuilder::new(socket, &req, stream).start_with_addr()?;

    let coordinator = SessionCoordinator::new(DashScopeConnector::new(&config.upstream), params)
        .with_timeouts(config.upstream.task_start_timeout(), config.upstream.finish_timeout())
        .with_session_id(connection_id.clone());
    let session_state = state.get_ref().clone();

    tokio::spawn(async move {
        let _slot = slot;
        let result = coordinator
            .run(ClientAudioSource::new(audio_rx, disconnect_rx), ClientResultSink::new(addr))
            .await;

        match result {
            Ok(report) => session_state.record_session_report(&report),
            Err(e) => {
                if e.is_timeout() {
                    warn!(session_id = %connection_id, "Relay session timed out: {}", e);
                } else {
                    error!(session_id = %connection_id, "Relay session failed: {}", e);
                }
                session_state.record_session_failure();
            }
        }
    });

    Ok(response)
}
