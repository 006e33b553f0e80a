//! # Upstream Session
//!
//! Owns the single WebSocket connection to the recognition service.
//!
//! ## Connection Split:
//! After the handshake the socket is split in two halves:
//! - **[`FrameSink`]** (write half): kept by the session coordinator, which sends
//!   `run-task`, audio frames and `finish-task` through [`UpstreamSession`]
//! - **[`FrameSource`]** (read half): handed to the background listener, which
//!   decodes and dispatches events
//!
//! Both halves are traits so tests can drive the coordinator with in-memory doubles.

use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::relay::event::{OutboundAction, RecognitionParams};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production write half.
pub type WsFrameSink = SplitSink<UpstreamStream, Message>;

/// Production read half.
pub type WsFrameSource = SplitStream<UpstreamStream>;

/// Write half of the upstream connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError>;
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), RelayError>;
    async fn close(&mut self) -> Result<(), RelayError>;
}

/// Read half of the upstream connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame. `Ok(None)` means upstream closed the connection.
    async fn next_text(&mut self) -> Result<Option<String>, RelayError>;
}

/// Opens upstream connections; one call per relay session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    type Sink: FrameSink + 'static;
    type Source: FrameSource + 'static;

    async fn connect(&self) -> Result<(Self::Sink, Self::Source), RelayError>;
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.send(Message::Text(text))
            .await
            .map_err(|e| RelayError::UpstreamTransport(e.to_string()))
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), RelayError> {
        self.send(Message::Binary(data))
            .await
            .map_err(|e| RelayError::UpstreamTransport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        SinkExt::close(self)
            .await
            .map_err(|e| RelayError::UpstreamTransport(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn next_text(&mut self) -> Result<Option<String>, RelayError> {
        while let Some(message) = self.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(frame)) => {
                    debug!("Upstream sent close frame: {:?}", frame);
                    return Ok(None);
                }
                Ok(Message::Binary(data)) => {
                    debug!(bytes = data.len(), "Ignoring binary frame from upstream");
                }
                Ok(_) => {} // ping/pong/raw frames are handled by tungstenite
                Err(e) => return Err(RelayError::UpstreamTransport(e.to_string())),
            }
        }
        Ok(None)
    }
}

/// Dials the DashScope realtime inference endpoint.
#[derive(Debug, Clone)]
pub struct DashScopeConnector {
    url: String,
    api_key: String,
    data_inspection: bool,
}

impl DashScopeConnector {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            data_inspection: config.data_inspection,
        }
    }
}

#[async_trait]
impl UpstreamConnector for DashScopeConnector {
    type Sink = WsFrameSink;
    type Source = WsFrameSource;

    /// Open the upstream WebSocket with the bearer token and data-inspection headers.
    ///
    /// An empty API key fails before anything is dialed.
    async fn connect(&self) -> Result<(WsFrameSink, WsFrameSource), RelayError> {
        if self.api_key.trim().is_empty() {
            return Err(RelayError::MissingApiKey);
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Connect(format!("invalid upstream url: {}", e)))?;

        let authorization = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| RelayError::Connect(format!("invalid API key: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", authorization);
        if self.data_inspection {
            headers.insert("X-DashScope-DataInspection", HeaderValue::from_static("enable"));
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        info!(url = %self.url, status = %response.status(), "Connected to upstream recognition service");

        Ok(stream.split())
    }
}

/// Command side of one upstream connection.
///
/// ## Ordering:
/// The coordinator calls [`send_run_task`](Self::send_run_task) first, forwards
/// audio only after `task-started`, and ends with
/// [`send_finish_task`](Self::send_finish_task). `finish-task` goes out at most once
/// and `close` only closes the socket the first time it is called.
pub struct UpstreamSession<S> {
    sink: S,
    finish_sent: bool,
    closed: bool,
}

impl<S: FrameSink> UpstreamSession<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            finish_sent: false,
            closed: false,
        }
    }

    /// Send `run-task` under a freshly generated task id and return that id.
    pub async fn send_run_task(&mut self, params: &RecognitionParams) -> Result<String, RelayError> {
        let task_id = Uuid::new_v4().to_string();
        let action = OutboundAction::RunTask {
            task_id: task_id.clone(),
            params: params.clone(),
        };
        self.sink.send_text(action.encode()?).await?;

        info!(
            task_id = %task_id,
            model = %params.model,
            sample_rate = params.parameters.sample_rate,
            "Sent run-task"
        );
        Ok(task_id)
    }

    /// Forward one audio frame as-is.
    pub async fn forward_audio_chunk(&mut self, chunk: Vec<u8>) -> Result<(), RelayError> {
        self.sink.send_binary(chunk).await
    }

    /// Send `finish-task` for `task_id`; repeated calls are no-ops.
    pub async fn send_finish_task(&mut self, task_id: &str) -> Result<(), RelayError> {
        if self.finish_sent {
            debug!(task_id = %task_id, "finish-task already sent, skipping");
            return Ok(());
        }
        self.finish_sent = true;

        let action = OutboundAction::FinishTask {
            task_id: task_id.to_string(),
        };
        self.sink.send_text(action.encode()?).await?;

        info!(task_id = %task_id, "Sent finish-task");
        Ok(())
    }

    /// Close the write half. Errors are logged, not returned.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.sink.close().await {
            warn!("Error closing upstream connection: {}", e);
        }
    }
}
