//! # Session Coordinator
//!
//! Drives one relay session from dial to teardown:
//!
//! ```text
//! Connecting -> AwaitingTaskStarted -> Forwarding -> Finishing -> Closed
//!      |                |
//!      +----------------+--> Failed
//! ```
//!
//! ## Two activities per session:
//! - **Foreground** (this type): owns the upstream write half and the audio source
//! - **Listener** (spawned task): owns the upstream read half and a clone of the
//!   result sink, see [`crate::relay::listener`]
//!
//! They meet through two `oneshot` channels: `started` and `done`.
//!
//! ## Teardown:
//! Whatever the path, the upstream connection and the downstream sink are each
//! closed exactly once before [`SessionCoordinator::run`] returns.

use crate::error::RelayError;
use crate::relay::downstream::{AudioSource, CloseStatus, ResultSink};
use crate::relay::event::RecognitionParams;
use crate::relay::listener::{receive_loop, EventDispatcher, ListenerStats, SessionEnd};
use crate::relay::upstream::{FrameSink, UpstreamConnector, UpstreamSession};

use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long the listener may keep running after the upstream write half is closed.
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_TASK_START_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Summary of a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub task_id: String,
    pub end: SessionEnd,
    pub audio_chunks: u64,
    pub audio_bytes: u64,
    pub listener: ListenerStats,
}

#[derive(Debug, Default)]
struct Progress {
    task_id: Option<String>,
    audio_chunks: u64,
    audio_bytes: u64,
}

pub struct SessionCoordinator<C> {
    connector: C,
    params: RecognitionParams,
    start_timeout: Duration,
    finish_timeout: Duration,
    session_id: String,
}

impl<C: UpstreamConnector> SessionCoordinator<C> {
    pub fn new(connector: C, params: RecognitionParams) -> Self {
        Self {
            connector,
            params,
            start_timeout: DEFAULT_TASK_START_TIMEOUT,
            finish_timeout: DEFAULT_FINISH_TIMEOUT,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_timeouts(mut self, start_timeout: Duration, finish_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self.finish_timeout = finish_timeout;
        self
    }

    /// Tag log lines with an externally assigned id (e.g. the client connection id).
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Run the session until the task ends, the input ends, or something fails.
    ///
    /// `Ok` covers every ending where upstream answered: a finished task, a failed
    /// task (`SessionEnd::TaskFailed`), or a client that left. `Err` means the task
    /// could not be started or a transport broke.
    pub async fn run<A, R>(self, mut source: A, sink: R) -> Result<SessionReport, RelayError>
    where
        A: AudioSource,
        R: ResultSink,
    {
        let session_id = self.session_id.clone();
        debug!(session_id = %session_id, state = "connecting", "Session state");

        let (upstream_sink, upstream_source) = match self.connector.connect().await {
            Ok(halves) => halves,
            Err(e) => {
                debug!(session_id = %session_id, state = "failed", "Session state");
                sink.close(CloseStatus::Failed(e.to_string())).await;
                return Err(e);
            }
        };

        let mut upstream = UpstreamSession::new(upstream_sink);
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, mut done_rx) = oneshot::channel();
        let dispatcher = EventDispatcher::new(started_tx, done_tx, sink.clone());
        let mut listener = tokio::spawn(receive_loop(upstream_source, dispatcher));

        let mut progress = Progress::default();
        let outcome = self
            .drive(&mut upstream, &mut source, started_rx, &mut done_rx, &mut progress)
            .await;

        debug!(session_id = %session_id, state = "closed", "Session state");
        upstream.close().await;

        let stats = match tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, &mut listener).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                warn!(session_id = %session_id, "Listener task failed: {}", e);
                ListenerStats::default()
            }
            Err(_) => {
                debug!(session_id = %session_id, "Listener still running after close, aborting");
                listener.abort();
                ListenerStats::default()
            }
        };

        let status = match &outcome {
            Ok(end) if end.is_success() => CloseStatus::Completed,
            Ok(end) => CloseStatus::Failed(end.describe()),
            Err(e) => CloseStatus::Failed(e.to_string()),
        };
        sink.close(status).await;

        let end = outcome?;
        let report = SessionReport {
            task_id: progress.task_id.unwrap_or_default(),
            end,
            audio_chunks: progress.audio_chunks,
            audio_bytes: progress.audio_bytes,
            listener: stats,
        };

        info!(
            session_id = %session_id,
            task_id = %report.task_id,
            chunks = report.audio_chunks,
            bytes = report.audio_bytes,
            results = report.listener.results_emitted,
            "Session ended: {}",
            report.end.describe()
        );

        Ok(report)
    }

    async fn drive<S, A>(
        &self,
        upstream: &mut UpstreamSession<S>,
        source: &mut A,
        mut started_rx: oneshot::Receiver<()>,
        done_rx: &mut oneshot::Receiver<SessionEnd>,
        progress: &mut Progress,
    ) -> Result<SessionEnd, RelayError>
    where
        S: FrameSink,
        A: AudioSource,
    {
        let session_id = self.session_id.as_str();
        debug!(session_id = %session_id, state = "awaiting_task_started", "Session state");

        let task_id = upstream.send_run_task(&self.params).await?;
        progress.task_id = Some(task_id.clone());

        let deadline = tokio::time::sleep(self.start_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            end = &mut *done_rx => {
                return match end {
                    Ok(SessionEnd::UpstreamClosed) | Err(_) => {
                        debug!(session_id = %session_id, state = "failed", "Session state");
                        Err(RelayError::TaskNotStarted)
                    }
                    Ok(end) => Ok(end),
                };
            }
            started = &mut started_rx => {
                if started.is_err() {
                    debug!(session_id = %session_id, state = "failed", "Session state");
                    return Err(RelayError::TaskNotStarted);
                }
            }
            _ = source.disconnected() => {
                info!(session_id = %session_id, task_id = %task_id, "Client left before the task started");
                return Ok(SessionEnd::ClientDisconnected);
            }
            _ = &mut deadline => {
                warn!(
                    session_id = %session_id,
                    task_id = %task_id,
                    "No task-started within {:?}",
                    self.start_timeout
                );
                debug!(session_id = %session_id, state = "failed", "Session state");
                return Err(RelayError::TaskStartTimeout(self.start_timeout));
            }
        }

        debug!(session_id = %session_id, task_id = %task_id, state = "forwarding", "Session state");

        loop {
            tokio::select! {
                biased;
                end = &mut *done_rx => {
                    let end = end.unwrap_or(SessionEnd::UpstreamClosed);
                    if matches!(end, SessionEnd::ClientDisconnected | SessionEnd::UpstreamClosed) {
                        debug!(session_id = %session_id, state = "finishing", "Session state");
                        Self::finish_best_effort(upstream, &task_id).await;
                    }
                    return Ok(end);
                }
                read = source.read_chunk() => match read {
                    Ok(Some(chunk)) => {
                        let bytes = chunk.len() as u64;
                        if let Err(e) = upstream.forward_audio_chunk(chunk).await {
                            warn!(
                                session_id = %session_id,
                                task_id = %task_id,
                                "Forwarding audio failed: {}",
                                e
                            );
                            debug!(session_id = %session_id, state = "finishing", "Session state");
                            Self::finish_best_effort(upstream, &task_id).await;
                            return Err(e);
                        }
                        progress.audio_chunks += 1;
                        progress.audio_bytes += bytes;
                    }
                    Ok(None) => {
                        debug!(session_id = %session_id, state = "finishing", "Session state");
                        info!(session_id = %session_id, task_id = %task_id, "Audio input ended");
                        upstream.send_finish_task(&task_id).await?;

                        return match tokio::time::timeout(self.finish_timeout, &mut *done_rx).await {
                            Ok(Ok(end)) => Ok(end),
                            Ok(Err(_)) => Ok(SessionEnd::UpstreamClosed),
                            Err(_) => {
                                warn!(
                                    session_id = %session_id,
                                    task_id = %task_id,
                                    "No terminal event within {:?}",
                                    self.finish_timeout
                                );
                                Ok(SessionEnd::FinishTimeout)
                            }
                        };
                    }
                    Err(RelayError::DownstreamClosed) => {
                        info!(session_id = %session_id, task_id = %task_id, "Client disconnected");
                        debug!(session_id = %session_id, state = "finishing", "Session state");
                        Self::finish_best_effort(upstream, &task_id).await;
                        return Ok(SessionEnd::ClientDisconnected);
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, task_id = %task_id, "Reading audio failed: {}", e);
                        debug!(session_id = %session_id, state = "finishing", "Session state");
                        Self::finish_best_effort(upstream, &task_id).await;
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn finish_best_effort<S: FrameSink>(upstream: &mut UpstreamSession<S>, task_id: &str) {
        if let Err(e) = upstream.send_finish_task(task_id).await {
            warn!(task_id = %task_id, "Could not send finish-task: {}", e);
        }
    }
}
