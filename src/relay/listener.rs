//! # Upstream Listener
//!
//! Background half of a relay session. Reads frames from the upstream connection,
//! decodes them and reacts:
//!
//! | event              | effect                                              |
//! |--------------------|-----------------------------------------------------|
//! | `task-started`     | fire the started signal (once)                      |
//! | `result-generated` | emit the sentence text downstream                   |
//! | `task-finished`    | fire done and stop                                  |
//! | `task-failed`      | log the reason, fire done and stop                  |
//! | anything else      | log and keep reading                                |
//!
//! The two signals are `oneshot` senders held in `Option`s, so each can fire at
//! most once. The listener returns right after a terminal event, which is what
//! guarantees no result is emitted after the task ended.

use crate::relay::downstream::ResultSink;
use crate::relay::event::InboundEvent;
use crate::relay::upstream::FrameSource;

use std::ops::ControlFlow;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Why a session's task ended, as reported through the done signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    TaskFinished,
    TaskFailed { message: Option<String> },
    /// The local client went away (read or write side).
    ClientDisconnected,
    /// Upstream closed or broke the connection without a terminal event.
    UpstreamClosed,
    /// Input ended but no terminal event arrived in time.
    FinishTimeout,
}

impl SessionEnd {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionEnd::TaskFinished | SessionEnd::ClientDisconnected)
    }

    pub fn describe(&self) -> String {
        match self {
            SessionEnd::TaskFinished => "task finished".to_string(),
            SessionEnd::TaskFailed { message: Some(msg) } => format!("task failed: {}", msg),
            SessionEnd::TaskFailed { message: None } => "task failed for an unknown reason".to_string(),
            SessionEnd::ClientDisconnected => "client disconnected".to_string(),
            SessionEnd::UpstreamClosed => "upstream connection closed".to_string(),
            SessionEnd::FinishTimeout => "no task-finished before the finish timeout".to_string(),
        }
    }
}

/// Counters reported by a finished listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub events: u64,
    pub results_emitted: u64,
    pub malformed_frames: u64,
}

/// Applies inbound events to the session signals and the result sink.
pub struct EventDispatcher<R> {
    started: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Sender<SessionEnd>>,
    sink: R,
    stats: ListenerStats,
}

impl<R: ResultSink> EventDispatcher<R> {
    pub fn new(started: oneshot::Sender<()>, done: oneshot::Sender<SessionEnd>, sink: R) -> Self {
        Self {
            started: Some(started),
            done: Some(done),
            sink,
            stats: ListenerStats::default(),
        }
    }

    /// Handle one raw text frame.
    pub async fn handle_frame(&mut self, frame: &str) -> ControlFlow<()> {
        let event = match InboundEvent::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!("Skipping upstream frame: {}", e);
                return ControlFlow::Continue(());
            }
        };

        self.stats.events += 1;
        debug!(event = event.name(), task_id = event.task_id(), "Upstream event");

        match event {
            InboundEvent::TaskStarted { task_id } => {
                match self.started.take() {
                    Some(started) => {
                        info!(task_id = %task_id, "Task started");
                        let _ = started.send(());
                    }
                    None => debug!(task_id = %task_id, "Duplicate task-started ignored"),
                }
                ControlFlow::Continue(())
            }
            InboundEvent::ResultGenerated { task_id, sentence } => {
                if sentence.text.is_empty() {
                    return ControlFlow::Continue(());
                }

                debug!(task_id = %task_id, is_final = sentence.is_final(), "Result: {}", sentence.text);

                match self.sink.emit_result(&sentence.text).await {
                    Ok(()) => {
                        self.stats.results_emitted += 1;
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, "Failed to deliver result downstream: {}", e);
                        self.finish(SessionEnd::ClientDisconnected);
                        ControlFlow::Break(())
                    }
                }
            }
            InboundEvent::TaskFinished { task_id } => {
                info!(task_id = %task_id, "Task finished");
                self.finish(SessionEnd::TaskFinished);
                ControlFlow::Break(())
            }
            InboundEvent::TaskFailed {
                task_id,
                error_code,
                error_message,
            } => {
                match &error_message {
                    Some(msg) => error!(task_id = %task_id, code = ?error_code, "Task failed: {}", msg),
                    None => error!(
                        task_id = %task_id,
                        code = ?error_code,
                        "task failed for an unknown reason"
                    ),
                }
                self.finish(SessionEnd::TaskFailed { message: error_message });
                ControlFlow::Break(())
            }
            InboundEvent::Unrecognized { task_id, name } => {
                warn!(task_id = %task_id, "Ignoring unrecognized upstream event '{}'", name);
                ControlFlow::Continue(())
            }
        }
    }

    /// Fire the done signal if nothing fired it yet.
    pub fn finish(&mut self, end: SessionEnd) {
        if let Some(done) = self.done.take() {
            let _ = done.send(end);
        }
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats
    }
}

/// Read upstream frames until a terminal event or the end of the connection.
pub async fn receive_loop<F, R>(mut source: F, mut dispatcher: EventDispatcher<R>) -> ListenerStats
where
    F: FrameSource,
    R: ResultSink,
{
    loop {
        match source.next_text().await {
            Ok(Some(frame)) => {
                if dispatcher.handle_frame(&frame).await.is_break() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Upstream stream ended");
                dispatcher.finish(SessionEnd::UpstreamClosed);
                break;
            }
            Err(e) => {
                warn!("Upstream read failed: {}", e);
                dispatcher.finish(SessionEnd::UpstreamClosed);
                break;
            }
        }
    }

    dispatcher.stats()
}
