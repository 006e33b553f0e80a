//! # Relay Module
//!
//! Bridges a local audio producer to the DashScope realtime recognition service
//! and streams recognized text back.
//!
//! ## Key Components:
//! - **Event Codec**: Typed `run-task`/`finish-task` actions and inbound events
//! - **Upstream Session**: Authenticated WebSocket to the recognition service
//! - **Downstream**: Audio sources and result sinks (client socket or local file)
//! - **Listener**: Background task dispatching upstream events
//! - **Coordinator**: Per-session state machine tying it all together
//!
//! ## Session Protocol:
//! 1. Connect upstream and send `run-task` with a fresh task id
//! 2. Wait for `task-started` before forwarding any audio
//! 3. Forward binary audio frames while results flow back as text
//! 4. Send `finish-task` when input ends, then close both sides

pub mod coordinator;  // Session state machine
pub mod downstream;   // Audio source / result sink seams
pub mod event;        // Wire envelope codec
pub mod listener;     // Upstream receive loop
pub mod upstream;     // Upstream connection and commands

#[cfg(test)]
pub mod testing;      // In-memory doubles shared by the tests

pub use coordinator::{SessionCoordinator, SessionReport};
pub use downstream::{AudioSource, CloseStatus, FileAudioSource, LogResultSink, ResultSink};
pub use event::RecognitionParams;
pub use upstream::DashScopeConnector;
