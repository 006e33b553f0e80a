//! In-memory doubles for relay tests.

use crate::error::RelayError;
use crate::relay::downstream::{AudioSource, CloseStatus, ResultSink};
use crate::relay::event::{Parameters, RecognitionParams};
use crate::relay::upstream::{FrameSink, FrameSource, UpstreamConnector};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

pub fn recognition_params() -> RecognitionParams {
    RecognitionParams {
        model: "paraformer-realtime-v2".to_string(),
        parameters: Parameters {
            format: "pcm".to_string(),
            sample_rate: 16000,
            language_hints: vec!["zh".to_string()],
            vocabulary_id: None,
            disfluency_removal_enabled: None,
        },
    }
}

/// Canned upstream frames.
pub mod frames {
    use serde_json::json;

    pub fn task_started(task_id: &str) -> String {
        json!({"header": {"task_id": task_id, "event": "task-started", "attributes": {}}, "payload": {}}).to_string()
    }

    pub fn result_generated(task_id: &str, text: &str) -> String {
        json!({
            "header": {"task_id": task_id, "event": "result-generated", "attributes": {}},
            "payload": {
                "output": {"sentence": {"begin_time": 170, "end_time": null, "text": text, "words": []}},
                "usage": null
            }
        })
        .to_string()
    }

    pub fn task_finished(task_id: &str) -> String {
        json!({"header": {"task_id": task_id, "event": "task-finished", "attributes": {}}, "payload": {}}).to_string()
    }

    pub fn task_failed(task_id: &str, message: &str) -> String {
        json!({
            "header": {
                "task_id": task_id,
                "event": "task-failed",
                "error_code": "CLIENT_ERROR",
                "error_message": message,
                "attributes": {}
            },
            "payload": {}
        })
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl SentFrame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SentFrame::Text(text) => Some(text),
            SentFrame::Binary(_) => None,
        }
    }

    /// `header.action` of a text frame.
    pub fn action(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(self.as_text()?).ok()?;
        value["header"]["action"].as_str().map(str::to_string)
    }

    pub fn task_id(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(self.as_text()?).ok()?;
        value["header"]["task_id"].as_str().map(str::to_string)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedFrames(Arc<Mutex<Vec<SentFrame>>>);

impl SharedFrames {
    pub fn snapshot(&self) -> Vec<SentFrame> {
        self.0.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.snapshot().iter().filter_map(SentFrame::action).collect()
    }

    pub fn binary_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|frame| matches!(frame, SentFrame::Binary(_)))
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Upstream write half that records everything sent through it.
#[derive(Default)]
pub struct RecordingSink {
    frames: SharedFrames,
    closes: Counter,
    tap: Option<mpsc::UnboundedSender<SentFrame>>,
    closed: Option<Arc<Notify>>,
    fail_binary: bool,
}

impl RecordingSink {
    pub fn frames(&self) -> SharedFrames {
        self.frames.clone()
    }

    pub fn close_count(&self) -> Counter {
        self.closes.clone()
    }

    fn record(&mut self, frame: SentFrame) {
        self.frames.0.lock().unwrap().push(frame.clone());
        if let Some(tap) = &self.tap {
            let _ = tap.send(frame);
        }
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.record(SentFrame::Text(text));
        Ok(())
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), RelayError> {
        if self.fail_binary {
            return Err(RelayError::UpstreamTransport("broken pipe".to_string()));
        }
        self.record(SentFrame::Binary(data));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.closes.incr();
        if let Some(closed) = &self.closed {
            closed.notify_one();
        }
        Ok(())
    }
}

/// Upstream read half fed from a channel. Ends when the channel closes or the
/// paired [`RecordingSink`] is closed.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<Notify>,
}

impl ChannelSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                closed: Arc::new(Notify::new()),
            },
            tx,
        )
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_text(&mut self) -> Result<Option<String>, RelayError> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => Ok(frame),
            _ = self.closed.notified() => Ok(None),
        }
    }
}

/// Test side of a fake upstream connection.
pub struct UpstreamPeer {
    /// Frames the fake service sends to the relay.
    pub inbound: mpsc::UnboundedSender<String>,
    /// Frames the relay sent, in order, as they happen.
    pub sent: mpsc::UnboundedReceiver<SentFrame>,
    pub frames: SharedFrames,
    pub closes: Counter,
}

/// Connector handing out one pre-built fake connection.
pub struct FakeConnector {
    halves: Mutex<Option<(RecordingSink, ChannelSource)>>,
}

impl FakeConnector {
    pub fn refusing() -> Self {
        Self {
            halves: Mutex::new(None),
        }
    }
}

pub fn fake_upstream() -> (FakeConnector, UpstreamPeer) {
    build_fake_upstream(false)
}

/// Fake upstream whose binary writes fail.
pub fn broken_upstream() -> (FakeConnector, UpstreamPeer) {
    build_fake_upstream(true)
}

fn build_fake_upstream(fail_binary: bool) -> (FakeConnector, UpstreamPeer) {
    let (source, inbound) = ChannelSource::new();
    let (tap_tx, tap_rx) = mpsc::unbounded_channel();
    let sink = RecordingSink {
        tap: Some(tap_tx),
        closed: Some(source.closed.clone()),
        fail_binary,
        ..RecordingSink::default()
    };
    let peer = UpstreamPeer {
        inbound,
        sent: tap_rx,
        frames: sink.frames(),
        closes: sink.close_count(),
    };
    let connector = FakeConnector {
        halves: Mutex::new(Some((sink, source))),
    };
    (connector, peer)
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    type Sink = RecordingSink;
    type Source = ChannelSource;

    async fn connect(&self) -> Result<(RecordingSink, ChannelSource), RelayError> {
        self.halves
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RelayError::Connect("connection refused".to_string()))
    }
}

/// Audio source fed from a channel; a dropped sender means end of input.
pub struct ChannelAudioSource {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, RelayError>>,
    gone: Arc<Notify>,
}

impl ChannelAudioSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<Vec<u8>, RelayError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                gone: Arc::new(Notify::new()),
            },
            tx,
        )
    }

    /// Handle that reports the producer as gone when notified.
    pub fn disconnect_handle(&self) -> Arc<Notify> {
        self.gone.clone()
    }
}

#[async_trait]
impl AudioSource for ChannelAudioSource {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn disconnected(&mut self) {
        self.gone.notified().await
    }
}

/// Result sink that records results and close calls.
#[derive(Debug, Clone, Default)]
pub struct RecordingResultSink {
    results: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<Vec<CloseStatus>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingResultSink {
    pub fn results(&self) -> Vec<String> {
        self.results.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<CloseStatus> {
        self.closes.lock().unwrap().clone()
    }

    pub fn fail_emits(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultSink for RecordingResultSink {
    async fn emit_result(&self, text: &str) -> Result<(), RelayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::DownstreamClosed);
        }
        self.results.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self, status: CloseStatus) {
        self.closes.lock().unwrap().push(status);
    }
}
