//! # Upstream Event Codec
//!
//! Every control-plane message exchanged with the recognition service is a JSON
//! envelope with a `header` and a `payload`:
//!
//! ```json
//! {
//!   "header": {"action": "run-task", "task_id": "2bf83b9a-...", "streaming": "duplex"},
//!   "payload": {
//!     "task_group": "audio", "task": "asr", "function": "recognition",
//!     "model": "paraformer-realtime-v2",
//!     "parameters": {"format": "pcm", "sample_rate": 16000, "language_hints": ["zh"]},
//!     "input": {}
//!   }
//! }
//! ```
//!
//! Outbound messages carry `header.action`, inbound ones carry `header.event`.
//! The wire strings are mapped onto two closed types, [`OutboundAction`] and
//! [`InboundEvent`], so the relay matches on variants instead of literals.
//! Unknown event names survive as [`InboundEvent::Unrecognized`] for logging.

use crate::config::UpstreamConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The only streaming mode the relay speaks.
pub const STREAMING_DUPLEX: &str = "duplex";

const ACTION_RUN_TASK: &str = "run-task";
const ACTION_FINISH_TASK: &str = "finish-task";

const EVENT_TASK_STARTED: &str = "task-started";
const EVENT_RESULT_GENERATED: &str = "result-generated";
const EVENT_TASK_FINISHED: &str = "task-finished";
const EVENT_TASK_FAILED: &str = "task-failed";

/// Wire envelope shared by both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Input>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

/// `run-task` recognition parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    pub format: String,
    pub sample_rate: u32,
    pub language_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disfluency_removal_enabled: Option<bool>,
}

/// Always serialized as `{}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Input {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub sentence: Option<Sentence>,
}

/// A (possibly partial) recognized sentence.
///
/// `end_time` stays `None` while the sentence is still being recognized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    #[serde(default)]
    pub begin_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Word {
    #[serde(default)]
    pub begin_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub punctuation: String,
}

impl Sentence {
    /// True once upstream has assigned an end time.
    pub fn is_final(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Model and audio settings sent with `run-task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionParams {
    pub model: String,
    pub parameters: Parameters,
}

impl RecognitionParams {
    /// Parameters for a new task, taken from the current upstream configuration.
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            model: config.model.clone(),
            parameters: Parameters {
                format: config.format.clone(),
                sample_rate: config.sample_rate,
                language_hints: config.language_hints.clone(),
                vocabulary_id: config.vocabulary_id.clone(),
                disfluency_removal_enabled: config.disfluency_removal_enabled,
            },
        }
    }
}

/// Commands the relay sends upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    RunTask {
        task_id: String,
        params: RecognitionParams,
    },
    FinishTask {
        task_id: String,
    },
}

impl OutboundAction {
    pub fn task_id(&self) -> &str {
        match self {
            OutboundAction::RunTask { task_id, .. } | OutboundAction::FinishTask { task_id } => task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundAction::RunTask { .. } => ACTION_RUN_TASK,
            OutboundAction::FinishTask { .. } => ACTION_FINISH_TASK,
        }
    }

    /// Serialize into the canonical wire envelope.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let header = Header {
            action: Some(self.name().to_string()),
            task_id: self.task_id().to_string(),
            streaming: Some(STREAMING_DUPLEX.to_string()),
            ..Header::default()
        };

        let payload = match self {
            OutboundAction::RunTask { params, .. } => Payload {
                task_group: Some("audio".to_string()),
                task: Some("asr".to_string()),
                function: Some("recognition".to_string()),
                model: Some(params.model.clone()),
                parameters: Some(params.parameters.clone()),
                input: Some(Input {}),
                ..Payload::default()
            },
            OutboundAction::FinishTask { .. } => Payload {
                input: Some(Input {}),
                ..Payload::default()
            },
        };

        serde_json::to_string(&Envelope { header, payload })
    }
}

/// Events the recognition service sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TaskStarted {
        task_id: String,
    },
    ResultGenerated {
        task_id: String,
        sentence: Sentence,
    },
    TaskFinished {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error_code: Option<String>,
        error_message: Option<String>,
    },
    /// An `event` value the relay does not know; `name` is the original string.
    Unrecognized {
        task_id: String,
        name: String,
    },
}

impl InboundEvent {
    /// Parse one inbound text frame.
    ///
    /// A frame that is not a JSON envelope is a [`DecodeError`]; a well-formed
    /// envelope with an unknown (or missing) event name is `Unrecognized`.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError)?;
        let Envelope { header, payload } = envelope;
        let task_id = header.task_id;

        let event = match header.event.as_deref() {
            Some(EVENT_TASK_STARTED) => InboundEvent::TaskStarted { task_id },
            Some(EVENT_RESULT_GENERATED) => InboundEvent::ResultGenerated {
                task_id,
                sentence: payload
                    .output
                    .and_then(|output| output.sentence)
                    .unwrap_or_default(),
            },
            Some(EVENT_TASK_FINISHED) => InboundEvent::TaskFinished { task_id },
            Some(EVENT_TASK_FAILED) => InboundEvent::TaskFailed {
                task_id,
                error_code: header.error_code.filter(|code| !code.is_empty()),
                error_message: header.error_message.filter(|msg| !msg.is_empty()),
            },
            other => InboundEvent::Unrecognized {
                task_id,
                name: other.unwrap_or_default().to_string(),
            },
        };

        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            InboundEvent::TaskStarted { .. } => EVENT_TASK_STARTED,
            InboundEvent::ResultGenerated { .. } => EVENT_RESULT_GENERATED,
            InboundEvent::TaskFinished { .. } => EVENT_TASK_FINISHED,
            InboundEvent::TaskFailed { .. } => EVENT_TASK_FAILED,
            InboundEvent::Unrecognized { name, .. } => name.as_str(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            InboundEvent::TaskStarted { task_id }
            | InboundEvent::ResultGenerated { task_id, .. }
            | InboundEvent::TaskFinished { task_id }
            | InboundEvent::TaskFailed { task_id, .. }
            | InboundEvent::Unrecognized { task_id, .. } => task_id,
        }
    }
}

/// An inbound frame that could not be parsed as an envelope.
#[derive(Debug)]
pub struct DecodeError(serde_json::Error);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed upstream frame: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn params() -> RecognitionParams {
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

    #[test]
    fn test_run_task_envelope() {
        let action = OutboundAction::RunTask {
            task_id: "task-1".to_string(),
            params: params(),
        };
        let json: Value = serde_json::from_str(&action.encode().unwrap()).unwrap();

        assert_eq!(json["header"]["action"], "run-task");
        assert_eq!(json["header"]["task_id"], "task-1");
        assert_eq!(json["header"]["streaming"], "duplex");
        assert!(json["header"].get("event").is_none());

        let payload = &json["payload"];
        assert_eq!(payload["task_group"], "audio");
        assert_eq!(payload["task"], "asr");
        assert_eq!(payload["function"], "recognition");
        assert_eq!(payload["model"], "paraformer-realtime-v2");
        assert_eq!(payload["parameters"]["format"], "pcm");
        assert_eq!(payload["parameters"]["sample_rate"], 16000);
        assert_eq!(payload["parameters"]["language_hints"], serde_json::json!(["zh"]));
        assert!(payload["parameters"].get("vocabulary_id").is_none());
        assert_eq!(payload["input"], serde_json::json!({}));
    }

    #[test]
    fn test_optional_parameters_are_sent_when_set() {
        let mut params = params();
        params.parameters.vocabulary_id = Some("vocab-123".to_string());
        params.parameters.disfluency_removal_enabled = Some(false);
        let action = OutboundAction::RunTask {
            task_id: "task-1".to_string(),
            params,
        };
        let json: Value = serde_json::from_str(&action.encode().unwrap()).unwrap();
        assert_eq!(json["payload"]["parameters"]["vocabulary_id"], "vocab-123");
        assert_eq!(json["payload"]["parameters"]["disfluency_removal_enabled"], false);
    }

    #[test]
    fn test_params_follow_upstream_config() {
        let mut config = crate::config::AppConfig::default().upstream;
        config.language_hints = vec!["zh".to_string(), "en".to_string()];
        config.vocabulary_id = Some("vocab-123".to_string());

        let params = RecognitionParams::from_config(&config);
        assert_eq!(params.model, config.model);
        assert_eq!(params.parameters.sample_rate, 16000);
        assert_eq!(params.parameters.language_hints, vec!["zh", "en"]);
        assert_eq!(params.parameters.vocabulary_id.as_deref(), Some("vocab-123"));
    }

    #[test]
    fn test_finish_task_envelope() {
        let action = OutboundAction::FinishTask {
            task_id: "task-1".to_string(),
        };
        let json: Value = serde_json::from_str(&action.encode().unwrap()).unwrap();
        assert_eq!(json["header"]["action"], "finish-task");
        assert_eq!(json["header"]["task_id"], "task-1");
        assert_eq!(json["header"]["streaming"], "duplex");
        assert_eq!(json["payload"], serde_json::json!({"input": {}}));
    }

    #[test]
    fn test_decode_result_generated() {
        let frame = r#"{
            "header": {"task_id": "t", "event": "result-generated", "attributes": {}},
            "payload": {
                "output": {
                    "sentence": {
                        "begin_time": 170,
                        "end_time": null,
                        "text": "好，我们的一个",
                        "words": [
                            {"begin_time": 170, "end_time": 295, "text": "好", "punctuation": "，"},
                            {"begin_time": 295, "end_time": 503, "text": "我们", "punctuation": ""}
                        ]
                    }
                },
                "usage": null
            }
        }"#;

        match InboundEvent::decode(frame).unwrap() {
            InboundEvent::ResultGenerated { task_id, sentence } => {
                assert_eq!(task_id, "t");
                assert_eq!(sentence.text, "好，我们的一个");
                assert_eq!(sentence.begin_time, Some(170));
                assert!(!sentence.is_final());
                assert_eq!(sentence.words.len(), 2);
                assert_eq!(sentence.words[0].punctuation, "，");
                assert_eq!(sentence.words[1].end_time, Some(503));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_task_failed() {
        let frame = r#"{
            "header": {
                "task_id": "t", "event": "task-failed",
                "error_code": "CLIENT_ERROR",
                "error_message": "request timeout after 23 seconds.",
                "attributes": {}
            },
            "payload": {}
        }"#;
        let event = InboundEvent::decode(frame).unwrap();
        assert_eq!(
            event,
            InboundEvent::TaskFailed {
                task_id: "t".to_string(),
                error_code: Some("CLIENT_ERROR".to_string()),
                error_message: Some("request timeout after 23 seconds.".to_string()),
            }
        );

        let bare = r#"{"header": {"task_id": "t", "event": "task-failed", "error_message": ""}}"#;
        match InboundEvent::decode(bare).unwrap() {
            InboundEvent::TaskFailed { error_message, .. } => assert_eq!(error_message, None),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_lifecycle_events() {
        let started = InboundEvent::decode(r#"{"header": {"task_id": "t", "event": "task-started"}, "payload": {}}"#).unwrap();
        assert_eq!(started, InboundEvent::TaskStarted { task_id: "t".to_string() });

        let finished = InboundEvent::decode(
            r#"{"header": {"task_id": "t", "event": "task-finished"}, "payload": {"output": {}, "usage": null}}"#,
        )
        .unwrap();
        assert_eq!(finished, InboundEvent::TaskFinished { task_id: "t".to_string() });
    }

    #[test]
    fn test_decode_unrecognized_keeps_name() {
        let event = InboundEvent::decode(r#"{"header": {"task_id": "t", "event": "task-paused"}}"#).unwrap();
        assert_eq!(event.name(), "task-paused");
        assert!(matches!(event, InboundEvent::Unrecognized { .. }));

        let nameless = InboundEvent::decode(r#"{"header": {"task_id": "t"}}"#).unwrap();
        assert_eq!(nameless.name(), "");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(InboundEvent::decode("not json").is_err());
        assert!(InboundEvent::decode(r#"{"payload": {}}"#).is_err());
        let err = InboundEvent::decode("{").unwrap_err();
        assert!(err.to_string().starts_with("malformed upstream frame"));
    }
}
