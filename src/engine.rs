//! Voice engine boundary.
//!
//! The engine runs the actual call (audio, speech recognition, the assistant
//! itself). The core only starts and stops it and consumes its events. Engines
//! that deliver just the minimal event set (start, end, final transcripts) are
//! fully supported; the end-of-call report is optional.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transcript::{Role, UtteranceEvent, UtteranceKind};

/// Errors reported by an engine implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine rejected session start: {0}")]
    StartRejected(String),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// Everything the engine needs to start a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSessionConfig {
    pub session_id: String,
    pub assistant_id: String,
    /// Grounding text from the context builder
    pub context: String,
    /// Opening line spoken by the assistant
    pub first_message: String,
}

/// Control surface of a voice engine
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    /// Ask the engine to start a call. Success only means the request was
    /// accepted; the call is live once `EngineEvent::CallStarted` arrives.
    async fn start(&self, config: EngineSessionConfig) -> Result<(), EngineError>;

    /// Request the call to stop. Must not block on the engine's acknowledgment.
    fn stop(&self);
}

/// Events consumed by the lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    CallStarted,
    CallEnded,
    SpeechStarted(Role),
    SpeechEnded(Role),
    Utterance(UtteranceEvent),
    /// Rich termination signal carrying engine-computed results
    EndOfCallReport {
        analysis: Option<String>,
        transcript: Option<String>,
    },
    Error(String),
}

impl EngineEvent {
    /// Whether this event ends the call
    pub fn is_termination(&self) -> bool {
        matches!(self, EngineEvent::CallEnded | EngineEvent::EndOfCallReport { .. })
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::CallStarted => "call_started",
            EngineEvent::CallEnded => "call_ended",
            EngineEvent::SpeechStarted(_) => "speech_started",
            EngineEvent::SpeechEnded(_) => "speech_ended",
            EngineEvent::Utterance(_) => "utterance",
            EngineEvent::EndOfCallReport { .. } => "end_of_call_report",
            EngineEvent::Error(_) => "error",
        }
    }
}

/// Speech status in a `speech-update` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechStatus {
    Started,
    Stopped,
}

/// Analysis block of an end-of-call report
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReportAnalysis {
    pub summary: Option<String>,
}

/// JSON client message as emitted by the voice platform
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineMessage {
    CallStart,
    CallEnd,
    SpeechUpdate {
        status: SpeechStatus,
        role: Role,
    },
    Transcript {
        role: Role,
        #[serde(rename = "transcriptType")]
        transcript_type: UtteranceKind,
        transcript: String,
    },
    EndOfCallReport {
        #[serde(default)]
        analysis: Option<ReportAnalysis>,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        transcript: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Message types the core does not act on (volume levels, tool calls, ...)
    #[serde(other)]
    Unknown,
}

impl EngineMessage {
    /// Parse one JSON message
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Map to a lifecycle event; `None` for messages the core ignores
    pub fn into_event(self) -> Option<EngineEvent> {
        match self {
            EngineMessage::CallStart => Some(EngineEvent::CallStarted),
            EngineMessage::CallEnd => Some(EngineEvent::CallEnded),
            EngineMessage::SpeechUpdate { status, role } => Some(match status {
                SpeechStatus::Started => EngineEvent::SpeechStarted(role),
                SpeechStatus::Stopped => EngineEvent::SpeechEnded(role),
            }),
            EngineMessage::Transcript {
                role,
                transcript_type,
                transcript,
            } => Some(EngineEvent::Utterance(UtteranceEvent {
                role,
                text: transcript,
                kind: transcript_type,
            })),
            EngineMessage::EndOfCallReport {
                analysis,
                summary,
                transcript,
            } => {
                // Newer payloads nest the summary under `analysis`
                let analysis = analysis.and_then(|a| a.summary).or(summary);
                Some(EngineEvent::EndOfCallReport {
                    analysis: non_blank(analysis),
                    transcript: non_blank(transcript),
                })
            }
            EngineMessage::Error { message } => Some(EngineEvent::Error(
                message.unwrap_or_else(|| "Unknown engine error".to_string()),
            )),
            EngineMessage::Unknown => None,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
