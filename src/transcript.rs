//! Transcript accumulator for a voice consultation.
//!
//! Merges the engine's streamed partial/final utterances into an ordered log of
//! finalized messages. At most one partial utterance is in flight at a time and
//! partials never reach the persisted transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Who spoke an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "user")]
    Patient,
    #[serde(alias = "bot")]
    Assistant,
}

impl Role {
    /// Label used in the flattened transcript
    pub fn label(&self) -> &'static str {
        match self {
            Role::Patient => "Patient",
            Role::Assistant => "Assistant",
        }
    }
}

/// Whether the engine is still transcribing an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceKind {
    Partial,
    Final,
}

/// One streamed transcript event from the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceEvent {
    pub role: Role,
    pub text: String,
    pub kind: UtteranceKind,
}

impl UtteranceEvent {
    pub fn partial(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            kind: UtteranceKind::Partial,
        }
    }

    pub fn final_text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            kind: UtteranceKind::Final,
        }
    }
}

/// A finalized utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// The utterance currently being transcribed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPartial {
    pub role: Role,
    pub text: String,
}

/// Ordered, append-only transcript with at most one in-flight partial
#[derive(Debug, Clone, Default)]
pub struct TranscriptAccumulator {
    messages: Vec<TranscriptMessage>,
    pending_partial: Option<PendingPartial>,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one streamed event.
    ///
    /// A partial replaces the in-flight entry wholesale, whatever its role.
    /// A final is appended and always clears the in-flight entry. Finals with
    /// no text are dropped.
    pub fn apply(&mut self, event: UtteranceEvent, now: DateTime<Utc>) {
        match event.kind {
            UtteranceKind::Partial => {
                self.pending_partial = Some(PendingPartial {
                    role: event.role,
                    text: event.text,
                });
            }
            UtteranceKind::Final => {
                let text = event.text.trim();
                if text.is_empty() {
                    debug!("Dropping empty final utterance from {}", event.role.label());
                    return;
                }
                debug!(
                    "Final utterance #{} from {} ({} words)",
                    self.messages.len(),
                    event.role.label(),
                    text.split_whitespace().count()
                );
                self.messages.push(TranscriptMessage {
                    role: event.role,
                    text: text.to_string(),
                    timestamp: now,
                });
                self.pending_partial = None;
            }
        }
    }

    /// Finalized messages in append order
    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    pub fn pending_partial(&self) -> Option<&PendingPartial> {
        self.pending_partial.as_ref()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Finalized patient utterances, in order
    pub fn patient_utterances(&self) -> impl Iterator<Item = &str> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Patient)
            .map(|m| m.text.as_str())
    }

    /// Total words across finalized messages
    pub fn word_count(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.text.split_whitespace().count())
            .sum()
    }

    /// "Role: text" per finalized message, newline separated
    pub fn flatten(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending_partial = None;
    }
}
