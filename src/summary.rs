//! Consultation summarizer.
//!
//! Derives the persisted summary from a finished session. Engine-supplied
//! analysis and transcript take priority over what the core assembled itself;
//! fixed fallbacks keep every field populated. Never produces a diagnosis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::patient::PatientSnapshot;
use crate::session::Session;

pub const NO_SYMPTOMS_TEXT: &str = "No specific symptoms mentioned";

pub const ASSESSMENT_TEXT: &str = "No diagnosis provided. This automated consultation does not \
assess or diagnose medical conditions; please consult a licensed healthcare provider for a \
medical evaluation.";

pub const DISCLAIMER_TEXT: &str = "This consultation was conducted with an automated AI \
assistant and is not professional medical advice. If your symptoms are severe or worsening, \
contact a healthcare provider or emergency services.";

pub const GENERIC_FOLLOW_UP_TEXT: &str = "Follow up with your primary care provider if your \
symptoms persist or worsen.";

/// The persisted outcome of a consultation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationSummary {
    pub session_id: Option<String>,
    pub initial_complaint: String,
    pub summary_text: String,
    pub symptoms_text: String,
    pub assessment_text: String,
    pub follow_up_text: String,
    pub disclaimer_text: String,
    pub duration_seconds: u64,
    pub transcript_text: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

impl ConsultationSummary {
    /// "3m 05s" style duration for display
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

/// Summarize a finished session. `None` when no utterance was finalized.
pub fn summarize(session: &Session, snapshot: &PatientSnapshot) -> Option<ConsultationSummary> {
    let transcript = session.transcript();
    if transcript.is_empty() {
        return None;
    }

    let analysis = session
        .engine_analysis()
        .map(str::trim)
        .filter(|a| !a.is_empty());

    let (analysis_symptoms, analysis_follow_up) = match analysis {
        Some(text) => split_analysis(text),
        None => (None, None),
    };

    let symptoms_text = analysis_symptoms.unwrap_or_else(|| {
        let patient: Vec<&str> = transcript.patient_utterances().collect();
        if patient.is_empty() {
            NO_SYMPTOMS_TEXT.to_string()
        } else {
            patient.join("; ")
        }
    });

    let follow_up_text = analysis_follow_up.unwrap_or_else(|| follow_up_template(snapshot));

    let duration_seconds = session.duration_seconds().unwrap_or(session.elapsed_seconds());

    let summary_text = match analysis {
        Some(text) => text.to_string(),
        None => local_summary_text(
            session.initial_complaint(),
            transcript.message_count(),
            duration_seconds,
        ),
    };

    let transcript_text = session
        .engine_transcript()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| transcript.flatten());

    Some(ConsultationSummary {
        session_id: session.session_id().map(str::to_string),
        initial_complaint: session.initial_complaint().to_string(),
        summary_text,
        symptoms_text,
        assessment_text: ASSESSMENT_TEXT.to_string(),
        follow_up_text,
        disclaimer_text: DISCLAIMER_TEXT.to_string(),
        duration_seconds,
        transcript_text,
        started_at: session.started_at(),
        ended_at: session.ended_at(),
        generated_at: Utc::now(),
    })
}

/// Split engine analysis into (symptoms, follow-up).
///
/// A single sentence is symptoms only. With several sentences the first is
/// the symptom portion and the rest is the follow-up, unless it merely
/// repeats the first.
fn split_analysis(analysis: &str) -> (Option<String>, Option<String>) {
    let sentences = split_sentences(analysis);
    match sentences.split_first() {
        None => (None, None),
        Some((first, [])) => (Some(first.to_string()), None),
        Some((first, rest)) => {
            let tail = rest.join(" ");
            if tail.eq_ignore_ascii_case(first) {
                (Some(first.to_string()), None)
            } else {
                (Some(first.to_string()), Some(tail))
            }
        }
    }
}

/// Split text into sentences ending in `.`, `!` or `?` followed by whitespace
/// or the end of the text. Terminators stay with their sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                None => true,
                Some((_, next)) => next.is_whitespace(),
            };
            if at_boundary {
                let end = i + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
    }

    let remainder = text[start..].trim();
    if !remainder.is_empty() {
        sentences.push(remainder);
    }
    sentences
}

fn follow_up_template(snapshot: &PatientSnapshot) -> String {
    match snapshot.profile.location() {
        Some(location) => format!(
            "Follow up with a primary care provider in {} if your symptoms persist or worsen.",
            location
        ),
        None => GENERIC_FOLLOW_UP_TEXT.to_string(),
    }
}

fn local_summary_text(complaint: &str, message_count: usize, duration_seconds: u64) -> String {
    let complaint = complaint.trim();
    let exchanges = if message_count == 1 {
        "1 exchange".to_string()
    } else {
        format!("{} exchanges", message_count)
    };
    if complaint.is_empty() {
        format!(
            "Voice consultation with {} over {}.",
            exchanges,
            format_duration(duration_seconds)
        )
    } else {
        format!(
            "Voice consultation about \"{}\" with {} over {}.",
            complaint,
            exchanges,
            format_duration(duration_seconds)
        )
    }
}

pub fn format_duration(seconds: u64) -> String {
    format!("{}m {:02}s", seconds / 60, seconds % 60)
}
