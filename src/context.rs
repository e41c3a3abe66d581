//! Patient context builder.
//!
//! Turns a patient snapshot and the initial complaint into the grounding text
//! handed to the voice assistant at session start. The section order and the
//! placeholders are fixed so the assistant prompt keeps a stable shape even
//! when most of the profile is empty.

use chrono::{Datelike, Local, NaiveDate};

use crate::patient::{PatientSnapshot, MAX_RECENT_CONSULTATIONS};

const NOT_SPECIFIED: &str = "Not specified";
const UNKNOWN: &str = "Unknown";
const NONE_REPORTED: &str = "None reported";

const PREAMBLE: &str = "You are a virtual health assistant conducting a preliminary voice consultation. \
You are not a doctor. You must not provide a diagnosis, prescribe medication, or claim certainty about \
any medical condition. If the patient describes an emergency (chest pain, difficulty breathing, \
stroke symptoms, thoughts of self-harm), tell them to call emergency services immediately.";

const CLOSING_INSTRUCTIONS: &str = "INSTRUCTIONS:
- Ask one question at a time and keep responses short and conversational.
- Clarify onset, duration, severity, location, and anything that makes the symptoms better or worse.
- Take the patient's existing conditions and recent consultations into account.
- Do not diagnose. Suggest appropriate next steps such as rest, monitoring, or seeing a provider.
- When the patient has nothing more to add, briefly recap what they reported and end the call politely.";

/// Build the assistant context using today's local date for the age calculation
pub fn build_context(snapshot: &PatientSnapshot, initial_complaint: &str) -> String {
    build_context_on(snapshot, initial_complaint, Local::now().date_naive())
}

/// Build the assistant context as of `today`
pub fn build_context_on(
    snapshot: &PatientSnapshot,
    initial_complaint: &str,
    today: NaiveDate,
) -> String {
    let profile = &snapshot.profile;
    let mut out = String::new();

    out.push_str(PREAMBLE);
    out.push_str("\n\n");

    out.push_str("PATIENT INFORMATION:\n");
    out.push_str(&format!(
        "- Name: {}\n",
        profile.display_name().unwrap_or_else(|| NOT_SPECIFIED.to_string())
    ));
    let age = profile
        .birth_date
        .and_then(|dob| age_on(dob, today))
        .map(|years| format!("{} years", years))
        .unwrap_or_else(|| UNKNOWN.to_string());
    out.push_str(&format!("- Age: {}\n", age));
    out.push_str(&format!(
        "- Gender: {}\n",
        or_placeholder(profile.gender.as_deref(), NOT_SPECIFIED)
    ));
    out.push_str(&format!(
        "- Location: {}\n",
        profile.location().unwrap_or_else(|| NOT_SPECIFIED.to_string())
    ));
    out.push_str(&format!(
        "- Blood type: {}\n",
        or_placeholder(profile.blood_type.as_deref(), UNKNOWN)
    ));
    out.push_str(&format!(
        "- Height: {}\n",
        profile
            .height_cm
            .map(|h| format!("{:.0} cm", h))
            .unwrap_or_else(|| NOT_SPECIFIED.to_string())
    ));
    out.push_str(&format!(
        "- Weight: {}\n",
        profile
            .weight_kg
            .map(|w| format!("{:.1} kg", w))
            .unwrap_or_else(|| NOT_SPECIFIED.to_string())
    ));
    out.push('\n');

    out.push_str("ACTIVE CONDITIONS:\n");
    let active: Vec<_> = snapshot.conditions.iter().filter(|c| c.is_active()).collect();
    if active.is_empty() {
        out.push_str(&format!("- {}\n", NONE_REPORTED));
    }
    for condition in active {
        out.push_str(&format!(
            "- {} (severity: {}, status: {}, onset: {})\n",
            condition.name,
            or_placeholder(condition.severity.as_deref(), NOT_SPECIFIED),
            condition.status.map(|s| s.as_str()).unwrap_or(NOT_SPECIFIED),
            condition
                .onset_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
        ));
    }
    out.push('\n');

    out.push_str("RECENT CONSULTATIONS:\n");
    let mut recent: Vec<_> = snapshot.recent_consultations.iter().collect();
    recent.sort_by(|a, b| b.date.cmp(&a.date));
    if recent.is_empty() {
        out.push_str(&format!("- {}\n", NONE_REPORTED));
    }
    for consultation in recent.into_iter().take(MAX_RECENT_CONSULTATIONS) {
        out.push_str(&format!("- {}:\n", consultation.date.format("%Y-%m-%d")));
        out.push_str(&format!(
            "  Summary: {}\n",
            or_placeholder(consultation.summary.as_deref(), NOT_SPECIFIED)
        ));
        out.push_str(&format!(
            "  Symptoms: {}\n",
            or_placeholder(consultation.symptoms.as_deref(), NOT_SPECIFIED)
        ));
        out.push_str(&format!(
            "  Follow-up: {}\n",
            or_placeholder(consultation.follow_up.as_deref(), NOT_SPECIFIED)
        ));
    }
    out.push('\n');

    out.push_str("INITIAL COMPLAINT:\n");
    out.push_str(initial_complaint);
    out.push_str("\n\n");

    out.push_str(CLOSING_INSTRUCTIONS);
    out
}

/// Opening line spoken by the assistant
pub fn first_message(snapshot: &PatientSnapshot) -> String {
    match snapshot
        .profile
        .first_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
    {
        Some(name) => format!(
            "Hello {}, I'm your virtual health assistant. I've read your note. Can you tell me more about how you're feeling?",
            name
        ),
        None => "Hello, I'm your virtual health assistant. I've read your note. Can you tell me more about how you're feeling?".to_string(),
    }
}

/// Whole years between `dob` and `today`, counting a year only once its
/// anniversary has been reached. `None` for a birth date in the future.
pub fn age_on(dob: NaiveDate, today: NaiveDate) -> Option<u32> {
    if dob > today {
        return None;
    }
    let mut years = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

fn or_placeholder<'a>(value: Option<&'a str>, placeholder: &'a str) -> &'a str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(placeholder)
}
