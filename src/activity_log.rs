//! Activity Logging Module
//!
//! Structured activity events for auditing and debugging.
//! IMPORTANT: This module must NEVER log PHI (Protected Health Information).
//!
//! What IS logged:
//! - Session IDs and record IDs
//! - States, transitions and termination causes
//! - Durations and message counts
//! - Outcomes (success/failure) and sanitized error messages
//!
//! What is NOT logged:
//! - The initial complaint
//! - Transcript text or engine analysis
//! - Patient names, dates of birth or locations

use std::path::Path;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Guard that must be held for the duration of the process
/// to ensure logs are flushed before exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the activity logging system
///
/// Sets up dual logging:
/// - Console output (human-readable)
/// - File output (JSON, daily rotation) in `log_dir`
pub fn init_logging(log_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "activity.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Activity logging system initialized"
    );

    Ok(())
}

// ============================================================================
// Session Lifecycle Events
// ============================================================================

/// Log a start request accepted by the engine
pub fn log_session_start(session_id: &str, assistant_id: &str, context_chars: usize) {
    info!(
        event = "session_start",
        session_id = %session_id,
        assistant_id = %assistant_id,
        context_chars = context_chars,
        "Consultation session started"
    );
}

/// Log engine confirmation that the call is live
pub fn log_call_started(session_id: &str) {
    info!(
        event = "call_started",
        session_id = %session_id,
        "Voice call connected"
    );
}

/// Log session state transition
pub fn log_session_transition(session_id: &str, from_state: &str, to_state: &str) {
    info!(
        event = "session_transition",
        session_id = %session_id,
        from_state = %from_state,
        to_state = %to_state,
        "Session state changed"
    );
}

/// Log a termination signal and whether it was acted upon
pub fn log_termination_signal(session_id: Option<&str>, cause: &str, state: &str, accepted: bool) {
    info!(
        event = "termination_signal",
        session_id = session_id,
        cause = %cause,
        state = %state,
        accepted = accepted,
        "Termination signal received"
    );
}

/// Log session reset
pub fn log_session_reset(session_id: Option<&str>) {
    info!(
        event = "session_reset",
        session_id = session_id,
        "Session reset to idle"
    );
}

/// Log an engine error (message must be engine-originated, not clinical text)
pub fn log_engine_error(session_id: Option<&str>, state: &str, message: &str) {
    warn!(
        event = "engine_error",
        session_id = session_id,
        state = %state,
        error = %message,
        "Voice engine error"
    );
}

// ============================================================================
// Summary and Persistence Events
// ============================================================================

/// Log summary generation (without content)
pub fn log_summary_generated(
    session_id: Option<&str>,
    message_count: usize,
    duration_seconds: u64,
    produced: bool,
    used_engine_analysis: bool,
) {
    info!(
        event = "summary_generated",
        session_id = session_id,
        message_count = message_count,
        duration_seconds = duration_seconds,
        produced = produced,
        used_engine_analysis = used_engine_analysis,
        "Consultation summary step finished"
    );
}

/// Log a create/update call to the consultation store
pub fn log_persistence(
    session_id: Option<&str>,
    operation: &str,
    record_id: Option<&str>,
    success: bool,
    error_message: Option<&str>,
) {
    if success {
        info!(
            event = "consultation_saved",
            session_id = session_id,
            operation = %operation,
            record_id = record_id,
            success = true,
            "Consultation saved"
        );
    } else {
        error!(
            event = "consultation_saved",
            session_id = session_id,
            operation = %operation,
            record_id = record_id,
            success = false,
            error = error_message,
            "Consultation save failed"
        );
    }
}
