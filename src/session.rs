//! Consultation session lifecycle.
//!
//! `Session` is a plain owned value; every transition happens through one of
//! its methods in response to a single input (user action, engine event, timer
//! expiry). The methods return a [`SessionEffect`] telling the driver which
//! timers to start or cancel. Duplicate or late termination signals are
//! rejected by guarding on the current state, so the first one wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::activity_log;
use crate::engine::EngineEvent;
use crate::summary::ConsultationSummary;
use crate::transcript::{Role, TranscriptAccumulator, TranscriptMessage};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Ending,
    Summarizing,
    Summarized,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Summarizing => "summarizing",
            SessionState::Summarized => "summarized",
            SessionState::Failed => "failed",
        }
    }

    /// A call is being set up or is live
    pub fn is_in_call(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }
}

/// Session error types
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Could not start the consultation: {0}")]
    EngineStart(String),
    #[error("Voice engine error: {0}")]
    Engine(String),
    #[error("Could not save the consultation: {0}")]
    Persistence(String),
}

impl SessionError {
    /// Errors the user can recover from by simply trying again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::EngineStart(_) | SessionError::Engine(_) | SessionError::Persistence(_)
        )
    }
}

/// What ended the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    UserRequested,
    CallEnded,
    EndOfCallReport,
    ReportGraceExpired,
}

impl TerminationCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationCause::UserRequested => "user_requested",
            TerminationCause::CallEnded => "call_ended",
            TerminationCause::EndOfCallReport => "end_of_call_report",
            TerminationCause::ReportGraceExpired => "report_grace_expired",
        }
    }
}

/// Work the driver has to do after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Nothing changed that concerns timers
    None,
    /// Call confirmed: start the duration ticker
    CallActive,
    /// Call ended without a report: stop the ticker, start the report grace timer
    AwaitingReport,
    /// Stop all timers and run the summarizer
    ReadyToSummarize,
    /// Connection attempt failed: stop all timers
    Failed(SessionError),
    /// User abandoned the connection attempt: stop the engine and timers
    Cancelled,
}

/// Status snapshot for the caller's UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub elapsed_seconds: u64,
    pub duration_seconds: Option<u64>,
    pub message_count: usize,
    pub draft_text: Option<String>,
    pub assistant_speaking: bool,
    pub patient_speaking: bool,
    pub error_message: Option<String>,
    pub has_summary: bool,
    pub record_id: Option<String>,
}

/// One consultation attempt, from start request to dismissed summary
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    /// Unique session ID for log correlation (generated on start)
    session_id: Option<String>,
    initial_complaint: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    elapsed_seconds: u64,
    duration_seconds: Option<u64>,
    termination: Option<TerminationCause>,
    transcript: TranscriptAccumulator,
    engine_analysis: Option<String>,
    engine_transcript: Option<String>,
    assistant_speaking: bool,
    patient_speaking: bool,
    last_error: Option<SessionError>,
    summary: Option<ConsultationSummary>,
    record_id: Option<String>,
    /// Wait for the engine's end-of-call report after a plain end
    await_report: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::with_report_policy(true)
    }

    /// Create a session that does (or does not) wait for an end-of-call report
    pub fn with_report_policy(await_report: bool) -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            initial_complaint: String::new(),
            started_at: None,
            ended_at: None,
            elapsed_seconds: 0,
            duration_seconds: None,
            termination: None,
            transcript: TranscriptAccumulator::new(),
            engine_analysis: None,
            engine_transcript: None,
            assistant_speaking: false,
            patient_speaking: false,
            last_error: None,
            summary: None,
            record_id: None,
            await_report,
        }
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// Set the initial complaint. Only possible before a call starts.
    pub fn set_complaint(&mut self, complaint: &str) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Idle | SessionState::Failed) {
            return Err(SessionError::InvalidTransition(format!(
                "Cannot change the complaint in state {}",
                self.state.as_str()
            )));
        }
        self.initial_complaint = complaint.to_string();
        Ok(())
    }

    /// Idle/Failed -> Connecting
    pub fn request_start(&mut self) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Idle | SessionState::Failed) {
            return Err(SessionError::InvalidTransition(format!(
                "Cannot start from state {}",
                self.state.as_str()
            )));
        }
        if self.initial_complaint.trim().is_empty() {
            return Err(SessionError::Validation(
                "Please describe your concern before starting the consultation".to_string(),
            ));
        }

        self.clear_call_data();
        self.session_id = Some(uuid::Uuid::new_v4().to_string());
        self.transition(SessionState::Connecting);
        Ok(())
    }

    /// User pressed "end call"
    pub fn request_end(&mut self, now: DateTime<Utc>) -> SessionEffect {
        match self.state {
            SessionState::Connecting => {
                info!("Connection attempt cancelled by user");
                self.transition(SessionState::Idle);
                SessionEffect::Cancelled
            }
            SessionState::Active => self.accept_termination(TerminationCause::UserRequested, now),
            state => {
                debug!("End request ignored in state {}", state.as_str());
                SessionEffect::None
            }
        }
    }

    /// Summarized -> Idle, clearing everything. Also clears an idle or failed session.
    pub fn dismiss(&mut self) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            SessionState::Summarized | SessionState::Idle | SessionState::Failed
        ) {
            return Err(SessionError::InvalidTransition(format!(
                "Cannot dismiss in state {}",
                self.state.as_str()
            )));
        }
        activity_log::log_session_reset(self.session_id.as_deref());
        self.reset();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    /// Engine rejected the start request
    pub fn start_failed(&mut self, error: SessionError) -> SessionEffect {
        if self.state != SessionState::Connecting {
            debug!("Start failure ignored in state {}", self.state.as_str());
            return SessionEffect::None;
        }
        self.fail(error)
    }

    /// Single ingress for engine events
    pub fn handle_engine_event(&mut self, event: EngineEvent, now: DateTime<Utc>) -> SessionEffect {
        match (self.state, event) {
            (SessionState::Connecting, EngineEvent::CallStarted) => {
                self.started_at = Some(now);
                self.elapsed_seconds = 0;
                self.transition(SessionState::Active);
                if let Some(id) = self.session_id.as_deref() {
                    activity_log::log_call_started(id);
                }
                SessionEffect::CallActive
            }
            (SessionState::Connecting, EngineEvent::Error(message)) => {
                self.fail(SessionError::EngineStart(message))
            }
            (SessionState::Connecting, event) if event.is_termination() => self.fail(
                SessionError::EngineStart("The call ended before it was connected".to_string()),
            ),

            (SessionState::Active, EngineEvent::Utterance(utterance)) => {
                self.transcript.apply(utterance, now);
                SessionEffect::None
            }
            (SessionState::Active, EngineEvent::SpeechStarted(role)) => {
                self.set_speaking(role, true);
                SessionEffect::None
            }
            (SessionState::Active, EngineEvent::SpeechEnded(role)) => {
                self.set_speaking(role, false);
                SessionEffect::None
            }
            (SessionState::Active, EngineEvent::Error(message)) => {
                // Mid-call errors are telemetry unless the engine also ends the call
                warn!("Engine error during active call: {}", message);
                activity_log::log_engine_error(
                    self.session_id.as_deref(),
                    self.state.as_str(),
                    &message,
                );
                self.last_error = Some(SessionError::Engine(message));
                SessionEffect::None
            }
            (SessionState::Active, EngineEvent::CallEnded) => {
                self.accept_termination(TerminationCause::CallEnded, now)
            }
            (SessionState::Active, EngineEvent::EndOfCallReport { analysis, transcript }) => {
                self.engine_analysis = analysis;
                self.engine_transcript = transcript;
                self.accept_termination(TerminationCause::EndOfCallReport, now)
            }

            (SessionState::Ending, EngineEvent::Utterance(utterance)) => {
                // The engine flushes the utterance that was in flight when the
                // call was hung up
                self.transcript.apply(utterance, now);
                SessionEffect::None
            }
            (SessionState::Ending, EngineEvent::EndOfCallReport { analysis, transcript }) => {
                // The report we were waiting for: enriches the summary, does not
                // restart termination
                self.engine_analysis = analysis;
                self.engine_transcript = transcript;
                self.log_signal(TerminationCause::EndOfCallReport, true);
                self.transition(SessionState::Summarizing);
                SessionEffect::ReadyToSummarize
            }

            (state, event) => {
                if event.is_termination() {
                    let cause = match event {
                        EngineEvent::CallEnded => TerminationCause::CallEnded,
                        _ => TerminationCause::EndOfCallReport,
                    };
                    self.log_signal(cause, false);
                } else {
                    debug!("Ignoring {} in state {}", event.kind(), state.as_str());
                }
                SessionEffect::None
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// One-second duration tick. Counts only while the call is live.
    pub fn tick(&mut self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        self.elapsed_seconds += 1;
        true
    }

    /// No report arrived in time: summarize with local data
    pub fn report_grace_expired(&mut self) -> SessionEffect {
        if self.state != SessionState::Ending {
            return SessionEffect::None;
        }
        info!("End-of-call report not received in time, summarizing local transcript");
        self.log_signal(TerminationCause::ReportGraceExpired, true);
        self.transition(SessionState::Summarizing);
        SessionEffect::ReadyToSummarize
    }

    // ------------------------------------------------------------------
    // Summary outcome
    // ------------------------------------------------------------------

    /// Summarizing -> Summarized. `None` means nothing worth summarizing.
    pub fn complete_summary(
        &mut self,
        summary: Option<ConsultationSummary>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Summarizing {
            return Err(SessionError::InvalidTransition(format!(
                "Cannot complete summary in state {}",
                self.state.as_str()
            )));
        }
        self.summary = summary;
        self.transition(SessionState::Summarized);
        Ok(())
    }

    /// The summary was stored
    pub fn record_saved(&mut self, record_id: String) {
        self.record_id = Some(record_id);
        if matches!(self.last_error, Some(SessionError::Persistence(_))) {
            self.last_error = None;
        }
    }

    /// Storing the summary failed; the summary itself stays available
    pub fn record_save_failed(&mut self, message: String) {
        warn!("Consultation save failed: {}", message);
        self.last_error = Some(SessionError::Persistence(message));
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn initial_complaint(&self) -> &str {
        &self.initial_complaint
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    /// Frozen call duration, once a termination signal was accepted
    pub fn duration_seconds(&self) -> Option<u64> {
        self.duration_seconds
    }

    pub fn termination(&self) -> Option<TerminationCause> {
        self.termination
    }

    pub fn transcript(&self) -> &TranscriptAccumulator {
        &self.transcript
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        self.transcript.messages()
    }

    pub fn engine_analysis(&self) -> Option<&str> {
        self.engine_analysis.as_deref()
    }

    pub fn engine_transcript(&self) -> Option<&str> {
        self.engine_transcript.as_deref()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn summary(&self) -> Option<&ConsultationSummary> {
        self.summary.as_ref()
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    pub fn awaits_report(&self) -> bool {
        self.await_report
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            session_id: self.session_id.clone(),
            elapsed_seconds: self.elapsed_seconds,
            duration_seconds: self.duration_seconds,
            message_count: self.transcript.message_count(),
            draft_text: self.transcript.pending_partial().map(|p| p.text.clone()),
            assistant_speaking: self.assistant_speaking,
            patient_speaking: self.patient_speaking,
            error_message: self.last_error.as_ref().map(|e| e.to_string()),
            has_summary: self.summary.is_some(),
            record_id: self.record_id.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Active -> Ending, freezing the duration. First signal only.
    fn accept_termination(&mut self, cause: TerminationCause, now: DateTime<Utc>) -> SessionEffect {
        self.ended_at = Some(now);
        self.duration_seconds = Some(self.elapsed_seconds);
        self.termination = Some(cause);
        self.assistant_speaking = false;
        self.patient_speaking = false;
        self.log_signal(cause, true);
        self.transition(SessionState::Ending);

        if cause == TerminationCause::EndOfCallReport || !self.await_report {
            self.transition(SessionState::Summarizing);
            SessionEffect::ReadyToSummarize
        } else {
            SessionEffect::AwaitingReport
        }
    }

    fn fail(&mut self, error: SessionError) -> SessionEffect {
        warn!("Session failed: {}", error);
        activity_log::log_engine_error(
            self.session_id.as_deref(),
            self.state.as_str(),
            &error.to_string(),
        );
        self.last_error = Some(error.clone());
        self.transition(SessionState::Failed);
        SessionEffect::Failed(error)
    }

    fn set_speaking(&mut self, role: Role, speaking: bool) {
        match role {
            Role::Assistant => self.assistant_speaking = speaking,
            Role::Patient => self.patient_speaking = speaking,
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        info!("Session transitioning {} -> {}", from.as_str(), to.as_str());
        if let Some(id) = self.session_id.as_deref() {
            activity_log::log_session_transition(id, from.as_str(), to.as_str());
        }
    }

    fn log_signal(&self, cause: TerminationCause, accepted: bool) {
        activity_log::log_termination_signal(
            self.session_id.as_deref(),
            cause.as_str(),
            self.state.as_str(),
            accepted,
        );
    }

    /// Clear everything produced by a previous call, keeping the complaint
    fn clear_call_data(&mut self) {
        self.session_id = None;
        self.started_at = None;
        self.ended_at = None;
        self.elapsed_seconds = 0;
        self.duration_seconds = None;
        self.termination = None;
        self.transcript.clear();
        self.engine_analysis = None;
        self.engine_transcript = None;
        self.assistant_speaking = false;
        self.patient_speaking = false;
        self.last_error = None;
        self.summary = None;
        self.record_id = None;
    }

    fn reset(&mut self) {
        self.clear_call_data();
        self.initial_complaint.clear();
        self.state = SessionState::Idle;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
