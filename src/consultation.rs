//! Consultation controller.
//!
//! Drives one [`Session`] against a voice engine and a consultation store:
//!
//! ```text
//!   engine callbacks ──┐
//!   duration ticker ───┼─► inbox (mpsc) ─► Session transition ─► effects
//!   report grace timer ┘                                          │
//!                                     ticker / grace timer / summarize + save
//! ```
//!
//! Inputs are handled strictly one at a time. Every input carries the session
//! ID it was produced for, so a tick, a grace expiry or an engine event that
//! was still queued (or arrived late) when its session moved on is dropped.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::activity_log;
use crate::config::ConsultationSettings;
use crate::context::{build_context, first_message};
use crate::engine::{EngineEvent, EngineSessionConfig, VoiceEngine};
use crate::patient::PatientSnapshot;
use crate::session::{Session, SessionEffect, SessionError, SessionState, SessionStatus};
use crate::store::ConsultationStore;
use crate::summary::{summarize, ConsultationSummary};

/// One unit of work for the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Engine {
        session_id: String,
        event: EngineEvent,
    },
    Tick { session_id: String },
    ReportGraceExpired { session_id: String },
}

/// Handle given to engine adapters to deliver their events.
///
/// A sender is bound to one session. Events it delivers after that session
/// has been replaced are dropped by the controller.
#[derive(Debug, Clone)]
pub struct EngineEventSender {
    tx: mpsc::UnboundedSender<Input>,
    session_id: String,
}

impl EngineEventSender {
    /// Queue an engine event. Returns false once the controller is gone.
    pub fn send(&self, event: EngineEvent) -> bool {
        let input = Input::Engine {
            session_id: self.session_id.clone(),
            event,
        };
        self.tx.send(input).is_ok()
    }

    /// Same channel, bound to another session. Engine adapters use this with
    /// the `session_id` of the `EngineSessionConfig` they were started with.
    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            session_id: session_id.into(),
        }
    }
}

pub struct ConsultationController {
    engine: Arc<dyn VoiceEngine>,
    store: Arc<dyn ConsultationStore>,
    snapshot: PatientSnapshot,
    settings: ConsultationSettings,
    session: Session,
    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox_rx: mpsc::UnboundedReceiver<Input>,
    status_tx: watch::Sender<SessionStatus>,
    ticker: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

impl ConsultationController {
    pub fn new(
        engine: Arc<dyn VoiceEngine>,
        store: Arc<dyn ConsultationStore>,
        snapshot: PatientSnapshot,
        settings: ConsultationSettings,
    ) -> Self {
        let session = Session::with_report_policy(settings.await_engine_report);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(session.status());
        Self {
            engine,
            store,
            snapshot,
            settings,
            session,
            inbox_tx,
            inbox_rx,
            status_tx,
            ticker: None,
            grace_timer: None,
        }
    }

    /// Sender for the engine adapter's event callbacks, bound to the current
    /// session (if any)
    pub fn event_sender(&self) -> EngineEventSender {
        EngineEventSender {
            tx: self.inbox_tx.clone(),
            session_id: self.session.session_id().unwrap_or_default().to_string(),
        }
    }

    /// Receiver for status updates after every handled input
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn summary(&self) -> Option<&ConsultationSummary> {
        self.session.summary()
    }

    /// Replace the patient snapshot used for the next session
    pub fn set_snapshot(&mut self, snapshot: PatientSnapshot) {
        self.snapshot = snapshot;
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// Validate the complaint and ask the engine to start a call.
    ///
    /// A previous summarized session is cleared first. Validation failures
    /// leave the session untouched; an engine rejection moves it to Failed
    /// with the complaint kept for a retry.
    pub async fn start(&mut self, complaint: &str) -> Result<(), SessionError> {
        if self.session.state() == SessionState::Summarized {
            self.session.dismiss()?;
        }
        self.session.set_complaint(complaint)?;
        self.session.request_start()?;
        self.publish_status();

        let session_id = self.session.session_id().unwrap_or_default().to_string();
        let context = build_context(&self.snapshot, complaint);
        let context_chars = context.chars().count();
        let config = EngineSessionConfig {
            session_id: session_id.clone(),
            assistant_id: self.settings.assistant_id.clone(),
            context,
            first_message: first_message(&self.snapshot),
        };

        match self.engine.start(config).await {
            Ok(()) => {
                activity_log::log_session_start(
                    &session_id,
                    &self.settings.assistant_id,
                    context_chars,
                );
                Ok(())
            }
            Err(e) => {
                let error = SessionError::EngineStart(e.to_string());
                let effect = self.session.start_failed(error.clone());
                self.apply_effect(effect).await;
                self.publish_status();
                Err(error)
            }
        }
    }

    /// User pressed "end call". Never waits for the engine to acknowledge.
    pub async fn end_call(&mut self) -> SessionEffect {
        let effect = self.session.request_end(Utc::now());
        if effect != SessionEffect::None {
            self.engine.stop();
        }
        self.apply_effect(effect.clone()).await;
        self.publish_status();
        effect
    }

    /// Close the summary view, clearing the session
    pub fn dismiss(&mut self) -> Result<(), SessionError> {
        self.session.dismiss()?;
        self.stop_timers();
        self.publish_status();
        Ok(())
    }

    /// Save the in-memory summary again after a failed (or to refresh a
    /// successful) save. Returns the record ID.
    pub async fn retry_save(&mut self) -> Result<String, SessionError> {
        let summary = self.session.summary().cloned().ok_or_else(|| {
            SessionError::InvalidTransition("There is no summary to save".to_string())
        })?;
        self.persist(&summary).await;
        self.publish_status();

        if let Some(error) = self
            .session
            .last_error()
            .filter(|e| matches!(e, SessionError::Persistence(_)))
        {
            return Err(error.clone());
        }
        self.session
            .record_id()
            .map(str::to_string)
            .ok_or_else(|| SessionError::Persistence("No record was created".to_string()))
    }

    // ------------------------------------------------------------------
    // Input processing
    // ------------------------------------------------------------------

    /// Handle one input
    pub async fn handle(&mut self, input: Input) -> SessionEffect {
        let effect = match input {
            Input::Engine { session_id, event } => {
                if self.is_current(&session_id) {
                    debug!("Engine event: {}", event.kind());
                    self.session.handle_engine_event(event, Utc::now())
                } else {
                    debug!("Dropping {} from a previous session", event.kind());
                    SessionEffect::None
                }
            }
            Input::Tick { session_id } => {
                if self.is_current(&session_id) {
                    self.session.tick();
                }
                SessionEffect::None
            }
            Input::ReportGraceExpired { session_id } => {
                if self.is_current(&session_id) {
                    self.grace_timer = None;
                    self.session.report_grace_expired()
                } else {
                    SessionEffect::None
                }
            }
        };
        self.apply_effect(effect.clone()).await;
        self.publish_status();
        effect
    }

    /// Wait for and handle the next input
    pub async fn next(&mut self) -> SessionEffect {
        match self.inbox_rx.recv().await {
            Some(input) => self.handle(input).await,
            // Unreachable while we hold a sender
            None => SessionEffect::None,
        }
    }

    /// Process inputs until the session leaves the call: summarized, failed,
    /// or back to idle after a cancellation.
    pub async fn run_until_settled(&mut self) -> SessionState {
        while matches!(
            self.session.state(),
            SessionState::Connecting | SessionState::Active | SessionState::Ending
        ) {
            self.next().await;
        }
        self.session.state()
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    async fn apply_effect(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::None => {}
            SessionEffect::CallActive => self.start_ticker(),
            SessionEffect::AwaitingReport => {
                self.stop_ticker();
                self.start_grace_timer();
            }
            SessionEffect::ReadyToSummarize => {
                self.stop_timers();
                self.finalize().await;
            }
            SessionEffect::Failed(_) => {
                self.stop_timers();
                self.engine.stop();
            }
            SessionEffect::Cancelled => self.stop_timers(),
        }
    }

    /// Summarizing -> Summarized, saving the summary if there is one
    async fn finalize(&mut self) {
        let summary = summarize(&self.session, &self.snapshot);
        activity_log::log_summary_generated(
            self.session.session_id(),
            self.session.transcript().message_count(),
            self.session.duration_seconds().unwrap_or(0),
            summary.is_some(),
            self.session.engine_analysis().is_some(),
        );

        if let Err(e) = self.session.complete_summary(summary.clone()) {
            warn!("Could not complete summary: {}", e);
            return;
        }

        match summary {
            Some(summary) => self.persist(&summary).await,
            None => info!("No utterances were exchanged, nothing to save"),
        }
    }

    /// Create the record, or update it when one already exists
    async fn persist(&mut self, summary: &ConsultationSummary) {
        let existing = self.session.record_id().map(str::to_string);
        let (operation, result) = match existing.as_deref() {
            Some(id) => ("update", self.store.update_consultation(id, summary).await),
            None => ("create", self.store.create_consultation(summary).await),
        };

        match result {
            Ok(record) => {
                activity_log::log_persistence(
                    self.session.session_id(),
                    operation,
                    Some(&record.id),
                    true,
                    None,
                );
                self.session.record_saved(record.id);
            }
            Err(e) => {
                let message = e.to_string();
                activity_log::log_persistence(
                    self.session.session_id(),
                    operation,
                    existing.as_deref(),
                    false,
                    Some(&message),
                );
                self.session.record_save_failed(message);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn start_ticker(&mut self) {
        self.stop_ticker();
        let Some(session_id) = self.session.session_id().map(str::to_string) else {
            return;
        };
        let tx = self.inbox_tx.clone();
        let period = self.settings.tick_interval;

        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let tick = Input::Tick {
                    session_id: session_id.clone(),
                };
                if tx.send(tick).is_err() {
                    break;
                }
            }
        }));
    }

    fn start_grace_timer(&mut self) {
        self.stop_grace_timer();
        let Some(session_id) = self.session.session_id().map(str::to_string) else {
            return;
        };
        let tx = self.inbox_tx.clone();
        let grace = self.settings.report_grace;
        debug!("Waiting up to {:?} for the end-of-call report", grace);

        self.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Input::ReportGraceExpired { session_id });
        }));
    }

    fn stop_ticker(&mut self) {
        if let Some(h) = self.ticker.take() {
            h.abort();
        }
    }

    fn stop_grace_timer(&mut self) {
        if let Some(h) = self.grace_timer.take() {
            h.abort();
        }
    }

    fn stop_timers(&mut self) {
        self.stop_ticker();
        self.stop_grace_timer();
    }

    pub(crate) fn has_running_timers(&self) -> bool {
        self.ticker.is_some() || self.grace_timer.is_some()
    }

    fn is_current(&self, session_id: &str) -> bool {
        self.session.session_id() == Some(session_id)
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.session.status());
    }
}

impl Drop for ConsultationController {
    fn drop(&mut self) {
        self.stop_timers();
    }
}
