//! End-to-End Consultation Tests
//!
//! Drive a full `ConsultationController` with a scripted voice engine and an
//! in-memory store. Time is paused, so the duration ticker and the report
//! grace timer advance deterministically whenever the controller waits for
//! its next input.
//!
//! ```bash
//! cargo test e2e_
//! ```

#[cfg(test)]
mod tests {
    use crate::config::ConsultationSettings;
    use crate::consultation::{ConsultationController, Input};
    use crate::engine::{EngineError, EngineEvent, EngineMessage, EngineSessionConfig, VoiceEngine};
    use crate::patient::{PatientProfile, PatientSnapshot};
    use crate::session::{SessionEffect, SessionError, SessionState, TerminationCause};
    use crate::store::{ConsultationRecord, ConsultationStore, MemoryStore, StoreError};
    use crate::summary::{ConsultationSummary, ASSESSMENT_TEXT, GENERIC_FOLLOW_UP_TEXT};
    use crate::transcript::{Role, UtteranceEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ========================================================================
    // Test doubles
    // ========================================================================

    #[derive(Default)]
    struct ScriptedEngine {
        starts: Mutex<Vec<EngineSessionConfig>>,
        stops: AtomicUsize,
        reject: AtomicBool,
    }

    impl ScriptedEngine {
        fn rejecting() -> Self {
            let engine = Self::default();
            engine.reject.store(true, Ordering::SeqCst);
            engine
        }

        fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        fn start_count(&self) -> usize {
            self.starts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VoiceEngine for ScriptedEngine {
        async fn start(&self, config: EngineSessionConfig) -> Result<(), EngineError> {
            self.starts.lock().unwrap().push(config);
            if self.reject.load(Ordering::SeqCst) {
                Err(EngineError::Unavailable("assistant offline".to_string()))
            } else {
                Ok(())
            }
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails the first `failures` creates, then behaves like a memory store
    struct FlakyStore {
        failures: AtomicUsize,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                inner: MemoryStore::new(),
            }
        }
    }

    #[async_trait]
    impl ConsultationStore for FlakyStore {
        async fn create_consultation(
            &self,
            summary: &ConsultationSummary,
        ) -> Result<ConsultationRecord, StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend("database unavailable".to_string()));
            }
            self.inner.create_consultation(summary).await
        }

        async fn update_consultation(
            &self,
            id: &str,
            summary: &ConsultationSummary,
        ) -> Result<ConsultationRecord, StoreError> {
            self.inner.update_consultation(id, summary).await
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn controller(
        engine: Arc<ScriptedEngine>,
        store: Arc<dyn ConsultationStore>,
        snapshot: PatientSnapshot,
    ) -> ConsultationController {
        ConsultationController::new(engine, store, snapshot, ConsultationSettings::default())
    }

    fn patient_says(text: &str) -> EngineEvent {
        EngineEvent::Utterance(UtteranceEvent::final_text(Role::Patient, text))
    }

    fn report(analysis: &str) -> EngineEvent {
        EngineEvent::EndOfCallReport {
            analysis: Some(analysis.to_string()),
            transcript: None,
        }
    }

    /// Start a call and confirm it from the engine side
    async fn connected(c: &mut ConsultationController, complaint: &str) {
        c.start(complaint).await.unwrap();
        c.event_sender().send(EngineEvent::CallStarted);
        assert_eq!(c.next().await, SessionEffect::CallActive);
    }

    async fn run_ticks(c: &mut ConsultationController, n: u64) {
        for _ in 0..n {
            assert_eq!(c.next().await, SessionEffect::None);
        }
        assert_eq!(c.session().elapsed_seconds(), n);
    }

    // ========================================================================
    // Scenarios
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn e2e_headache_call_with_plain_end() {
        let engine = Arc::new(ScriptedEngine::default());
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(engine.clone(), store.clone(), PatientSnapshot::default());

        connected(&mut c, "persistent headache for 3 days").await;
        let tx = c.event_sender();
        tx.send(EngineEvent::Utterance(UtteranceEvent::partial(Role::Patient, "started")));
        tx.send(patient_says("started 3 days ago"));
        tx.send(EngineEvent::Utterance(UtteranceEvent::final_text(
            Role::Assistant,
            "Is it worse at any particular time?",
        )));
        tx.send(patient_says("worse in the morning"));
        for _ in 0..4 {
            c.next().await;
        }

        run_ticks(&mut c, 95).await;

        tx.send(EngineEvent::CallEnded);
        assert_eq!(c.next().await, SessionEffect::AwaitingReport);
        assert_eq!(c.session().state(), SessionState::Ending);

        // No report ever arrives: the grace timer finishes the session
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);

        let summary = c.summary().unwrap();
        assert_eq!(summary.symptoms_text, "started 3 days ago; worse in the morning");
        assert_eq!(summary.duration_seconds, 95);
        assert_eq!(summary.assessment_text, ASSESSMENT_TEXT);
        assert_eq!(summary.follow_up_text, GENERIC_FOLLOW_UP_TEXT);
        let first = summary.transcript_text.find("Patient: started 3 days ago").unwrap();
        let second = summary.transcript_text.find("Patient: worse in the morning").unwrap();
        assert!(first < second);
        assert!(!summary.transcript_text.contains("Patient: started\n"));

        assert_eq!(store.len(), 1);
        assert!(c.session().record_id().is_some());
        assert!(!c.has_running_timers());

        let starts = engine.starts.lock().unwrap();
        assert!(starts[0].context.contains("INITIAL COMPLAINT:\npersistent headache for 3 days"));
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_rich_report_first_then_plain_end_ignored() {
        let engine = Arc::new(ScriptedEngine::default());
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(engine, store.clone(), PatientSnapshot::default());

        connected(&mut c, "always tired").await;
        let tx = c.event_sender();
        tx.send(patient_says("I feel tired all the time"));
        c.next().await;
        run_ticks(&mut c, 30).await;

        tx.send(report("Patient reports mild fatigue. Recommend rest and hydration."));
        assert_eq!(c.next().await, SessionEffect::ReadyToSummarize);
        assert_eq!(c.session().state(), SessionState::Summarized);

        tx.send(EngineEvent::CallEnded);
        assert_eq!(c.next().await, SessionEffect::None);
        assert_eq!(c.session().state(), SessionState::Summarized);

        let summary = c.summary().unwrap();
        assert_eq!(summary.symptoms_text, "Patient reports mild fatigue.");
        assert_eq!(summary.follow_up_text, "Recommend rest and hydration.");
        assert_eq!(summary.duration_seconds, 30);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_plain_end_then_report_finalizes_once() {
        let engine = Arc::new(ScriptedEngine::default());
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(engine, store.clone(), PatientSnapshot::default());

        connected(&mut c, "rash on arm").await;
        let tx = c.event_sender();
        tx.send(patient_says("it itches"));
        c.next().await;
        run_ticks(&mut c, 10).await;

        // Both termination signals arrive back to back
        tx.send(EngineEvent::CallEnded);
        tx.send(report("Itchy rash on the forearm. Avoid scratching."));
        assert_eq!(c.next().await, SessionEffect::AwaitingReport);
        assert_eq!(c.next().await, SessionEffect::ReadyToSummarize);

        assert_eq!(c.session().duration_seconds(), Some(10));
        assert_eq!(c.session().termination(), Some(TerminationCause::CallEnded));
        assert_eq!(c.summary().unwrap().symptoms_text, "Itchy rash on the forearm.");
        assert_eq!(store.len(), 1);

        // Nothing else is ever delivered: ticker and grace timer are gone
        assert!(!c.has_running_timers());
        let quiet = tokio::time::timeout(Duration::from_secs(30), c.next()).await;
        assert!(quiet.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_double_end_call_click() {
        let engine = Arc::new(ScriptedEngine::default());
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(engine.clone(), store.clone(), PatientSnapshot::default());

        connected(&mut c, "sore throat").await;
        c.event_sender().send(patient_says("hurts to swallow"));
        c.next().await;
        run_ticks(&mut c, 3).await;

        assert_eq!(c.end_call().await, SessionEffect::AwaitingReport);
        assert_eq!(c.end_call().await, SessionEffect::None);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(c.session().state(), SessionState::Ending);

        // The engine never confirms; the grace period completes the session
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);
        assert_eq!(c.session().termination(), Some(TerminationCause::UserRequested));
        assert_eq!(c.session().duration_seconds(), Some(3));
        assert_eq!(store.len(), 1);

        assert_eq!(c.end_call().await, SessionEffect::None);
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_no_messages_no_record() {
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            store.clone(),
            PatientSnapshot::default(),
        );

        connected(&mut c, "back pain").await;
        c.event_sender().send(EngineEvent::CallEnded);
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);

        assert!(c.summary().is_none());
        assert!(c.session().last_error().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_empty_complaint_never_reaches_engine() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut c = controller(
            engine.clone(),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        let result = c.start("   ").await;
        assert!(matches!(result, Err(SessionError::Validation(_))));
        assert_eq!(c.session().state(), SessionState::Idle);
        assert_eq!(engine.start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_engine_start_rejected_then_retry() {
        let engine = Arc::new(ScriptedEngine::rejecting());
        let mut c = controller(
            engine.clone(),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        let result = c.start("chest tightness when running").await;
        assert!(matches!(result, Err(SessionError::EngineStart(_))));
        assert_eq!(c.session().state(), SessionState::Failed);
        assert_eq!(c.session().initial_complaint(), "chest tightness when running");
        assert!(!c.has_running_timers());

        engine.reject.store(false, Ordering::SeqCst);
        let complaint = c.session().initial_complaint().to_string();
        c.start(&complaint).await.unwrap();
        assert_eq!(c.session().state(), SessionState::Connecting);
        assert_eq!(engine.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_engine_error_while_connecting() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut c = controller(
            engine.clone(),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        c.start("earache").await.unwrap();
        c.event_sender()
            .send(EngineEvent::Error("microphone permission denied".to_string()));
        assert_eq!(c.run_until_settled().await, SessionState::Failed);
        assert!(c.session().last_error().unwrap().is_retryable());
        assert_eq!(c.session().initial_complaint(), "earache");
        assert!(!c.has_running_timers());
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_mid_call_error_does_not_end_call() {
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        connected(&mut c, "nausea").await;
        c.event_sender().send(EngineEvent::Error("packet loss".to_string()));
        assert_eq!(c.next().await, SessionEffect::None);
        assert_eq!(c.session().state(), SessionState::Active);
        run_ticks(&mut c, 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_cancel_while_connecting() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut c = controller(
            engine.clone(),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        c.start("fever").await.unwrap();
        assert_eq!(c.end_call().await, SessionEffect::Cancelled);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(c.session().state(), SessionState::Idle);
        assert_eq!(c.session().initial_complaint(), "fever");
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_persistence_failure_keeps_summary_and_retries() {
        let store = Arc::new(FlakyStore::new(1));
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            store.clone(),
            PatientSnapshot::default(),
        );

        connected(&mut c, "twisted ankle").await;
        let tx = c.event_sender();
        tx.send(patient_says("it is swollen"));
        tx.send(report("Swollen ankle after a fall. Ice and elevate."));
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);

        assert!(c.summary().is_some());
        assert!(c.session().record_id().is_none());
        assert!(matches!(
            c.session().last_error(),
            Some(SessionError::Persistence(_))
        ));

        let id = c.retry_save().await.unwrap();
        assert_eq!(c.session().record_id(), Some(id.as_str()));
        assert!(c.session().last_error().is_none());
        assert_eq!(store.inner.len(), 1);

        // Saving again updates the same record
        let again = c.retry_save().await.unwrap();
        assert_eq!(again, id);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_follow_up_uses_patient_location() {
        let snapshot = PatientSnapshot {
            profile: PatientProfile {
                first_name: Some("Ana".to_string()),
                city: Some("Tucson".to_string()),
                state: Some("AZ".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = Arc::new(ScriptedEngine::default());
        let mut c = controller(engine.clone(), Arc::new(MemoryStore::new()), snapshot);

        connected(&mut c, "dry cough").await;
        c.event_sender().send(patient_says("mostly at night"));
        c.next().await;
        c.end_call().await;
        c.run_until_settled().await;

        assert!(c.summary().unwrap().follow_up_text.contains("Tucson, AZ"));
        assert!(engine.starts.lock().unwrap()[0].first_message.starts_with("Hello Ana,"));
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_new_session_after_summary_and_dismiss() {
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            store.clone(),
            PatientSnapshot::default(),
        );

        connected(&mut c, "headache").await;
        c.event_sender().send(patient_says("behind my eyes"));
        c.next().await;
        c.end_call().await;
        c.run_until_settled().await;
        let first_id = c.session().session_id().unwrap().to_string();

        // Starting again discards the previous session
        connected(&mut c, "stomach ache").await;
        assert_ne!(c.session().session_id().unwrap(), first_id);
        assert!(c.session().messages().is_empty());
        assert!(c.summary().is_none());

        c.end_call().await;
        c.run_until_settled().await;
        c.dismiss().unwrap();
        assert_eq!(c.session().state(), SessionState::Idle);
        assert!(c.session().initial_complaint().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_stale_timer_inputs_are_ignored() {
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        connected(&mut c, "insomnia").await;
        let effect = c
            .handle(Input::Tick {
                session_id: "previous-session".to_string(),
            })
            .await;
        assert_eq!(effect, SessionEffect::None);
        assert_eq!(c.session().elapsed_seconds(), 0);

        let effect = c
            .handle(Input::ReportGraceExpired {
                session_id: "previous-session".to_string(),
            })
            .await;
        assert_eq!(effect, SessionEffect::None);
        assert_eq!(c.session().state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_queued_call_end_does_not_fail_next_session() {
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            store.clone(),
            PatientSnapshot::default(),
        );

        connected(&mut c, "always tired").await;
        let old = c.event_sender();
        old.send(patient_says("I feel tired all the time"));
        old.send(report("Patient reports mild fatigue. Recommend rest and hydration."));
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);

        // The engine's own call end is still queued when the next call starts
        old.send(EngineEvent::CallEnded);
        c.start("headache").await.unwrap();
        let new = c.event_sender();
        new.send(EngineEvent::CallStarted);

        assert_eq!(c.next().await, SessionEffect::None);
        assert_eq!(c.session().state(), SessionState::Connecting);
        assert!(c.session().last_error().is_none());
        assert_eq!(c.next().await, SessionEffect::CallActive);
        assert_eq!(c.session().state(), SessionState::Active);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_late_report_after_new_start_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            store.clone(),
            PatientSnapshot::default(),
        );

        connected(&mut c, "sore knee").await;
        let old = c.event_sender();
        old.send(patient_says("it clicks when I walk"));
        old.send(EngineEvent::CallEnded);
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);
        let first_record = c.session().record_id().map(str::to_string);

        c.start("headache").await.unwrap();

        // The previous call's report shows up after its grace period
        old.send(report("Knee clicking on walking. See a physiotherapist."));
        assert_eq!(c.next().await, SessionEffect::None);
        assert_eq!(c.session().state(), SessionState::Connecting);
        assert!(c.session().engine_analysis().is_none());

        c.event_sender().send(EngineEvent::CallStarted);
        assert_eq!(c.next().await, SessionEffect::CallActive);

        // And it is just as harmless once the new call is live
        old.send(report("Knee clicking on walking. See a physiotherapist."));
        old.send(patient_says("stray words"));
        c.next().await;
        c.next().await;
        assert_eq!(c.session().state(), SessionState::Active);
        assert!(c.session().messages().is_empty());
        assert_eq!(store.len(), 1);
        assert!(first_record.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_words_flushed_after_hang_up_reach_the_summary() {
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );

        connected(&mut c, "persistent headache for 3 days").await;
        let tx = c.event_sender();
        tx.send(patient_says("started 3 days ago"));
        c.next().await;

        assert_eq!(c.end_call().await, SessionEffect::AwaitingReport);
        tx.send(patient_says("worse in the morning"));
        assert_eq!(c.run_until_settled().await, SessionState::Summarized);

        assert_eq!(
            c.summary().unwrap().symptoms_text,
            "started 3 days ago; worse in the morning"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_status_updates_are_published() {
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            Arc::new(MemoryStore::new()),
            PatientSnapshot::default(),
        );
        let status = c.subscribe_status();
        assert_eq!(status.borrow().state, SessionState::Idle);

        connected(&mut c, "allergies").await;
        assert_eq!(status.borrow().state, SessionState::Active);

        c.event_sender().send(EngineEvent::Utterance(UtteranceEvent::partial(
            Role::Patient,
            "my eyes are",
        )));
        c.next().await;
        assert_eq!(status.borrow().draft_text.as_deref(), Some("my eyes are"));

        run_ticks(&mut c, 4).await;
        assert_eq!(status.borrow().elapsed_seconds, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn e2e_replay_of_wire_messages() {
        let lines = [
            r#"{"type":"call-start"}"#,
            r#"{"type":"speech-update","status":"started","role":"assistant"}"#,
            r#"{"type":"transcript","role":"assistant","transcriptType":"final","transcript":"Hello, how can I help?"}"#,
            r#"{"type":"transcript","role":"user","transcriptType":"partial","transcript":"my"}"#,
            r#"{"type":"transcript","role":"user","transcriptType":"final","transcript":"my knee is swollen"}"#,
            r#"{"type":"volume-level","volume":0.2}"#,
            r#"{"type":"end-of-call-report","analysis":{"summary":"Swollen knee. Rest and ice it."},"transcript":"AI: Hello, how can I help?\nUser: my knee is swollen"}"#,
            r#"{"type":"call-end"}"#,
        ];

        let store = Arc::new(MemoryStore::new());
        let mut c = controller(
            Arc::new(ScriptedEngine::default()),
            store.clone(),
            PatientSnapshot::default(),
        );
        c.start("knee pain").await.unwrap();
        let tx = c.event_sender();
        for line in lines {
            if let Some(event) = EngineMessage::parse(line).unwrap().into_event() {
                tx.send(event);
            }
        }

        assert_eq!(c.run_until_settled().await, SessionState::Summarized);
        let summary = c.summary().unwrap();
        assert_eq!(summary.symptoms_text, "Swollen knee.");
        assert_eq!(summary.follow_up_text, "Rest and ice it.");
        assert!(summary.transcript_text.starts_with("AI: Hello"));
        assert_eq!(c.session().messages().len(), 2);
        assert_eq!(store.len(), 1);
    }
}
