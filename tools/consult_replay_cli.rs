//! Consultation Replay CLI
//!
//! Replays a recorded stream of voice platform messages (one JSON message per
//! line) through the consultation controller and prints the resulting summary.
//! Useful for checking summaries against real calls without a live engine.
//!
//! Usage:
//!   cargo run --bin consult_replay_cli -- --events call.jsonl --complaint "headache for 3 days"
//!   cargo run --bin consult_replay_cli -- --events call.jsonl --complaint "cough" --patient patient.json
//!   cargo run --bin consult_replay_cli -- --events call.jsonl --complaint "cough" --pace-ms 1000 --no-save

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};

use voice_consult::activity_log;
use voice_consult::config::Config;
use voice_consult::engine::EngineError;
use voice_consult::patient::{most_recent, PatientSnapshot};
use voice_consult::{
    ArchiveStore, ConsultationController, ConsultationStore, EngineEvent, EngineEventSender,
    EngineMessage, EngineSessionConfig, MemoryStore, SessionState, VoiceEngine,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Recorded engine messages, one JSON object per line
    #[arg(short, long)]
    events: PathBuf,

    /// The patient's initial complaint
    #[arg(short, long)]
    complaint: String,

    /// Patient snapshot JSON (profile, conditions, recent consultations)
    #[arg(short, long)]
    patient: Option<PathBuf>,

    /// Config file (defaults to ~/.voiceconsult/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the archive directory from the config
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Keep the summary in memory instead of writing it to the archive
    #[arg(long)]
    no_save: bool,

    /// Delay between replayed messages, in milliseconds
    #[arg(long, default_value = "0")]
    pace_ms: u64,

    /// Print the context sent to the engine
    #[arg(long)]
    show_context: bool,

    /// Debug-level console logging
    #[arg(short, long)]
    verbose: bool,
}

/// Voice engine stand-in that plays back a recorded call
struct ReplayEngine {
    events: Vec<EngineEvent>,
    pace: Duration,
    sender: Mutex<Option<EngineEventSender>>,
    started: Mutex<Option<EngineSessionConfig>>,
}

impl ReplayEngine {
    fn new(events: Vec<EngineEvent>, pace: Duration) -> Self {
        Self {
            events,
            pace,
            sender: Mutex::new(None),
            started: Mutex::new(None),
        }
    }

    fn attach(&self, sender: EngineEventSender) {
        if let Ok(mut slot) = self.sender.lock() {
            *slot = Some(sender);
        }
    }

    fn started_config(&self) -> Option<EngineSessionConfig> {
        self.started.lock().ok().and_then(|c| c.clone())
    }
}

#[async_trait]
impl VoiceEngine for ReplayEngine {
    async fn start(&self, config: EngineSessionConfig) -> Result<(), EngineError> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or_else(|| {
                EngineError::Unavailable("Replay engine is not attached".to_string())
            })?
            .for_session(config.session_id.as_str());
        if let Ok(mut started) = self.started.lock() {
            *started = Some(config);
        }

        let mut events = self.events.clone();
        if !events.iter().any(EngineEvent::is_termination) {
            warn!("Recording has no call end, hanging up after the last message");
            events.push(EngineEvent::CallEnded);
        }
        let pace = self.pace;

        tokio::spawn(async move {
            for event in events {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                if !sender.send(event) {
                    break;
                }
            }
        });
        Ok(())
    }

    fn stop(&self) {
        info!("Replay engine stopped");
    }
}

fn load_events(path: &Path) -> Result<Vec<EngineEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = EngineMessage::parse(line)
            .with_context(|| format!("Invalid engine message on line {}", index + 1))?;
        if let Some(event) = message.into_event() {
            events.push(event);
        }
    }
    Ok(events)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }

    let mut config = match args.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load_or_default(),
    };
    if let Some(dir) = args.archive_dir.clone() {
        config.archive_dir = Some(dir);
    }

    activity_log::init_logging(&config.get_log_dir()?)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let settings = config.consultation_settings();
    let archive = ArchiveStore::new(config.get_archive_dir()?);

    let mut snapshot = match args.patient {
        Some(ref path) => PatientSnapshot::load(path)?,
        None => PatientSnapshot::default(),
    };
    match archive
        .recent_consultations(settings.recent_consultation_limit)
        .await
    {
        Ok(archived) => {
            let mut all = std::mem::take(&mut snapshot.recent_consultations);
            all.extend(archived);
            snapshot.recent_consultations = most_recent(all, settings.recent_consultation_limit);
        }
        Err(e) => warn!("Could not read archived consultations: {}", e),
    }

    let events = load_events(&args.events)?;
    info!("Loaded {} engine events", events.len());

    let store: Arc<dyn ConsultationStore> = if args.no_save {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(archive.clone())
    };
    let engine = Arc::new(ReplayEngine::new(events, Duration::from_millis(args.pace_ms)));
    let mut controller = ConsultationController::new(engine.clone(), store, snapshot, settings);
    engine.attach(controller.event_sender());

    controller.start(&args.complaint).await?;
    if args.show_context {
        if let Some(started) = engine.started_config() {
            println!("=== Context ===\n{}\n", started.context);
            println!("=== First message ===\n{}\n", started.first_message);
        }
    }

    let state = controller.run_until_settled().await;
    if state != SessionState::Summarized {
        let reason = controller
            .session()
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("session ended in state {}", state.as_str()));
        bail!("Replay did not produce a summary: {}", reason);
    }

    let Some(summary) = controller.summary() else {
        println!("No utterances were exchanged; nothing to summarize.");
        return Ok(());
    };

    println!("=== Consultation summary ===");
    println!("Complaint:  {}", summary.initial_complaint);
    println!("Duration:   {}", summary.formatted_duration());
    println!("Summary:    {}", summary.summary_text);
    println!("Symptoms:   {}", summary.symptoms_text);
    println!("Assessment: {}", summary.assessment_text);
    println!("Follow-up:  {}", summary.follow_up_text);
    println!();
    println!("{}", summary.disclaimer_text);
    println!();
    println!("=== Transcript ===\n{}", summary.transcript_text);

    match (controller.session().record_id(), controller.session().last_error()) {
        (Some(id), _) if !args.no_save => {
            println!("\nSaved as {} under {}", id, archive.base_dir().display())
        }
        (_, Some(error)) => eprintln!("\n{}", error),
        _ => {}
    }

    Ok(())
}
