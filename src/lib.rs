//! Voice consultation core.
//!
//! Drives a third-party voice assistant through one patient consultation:
//! grounding context in, streamed transcript events through a lifecycle state
//! machine, a structured summary out to a persistence gateway.

pub mod activity_log;
pub mod config;
pub mod consultation;
pub mod context;
pub mod engine;
pub mod patient;
pub mod session;
pub mod store;
pub mod summary;
pub mod transcript;

mod e2e_tests;

pub use consultation::{ConsultationController, EngineEventSender, Input};
pub use engine::{EngineEvent, EngineMessage, EngineSessionConfig, VoiceEngine};
pub use session::{Session, SessionEffect, SessionError, SessionState, SessionStatus};
pub use store::{ArchiveStore, ConsultationRecord, ConsultationStore, MemoryStore, StoreError};
pub use summary::{summarize, ConsultationSummary};
pub use transcript::{Role, TranscriptAccumulator, UtteranceEvent, UtteranceKind};
