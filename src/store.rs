//! Consultation persistence.
//!
//! The core only needs to create and update a consultation record; where it
//! lands is up to the implementation. Two are provided:
//!
//! - [`ArchiveStore`]: local on-disk archive, one directory per record at
//!   `<base>/YYYY/MM/DD/<record_id>/` holding `record.json` and `transcript.txt`
//! - [`MemoryStore`]: in-process map, for embedding and tests

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::patient::{most_recent, PastConsultation};
use crate::summary::ConsultationSummary;

const RECORD_FILE: &str = "record.json";
const TRANSCRIPT_FILE: &str = "transcript.txt";

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Consultation not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A stored consultation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub summary: ConsultationSummary,
}

impl ConsultationRecord {
    fn new(summary: ConsultationSummary) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            summary,
        }
    }

    /// Condensed form used as "recent consultation" context
    pub fn to_past_consultation(&self) -> PastConsultation {
        let date = self.summary.started_at.unwrap_or(self.created_at).date_naive();
        PastConsultation {
            date,
            summary: Some(self.summary.summary_text.clone()),
            symptoms: Some(self.summary.symptoms_text.clone()),
            follow_up: Some(self.summary.follow_up_text.clone()),
        }
    }
}

/// Persistence gateway contract
#[async_trait]
pub trait ConsultationStore: Send + Sync {
    async fn create_consultation(
        &self,
        summary: &ConsultationSummary,
    ) -> Result<ConsultationRecord, StoreError>;

    async fn update_consultation(
        &self,
        id: &str,
        summary: &ConsultationSummary,
    ) -> Result<ConsultationRecord, StoreError>;
}

// ============================================================================
// Local archive
// ============================================================================

/// Local on-disk archive
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    base_dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Load one record by ID
    pub async fn get(&self, id: &str) -> Result<ConsultationRecord, StoreError> {
        let base = self.base_dir.clone();
        let id = id.to_string();
        blocking(move || {
            let dir = find_record_dir(&base, &id)?.ok_or(StoreError::NotFound(id))?;
            read_record(&dir)
        })
        .await
    }

    /// Most recent consultations, newest first, for the patient snapshot
    pub async fn recent_consultations(
        &self,
        limit: usize,
    ) -> Result<Vec<PastConsultation>, StoreError> {
        let base = self.base_dir.clone();
        blocking(move || {
            let past = list_record_dirs(&base)?
                .iter()
                .filter_map(|dir| match read_record(dir) {
                    Ok(record) => Some(record.to_past_consultation()),
                    Err(e) => {
                        warn!("Skipping unreadable archive entry {}: {}", dir.display(), e);
                        None
                    }
                })
                .collect();
            Ok(most_recent(past, limit))
        })
        .await
    }
}

#[async_trait]
impl ConsultationStore for ArchiveStore {
    async fn create_consultation(
        &self,
        summary: &ConsultationSummary,
    ) -> Result<ConsultationRecord, StoreError> {
        let base = self.base_dir.clone();
        let record = ConsultationRecord::new(summary.clone());
        blocking(move || {
            let dir = date_dir(&base, &record.created_at).join(&record.id);
            fs::create_dir_all(&dir)?;
            write_record(&dir, &record)?;
            info!("Archived consultation {} to {}", record.id, dir.display());
            Ok(record)
        })
        .await
    }

    async fn update_consultation(
        &self,
        id: &str,
        summary: &ConsultationSummary,
    ) -> Result<ConsultationRecord, StoreError> {
        let base = self.base_dir.clone();
        let id = id.to_string();
        let summary = summary.clone();
        blocking(move || {
            let dir = find_record_dir(&base, &id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let mut record = read_record(&dir)?;
            record.summary = summary;
            record.updated_at = Utc::now();
            write_record(&dir, &record)?;
            info!("Updated archived consultation {}", record.id);
            Ok(record)
        })
        .await
    }
}

/// Run filesystem work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("Archive task failed: {}", e)))?
}

fn date_dir(base: &Path, date: &DateTime<Utc>) -> PathBuf {
    base.join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day()))
}

fn write_record(dir: &Path, record: &ConsultationRecord) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(record)?;
    fs::write(dir.join(RECORD_FILE), json)?;
    fs::write(dir.join(TRANSCRIPT_FILE), &record.summary.transcript_text)?;
    Ok(())
}

fn read_record(dir: &Path) -> Result<ConsultationRecord, StoreError> {
    let content = fs::read_to_string(dir.join(RECORD_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

/// Sub-directories of `dir`, or nothing if it does not exist
fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

/// Every record directory under `base` (YYYY/MM/DD/id)
fn list_record_dirs(base: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut records = Vec::new();
    for year in subdirs(base)? {
        for month in subdirs(&year)? {
            for day in subdirs(&month)? {
                records.extend(
                    subdirs(&day)?
                        .into_iter()
                        .filter(|d| d.join(RECORD_FILE).exists()),
                );
            }
        }
    }
    debug!("Found {} archived consultations", records.len());
    Ok(records)
}

fn find_record_dir(base: &Path, id: &str) -> Result<Option<PathBuf>, StoreError> {
    Ok(list_record_dirs(base)?
        .into_iter()
        .find(|d| d.file_name().map(|n| n == id).unwrap_or(false)))
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, ConsultationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<ConsultationRecord> {
        self.records.lock().ok().and_then(|r| r.get(id).cloned())
    }
}

#[async_trait]
impl ConsultationStore for MemoryStore {
    async fn create_consultation(
        &self,
        summary: &ConsultationSummary,
    ) -> Result<ConsultationRecord, StoreError> {
        let record = ConsultationRecord::new(summary.clone());
        let mut records = self
            .records
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_consultation(
        &self,
        id: &str,
        summary: &ConsultationSummary,
    ) -> Result<ConsultationRecord, StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.summary = summary.clone();
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}
