//! Read-only patient data consumed by the context builder and summarizer.
//!
//! Field names follow FHIR-style camelCase on the wire so snapshots exported by
//! the surrounding application deserialize directly.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum number of past consultations carried in a snapshot
pub const MAX_RECENT_CONSULTATIONS: usize = 3;

/// Patient demographics (simplified)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub blood_type: Option<String>,
    pub height_cm: Option<f32>,
    pub weight_kg: Option<f32>,
}

impl PatientProfile {
    /// Full display name, if any part of it is known
    pub fn display_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    /// "City, State" when either half is known
    pub fn location(&self) -> Option<String> {
        let parts: Vec<&str> = [self.city.as_deref(), self.state.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// Clinical status of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionStatus {
    Active,
    Recurrence,
    Relapse,
    Inactive,
    Remission,
    Resolved,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::Active => "active",
            ConditionStatus::Recurrence => "recurrence",
            ConditionStatus::Relapse => "relapse",
            ConditionStatus::Inactive => "inactive",
            ConditionStatus::Remission => "remission",
            ConditionStatus::Resolved => "resolved",
        }
    }

    /// Statuses that count as an ongoing problem
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConditionStatus::Active | ConditionStatus::Recurrence | ConditionStatus::Relapse
        )
    }
}

/// A recorded medical condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub name: String,
    pub severity: Option<String>,
    pub status: Option<ConditionStatus>,
    pub onset_date: Option<NaiveDate>,
}

impl Condition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            severity: None,
            status: None,
            onset_date: None,
        }
    }

    /// Conditions without a recorded status are treated as active
    pub fn is_active(&self) -> bool {
        self.status.map(|s| s.is_active()).unwrap_or(true)
    }
}

/// Summary of an earlier consultation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastConsultation {
    pub date: NaiveDate,
    pub summary: Option<String>,
    pub symptoms: Option<String>,
    pub follow_up: Option<String>,
}

/// Read-only bundle of profile and history used to ground a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSnapshot {
    #[serde(default)]
    pub profile: PatientProfile,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub recent_consultations: Vec<PastConsultation>,
}

impl PatientSnapshot {
    /// Build a snapshot, keeping only active conditions and the most recent
    /// consultations (newest first).
    pub fn new(
        profile: PatientProfile,
        conditions: Vec<Condition>,
        consultations: Vec<PastConsultation>,
    ) -> Self {
        Self {
            profile,
            conditions: conditions.into_iter().filter(Condition::is_active).collect(),
            recent_consultations: most_recent(consultations, MAX_RECENT_CONSULTATIONS),
        }
    }

    /// Load a snapshot from a JSON file and normalize it
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read patient snapshot {}", path.display()))?;
        let raw: PatientSnapshot =
            serde_json::from_str(&content).context("Invalid patient snapshot JSON")?;
        Ok(Self::new(raw.profile, raw.conditions, raw.recent_consultations))
    }
}

/// Newest-first, truncated to `limit`
pub fn most_recent(
    mut consultations: Vec<PastConsultation>,
    limit: usize,
) -> Vec<PastConsultation> {
    consultations.sort_by(|a, b| b.date.cmp(&a.date));
    consultations.truncate(limit);
    consultations
}
