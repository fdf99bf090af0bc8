use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::ScreeningCategory;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{AnalysisResult, Report, StorageObjectRef, Submission, SubmissionStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("DynamoDB error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid data format: {0}")]
    InvalidData(String),
    #[error("Provenance identity conflict for submission {id}: {field} differs")]
    IdentityConflict { id: Uuid, field: &'static str },
    #[error("Stale provenance write for submission {id}: {incoming} is behind {stored}")]
    StaleStatus {
        id: Uuid,
        stored: String,
        incoming: String,
    },
}

impl StoreError {
    /// Conflicts repeat on every retry; only backend failures may clear up.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::IdentityConflict { .. } | StoreError::StaleStatus { .. }
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Persistence {
            recoverable: !err.is_conflict(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Provenance of a completed submission, keyed by submission id.
///
/// Identity fields never change after the first write; `status`, `report`
/// and `updated_at` are last-write-wins, except that `progress` never drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    pub submission_id: Uuid,
    pub patient_id: String,
    #[serde(default)]
    pub doctor_id: Option<String>,
    pub category: ScreeningCategory,
    pub created_at: DateTime<Utc>,
    pub image_ref: StorageObjectRef,
    pub analysis: AnalysisResult,
    pub status: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub report: Option<Report>,
    pub updated_at: DateTime<Utc>,
}

impl ProvenanceRecord {
    pub fn from_submission(submission: &Submission) -> Result<Self, PipelineError> {
        let image_ref = submission.image_ref.clone().ok_or_else(|| {
            PipelineError::NotFound(format!("submission {} has no source image", submission.id))
        })?;
        let analysis = submission.analysis.clone().ok_or_else(|| {
            PipelineError::NotFound(format!(
                "submission {} has no analysis result",
                submission.id
            ))
        })?;
        if submission.status == SubmissionStatus::Persisted && submission.report.is_none() {
            return Err(PipelineError::NotFound(format!(
                "persisted submission {} has no report",
                submission.id
            )));
        }
        Ok(Self {
            submission_id: submission.id,
            patient_id: submission.patient_id.clone(),
            doctor_id: submission.doctor_id.clone(),
            category: submission.category.clone(),
            created_at: submission.created_at,
            image_ref,
            analysis,
            status: submission.status.label().to_string(),
            progress: submission.status.rank(),
            report: submission.report.clone(),
            updated_at: submission.updated_at,
        })
    }

    /// First identity field that differs from `other`, if any.
    pub fn identity_conflict(&self, other: &ProvenanceRecord) -> Option<&'static str> {
        if self.submission_id != other.submission_id {
            Some("submissionId")
        } else if self.patient_id != other.patient_id {
            Some("patientId")
        } else if self.doctor_id != other.doctor_id {
            Some("doctorId")
        } else if self.category != other.category {
            Some("category")
        } else if self.created_at != other.created_at {
            Some("createdAt")
        } else if self.image_ref != other.image_ref {
            Some("imageRef")
        } else if self.analysis != other.analysis {
            Some("analysis")
        } else {
            None
        }
    }

    pub fn same_mutable_state(&self, other: &ProvenanceRecord) -> bool {
        self.status == other.status && self.report == other.report
    }

    /// Rejects a write whose status is behind the stored one.
    pub fn check_progress(&self, incoming: &ProvenanceRecord) -> Result<(), StoreError> {
        if incoming.progress < self.progress {
            return Err(StoreError::StaleStatus {
                id: self.submission_id,
                stored: self.status.clone(),
                incoming: incoming.status.clone(),
            });
        }
        Ok(())
    }
}

/// Durable checkpoints and provenance. Implementations guarantee per-key
/// write atomicity; nothing else is shared between submissions.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn save_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError>;

    async fn upsert_provenance(
        &self,
        record: &ProvenanceRecord,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_provenance(&self, id: Uuid) -> Result<Option<ProvenanceRecord>, StoreError>;
}
