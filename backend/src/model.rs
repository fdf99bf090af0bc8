use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{AppointmentInfo, ClinicalContext, DoctorInfo, PatientInfo, ScreeningCategory};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Analysis,
    Render,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Upload => "upload",
            Stage::Analysis => "analysis",
            Stage::Render => "render",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Last completed milestone of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Checkpoint {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "UPLOADED")]
    Uploaded,
    #[serde(rename = "ANALYZED")]
    Analyzed,
    #[serde(rename = "RENDERED")]
    Rendered,
}

impl Checkpoint {
    pub fn status(self) -> SubmissionStatus {
        match self {
            Checkpoint::Pending => SubmissionStatus::Pending,
            Checkpoint::Uploaded => SubmissionStatus::Uploaded,
            Checkpoint::Analyzed => SubmissionStatus::Analyzed,
            Checkpoint::Rendered => SubmissionStatus::Rendered,
        }
    }

    /// The stage that follows this checkpoint.
    pub fn next_stage(self) -> Stage {
        match self {
            Checkpoint::Pending => Stage::Upload,
            Checkpoint::Uploaded => Stage::Analysis,
            Checkpoint::Analyzed => Stage::Render,
            Checkpoint::Rendered => Stage::Persist,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Uploading,
    Uploaded,
    Analyzing,
    Analyzed,
    Rendering,
    Rendered,
    Persisted,
    #[serde(rename_all = "camelCase")]
    Failed {
        reason: String,
        last_good: Checkpoint,
        retryable: bool,
    },
    #[serde(rename_all = "camelCase")]
    Abandoned { stage: Stage, last_good: Checkpoint },
}

impl SubmissionStatus {
    /// Progress rank; never decreases for a given submission.
    pub fn rank(&self) -> u8 {
        match self {
            SubmissionStatus::Pending => 0,
            SubmissionStatus::Uploading => 1,
            SubmissionStatus::Uploaded => 2,
            SubmissionStatus::Analyzing => 3,
            SubmissionStatus::Analyzed => 4,
            SubmissionStatus::Rendering => 5,
            SubmissionStatus::Rendered => 6,
            SubmissionStatus::Persisted => 7,
            SubmissionStatus::Failed { last_good, .. }
            | SubmissionStatus::Abandoned { last_good, .. } => last_good.status().rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Persisted
                | SubmissionStatus::Failed { .. }
                | SubmissionStatus::Abandoned { .. }
        )
    }

    pub fn last_good(&self) -> Option<Checkpoint> {
        match self {
            SubmissionStatus::Pending | SubmissionStatus::Uploading => Some(Checkpoint::Pending),
            SubmissionStatus::Uploaded | SubmissionStatus::Analyzing => Some(Checkpoint::Uploaded),
            SubmissionStatus::Analyzed | SubmissionStatus::Rendering => Some(Checkpoint::Analyzed),
            SubmissionStatus::Rendered => Some(Checkpoint::Rendered),
            SubmissionStatus::Persisted => None,
            SubmissionStatus::Failed { last_good, .. }
            | SubmissionStatus::Abandoned { last_good, .. } => Some(*last_good),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Uploading => "UPLOADING",
            SubmissionStatus::Uploaded => "UPLOADED",
            SubmissionStatus::Analyzing => "ANALYZING",
            SubmissionStatus::Analyzed => "ANALYZED",
            SubmissionStatus::Rendering => "RENDERING",
            SubmissionStatus::Rendered => "RENDERED",
            SubmissionStatus::Persisted => "PERSISTED",
            SubmissionStatus::Failed { .. } => "FAILED",
            SubmissionStatus::Abandoned { .. } => "ABANDONED",
        }
    }

    fn in_progress(stage: Stage) -> SubmissionStatus {
        match stage {
            Stage::Upload => SubmissionStatus::Uploading,
            Stage::Analysis => SubmissionStatus::Analyzing,
            Stage::Render => SubmissionStatus::Rendering,
            Stage::Persist => SubmissionStatus::Rendered,
        }
    }

    fn completed(stage: Stage) -> SubmissionStatus {
        match stage {
            Stage::Upload => SubmissionStatus::Uploaded,
            Stage::Analysis => SubmissionStatus::Analyzed,
            Stage::Render => SubmissionStatus::Rendered,
            Stage::Persist => SubmissionStatus::Persisted,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: &SubmissionStatus) -> bool {
        match self {
            SubmissionStatus::Persisted => false,
            SubmissionStatus::Failed {
                last_good,
                retryable,
                ..
            } => *retryable && *next == last_good.status(),
            SubmissionStatus::Abandoned { last_good, .. } => *next == last_good.status(),
            current => {
                let Some(checkpoint) = current.last_good() else {
                    return false;
                };
                match next {
                    SubmissionStatus::Failed { last_good, .. }
                    | SubmissionStatus::Abandoned { last_good, .. } => *last_good == checkpoint,
                    _ => {
                        let stage = checkpoint.next_stage();
                        let started = SubmissionStatus::in_progress(stage);
                        let done = SubmissionStatus::completed(stage);
                        (*next == started && next.rank() > current.rank()) || *next == done
                    }
                }
            }
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::Failed { reason, last_good, .. } => {
                write!(f, "FAILED ({}; last good {:?})", reason, last_good)
            }
            SubmissionStatus::Abandoned { stage, last_good } => {
                write!(f, "ABANDONED ({} stage; last good {:?})", stage, last_good)
            }
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObjectRef {
    pub provider: String,
    pub key: String,
    pub url: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub submission_id: Uuid,
    pub label: String,
    pub confidence: BTreeMap<String, f64>,
    pub model_version: String,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_image_url: Option<String>,
}

impl AnalysisResult {
    pub fn top_confidence(&self) -> Option<f64> {
        self.confidence.get(&self.label).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub submission_id: Uuid,
    pub rendered_at: DateTime<Utc>,
    pub output: StorageObjectRef,
    pub findings: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub patient_id: String,
    #[serde(default)]
    pub doctor_id: Option<String>,
    pub category: ScreeningCategory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    pub context: ClinicalContext,
    #[serde(default)]
    pub image_ref: Option<StorageObjectRef>,
    #[serde(default)]
    pub analysis: Option<AnalysisResult>,
    #[serde(default)]
    pub report: Option<Report>,
    #[serde(default)]
    pub prior_reports: Vec<Report>,
}

impl Submission {
    pub fn new(category: ScreeningCategory, context: ClinicalContext) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            patient_id: context.patient.id.clone(),
            doctor_id: context.doctor.as_ref().map(|d| d.id.clone()),
            category,
            created_at: now,
            updated_at: now,
            status: SubmissionStatus::Pending,
            context,
            image_ref: None,
            analysis: None,
            report: None,
            prior_reports: Vec::new(),
        }
    }

    pub fn patient(&self) -> &PatientInfo {
        &self.context.patient
    }

    pub fn appointment(&self) -> Option<&AppointmentInfo> {
        self.context.appointment.as_ref()
    }

    pub fn doctor(&self) -> Option<&DoctorInfo> {
        self.context.doctor.as_ref()
    }

    pub fn transition(&mut self, next: SubmissionStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(&next) {
            return Err(PipelineError::Validation(format!(
                "submission {} cannot move from {} to {}",
                self.id,
                self.status.label(),
                next.label()
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_image(&mut self, image: StorageObjectRef) -> Result<(), PipelineError> {
        if self.image_ref.is_some() {
            return Err(PipelineError::Validation(format!(
                "submission {} already has a source image",
                self.id
            )));
        }
        self.image_ref = Some(image);
        Ok(())
    }

    pub fn record_analysis(&mut self, analysis: AnalysisResult) -> Result<(), PipelineError> {
        if self.analysis.is_some() {
            return Err(PipelineError::Validation(format!(
                "submission {} already has an analysis result",
                self.id
            )));
        }
        if analysis.submission_id != self.id {
            return Err(PipelineError::Validation(format!(
                "analysis belongs to submission {}, not {}",
                analysis.submission_id, self.id
            )));
        }
        self.analysis = Some(analysis);
        Ok(())
    }

    /// Records a report; a previous one is kept unchanged in `prior_reports`.
    pub fn record_report(&mut self, report: Report) -> Result<(), PipelineError> {
        if self.image_ref.is_none() || self.analysis.is_none() {
            return Err(PipelineError::NotFound(format!(
                "submission {} has no source image and analysis to report on",
                self.id
            )));
        }
        if let Some(previous) = self.report.take() {
            self.prior_reports.push(previous);
        }
        self.report = Some(report);
        Ok(())
    }
}
