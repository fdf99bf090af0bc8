use chrono::Utc;
use shared::{ClinicalContext, ScreeningCategory};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::persister::{MetadataPersister, PersistAck};
use crate::db::store::SubmissionStore;
use crate::error::PipelineError;
use crate::inference::invoker::AnalysisInvoker;
use crate::model::{AnalysisResult, Report, Stage, StorageObjectRef, Submission, SubmissionStatus};
use crate::pipeline::admission::AdmissionGate;
use crate::report::assembler::ReportAssembler;
use crate::storage::uploader::{ObjectStoreUploader, PDF_CONTENT_TYPE};

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub category: String,
    pub context: ClinicalContext,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

struct PendingPayload {
    bytes: Vec<u8>,
    content_type: String,
    file_name: String,
}

enum StageOutput {
    Image(StorageObjectRef),
    Analysis(AnalysisResult),
    Report(Report),
    Persisted(Box<Submission>),
}

/// Marks a submission as being driven; released on drop.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

pub struct SubmissionCoordinator {
    uploader: ObjectStoreUploader,
    invoker: AnalysisInvoker,
    assembler: ReportAssembler,
    persister: MetadataPersister,
    store: Arc<dyn SubmissionStore>,
    gate: AdmissionGate,
    stage_timeout: Duration,
    payloads: Mutex<HashMap<Uuid, PendingPayload>>,
    active: Mutex<HashSet<Uuid>>,
}

impl SubmissionCoordinator {
    pub fn new(
        uploader: ObjectStoreUploader,
        invoker: AnalysisInvoker,
        assembler: ReportAssembler,
        persister: MetadataPersister,
        store: Arc<dyn SubmissionStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            uploader,
            invoker,
            assembler,
            persister,
            store,
            gate: AdmissionGate::new(config.max_in_flight),
            stage_timeout: config.stage_timeout,
            payloads: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn uploader(&self) -> &ObjectStoreUploader {
        &self.uploader
    }

    pub fn invoker(&self) -> &AnalysisInvoker {
        &self.invoker
    }

    pub fn assembler(&self) -> &ReportAssembler {
        &self.assembler
    }

    pub fn persister(&self) -> &MetadataPersister {
        &self.persister
    }

    /// Validates the request and checkpoints a `PENDING` submission. The
    /// payload is held in memory until the upload stage records its reference.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Submission, PipelineError> {
        let category = ScreeningCategory::parse(&request.category)
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        if request.context.patient.id.trim().is_empty() {
            return Err(PipelineError::Validation("patient id is required".to_string()));
        }
        if request
            .context
            .appointment
            .as_ref()
            .is_none_or(|a| a.id.trim().is_empty())
        {
            return Err(PipelineError::Validation(
                "appointment id is required".to_string(),
            ));
        }
        if !ObjectStoreUploader::is_image_type(&request.content_type) {
            return Err(PipelineError::Validation(format!(
                "content type '{}' is not an accepted image type",
                request.content_type
            )));
        }
        self.uploader
            .validate_payload(&request.payload, &request.content_type)?;

        let submission = Submission::new(category, request.context);
        self.checkpoint(&submission, Stage::Upload).await?;
        self.lock_payloads()?.insert(
            submission.id,
            PendingPayload {
                bytes: request.payload,
                content_type: request.content_type,
                file_name: request.file_name,
            },
        );
        log::info!(
            "Ingested submission {} ({}) for patient {}",
            submission.id,
            submission.category,
            submission.patient_id
        );
        Ok(submission)
    }

    pub async fn get(&self, id: Uuid) -> Result<Submission, PipelineError> {
        tokio::time::timeout(self.stage_timeout, self.store.load_submission(id))
            .await
            .map_err(|_| {
                log::error!("Loading submission {} timed out after {:?}", id, self.stage_timeout);
                PipelineError::Persistence {
                    message: format!("timed out loading submission {}", id),
                    recoverable: true,
                }
            })??
            .ok_or_else(|| PipelineError::NotFound(format!("submission {}", id)))
    }

    /// Drives exactly the next stage of a non-terminal submission. The stage is
    /// chosen from the recorded references, so a resumed submission never
    /// repeats a completed stage.
    pub async fn advance(&self, submission: &mut Submission) -> Result<(), PipelineError> {
        if submission.status.is_terminal() {
            return Err(PipelineError::Validation(format!(
                "submission {} is {}",
                submission.id,
                submission.status.label()
            )));
        }
        let stage = Self::pending_stage(submission);
        let Some(last_good) = submission.status.last_good() else {
            return Err(PipelineError::Validation(format!(
                "submission {} has no resumable checkpoint",
                submission.id
            )));
        };

        if let Some(started) = Self::started_status(stage) {
            if submission.status != started {
                submission.transition(started)?;
                self.checkpoint(submission, stage).await?;
            }
        }

        log::info!("Submission {}: starting {} stage", submission.id, stage);
        let outcome = tokio::time::timeout(self.stage_timeout, self.execute(stage, submission)).await;

        match outcome {
            Ok(Ok(output)) => {
                self.apply(submission, output)?;
                self.checkpoint(submission, stage).await?;
                log::info!("Submission {}: now {}", submission.id, submission.status);
                Ok(())
            }
            Ok(Err(err)) => {
                log::warn!("Submission {}: {} stage failed: {}", submission.id, stage, err);
                if !err.is_recoverable() {
                    // A permanent failure is never retried.
                    self.lock_payloads()?.remove(&submission.id);
                }
                submission.transition(SubmissionStatus::Failed {
                    reason: err.public_message(),
                    last_good,
                    retryable: err.is_recoverable(),
                })?;
                self.checkpoint(submission, stage).await?;
                Err(err)
            }
            Err(_) => {
                log::warn!(
                    "Submission {}: {} stage abandoned after {:?}",
                    submission.id,
                    stage,
                    self.stage_timeout
                );
                submission.transition(SubmissionStatus::Abandoned { stage, last_good })?;
                self.checkpoint(submission, stage).await?;
                Err(PipelineError::Abandoned {
                    stage,
                    after: self.stage_timeout,
                })
            }
        }
    }

    /// Admits the submission through the gate and advances it until terminal.
    pub async fn run(&self, id: Uuid) -> Result<Submission, PipelineError> {
        let _permit = self
            .gate
            .admit()
            .await
            .map_err(|_| PipelineError::Validation("pipeline is shutting down".to_string()))?;
        let _guard = self.claim(id)?;
        log::debug!(
            "Submission {} admitted ({}/{} in flight)",
            id,
            self.gate.in_flight(),
            self.gate.limit()
        );

        let mut submission = self.get(id).await?;
        while !submission.status.is_terminal() {
            self.advance(&mut submission).await?;
        }
        Ok(submission)
    }

    /// Reopens a failed or abandoned submission at its last completed stage
    /// and runs it again.
    pub async fn retry(&self, id: Uuid) -> Result<Submission, PipelineError> {
        {
            let _guard = self.claim(id)?;
            let mut submission = self.get(id).await?;
            let reopen = match &submission.status {
                SubmissionStatus::Failed {
                    retryable: true,
                    last_good,
                    ..
                }
                | SubmissionStatus::Abandoned { last_good, .. } => last_good.status(),
                SubmissionStatus::Failed { reason, .. } => {
                    return Err(PipelineError::Validation(format!(
                        "submission {} failed permanently: {}",
                        id, reason
                    )));
                }
                other => {
                    return Err(PipelineError::Validation(format!(
                        "submission {} is {} and cannot be retried",
                        id,
                        other.label()
                    )));
                }
            };
            submission.transition(reopen)?;
            self.checkpoint(&submission, Self::pending_stage(&submission)).await?;
            log::info!("Submission {} reopened at {}", id, submission.status);
        }
        self.run(id).await
    }

    /// Renders a fresh report for a persisted submission; the previous report
    /// is kept in `prior_reports`.
    pub async fn rerender(&self, id: Uuid) -> Result<Submission, PipelineError> {
        let _permit = self
            .gate
            .admit()
            .await
            .map_err(|_| PipelineError::Validation("pipeline is shutting down".to_string()))?;
        let _guard = self.claim(id)?;

        let mut submission = self.get(id).await?;
        if submission.status != SubmissionStatus::Persisted {
            return Err(PipelineError::Validation(format!(
                "submission {} is {}; only persisted submissions can be re-rendered",
                id,
                submission.status.label()
            )));
        }

        let report = match tokio::time::timeout(self.stage_timeout, self.render_report(&submission)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::Abandoned {
                    stage: Stage::Render,
                    after: self.stage_timeout,
                });
            }
        };
        submission.record_report(report)?;
        submission.updated_at = Utc::now();

        match tokio::time::timeout(self.stage_timeout, self.persister.persist(&submission)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(PipelineError::Abandoned {
                    stage: Stage::Persist,
                    after: self.stage_timeout,
                });
            }
        }
        self.checkpoint(&submission, Stage::Persist).await?;
        log::info!(
            "Submission {} re-rendered ({} prior report(s))",
            id,
            submission.prior_reports.len()
        );
        Ok(submission)
    }

    fn pending_stage(submission: &Submission) -> Stage {
        if submission.image_ref.is_none() {
            Stage::Upload
        } else if submission.analysis.is_none() {
            Stage::Analysis
        } else if submission.report.is_none() {
            Stage::Render
        } else {
            Stage::Persist
        }
    }

    fn started_status(stage: Stage) -> Option<SubmissionStatus> {
        match stage {
            Stage::Upload => Some(SubmissionStatus::Uploading),
            Stage::Analysis => Some(SubmissionStatus::Analyzing),
            Stage::Render => Some(SubmissionStatus::Rendering),
            Stage::Persist => None,
        }
    }

    async fn execute(&self, stage: Stage, submission: &Submission) -> Result<StageOutput, PipelineError> {
        match stage {
            Stage::Upload => self.upload_source(submission).await.map(StageOutput::Image),
            Stage::Analysis => {
                let image = submission.image_ref.as_ref().ok_or_else(|| {
                    PipelineError::NotFound(format!("submission {} has no source image", submission.id))
                })?;
                self.invoker
                    .analyze(submission.id, &image.url, &submission.category)
                    .await
                    .map(StageOutput::Analysis)
            }
            Stage::Render => self.render_report(submission).await.map(StageOutput::Report),
            Stage::Persist => {
                let mut candidate = submission.clone();
                candidate.transition(SubmissionStatus::Persisted)?;
                let PersistAck { outcome, .. } = self.persister.persist(&candidate).await?;
                log::debug!("Submission {} provenance {:?}", submission.id, outcome);
                Ok(StageOutput::Persisted(Box::new(candidate)))
            }
        }
    }

    async fn upload_source(
        &self,
        submission: &Submission,
    ) -> Result<StorageObjectRef, PipelineError> {
        let (bytes, content_type, file_name) = {
            let payloads = self.lock_payloads()?;
            let pending = payloads.get(&submission.id).ok_or_else(|| {
                PipelineError::Validation(format!(
                    "payload for submission {} is no longer available; resubmit the image",
                    submission.id
                ))
            })?;
            (
                pending.bytes.clone(),
                pending.content_type.clone(),
                pending.file_name.clone(),
            )
        };
        self.uploader
            .upload(&bytes, &content_type, &submission.category, &file_name)
            .await
    }

    async fn render_report(&self, submission: &Submission) -> Result<Report, PipelineError> {
        let rendered = self.assembler.assemble(
            submission,
            submission.analysis.as_ref(),
            Some(submission.patient()),
            submission.appointment(),
            submission.doctor(),
        )?;
        let output = self
            .uploader
            .upload(
                &rendered.bytes,
                PDF_CONTENT_TYPE,
                &submission.category,
                &format!("report-{}", submission.id),
            )
            .await?;
        Ok(Report {
            submission_id: submission.id,
            rendered_at: Utc::now(),
            output,
            findings: rendered.findings,
            signed_by: submission.doctor_id.clone(),
            digest: rendered.digest,
        })
    }

    fn apply(&self, submission: &mut Submission, output: StageOutput) -> Result<(), PipelineError> {
        match output {
            StageOutput::Image(image) => {
                submission.record_image(image)?;
                submission.transition(SubmissionStatus::Uploaded)?;
                self.lock_payloads()?.remove(&submission.id);
            }
            StageOutput::Analysis(analysis) => {
                log::debug!(
                    "Submission {}: '{}' at {:?}",
                    submission.id,
                    analysis.label,
                    analysis.top_confidence()
                );
                submission.record_analysis(analysis)?;
                submission.transition(SubmissionStatus::Analyzed)?;
            }
            StageOutput::Report(report) => {
                submission.record_report(report)?;
                submission.transition(SubmissionStatus::Rendered)?;
            }
            StageOutput::Persisted(persisted) => {
                *submission = *persisted;
            }
        }
        Ok(())
    }

    /// Saves the submission; a store that does not answer within the stage
    /// timeout abandons `stage`.
    async fn checkpoint(&self, submission: &Submission, stage: Stage) -> Result<(), PipelineError> {
        match tokio::time::timeout(self.stage_timeout, self.store.save_submission(submission)).await {
            Ok(result) => result.map_err(|e| {
                log::error!("Checkpoint of submission {} failed: {}", submission.id, e);
                PipelineError::from(e)
            }),
            Err(_) => {
                log::error!(
                    "Checkpoint of submission {} timed out after {:?}",
                    submission.id,
                    self.stage_timeout
                );
                Err(PipelineError::Abandoned {
                    stage,
                    after: self.stage_timeout,
                })
            }
        }
    }

    fn claim(&self, id: Uuid) -> Result<ActiveGuard<'_>, PipelineError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| PipelineError::Persistence {
                message: "submission registry poisoned".to_string(),
                recoverable: true,
            })?;
        if !active.insert(id) {
            return Err(PipelineError::Validation(format!(
                "submission {} is already being processed",
                id
            )));
        }
        Ok(ActiveGuard {
            active: &self.active,
            id,
        })
    }

    fn lock_payloads(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, PendingPayload>>, PipelineError> {
        self.payloads
            .lock()
            .map_err(|_| PipelineError::Persistence {
                message: "payload buffer poisoned".to_string(),
                recoverable: true,
            })
    }

    #[cfg(test)]
    fn buffered_payloads(&self) -> usize {
        self.payloads.lock().map(|p| p.len()).unwrap_or_default()
    }
}
