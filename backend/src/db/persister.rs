use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::store::{ProvenanceRecord, SubmissionStore, UpsertOutcome};
use crate::error::PipelineError;
use crate::model::Submission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistAck {
    pub submission_id: Uuid,
    pub outcome: UpsertOutcome,
}

#[derive(Clone)]
pub struct MetadataPersister {
    store: Arc<dyn SubmissionStore>,
}

impl MetadataPersister {
    pub fn new(store: Arc<dyn SubmissionStore>) -> Self {
        Self { store }
    }

    /// Records provenance for a submission; safe to repeat.
    pub async fn persist(&self, submission: &Submission) -> Result<PersistAck, PipelineError> {
        let record = ProvenanceRecord::from_submission(submission)?;
        let outcome = self.store.upsert_provenance(&record).await.map_err(|e| {
            log::error!("Persisting provenance for {} failed: {}", submission.id, e);
            PipelineError::from(e)
        })?;
        log::info!("Provenance for {} {:?}", submission.id, outcome);
        Ok(PersistAck {
            submission_id: submission.id,
            outcome,
        })
    }
}
