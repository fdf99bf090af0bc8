use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;
use std::time::Duration;

use crate::model::Stage;
use crate::storage::s3_service::ObjectStoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Upload failed after {attempts} attempt(s): {cause}")]
    Upload {
        attempts: u32,
        #[source]
        cause: ObjectStoreError,
    },
    #[error("Analysis error: {message}")]
    Analysis { message: String, recoverable: bool },
    #[error("Render error: {0}")]
    Render(String),
    #[error("Persistence error: {message}")]
    Persistence { message: String, recoverable: bool },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{stage} stage abandoned after {}s", .after.as_secs_f32())]
    Abandoned { stage: Stage, after: Duration },
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Upload { .. } => "upload",
            PipelineError::Analysis { .. } => "analysis",
            PipelineError::Render(_) => "render",
            PipelineError::Persistence { .. } => "persistence",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Abandoned { .. } => "abandoned",
        }
    }

    /// Whether a caller may retry the same operation with the same input.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Validation(_) | PipelineError::Render(_) => false,
            PipelineError::Upload { cause, .. } => cause.is_transient(),
            PipelineError::Analysis { recoverable, .. }
            | PipelineError::Persistence { recoverable, .. } => *recoverable,
            PipelineError::NotFound(_)
            | PipelineError::Abandoned { .. } => true,
        }
    }

    /// Message safe to hand to clients.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Upload { attempts, .. } => {
                format!("Storage provider unavailable after {} attempt(s)", attempts)
            }
            PipelineError::Persistence {
                recoverable: true, ..
            } => "Metadata store unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Upload { .. } | PipelineError::Analysis { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Persistence {
                recoverable: true, ..
            } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Persistence { .. } => StatusCode::CONFLICT,
            PipelineError::Abandoned { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.public_message(),
            kind: self.kind().to_string(),
        })
    }
}
