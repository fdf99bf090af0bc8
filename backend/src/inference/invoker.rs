use chrono::Utc;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use shared::ScreeningCategory;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::inference::client::{InferenceCallError, InferenceClient, InferenceRequest};
use crate::model::AnalysisResult;

const MAX_FORWARDED_MESSAGE_LEN: usize = 200;
const UNKNOWN_MODEL_VERSION: &str = "unknown";

/// Per-class scores in wire order, duplicates included.
#[derive(Debug)]
struct ClassScores(Vec<(String, f64)>);

impl<'de> Deserialize<'de> for ClassScores {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScoresVisitor;

        impl<'de> Visitor<'de> for ScoresVisitor {
            type Value = ClassScores;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of class name to score")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut scores = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, f64>()? {
                    scores.push(entry);
                }
                Ok(ClassScores(scores))
            }
        }

        deserializer.deserialize_map(ScoresVisitor)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfidencePayload {
    PerClass(ClassScores),
    Single(f64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictionPayload {
    #[serde(alias = "prediction", alias = "predicted_label")]
    label: String,
    #[serde(alias = "confidences", alias = "probabilities")]
    confidence: ConfidencePayload,
    #[serde(default, alias = "model_version", alias = "model")]
    model_version: Option<String>,
    #[serde(default, alias = "result_image_url", alias = "resultImage")]
    result_image_url: Option<String>,
}

/// Calls the inference service once per request; retrying is left to the caller.
#[derive(Clone)]
pub struct AnalysisInvoker {
    client: Arc<dyn InferenceClient>,
    timeout: Duration,
}

impl AnalysisInvoker {
    pub fn new(client: Arc<dyn InferenceClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn analyze(
        &self,
        submission_id: Uuid,
        image_url: &str,
        category: &ScreeningCategory,
    ) -> Result<AnalysisResult, PipelineError> {
        Self::validate_image_url(image_url)?;

        let request = InferenceRequest {
            message: image_url.to_string(),
            category: category.to_string(),
        };

        log::info!("Requesting {} analysis for submission {}", category, submission_id);
        let body = match tokio::time::timeout(self.timeout, self.client.predict(&request)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(Self::map_call_error(e)),
            Err(_) => {
                log::warn!(
                    "Inference for submission {} exceeded {:?}",
                    submission_id,
                    self.timeout
                );
                return Err(PipelineError::Analysis {
                    message: format!("inference timed out after {}s", self.timeout.as_secs()),
                    recoverable: true,
                });
            }
        };

        let result = Self::parse_result(submission_id, &body)?;
        log::info!(
            "Submission {} analysed as '{}' (model {})",
            submission_id,
            result.label,
            result.model_version
        );
        Ok(result)
    }

    fn validate_image_url(image_url: &str) -> Result<(), PipelineError> {
        let parsed = Url::parse(image_url)
            .map_err(|e| PipelineError::Validation(format!("invalid image reference: {}", e)))?;
        match parsed.scheme() {
            "http" | "https" if parsed.host().is_some() => Ok(()),
            scheme => Err(PipelineError::Validation(format!(
                "image reference must be an http(s) URL, got '{}'",
                scheme
            ))),
        }
    }

    fn map_call_error(err: InferenceCallError) -> PipelineError {
        match err {
            InferenceCallError::Status { status, body } => {
                let recoverable = status == 429 || status >= 500;
                let message = Self::forwardable_message(&body)
                    .unwrap_or_else(|| format!("inference service returned HTTP {}", status));
                log::error!("Inference service returned HTTP {}: {}", status, message);
                PipelineError::Analysis {
                    message,
                    recoverable,
                }
            }
            InferenceCallError::Transport(detail) => {
                log::error!("Inference transport failure: {}", detail);
                PipelineError::Analysis {
                    message: "inference service unreachable".to_string(),
                    recoverable: true,
                }
            }
            InferenceCallError::TimedOut => PipelineError::Analysis {
                message: "inference request timed out".to_string(),
                recoverable: true,
            },
        }
    }

    /// The upstream `error`/`message`/`detail` text when it is short and printable.
    fn forwardable_message(body: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let message = ["error", "message", "detail"]
            .iter()
            .find_map(|field| value.get(*field).and_then(|v| v.as_str()))?;
        let message = message.trim();
        let safe = !message.is_empty()
            && message.len() <= MAX_FORWARDED_MESSAGE_LEN
            && !message.chars().any(char::is_control);
        safe.then(|| message.to_string())
    }

    fn parse_result(submission_id: Uuid, body: &str) -> Result<AnalysisResult, PipelineError> {
        let payload: PredictionPayload =
            serde_json::from_str(body).map_err(|e| PipelineError::Analysis {
                message: format!("malformed inference response: {}", e),
                recoverable: false,
            })?;

        let label = payload.label.trim().to_string();
        if label.is_empty() {
            return Err(PipelineError::Analysis {
                message: "inference response has an empty label".to_string(),
                recoverable: false,
            });
        }

        let confidence = match payload.confidence {
            ConfidencePayload::PerClass(ClassScores(scores)) => {
                let mut map = BTreeMap::new();
                for (class, score) in scores {
                    if map.insert(class.clone(), score).is_some() {
                        return Err(PipelineError::Analysis {
                            message: format!("duplicate confidence for '{}'", class),
                            recoverable: false,
                        });
                    }
                }
                map
            }
            ConfidencePayload::Single(score) => BTreeMap::from([(label.clone(), score)]),
        };
        if confidence.is_empty() {
            return Err(PipelineError::Analysis {
                message: "inference response has no confidence scores".to_string(),
                recoverable: false,
            });
        }
        if let Some((class, score)) = confidence
            .iter()
            .find(|(class, score)| class.trim().is_empty() || !score.is_finite() || !(0.0..=1.0).contains(*score))
        {
            return Err(PipelineError::Analysis {
                message: format!("confidence for '{}' is out of range: {}", class, score),
                recoverable: false,
            });
        }

        Ok(AnalysisResult {
            submission_id,
            label,
            confidence,
            model_version: payload
                .model_version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_MODEL_VERSION.to_string()),
            analyzed_at: Utc::now(),
            result_image_url: payload.result_image_url.filter(|u| !u.trim().is_empty()),
        })
    }
}
