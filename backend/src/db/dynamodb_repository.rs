use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::store::{ProvenanceRecord, StoreError, SubmissionStore, UpsertOutcome};
use crate::model::Submission;

/// Submissions table holds the latest checkpoint snapshot per submission;
/// provenance table holds one record per persisted submission.
#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    submissions_table: String,
    provenance_table: String,
}

impl DynamoDbRepository {
    pub fn new(client: Client, submissions_table: String, provenance_table: String) -> Self {
        Self {
            client,
            submissions_table,
            provenance_table,
        }
    }

    fn key(id: Uuid) -> HashMap<String, AttributeValue> {
        let mut key = HashMap::new();
        key.insert("submission_id".to_string(), AttributeValue::S(id.to_string()));
        key
    }

    fn provenance_item(
        record: &ProvenanceRecord,
    ) -> Result<HashMap<String, AttributeValue>, StoreError> {
        let mut item = Self::key(record.submission_id);
        item.insert(
            "patient_id".to_string(),
            AttributeValue::S(record.patient_id.clone()),
        );
        if let Some(doctor_id) = &record.doctor_id {
            item.insert("doctor_id".to_string(), AttributeValue::S(doctor_id.clone()));
        }
        item.insert(
            "category".to_string(),
            AttributeValue::S(record.category.to_string()),
        );
        item.insert(
            "created_at".to_string(),
            AttributeValue::S(record.created_at.to_rfc3339()),
        );
        item.insert(
            "image_ref".to_string(),
            AttributeValue::S(serde_json::to_string(&record.image_ref)?),
        );
        item.insert(
            "analysis".to_string(),
            AttributeValue::S(serde_json::to_string(&record.analysis)?),
        );
        item.insert("status".to_string(), AttributeValue::S(record.status.clone()));
        item.insert(
            "progress".to_string(),
            AttributeValue::N(record.progress.to_string()),
        );
        if let Some(report) = &record.report {
            item.insert(
                "report".to_string(),
                AttributeValue::S(serde_json::to_string(report)?),
            );
        }
        item.insert(
            "updated_at".to_string(),
            AttributeValue::S(record.updated_at.to_rfc3339()),
        );
        Ok(item)
    }

    fn string_attr<'a>(
        item: &'a HashMap<String, AttributeValue>,
        name: &str,
    ) -> Result<&'a String, StoreError> {
        item.get(name)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::InvalidData(format!("Invalid {}", name)))
    }

    fn timestamp_attr(
        item: &HashMap<String, AttributeValue>,
        name: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let raw = Self::string_attr(item, name)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::InvalidData(format!("Invalid {}: {}", name, e)))
    }

    fn parse_provenance_from_item(
        item: HashMap<String, AttributeValue>,
    ) -> Result<ProvenanceRecord, StoreError> {
        let submission_id = Uuid::parse_str(Self::string_attr(&item, "submission_id")?)
            .map_err(|e| StoreError::InvalidData(format!("Invalid submission_id: {}", e)))?;
        let category = shared::ScreeningCategory::parse(Self::string_attr(&item, "category")?)
            .map_err(|e| StoreError::InvalidData(format!("Invalid category: {}", e.0)))?;
        let progress = match item.get("progress").and_then(|v| v.as_n().ok()) {
            Some(raw) => raw
                .parse::<u8>()
                .map_err(|e| StoreError::InvalidData(format!("Invalid progress: {}", e)))?,
            None => 0,
        };
        let report = match item.get("report").and_then(|v| v.as_s().ok()) {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };

        Ok(ProvenanceRecord {
            submission_id,
            patient_id: Self::string_attr(&item, "patient_id")?.clone(),
            doctor_id: item.get("doctor_id").and_then(|v| v.as_s().ok()).cloned(),
            category,
            created_at: Self::timestamp_attr(&item, "created_at")?,
            image_ref: serde_json::from_str(Self::string_attr(&item, "image_ref")?)?,
            analysis: serde_json::from_str(Self::string_attr(&item, "analysis")?)?,
            status: Self::string_attr(&item, "status")?.clone(),
            progress,
            report,
            updated_at: Self::timestamp_attr(&item, "updated_at")?,
        })
    }

    /// Updates the mutable fields unless a concurrent writer already moved
    /// the record further along.
    async fn update_provenance(
        &self,
        record: &ProvenanceRecord,
        stored_status: &str,
    ) -> Result<(), StoreError> {
        let mut update_expression_parts = vec![
            "#status = :status",
            "progress = :progress",
            "updated_at = :updated_at",
        ];
        let mut expression_attribute_values = HashMap::new();
        let mut expression_attribute_names = HashMap::new();

        expression_attribute_names.insert("#status".to_string(), "status".to_string());
        expression_attribute_values.insert(
            ":status".to_string(),
            AttributeValue::S(record.status.clone()),
        );
        expression_attribute_values.insert(
            ":progress".to_string(),
            AttributeValue::N(record.progress.to_string()),
        );
        expression_attribute_values.insert(
            ":updated_at".to_string(),
            AttributeValue::S(record.updated_at.to_rfc3339()),
        );
        expression_attribute_values.insert(
            ":patient_id".to_string(),
            AttributeValue::S(record.patient_id.clone()),
        );

        let update_expression = match &record.report {
            Some(report) => {
                update_expression_parts.push("report = :report");
                expression_attribute_values.insert(
                    ":report".to_string(),
                    AttributeValue::S(serde_json::to_string(report)?),
                );
                format!("SET {}", update_expression_parts.join(", "))
            }
            None => format!("SET {} REMOVE report", update_expression_parts.join(", ")),
        };

        log::debug!("Provenance update expression: {}", update_expression);

        self.client
            .update_item()
            .table_name(&self.provenance_table)
            .set_key(Some(Self::key(record.submission_id)))
            .update_expression(update_expression)
            .condition_expression(
                "patient_id = :patient_id AND (attribute_not_exists(progress) OR progress <= :progress)",
            )
            .set_expression_attribute_names(Some(expression_attribute_names))
            .set_expression_attribute_values(Some(expression_attribute_values))
            .send()
            .await
            .map_err(|e| {
                log::error!(
                    "DynamoDB update_item failed for provenance {}: {:?}",
                    record.submission_id,
                    e
                );
                match e.as_service_error() {
                    Some(service_err) if service_err.is_conditional_check_failed_exception() => {
                        StoreError::StaleStatus {
                            id: record.submission_id,
                            stored: stored_status.to_string(),
                            incoming: record.status.clone(),
                        }
                    }
                    Some(service_err) => StoreError::Backend(format!("Service error: {:?}", service_err)),
                    None => StoreError::Backend(format!("SDK error: {}", e)),
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for DynamoDbRepository {
    async fn save_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut item = Self::key(submission.id);
        item.insert(
            "patient_id".to_string(),
            AttributeValue::S(submission.patient_id.clone()),
        );
        item.insert(
            "status".to_string(),
            AttributeValue::S(submission.status.label().to_string()),
        );
        item.insert(
            "updated_at".to_string(),
            AttributeValue::S(submission.updated_at.to_rfc3339()),
        );
        item.insert(
            "snapshot".to_string(),
            AttributeValue::S(serde_json::to_string(submission)?),
        );

        self.client
            .put_item()
            .table_name(&self.submissions_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| {
                log::error!("DynamoDB put_item failed for submission {}: {:?}", submission.id, e);
                StoreError::Backend(e.to_string())
            })?;
        log::debug!("Checkpointed submission {} at {}", submission.id, submission.status);
        Ok(())
    }

    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.submissions_table)
            .set_key(Some(Self::key(id)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match result.item {
            Some(item) => {
                let snapshot = Self::string_attr(&item, "snapshot")?;
                Ok(Some(serde_json::from_str(snapshot)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_provenance(
        &self,
        record: &ProvenanceRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let item = Self::provenance_item(record)?;
        let created = self
            .client
            .put_item()
            .table_name(&self.provenance_table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(submission_id)")
            .send()
            .await;

        match created {
            Ok(_) => {
                log::info!("Created provenance record for {}", record.submission_id);
                return Ok(UpsertOutcome::Created);
            }
            Err(e) => {
                let exists = e
                    .as_service_error()
                    .is_some_and(|service_err| service_err.is_conditional_check_failed_exception());
                if !exists {
                    log::error!(
                        "DynamoDB put_item failed for provenance {}: {:?}",
                        record.submission_id,
                        e
                    );
                    return Err(StoreError::Backend(e.to_string()));
                }
            }
        }

        let existing = self
            .get_provenance(record.submission_id)
            .await?
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "provenance {} vanished during upsert",
                    record.submission_id
                ))
            })?;
        if let Some(field) = existing.identity_conflict(record) {
            return Err(StoreError::IdentityConflict {
                id: record.submission_id,
                field,
            });
        }
        existing.check_progress(record)?;
        if existing.same_mutable_state(record) {
            return Ok(UpsertOutcome::Unchanged);
        }

        self.update_provenance(record, &existing.status).await?;
        log::info!(
            "Updated provenance record for {} to {}",
            record.submission_id,
            record.status
        );
        Ok(UpsertOutcome::Updated)
    }

    async fn get_provenance(&self, id: Uuid) -> Result<Option<ProvenanceRecord>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.provenance_table)
            .set_key(Some(Self::key(id)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        result.item.map(Self::parse_provenance_from_item).transpose()
    }
}
