//! Hand-written fakes for the provider seams, shared by the unit tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{AppointmentInfo, ClinicalContext, DoctorInfo, PatientInfo, ScreeningCategory};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::config::UploadPolicy;
use crate::db::store::{ProvenanceRecord, StoreError, SubmissionStore, UpsertOutcome};
use crate::inference::client::{InferenceCallError, InferenceClient, InferenceRequest};
use crate::model::{AnalysisResult, Report, StorageObjectRef, Submission, SubmissionStatus};
use crate::storage::s3_service::{ObjectStore, ObjectStoreError};

pub fn jpeg_bytes() -> Vec<u8> {
    let mut bytes = vec![
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00,
    ];
    bytes.extend_from_slice(&[0x42; 64]);
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    bytes
}

pub fn test_upload_policy() -> UploadPolicy {
    UploadPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(1),
        max_bytes: 1024 * 1024,
    }
}

pub fn lung_cancer() -> ScreeningCategory {
    ScreeningCategory::parse("lung-cancer").unwrap()
}

pub fn sample_context() -> ClinicalContext {
    ClinicalContext {
        patient: PatientInfo {
            id: "patient-42".into(),
            name: "Ada Lovelace".into(),
            date_of_birth: Some("1985-12-10".into()),
            gender: Some("female".into()),
            email: Some("ada@example.org".into()),
        },
        appointment: Some(AppointmentInfo {
            id: "appt-7".into(),
            scheduled_for: Some("2026-03-01T09:00:00Z".into()),
            reason: Some("Annual screening".into()),
            location: Some("Radiology, 2nd floor".into()),
        }),
        doctor: Some(DoctorInfo {
            id: "doctor-3".into(),
            name: "Dr. Grace Hopper".into(),
            specialty: Some("Pulmonology".into()),
            license_number: Some("LIC-0042".into()),
        }),
    }
}

/// A submission with its source image already uploaded.
pub fn sample_submission() -> Submission {
    let mut submission = Submission::new(lung_cancer(), sample_context());
    submission.image_ref = Some(StorageObjectRef {
        provider: "fake".into(),
        key: "lung-cancer/1767225600000-0000abcd-scan.jpg".into(),
        url: "https://objects.test/lung-cancer/1767225600000-0000abcd-scan.jpg".into(),
        content_type: "image/jpeg".into(),
        size: 80,
        sha256: "00".repeat(32),
    });
    submission.status = SubmissionStatus::Uploaded;
    submission
}

pub fn analysis_for(submission: &Submission, label: &str, score: f64) -> AnalysisResult {
    AnalysisResult {
        submission_id: submission.id,
        label: label.to_string(),
        confidence: BTreeMap::from([(label.to_string(), score)]),
        model_version: "test-model".into(),
        analyzed_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
        result_image_url: None,
    }
}

/// A rendered report for `submission`, stored beside its source image.
pub fn report_for(submission: &Submission) -> Report {
    Report {
        submission_id: submission.id,
        rendered_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 45, 0).unwrap(),
        output: StorageObjectRef {
            provider: "fake".into(),
            key: format!("lung-cancer/1767225600000-0000beef-report-{}.pdf", submission.id),
            url: format!(
                "https://objects.test/lung-cancer/1767225600000-0000beef-report-{}.pdf",
                submission.id
            ),
            content_type: "application/pdf".into(),
            size: 2048,
            sha256: "11".repeat(32),
        },
        findings: "lung-cancer screening result: no-cancer (confidence 92.0%).".into(),
        signed_by: submission.doctor_id.clone(),
        digest: "22".repeat(32),
    }
}

enum StoreMode {
    Normal,
    Rejecting,
    Stalling(Duration),
}

#[derive(Default)]
struct ObjectStoreState {
    objects: HashMap<String, Vec<u8>>,
    attempted: Vec<String>,
    deleted: Vec<String>,
    failures_left: u32,
}

pub struct FakeObjectStore {
    mode: StoreMode,
    state: Mutex<ObjectStoreState>,
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        Self {
            mode: StoreMode::Normal,
            state: Mutex::new(ObjectStoreState::default()),
        }
    }
}

impl FakeObjectStore {
    pub fn failing_transiently(failures: u32) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().failures_left = failures;
        store
    }

    pub fn rejecting() -> Self {
        Self {
            mode: StoreMode::Rejecting,
            ..Self::default()
        }
    }

    pub fn stalling(delay: Duration) -> Self {
        Self {
            mode: StoreMode::Stalling(delay),
            ..Self::default()
        }
    }

    pub fn put_calls(&self) -> usize {
        self.state.lock().unwrap().attempted.len()
    }

    pub fn attempted_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().attempted.clone()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    fn provider(&self) -> &str {
        "fake"
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://objects.test/{}", key)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        {
            let mut state = self.state.lock().unwrap();
            state.attempted.push(key.to_string());
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(ObjectStoreError::Transient("503 Service Unavailable".into()));
            }
        }
        match self.mode {
            StoreMode::Normal => {}
            StoreMode::Rejecting => {
                return Err(ObjectStoreError::Rejected("403 AccessDenied".into()));
            }
            StoreMode::Stalling(delay) => tokio::time::sleep(delay).await,
        }
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(key.to_string());
        state.objects.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum FakeReply {
    Body(String),
    Status(u16, String),
    Stall(Duration),
}

/// Replays scripted replies in order; the last one repeats.
pub struct FakeInferenceClient {
    replies: Mutex<VecDeque<FakeReply>>,
    latency: Duration,
    requests: Mutex<Vec<InferenceRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeInferenceClient {
    pub fn scripted(replies: Vec<FakeReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn replying(body: &str) -> Self {
        Self::scripted(vec![FakeReply::Body(body.to_string())])
    }

    pub fn failing(status: u16, body: &str) -> Self {
        Self::scripted(vec![FakeReply::Status(status, body.to_string())])
    }

    pub fn stalling(delay: Duration) -> Self {
        Self::scripted(vec![FakeReply::Stall(delay)])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> FakeReply {
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies
                .front()
                .cloned()
                .unwrap_or(FakeReply::Status(500, String::new()))
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for FakeInferenceClient {
    async fn predict(&self, request: &InferenceRequest) -> Result<String, InferenceCallError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.next_reply() {
            FakeReply::Body(body) => Ok(body),
            FakeReply::Status(status, body) => Err(InferenceCallError::Status { status, body }),
            FakeReply::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Err(InferenceCallError::TimedOut)
            }
        }
    }
}

/// Mutex-guarded maps standing in for the document store.
#[derive(Default)]
pub struct InMemoryStore {
    submissions: Mutex<HashMap<Uuid, Submission>>,
    history: Mutex<HashMap<Uuid, Vec<SubmissionStatus>>>,
    provenance: Mutex<HashMap<Uuid, ProvenanceRecord>>,
    fail_writes: AtomicBool,
    stall_saves_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every later checkpoint write hang for `delay`.
    pub fn stall_saves(&self, delay: Duration) {
        self.stall_saves_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn provenance(&self, id: Uuid) -> Option<ProvenanceRecord> {
        self.provenance.lock().unwrap().get(&id).cloned()
    }

    pub fn provenance_count(&self) -> usize {
        self.provenance.lock().unwrap().len()
    }

    /// Every status checkpointed for a submission, oldest first.
    pub fn status_history(&self, id: Uuid) -> Vec<SubmissionStatus> {
        self.history
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for InMemoryStore {
    async fn save_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let stall = self.stall_saves_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        self.check_writable()?;
        self.submissions
            .lock()
            .unwrap()
            .insert(submission.id, submission.clone());
        self.history
            .lock()
            .unwrap()
            .entry(submission.id)
            .or_default()
            .push(submission.status.clone());
        Ok(())
    }

    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions.lock().unwrap().get(&id).cloned())
    }

    async fn upsert_provenance(
        &self,
        record: &ProvenanceRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        self.check_writable()?;
        let mut provenance = self.provenance.lock().unwrap();
        let Some(existing) = provenance.get_mut(&record.submission_id) else {
            provenance.insert(record.submission_id, record.clone());
            return Ok(UpsertOutcome::Created);
        };
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
        existing.status = record.status.clone();
        existing.progress = record.progress;
        existing.report = record.report.clone();
        existing.updated_at = record.updated_at;
        Ok(UpsertOutcome::Updated)
    }

    async fn get_provenance(&self, id: Uuid) -> Result<Option<ProvenanceRecord>, StoreError> {
        Ok(self.provenance(id))
    }
}
