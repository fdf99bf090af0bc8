use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::{HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use shared::{
    AnalyzeRequest, ClinicalContext, ReportRequest, Role, SuccessResponse, UploadResponse,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::auth::middleware::{AuthMiddleware, AuthenticatedUser};
use crate::auth::redirect;
use crate::error::PipelineError;
use crate::model::Submission;
use crate::pipeline::coordinator::{IngestRequest, SubmissionCoordinator};
use crate::report::assembler::ReportDraft;
use crate::storage::uploader::ObjectStoreUploader;

pub fn configure_routes(cfg: &mut web::ServiceConfig, auth: AuthMiddleware) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/auth/landing").route(web::get().to(redirect::landing)))
        .service(
            web::scope("/api")
                .wrap(auth)
                .service(web::resource("/upload").route(web::post().to(upload_image)))
                .service(web::resource("/analyze").route(web::post().to(analyze_image)))
                .service(web::resource("/report").route(web::post().to(generate_report)))
                .service(web::resource("/metadata").route(web::post().to(save_metadata)))
                .service(web::resource("/submissions").route(web::post().to(create_submission)))
                .service(web::resource("/submissions/{id}").route(web::get().to(get_submission)))
                .service(
                    web::resource("/submissions/{id}/retry")
                        .route(web::post().to(retry_submission)),
                )
                .service(
                    web::resource("/submissions/{id}/rerender")
                        .route(web::post().to(rerender_submission)),
                ),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

struct UploadedFile {
    bytes: Vec<u8>,
    content_type: String,
    file_name: String,
}

#[derive(Default)]
struct MultipartForm {
    file: Option<UploadedFile>,
    fields: HashMap<String, String>,
}

async fn read_multipart(mut payload: Multipart, max_bytes: usize) -> Result<MultipartForm, PipelineError> {
    let mut form = MultipartForm::default();
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| PipelineError::Validation(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field.content_type().map(|m| m.essence_str().to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk
                .map_err(|e| PipelineError::Validation(format!("failed to read field '{}': {}", name, e)))?;
            if data.len() + chunk.len() > max_bytes {
                return Err(PipelineError::Validation(format!(
                    "field '{}' exceeds the {} byte limit",
                    name, max_bytes
                )));
            }
            data.extend_from_slice(&chunk);
        }

        if name == "file" {
            form.file = Some(UploadedFile {
                bytes: data,
                content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                file_name: file_name.unwrap_or_else(|| "upload".to_string()),
            });
        } else if !name.is_empty() {
            let value = String::from_utf8(data)
                .map_err(|_| PipelineError::Validation(format!("field '{}' is not UTF-8", name)))?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

/// Patients act only for themselves; staff must name the patient explicitly.
fn resolve_patient_id(user: &AuthenticatedUser, requested: Option<&str>) -> Result<String, PipelineError> {
    let requested = requested.map(str::trim).filter(|id| !id.is_empty());
    match user.role {
        Role::Patient => match requested {
            Some(id) if id != user.id => Err(PipelineError::Validation(
                "patients may only submit for themselves".to_string(),
            )),
            _ => Ok(user.id.clone()),
        },
        Role::Doctor | Role::Admin => requested.map(str::to_string).ok_or_else(|| {
            PipelineError::Validation("patient id is required".to_string())
        }),
    }
}

fn ensure_visible(user: &AuthenticatedUser, submission: &Submission) -> Result<(), PipelineError> {
    if user.role == Role::Patient && submission.patient_id != user.id {
        return Err(PipelineError::NotFound(format!("submission {}", submission.id)));
    }
    Ok(())
}

fn parse_submission_id(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw).map_err(|_| PipelineError::Validation("Invalid UUID format".to_string()))
}

async fn upload_image(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    payload: Multipart,
) -> Result<HttpResponse, PipelineError> {
    let uploader = coordinator.uploader();
    let mut form = read_multipart(payload, uploader.max_bytes()).await?;
    let file = form
        .file
        .take()
        .ok_or_else(|| PipelineError::Validation("missing 'file' field".to_string()))?;
    let category = form
        .fields
        .remove("category")
        .ok_or_else(|| PipelineError::Validation("missing 'category' field".to_string()))?;
    let category = shared::ScreeningCategory::parse(&category)
        .map_err(|e| PipelineError::Validation(e.to_string()))?;
    let patient_id = resolve_patient_id(&user, form.fields.remove("patientId").as_deref())?;
    if !ObjectStoreUploader::is_image_type(&file.content_type) {
        return Err(PipelineError::Validation(format!(
            "content type '{}' is not an accepted image type",
            file.content_type
        )));
    }

    let stored = uploader
        .upload(&file.bytes, &file.content_type, &category, &file.file_name)
        .await?;
    log::info!("User {} uploaded {} for patient {}", user.id, stored.key, patient_id);

    let mut metadata = form.fields;
    metadata.insert("patientId".to_string(), patient_id);
    metadata.insert("category".to_string(), category.to_string());
    metadata.insert("checksum".to_string(), stored.sha256.clone());
    metadata.insert("size".to_string(), stored.size.to_string());

    Ok(HttpResponse::Ok().json(UploadResponse {
        success: true,
        image_url: stored.url,
        public_id: stored.key,
        metadata,
    }))
}

async fn analyze_image(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    body: web::Json<AnalyzeRequest>,
) -> Result<HttpResponse, PipelineError> {
    let request = body.into_inner();
    let submission_id = request.submission_id.unwrap_or_else(Uuid::new_v4);
    log::info!("User {} requested analysis for {}", user.id, submission_id);
    let result = coordinator
        .invoker()
        .analyze(submission_id, &request.message, &request.category)
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

fn attachment_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(file_name)
    )
}

async fn generate_report(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    body: web::Json<ReportRequest>,
) -> Result<HttpResponse, PipelineError> {
    let request = body.into_inner();
    if user.role == Role::Patient {
        let requested = request.patient.as_ref().map(|p| p.id.as_str());
        resolve_patient_id(&user, requested)?;
    }

    let file_name = match &request.patient {
        Some(patient) => format!("{}-report-{}.pdf", request.category, patient.name),
        None => format!("{}-report.pdf", request.category),
    };
    let draft = ReportDraft {
        submission_id: None,
        category: request.category,
        source_image_url: request.source_image_url,
        result_image_url: request.result_image_url,
        findings: request.analysis_results,
        analyzed_at: None,
        patient: request.patient,
        appointment: request.appointment,
        doctor: request.doctor,
    };
    let rendered = coordinator.assembler().render(&draft)?;

    Ok(HttpResponse::Ok()
        .content_type("application/pdf")
        .insert_header((header::CONTENT_DISPOSITION, attachment_disposition(&file_name)))
        .insert_header(("X-Report-Digest", rendered.digest))
        .body(rendered.bytes))
}

async fn save_metadata(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    body: web::Json<Submission>,
) -> Result<HttpResponse, PipelineError> {
    let submission = body.into_inner();
    ensure_visible(&user, &submission)?;
    let ack = coordinator.persister().persist(&submission).await?;
    log::info!("Metadata for {} saved ({:?})", ack.submission_id, ack.outcome);
    Ok(HttpResponse::Ok().json(SuccessResponse { success: true }))
}

async fn create_submission(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    payload: Multipart,
) -> Result<HttpResponse, PipelineError> {
    let mut form = read_multipart(payload, coordinator.uploader().max_bytes()).await?;
    let file = form
        .file
        .take()
        .ok_or_else(|| PipelineError::Validation("missing 'file' field".to_string()))?;
    let category = form
        .fields
        .remove("category")
        .ok_or_else(|| PipelineError::Validation("missing 'category' field".to_string()))?;
    let raw_context = form
        .fields
        .remove("context")
        .ok_or_else(|| PipelineError::Validation("missing 'context' field".to_string()))?;
    let mut context: ClinicalContext = serde_json::from_str(&raw_context)
        .map_err(|e| PipelineError::Validation(format!("invalid context: {}", e)))?;
    context.patient.id = resolve_patient_id(&user, Some(&context.patient.id))?;

    let submission = coordinator
        .ingest(IngestRequest {
            category,
            context,
            payload: file.bytes,
            content_type: file.content_type,
            file_name: file.file_name,
        })
        .await?;

    let id = submission.id;
    let background = coordinator.clone();
    actix_web::rt::spawn(async move {
        match background.run(id).await {
            Ok(done) => log::info!("Submission {} finished as {}", id, done.status),
            Err(e) => log::warn!("Submission {} stopped: {}", id, e),
        }
    });

    Ok(HttpResponse::Accepted().json(submission))
}

async fn get_submission(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PipelineError> {
    let id = parse_submission_id(&path.into_inner())?;
    let submission = coordinator.get(id).await?;
    ensure_visible(&user, &submission)?;
    Ok(HttpResponse::Ok().json(submission))
}

async fn retry_submission(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PipelineError> {
    let id = parse_submission_id(&path.into_inner())?;
    ensure_visible(&user, &coordinator.get(id).await?)?;
    let submission = coordinator.retry(id).await?;
    Ok(HttpResponse::Ok().json(submission))
}

async fn rerender_submission(
    user: AuthenticatedUser,
    coordinator: web::Data<SubmissionCoordinator>,
    path: web::Path<String>,
) -> Result<HttpResponse, PipelineError> {
    let id = parse_submission_id(&path.into_inner())?;
    ensure_visible(&user, &coordinator.get(id).await?)?;
    let submission = coordinator.rerender(id).await?;
    Ok(HttpResponse::Ok().json(submission))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::JwtService;
    use crate::auth::models::AuthUser;
    use crate::config::{PipelineConfig, ReportConfig};
    use crate::db::persister::MetadataPersister;
    use crate::inference::invoker::AnalysisInvoker;
    use crate::report::assembler::ReportAssembler;
    use crate::testing::{
        FakeInferenceClient, FakeObjectStore, InMemoryStore, analysis_for, jpeg_bytes,
        sample_context, sample_submission, test_upload_policy,
    };
    use actix_web::{App, test as actix_test};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    const SECRET: &str = "0123456789abcdef0123";
    const BOUNDARY: &str = "screening-boundary";

    struct Fixture {
        jwt: Arc<JwtService>,
        coordinator: web::Data<SubmissionCoordinator>,
        objects: Arc<FakeObjectStore>,
        store: Arc<InMemoryStore>,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(FakeObjectStore::default());
        let store = Arc::new(InMemoryStore::default());
        let inference = Arc::new(FakeInferenceClient::replying(
            r#"{"label":"no-cancer","confidence":0.92}"#,
        ));
        let coordinator = SubmissionCoordinator::new(
            ObjectStoreUploader::new(objects.clone(), test_upload_policy()),
            AnalysisInvoker::new(inference, Duration::from_secs(5)),
            ReportAssembler::new(ReportConfig::default()),
            MetadataPersister::new(store.clone()),
            store.clone(),
            &PipelineConfig {
                max_in_flight: 2,
                stage_timeout: Duration::from_secs(2),
            },
        );
        Fixture {
            jwt: Arc::new(JwtService::new(SECRET)),
            coordinator: web::Data::new(coordinator),
            objects,
            store,
        }
    }

    fn bearer(fixture: &Fixture, id: &str, role: Role) -> (header::HeaderName, String) {
        let token = fixture
            .jwt
            .generate_token(&AuthUser {
                id: id.into(),
                name: "Test User".into(),
                role,
            })
            .unwrap();
        (header::AUTHORIZATION, format!("Bearer {}", token))
    }

    macro_rules! app {
        ($fixture:expr) => {{
            let jwt = $fixture.jwt.clone();
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::from(jwt.clone()))
                    .app_data($fixture.coordinator.clone())
                    .configure(move |cfg| configure_routes(cfg, AuthMiddleware::new(jwt))),
            )
            .await
        }};
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content_type, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    BOUNDARY, file_name, content_type
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_content_type() -> (header::HeaderName, String) {
        (
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
    }

    #[actix_web::test]
    async fn health_is_public() {
        let fixture = fixture();
        let app = app!(fixture);

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;

        assert!(resp.status().is_success());
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
    }

    #[actix_web::test]
    async fn landing_redirects_by_session() {
        let fixture = fixture();
        let app = app!(fixture);

        let anonymous =
            actix_test::call_service(&app, actix_test::TestRequest::get().uri("/auth/landing").to_request()).await;
        assert_eq!(anonymous.status(), 302);
        assert_eq!(anonymous.headers().get(header::LOCATION).unwrap(), "/login");

        let doctor = actix_test::call_service(
            &app,
            actix_test::TestRequest::get()
                .uri("/auth/landing")
                .insert_header(bearer(&fixture, "doctor-3", Role::Doctor))
                .to_request(),
        )
        .await;
        assert_eq!(doctor.status(), 302);
        assert_eq!(
            doctor.headers().get(header::LOCATION).unwrap(),
            "/doctor/dashboard"
        );
    }

    #[actix_web::test]
    async fn api_requires_a_bearer_token() {
        let fixture = fixture();
        let app = app!(fixture);

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::get()
                .uri(&format!("/api/submissions/{}", Uuid::new_v4()))
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), 401);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["kind"], "unauthorized");
    }

    #[actix_web::test]
    async fn report_endpoint_returns_a_pdf() {
        let fixture = fixture();
        let app = app!(fixture);
        let context = sample_context();

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::post()
                .uri("/api/report")
                .insert_header(bearer(&fixture, "doctor-3", Role::Doctor))
                .set_json(serde_json::json!({
                    "category": "lung-cancer",
                    "sourceImageUrl": "https://objects.test/lung-cancer/scan.jpg",
                    "analysisResults": {
                        "label": "no-cancer",
                        "confidence": { "no-cancer": 0.92 },
                        "modelVersion": "test-model"
                    },
                    "patient": context.patient,
                    "appointment": context.appointment,
                    "doctor": context.doctor,
                }))
                .to_request(),
        )
        .await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/pdf"
        );
        let disposition = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"lung-cancer-report-Ada_Lovelace.pdf\""));
        assert!(disposition.contains("filename*=UTF-8''lung-cancer-report-Ada%20Lovelace.pdf"));
        let body = actix_test::read_body(resp).await;
        assert!(body.starts_with(b"%PDF-1.4"));
    }

    #[actix_web::test]
    async fn report_without_analysis_is_a_render_error() {
        let fixture = fixture();
        let app = app!(fixture);
        let context = sample_context();

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::post()
                .uri("/api/report")
                .insert_header(bearer(&fixture, "doctor-3", Role::Doctor))
                .set_json(serde_json::json!({
                    "category": "lung-cancer",
                    "sourceImageUrl": "https://objects.test/lung-cancer/scan.jpg",
                    "patient": context.patient,
                    "appointment": context.appointment,
                }))
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), 500);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["kind"], "render");
    }

    #[actix_web::test]
    async fn metadata_saved_twice_keeps_one_record() {
        let fixture = fixture();
        let app = app!(fixture);
        let mut submission = sample_submission();
        submission.analysis = Some(analysis_for(&submission, "no-cancer", 0.92));

        for _ in 0..2 {
            let resp = actix_test::call_service(
                &app,
                actix_test::TestRequest::post()
                    .uri("/api/metadata")
                    .insert_header(bearer(&fixture, "doctor-3", Role::Doctor))
                    .set_json(&submission)
                    .to_request(),
            )
            .await;
            assert!(resp.status().is_success());
            let body: Value = actix_test::read_body_json(resp).await;
            assert_eq!(body["success"], true);
        }

        assert_eq!(fixture.store.provenance_count(), 1);
    }

    #[actix_web::test]
    async fn patients_cannot_see_other_patients_submissions() {
        let fixture = fixture();
        let app = app!(fixture);
        let mut submission = sample_submission();
        submission.analysis = Some(analysis_for(&submission, "no-cancer", 0.92));

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::post()
                .uri("/api/metadata")
                .insert_header(bearer(&fixture, "patient-99", Role::Patient))
                .set_json(&submission)
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), 404);
        assert_eq!(fixture.store.provenance_count(), 0);
    }

    #[actix_web::test]
    async fn submission_is_accepted_and_visible() {
        let fixture = fixture();
        let app = app!(fixture);
        let context = serde_json::to_string(&sample_context()).unwrap();
        let body = multipart_body(
            &[("category", "lung-cancer"), ("context", &context)],
            Some(("chest.jpg", "image/jpeg", jpeg_bytes().as_slice())),
        );

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::post()
                .uri("/api/submissions")
                .insert_header(bearer(&fixture, "patient-42", Role::Patient))
                .insert_header(multipart_content_type())
                .set_payload(body)
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), 202);
        let created: Value = actix_test::read_body_json(resp).await;
        assert_eq!(created["patientId"], "patient-42");
        let id = created["id"].as_str().unwrap().to_string();

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::get()
                .uri(&format!("/api/submissions/{}", id))
                .insert_header(bearer(&fixture, "patient-42", Role::Patient))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::get()
                .uri(&format!("/api/submissions/{}", id))
                .insert_header(bearer(&fixture, "patient-7", Role::Patient))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn empty_upload_is_rejected_before_storage() {
        let fixture = fixture();
        let app = app!(fixture);
        let body = multipart_body(
            &[("category", "lung-cancer")],
            Some(("chest.jpg", "image/jpeg", &[] as &[u8])),
        );

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::post()
                .uri("/api/upload")
                .insert_header(bearer(&fixture, "patient-42", Role::Patient))
                .insert_header(multipart_content_type())
                .set_payload(body)
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), 400);
        assert_eq!(fixture.objects.put_calls(), 0);
    }

    #[actix_web::test]
    async fn upload_returns_the_stored_reference() {
        let fixture = fixture();
        let app = app!(fixture);
        let body = multipart_body(
            &[("category", "lung-cancer"), ("patientId", "patient-42")],
            Some(("chest.jpg", "image/jpeg", jpeg_bytes().as_slice())),
        );

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::post()
                .uri("/api/upload")
                .insert_header(bearer(&fixture, "doctor-3", Role::Doctor))
                .insert_header(multipart_content_type())
                .set_payload(body)
                .to_request(),
        )
        .await;

        assert!(resp.status().is_success());
        let body: Value = actix_test::read_body_json(resp).await;
        let key = body["publicId"].as_str().unwrap();
        assert!(key.starts_with("lung-cancer/"));
        assert!(fixture.objects.contains(key));
        assert_eq!(body["imageUrl"], format!("https://objects.test/{}", key));
        assert_eq!(body["metadata"]["patientId"], "patient-42");
    }

    #[test]
    fn staff_must_name_the_patient() {
        let doctor = AuthenticatedUser {
            id: "doctor-3".into(),
            role: Role::Doctor,
        };
        let patient = AuthenticatedUser {
            id: "patient-42".into(),
            role: Role::Patient,
        };

        assert!(resolve_patient_id(&doctor, None).is_err());
        assert_eq!(resolve_patient_id(&doctor, Some("patient-42")).unwrap(), "patient-42");
        assert_eq!(resolve_patient_id(&patient, None).unwrap(), "patient-42");
        assert!(resolve_patient_id(&patient, Some("patient-7")).is_err());
    }
}
