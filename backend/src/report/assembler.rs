use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shared::{AnalysisFindings, AppointmentInfo, DoctorInfo, PatientInfo, ScreeningCategory};
use uuid::Uuid;

use crate::config::ReportConfig;
use crate::error::PipelineError;
use crate::model::{AnalysisResult, Submission};
use crate::report::pdf::PdfLayout;

const NOT_PROVIDED: &str = "Not provided";

/// Everything printed on a report. Optional fields that the layout needs are
/// checked in [`ReportAssembler::render`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
    pub submission_id: Option<Uuid>,
    pub category: ScreeningCategory,
    pub source_image_url: Option<String>,
    pub result_image_url: Option<String>,
    pub findings: Option<AnalysisFindings>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub patient: Option<PatientInfo>,
    pub appointment: Option<AppointmentInfo>,
    pub doctor: Option<DoctorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub bytes: Vec<u8>,
    pub findings: String,
    pub digest: String,
}

#[derive(Clone)]
pub struct ReportAssembler {
    config: ReportConfig,
}

impl ReportAssembler {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    pub fn assemble(
        &self,
        submission: &Submission,
        analysis: Option<&AnalysisResult>,
        patient: Option<&PatientInfo>,
        appointment: Option<&AppointmentInfo>,
        doctor: Option<&DoctorInfo>,
    ) -> Result<RenderedReport, PipelineError> {
        if let Some(analysis) = analysis {
            if analysis.submission_id != submission.id {
                return Err(PipelineError::Render(format!(
                    "analysis belongs to submission {}, not {}",
                    analysis.submission_id, submission.id
                )));
            }
        }

        let draft = ReportDraft {
            submission_id: Some(submission.id),
            category: submission.category.clone(),
            source_image_url: submission.image_ref.as_ref().map(|r| r.url.clone()),
            result_image_url: analysis.and_then(|a| a.result_image_url.clone()),
            findings: analysis.map(|a| AnalysisFindings {
                label: a.label.clone(),
                confidence: a.confidence.clone(),
                model_version: a.model_version.clone(),
                result_image_url: a.result_image_url.clone(),
            }),
            analyzed_at: analysis.map(|a| a.analyzed_at),
            patient: patient.cloned(),
            appointment: appointment.cloned(),
            doctor: doctor.cloned(),
        };
        self.render(&draft)
    }

    pub fn render(&self, draft: &ReportDraft) -> Result<RenderedReport, PipelineError> {
        let source_image_url = draft
            .source_image_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| missing("source image reference"))?;
        let findings = draft
            .findings
            .as_ref()
            .ok_or_else(|| missing("analysis result"))?;
        let patient = draft
            .patient
            .as_ref()
            .filter(|p| !p.id.trim().is_empty())
            .ok_or_else(|| missing("patient identity"))?;
        let appointment = draft
            .appointment
            .as_ref()
            .filter(|a| !a.id.trim().is_empty())
            .ok_or_else(|| missing("appointment identity"))?;
        if findings.label.trim().is_empty() {
            return Err(missing("analysis label"));
        }

        let result_image_url = draft
            .result_image_url
            .as_deref()
            .or(findings.result_image_url.as_deref())
            .filter(|u| !u.trim().is_empty());
        let summary = Self::findings_text(&draft.category, findings);

        let mut layout = PdfLayout::new();
        layout.title(&self.config.facility_name);
        layout.paragraph(&format!("Screening report: {}", draft.category));
        if let Some(id) = draft.submission_id {
            layout.field("Submission", &id.to_string());
        }

        layout.heading("Patient");
        layout.field("Name", &patient.name);
        layout.field("Patient ID", &patient.id);
        layout.field("Date of birth", or_not_provided(&patient.date_of_birth));
        layout.field("Gender", or_not_provided(&patient.gender));

        layout.heading("Appointment");
        layout.field("Appointment ID", &appointment.id);
        layout.field("Scheduled for", or_not_provided(&appointment.scheduled_for));
        layout.field("Reason", or_not_provided(&appointment.reason));
        layout.field("Location", or_not_provided(&appointment.location));

        layout.heading("Images");
        layout.field("Source image", source_image_url);
        layout.field("Comparison image", result_image_url.unwrap_or(NOT_PROVIDED));

        layout.heading("Findings");
        layout.field("Predicted label", &findings.label);
        for (class, score) in &findings.confidence {
            layout.field(&format!("Confidence ({})", class), &format!("{:.1}%", score * 100.0));
        }
        layout.field("Model version", &findings.model_version);
        if let Some(analyzed_at) = draft.analyzed_at {
            layout.field("Analysed at", &analyzed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        }
        layout.paragraph(&summary);

        layout.heading("Sign-off");
        match &draft.doctor {
            Some(doctor) => {
                layout.field("Reviewing doctor", &doctor.name);
                layout.field("Specialty", or_not_provided(&doctor.specialty));
                layout.field("License", or_not_provided(&doctor.license_number));
            }
            None => layout.paragraph("Unsigned report"),
        }
        layout.paragraph(
            "This report was produced by an automated screening model and must be reviewed by a qualified clinician.",
        );

        let bytes = layout
            .into_pdf(&format!("Screening report {}", draft.category))
            .map_err(PipelineError::Render)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        log::debug!("Rendered {} byte report with digest {}", bytes.len(), digest);

        Ok(RenderedReport {
            bytes,
            findings: summary,
            digest,
        })
    }

    fn findings_text(category: &ScreeningCategory, findings: &AnalysisFindings) -> String {
        let score = findings
            .confidence
            .get(&findings.label)
            .copied()
            .or_else(|| findings.confidence.values().copied().reduce(f64::max));
        match score {
            Some(score) => format!(
                "{} screening result: {} (confidence {:.1}%).",
                category,
                findings.label,
                score * 100.0
            ),
            None => format!("{} screening result: {}.", category, findings.label),
        }
    }
}

fn missing(field: &str) -> PipelineError {
    PipelineError::Render(format!("missing required field: {}", field))
}

fn or_not_provided(value: &Option<String>) -> &str {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(NOT_PROVIDED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{analysis_for, sample_submission};

    fn assembler() -> ReportAssembler {
        ReportAssembler::new(ReportConfig::default())
    }

    #[test]
    fn identical_inputs_render_identical_bytes() {
        let submission = sample_submission();
        let analysis = analysis_for(&submission, "no-cancer", 0.92);

        let render = || {
            assembler()
                .assemble(
                    &submission,
                    Some(&analysis),
                    Some(submission.patient()),
                    submission.appointment(),
                    submission.doctor(),
                )
                .unwrap()
        };
        let first = render();
        let second = render();

        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.digest, second.digest);
        assert!(first.bytes.starts_with(b"%PDF-"));
        assert_eq!(
            first.findings,
            "lung-cancer screening result: no-cancer (confidence 92.0%)."
        );
    }

    #[test]
    fn missing_comparison_image_and_doctor_still_render() {
        let mut submission = sample_submission();
        submission.context.doctor = None;
        let analysis = analysis_for(&submission, "no-cancer", 0.92);
        assert!(analysis.result_image_url.is_none());

        let report = assembler()
            .assemble(
                &submission,
                Some(&analysis),
                Some(submission.patient()),
                submission.appointment(),
                None,
            )
            .unwrap();

        let text = String::from_utf8_lossy(&report.bytes);
        assert!(text.contains("Comparison image: Not provided"));
        assert!(text.contains("Unsigned report"));
    }

    #[test]
    fn required_fields_fail_with_render_error() {
        let submission = sample_submission();
        let analysis = analysis_for(&submission, "no-cancer", 0.92);
        let a = assembler();

        let no_analysis = a.assemble(
            &submission,
            None,
            Some(submission.patient()),
            submission.appointment(),
            None,
        );
        let no_patient = a.assemble(&submission, Some(&analysis), None, submission.appointment(), None);
        let no_appointment =
            a.assemble(&submission, Some(&analysis), Some(submission.patient()), None, None);
        let mut without_image = submission.clone();
        without_image.image_ref = None;
        let no_image = a.assemble(
            &without_image,
            Some(&analysis),
            Some(submission.patient()),
            submission.appointment(),
            None,
        );

        for result in [no_analysis, no_patient, no_appointment, no_image] {
            assert!(matches!(result, Err(PipelineError::Render(_))));
        }
    }

    #[test]
    fn comparison_image_and_signer_are_printed_when_present() {
        let submission = sample_submission();
        let mut analysis = analysis_for(&submission, "malignant", 0.81);
        analysis.result_image_url = Some("https://cdn.example.org/heatmap.png".into());

        let report = assembler()
            .assemble(
                &submission,
                Some(&analysis),
                Some(submission.patient()),
                submission.appointment(),
                submission.doctor(),
            )
            .unwrap();

        let text = String::from_utf8_lossy(&report.bytes);
        assert!(text.contains("Comparison image: https://cdn.example.org/heatmap.png"));
        assert!(!text.contains("Unsigned report"));
    }
}
