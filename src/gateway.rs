//! The submission pipeline.
//!
//! Every request passes the stages in a fixed order and stops at the first
//! failure:
//!
//! ```text
//! ORIGIN_CHECK -> RATE_LIMIT -> CSRF -> SANITIZE -> RESOLVE_APPLICABLE
//!   -> VALIDATE_SCHEMA -> RISK_SCAN -> PERSIST
//! ```
//!
//! Callers only ever see a [`SubmissionResponse`]: a success with the new id
//! and any risk warnings, or an opaque [`ErrorCode`]. Internal detail goes to
//! the log, never to the response.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult, StoreError};
use crate::guard::{
    AbuseGuard, ClientIdentity, ForgeryGuard, ForgeryRejection, RateDecision, RateLimitConfig,
    RequestOrigin,
};
use crate::resolver::{Applicable, applicable_questions};
use crate::risk::{RiskScanner, Warning};
use crate::sanitize::sanitize_form;
use crate::schema::{CONSENT_MESSAGE, FieldErrors, Schema};
use crate::store::GatewayStore;
use crate::submission::SubmissionRecord;
use crate::survey::{AnswerSet, AnswerValue, CONSENT_FIELD, CSRF_FIELD, RawForm, Survey};

/// Opaque failure codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    InvalidOrigin,
    CsrfMissing,
    CsrfInvalid,
    ValidationError,
    DuplicateSubmission,
    DatabaseError,
    InternalError,
}

impl ErrorCode {
    /// Caller-facing message. Never includes internal detail.
    pub fn message(self) -> &'static str {
        match self {
            Self::RateLimited => "Too many submissions. Please try again later.",
            Self::InvalidOrigin => "Submissions are not accepted from this site.",
            Self::CsrfMissing => "Your session has expired. Please reload the form.",
            Self::CsrfInvalid => "Your session could not be verified. Please reload the form.",
            Self::ValidationError => "Please correct the highlighted answers.",
            Self::DuplicateSubmission => "This evidence has already been submitted.",
            Self::DatabaseError => "We could not save your evidence. Please try again later.",
            Self::InternalError => "Something went wrong. Please try again later.",
        }
    }

    /// HTTP status an adapter should use for this code.
    pub fn http_status(self) -> u16 {
        match self {
            Self::RateLimited => 429,
            Self::InvalidOrigin | Self::CsrfMissing | Self::CsrfInvalid => 403,
            Self::ValidationError => 400,
            Self::DuplicateSubmission => 409,
            Self::DatabaseError | Self::InternalError => 500,
        }
    }
}

impl From<ForgeryRejection> for ErrorCode {
    fn from(rejection: ForgeryRejection) -> Self {
        match rejection {
            ForgeryRejection::InvalidOrigin => Self::InvalidOrigin,
            ForgeryRejection::CsrfMissing => Self::CsrfMissing,
            ForgeryRejection::CsrfInvalid => Self::CsrfInvalid,
        }
    }
}

/// Pipeline stage, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OriginCheck,
    RateLimit,
    Csrf,
    Sanitize,
    ResolveApplicable,
    ValidateSchema,
    RiskScan,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OriginCheck => "ORIGIN_CHECK",
            Self::RateLimit => "RATE_LIMIT",
            Self::Csrf => "CSRF",
            Self::Sanitize => "SANITIZE",
            Self::ResolveApplicable => "RESOLVE_APPLICABLE",
            Self::ValidateSchema => "VALIDATE_SCHEMA",
            Self::RiskScan => "RISK_SCAN",
            Self::Persist => "PERSIST",
        })
    }
}

/// Identifiers of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionAck {
    pub id: String,
    #[serde(rename = "surveyId")]
    pub survey_id: String,
}

/// What the caller receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SubmissionAck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    #[serde(skip_serializing_if = "FieldErrors::is_empty")]
    pub field_errors: FieldErrors,
    /// Seconds until the caller may retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
}

impl SubmissionResponse {
    fn accepted(data: SubmissionAck, warnings: Vec<Warning>) -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            data: Some(data),
            warnings,
            field_errors: FieldErrors::new(),
            retry_after: None,
            blocked_until: None,
        }
    }

    fn failure(code: ErrorCode) -> Self {
        Self {
            success: false,
            error: Some(code.message().to_string()),
            code: Some(code),
            data: None,
            warnings: Vec::new(),
            field_errors: FieldErrors::new(),
            retry_after: None,
            blocked_until: None,
        }
    }

    fn invalid(field_errors: FieldErrors) -> Self {
        Self {
            field_errors,
            ..Self::failure(ErrorCode::ValidationError)
        }
    }

    fn rate_limited(decision: &RateDecision) -> Self {
        Self {
            retry_after: decision.retry_after_secs(),
            blocked_until: decision.blocked_until(),
            ..Self::failure(ErrorCode::RateLimited)
        }
    }

    /// HTTP status an adapter should answer with.
    pub fn http_status(&self) -> u16 {
        self.code.map_or(200, ErrorCode::http_status)
    }
}

/// Everything the pipeline needs to know about the request besides the form.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client: ClientIdentity,
    pub origin: RequestOrigin,
    /// Anti-forgery token held by the caller's session, if any.
    pub session_token: Option<String>,
}

/// Result of validating one form step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "FieldErrors::is_empty")]
    pub field_errors: FieldErrors,
    /// Question ids in the step that currently apply.
    pub applicable: Vec<String>,
}

/// Runs submissions for one survey.
pub struct SubmissionGateway {
    survey: Survey,
    schema: Schema,
    forgery: ForgeryGuard,
    abuse: AbuseGuard,
    risk: RiskScanner,
    store: Arc<dyn GatewayStore>,
}

impl SubmissionGateway {
    /// Build a gateway with guards and scanner configured from the survey.
    pub fn new(survey: Survey, store: Arc<dyn GatewayStore>) -> Self {
        let schema = Schema::compile(&survey);
        let forgery = ForgeryGuard::from_settings(survey.security());
        let abuse = AbuseGuard::new(
            Arc::clone(&store),
            RateLimitConfig::from(survey.security()),
        );
        let risk = RiskScanner::from_settings(survey.risk());
        tracing::info!(
            survey = survey.id(),
            rules = schema.rules().len(),
            "submission gateway ready"
        );
        Self {
            survey,
            schema,
            forgery,
            abuse,
            risk,
            store,
        }
    }

    /// Replace the risk scanner (for a custom crisis detector).
    pub fn with_risk_scanner(mut self, risk: RiskScanner) -> Self {
        self.risk = risk;
        self
    }

    pub fn survey(&self) -> &Survey {
        &self.survey
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn forgery_guard(&self) -> &ForgeryGuard {
        &self.forgery
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    /// Run a submission through the pipeline now.
    pub fn submit(&self, context: &RequestContext, form: RawForm) -> SubmissionResponse {
        self.submit_at(context, form, Utc::now())
    }

    /// Run a submission through the pipeline at an explicit time.
    pub fn submit_at(
        &self,
        context: &RequestContext,
        mut form: RawForm,
        now: DateTime<Utc>,
    ) -> SubmissionResponse {
        let client = &context.client;

        let origin = match self.forgery.check_origin(&context.origin) {
            Ok(origin) => origin,
            Err(rejection) => return self.reject(Stage::OriginCheck, client, rejection.into()),
        };

        let decision = self.abuse.check_at(client, now);
        if !decision.is_allowed() {
            tracing::debug!(stage = %Stage::RateLimit, identifier = %client.identifier, "submission rejected");
            return SubmissionResponse::rate_limited(&decision);
        }

        let submitted_token = form.take(CSRF_FIELD).into_iter().next();
        if let Err(rejection) = self.forgery.check_token(
            submitted_token.as_deref(),
            context.session_token.as_deref(),
            origin,
        ) {
            return self.reject(Stage::Csrf, client, rejection.into());
        }

        let mut answers = sanitize_form(&form, &self.survey);
        let applicable = applicable_questions(&self.survey, &answers);

        let mut errors = self.schema.validate(&answers, &applicable).err().unwrap_or_default();
        require_consent(&answers, &mut errors);
        if !errors.is_empty() {
            tracing::debug!(
                stage = %Stage::ValidateSchema,
                fields = ?errors.keys().collect::<Vec<_>>(),
                "submission failed validation"
            );
            return SubmissionResponse::invalid(errors);
        }

        let warnings = self.scan_risk(&answers, &applicable);

        retain_applicable(&mut answers, &applicable);
        let record = match SubmissionRecord::build(
            &self.survey,
            answers,
            &client.identifier,
            !warnings.is_empty(),
            now,
        ) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(stage = %Stage::Persist, error = %e, "failed to build submission record");
                return SubmissionResponse::failure(ErrorCode::InternalError);
            }
        };

        match self.store.create_submission(&record) {
            Ok(()) => {
                tracing::info!(
                    survey = %record.survey_id,
                    id = %record.id,
                    risk_flags = record.has_risk_flags,
                    "submission accepted"
                );
                SubmissionResponse::accepted(
                    SubmissionAck {
                        id: record.id,
                        survey_id: record.survey_id,
                    },
                    warnings,
                )
            }
            Err(e) => SubmissionResponse::failure(persist_error_code(&e)),
        }
    }

    /// Validate one section of a partially completed form. No guards run and
    /// nothing is recorded.
    pub fn validate_step(&self, form: &RawForm, section: usize) -> GatewayResult<StepOutcome> {
        let step = self
            .survey
            .sections()
            .get(section)
            .ok_or(GatewayError::NoSuchSection {
                index: section,
                count: self.survey.sections().len(),
            })?;
        let answers = sanitize_form(form, &self.survey);
        let applicable = applicable_questions(&self.survey, &answers);

        let in_step: Vec<&str> = step
            .questions
            .iter()
            .flat_map(|q| q.flatten())
            .map(|q| q.id())
            .collect();
        let field_errors = match self.schema.validate_where(&answers, &applicable, |rule| {
            in_step.contains(&rule.owner())
        }) {
            Ok(()) => FieldErrors::new(),
            Err(errors) => errors,
        };

        Ok(StepOutcome {
            valid: field_errors.is_empty(),
            field_errors,
            applicable: in_step
                .iter()
                .filter(|id| applicable.contains(id))
                .map(|id| id.to_string())
                .collect(),
        })
    }

    fn reject(&self, stage: Stage, client: &ClientIdentity, code: ErrorCode) -> SubmissionResponse {
        tracing::warn!(
            target: "intake::security",
            %stage,
            identifier = %client.identifier,
            code = ?code,
            "submission rejected"
        );
        SubmissionResponse::failure(code)
    }

    /// Scanning never blocks: a panicking detector yields no warnings.
    fn scan_risk(&self, answers: &AnswerSet, applicable: &Applicable<'_>) -> Vec<Warning> {
        match catch_unwind(AssertUnwindSafe(|| self.risk.scan(answers, applicable))) {
            Ok(warnings) => warnings,
            Err(_) => {
                tracing::error!(stage = %Stage::RiskScan, "risk scanner panicked, continuing without warnings");
                Vec::new()
            }
        }
    }
}

/// Consent is checked on its own, whatever rules the schema carries.
fn require_consent(answers: &AnswerSet, errors: &mut FieldErrors) {
    if answers.get(CONSENT_FIELD).and_then(AnswerValue::as_bool) != Some(true) {
        errors
            .entry(CONSENT_FIELD.to_string())
            .or_insert_with(|| CONSENT_MESSAGE.to_string());
    }
}

/// Keep only answers to questions that currently apply, plus consent.
fn retain_applicable(answers: &mut AnswerSet, applicable: &Applicable<'_>) {
    answers.retain(|id| id == CONSENT_FIELD || applicable.contains(id));
}

fn persist_error_code(error: &StoreError) -> ErrorCode {
    match error {
        StoreError::Duplicate { .. } => {
            tracing::info!(stage = %Stage::Persist, "duplicate submission rejected");
            ErrorCode::DuplicateSubmission
        }
        StoreError::Serialization { message } => {
            tracing::error!(stage = %Stage::Persist, error = %message, "submission could not be encoded");
            ErrorCode::InternalError
        }
        other => {
            tracing::error!(
                target: "intake::security",
                stage = %Stage::Persist,
                error = %other,
                "submission could not be stored"
            );
            ErrorCode::DatabaseError
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::guard::rate_limit::tests::DownStore;
    use crate::risk::{CrisisDetector, RiskError, default_resources};
    use crate::store::mem::MemGatewayStore;
    use crate::survey::Field;
    use crate::survey::tests::MAINTENANCE_SURVEY;

    fn survey_with(security: &str) -> Survey {
        let src = MAINTENANCE_SURVEY.replace(
            "[security]\nallowed_origins = [\"example.org\"]",
            &format!("[security]\nallowed_origins = [\"example.org\"]\n{security}"),
        );
        Survey::from_toml_str(&src).unwrap()
    }

    fn gateway(security: &str) -> SubmissionGateway {
        SubmissionGateway::new(survey_with(security), Arc::new(MemGatewayStore::new()))
    }

    fn context(ip: &str) -> RequestContext {
        RequestContext {
            client: ClientIdentity::new(ip, Some("Mozilla/5.0")),
            origin: RequestOrigin {
                origin: Some("https://example.org".into()),
                ..RequestOrigin::default()
            },
            session_token: Some("tok".into()),
        }
    }

    fn form(description: &str) -> RawForm {
        RawForm::from_pairs([
            ("parent_type", "paying"),
            ("description", description),
            ("payment_method", "direct"),
            ("impacts", "health"),
            ("consent_given", "true"),
            ("csrf_token", "tok"),
        ])
    }

    const DESCRIPTION: &str = "Payments stopped for three months.";

    #[test]
    fn accepts_valid_submission() {
        let gw = gateway("");
        let response = gw.submit(&context("1.1.1.1"), form(DESCRIPTION));
        assert!(response.success, "{response:?}");
        let ack = response.data.unwrap();
        assert_eq!(ack.survey_id, "maintenance");
        let stored = gw.store().get_submission(&ack.id).unwrap().unwrap();
        assert_eq!(stored.category.as_deref(), Some("Paying parent"));
        assert!(!stored.answers.contains("arrears"));
        assert!(stored.consent_given);
    }

    #[test]
    fn consent_is_required_independently_of_the_schema() {
        let mut errors = FieldErrors::new();
        require_consent(&AnswerSet::new(), &mut errors);
        assert_eq!(errors[CONSENT_FIELD], CONSENT_MESSAGE);

        let mut answers = AnswerSet::new();
        answers.insert(CONSENT_FIELD, AnswerValue::Text("true".into()));
        let mut errors = FieldErrors::new();
        require_consent(&answers, &mut errors);
        assert_eq!(errors.len(), 1);

        answers.insert(CONSENT_FIELD, AnswerValue::Bool(true));
        let mut errors = FieldErrors::new();
        require_consent(&answers, &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn submission_without_consent_is_not_stored() {
        let gw = gateway("");
        let mut raw = form(DESCRIPTION);
        raw.take(CONSENT_FIELD);
        let response = gw.submit(&context("1.1.1.5"), raw);
        assert_eq!(response.code, Some(ErrorCode::ValidationError));
        assert_eq!(response.field_errors[CONSENT_FIELD], CONSENT_MESSAGE);
        assert_eq!(response.field_errors.len(), 1);
        assert_eq!(gw.store().submission_count().unwrap(), 0);
    }

    #[test]
    fn origin_failure_comes_first() {
        let gw = gateway("");
        let mut ctx = context("1.1.1.1");
        ctx.origin.origin = Some("https://evil.com".into());
        ctx.session_token = None;
        let response = gw.submit(&ctx, RawForm::new());
        assert_eq!(response.code, Some(ErrorCode::InvalidOrigin));
        // Rejected before the rate limiter counted anything.
        assert!(gw.submit(&context("1.1.1.1"), form(DESCRIPTION)).success);
    }

    #[test]
    fn rate_limit_precedes_csrf_and_validation() {
        let gw = gateway("");
        let now = Utc::now();
        assert!(gw.submit_at(&context("1.2.3.4"), form(DESCRIPTION), now).success);

        let mut ctx = context("1.2.3.4");
        ctx.session_token = Some("other".into());
        let response = gw.submit_at(&ctx, form("short"), now + Duration::seconds(5));
        assert_eq!(response.code, Some(ErrorCode::RateLimited));
        let blocked_until = response.blocked_until.unwrap();
        assert_eq!(blocked_until, now + Duration::seconds(5) + Duration::hours(1));
        assert!(response.retry_after.unwrap() > 0);
        assert_eq!(response.http_status(), 429);
    }

    #[test]
    fn csrf_mismatch_is_rejected() {
        let gw = gateway("");
        let mut ctx = context("2.2.2.2");
        ctx.session_token = Some("different".into());
        let response = gw.submit(&ctx, form(DESCRIPTION));
        assert_eq!(response.code, Some(ErrorCode::CsrfInvalid));
        assert_eq!(response.http_status(), 403);
    }

    #[test]
    fn validation_errors_are_per_field() {
        let gw = gateway("");
        let response = gw.submit(&context("3.3.3.3"), form("short"));
        assert_eq!(response.code, Some(ErrorCode::ValidationError));
        assert_eq!(
            response.field_errors["description"],
            "Minimum 20 characters required"
        );
        assert_eq!(gw.store().submission_count().unwrap(), 0);
    }

    #[test]
    fn duplicate_submission_is_reported() {
        let gw = gateway("rate_limit_max_attempts = 10");
        assert!(gw.submit(&context("4.4.4.4"), form(DESCRIPTION)).success);
        let again = gw.submit(&context("4.4.4.4"), form(DESCRIPTION));
        assert_eq!(again.code, Some(ErrorCode::DuplicateSubmission));
        assert_eq!(again.http_status(), 409);
    }

    #[test]
    fn store_outage_fails_open_then_reports_database_error() {
        let gw = SubmissionGateway::new(survey_with(""), Arc::new(DownStore));
        let response = gw.submit(&context("5.5.5.5"), form(DESCRIPTION));
        assert_eq!(response.code, Some(ErrorCode::DatabaseError));
        assert_eq!(response.error.as_deref(), Some(ErrorCode::DatabaseError.message()));
    }

    struct PanickingDetector;

    impl CrisisDetector for PanickingDetector {
        fn detect(&self, _: &Field, _: &str) -> Result<bool, RiskError> {
            panic!("detector bug");
        }
    }

    #[test]
    fn crisis_text_is_accepted_with_warning() {
        let gw = gateway("");
        let response = gw.submit(
            &context("6.6.6.6"),
            form("Some nights I think about ending my life."),
        );
        assert!(response.success);
        assert_eq!(response.warnings.len(), 1);
        let stored = gw
            .store()
            .get_submission(&response.data.unwrap().id)
            .unwrap()
            .unwrap();
        assert!(stored.has_risk_flags);
    }

    #[test]
    fn panicking_scanner_does_not_block() {
        let gw = gateway("").with_risk_scanner(RiskScanner::new(
            Box::new(PanickingDetector),
            default_resources(),
        ));
        let response = gw.submit(&context("7.7.7.7"), form(DESCRIPTION));
        assert!(response.success);
        assert!(response.warnings.is_empty());
    }

    #[test]
    fn response_wire_shape() {
        let gw = gateway("");
        let ok = serde_json::to_value(gw.submit(&context("8.8.8.8"), form(DESCRIPTION))).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["surveyId"], "maintenance");
        assert!(ok.get("code").is_none());
        assert!(ok.get("warnings").is_none());

        let bad = serde_json::to_value(gw.submit(&context("9.9.9.9"), form("short"))).unwrap();
        assert_eq!(bad["code"], "VALIDATION_ERROR");
        assert_eq!(bad["field_errors"]["description"], "Minimum 20 characters required");
    }

    #[test]
    fn step_validation_checks_only_that_section() {
        let gw = gateway("");
        let first = gw
            .validate_step(&RawForm::from_pairs([("parent_type", "paying")]), 0)
            .unwrap();
        assert!(first.valid);
        assert_eq!(first.applicable, vec!["parent_type", "children"]);

        let second = gw
            .validate_step(&RawForm::from_pairs([("parent_type", "receiving")]), 1)
            .unwrap();
        assert!(!second.valid);
        assert!(second.field_errors.contains_key("description"));
        assert!(second.applicable.contains(&"arrears".to_string()));
        assert!(!second.field_errors.contains_key("parent_type"));

        assert!(matches!(
            gw.validate_step(&RawForm::new(), 9),
            Err(GatewayError::NoSuchSection { index: 9, count: 2 })
        ));
    }

    #[test]
    fn error_codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_value(ErrorCode::DuplicateSubmission).unwrap(),
            "DUPLICATE_SUBMISSION"
        );
        assert_eq!(Stage::ResolveApplicable.to_string(), "RESOLVE_APPLICABLE");
    }
}
