//! End-to-end tests for the submission pipeline.
//!
//! These drive `SubmissionGateway` through the public API only: origin and
//! token checks, rate limiting, sanitization, conditional validation, risk
//! warnings, and persistence to the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};

use intake_gateway::gateway::{ErrorCode, RequestContext, SubmissionGateway};
use intake_gateway::guard::{AbuseMonitor, ClientIdentity, RequestOrigin};
use intake_gateway::risk::Warning;
use intake_gateway::store::GatewayStore;
use intake_gateway::store::mem::MemGatewayStore;
use intake_gateway::survey::{AnswerValue, RawForm, Survey};

const SURVEY: &str = r#"
id = "maintenance"
title = "Child maintenance experiences"
gateway_field = "parent_type"

[security]
allowed_origins = ["example.org"]
rate_limit_max_attempts = 1
rate_limit_window_minutes = 4320
block_duration_minutes = 60

[[sections]]
title = "About you"

[[sections.questions]]
id = "parent_type"
label = "Are you the paying or receiving parent?"
type = "radio"
required = true
options = [
    { value = "paying", label = "Paying parent" },
    { value = "receiving", label = "Receiving parent" },
]

[[sections]]
title = "Your experience"

[[sections.questions]]
id = "description"
label = "Describe what happened"
type = "textarea"
required = true
min_length = 20
max_length = 2000
crisis_check = true

[[sections.questions]]
id = "arrears"
label = "Arrears owed to you"
type = "currency"
applies_to = ["receiving"]
min = 0
max = 100000

[[sections.questions]]
id = "impacts"
label = "How has this affected you?"
type = "checkbox"
options = [{ value = "financial" }, { value = "health" }]
"#;

const TOKEN: &str = "session-token";

fn survey() -> Survey {
    Survey::from_toml_str(SURVEY).unwrap()
}

fn gateway() -> (SubmissionGateway, Arc<dyn GatewayStore>) {
    let store: Arc<dyn GatewayStore> = Arc::new(MemGatewayStore::new());
    (SubmissionGateway::new(survey(), Arc::clone(&store)), store)
}

fn context(ip: &str) -> RequestContext {
    RequestContext {
        client: ClientIdentity::new(ip, Some("Mozilla/5.0 (X11; Linux x86_64)")),
        origin: RequestOrigin {
            origin: Some("https://example.org".into()),
            ..RequestOrigin::default()
        },
        session_token: Some(TOKEN.into()),
    }
}

fn form(description: &str) -> RawForm {
    RawForm::from_pairs([
        ("parent_type", "receiving"),
        ("description", description),
        ("arrears", "£1,250.50"),
        ("impacts", "financial"),
        ("consent_given", "true"),
        ("csrf_token", TOKEN),
    ])
}

#[test]
fn short_description_is_a_validation_error() {
    let (gateway, store) = gateway();
    let response = gateway.submit(&context("198.51.100.1"), form("short"));

    assert!(!response.success);
    assert_eq!(response.code, Some(ErrorCode::ValidationError));
    assert_eq!(response.http_status(), 400);
    assert_eq!(
        response.field_errors.get("description").map(String::as_str),
        Some("Minimum 20 characters required")
    );
    assert_eq!(store.submission_count().unwrap(), 0);
}

#[test]
fn valid_submission_is_stored_sanitized() {
    let (gateway, store) = gateway();
    let response = gateway.submit(
        &context("198.51.100.2"),
        form("It took <b>nine</b> months to arrive"),
    );

    assert!(response.success, "{response:?}");
    assert_eq!(response.http_status(), 200);
    let ack = response.data.unwrap();
    assert_eq!(ack.survey_id, "maintenance");

    let record = store.get_submission(&ack.id).unwrap().unwrap();
    assert!(record.consent_given);
    assert_eq!(record.category.as_deref(), Some("Receiving parent"));
    assert_eq!(
        record.answers.get("description"),
        Some(&AnswerValue::Text("It took nine months to arrive".into()))
    );
    assert_eq!(
        record.answers.get("arrears"),
        Some(&AnswerValue::Number(1250.5))
    );
    assert!(!record.answers.contains("consent_given"));
    assert!(!record.answers.contains("csrf_token"));
}

#[test]
fn second_submission_from_same_client_is_rate_limited() {
    let (gateway, store) = gateway();
    let ctx = context("1.2.3.4");
    let now = Utc::now();

    let first = gateway.submit_at(&ctx, form("A first account of what happened"), now);
    assert!(first.success, "{first:?}");

    let later = now + Duration::seconds(30);
    let second = gateway.submit_at(&ctx, form("A second account of what happened"), later);
    assert_eq!(second.code, Some(ErrorCode::RateLimited));
    assert_eq!(second.http_status(), 429);
    let blocked_until = second.blocked_until.unwrap();
    let expected = later + Duration::minutes(60);
    assert!((blocked_until - expected).num_seconds().abs() <= 1);
    assert!(second.retry_after.unwrap() > 0);

    // While blocked, even a fresh payload is refused.
    let third = gateway.submit_at(&ctx, form("A third account of what happened"), later);
    assert_eq!(third.code, Some(ErrorCode::RateLimited));

    let monitor = AbuseMonitor::new(Arc::clone(&store));
    let violations = monitor.recent_violations(None, 10).unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].identifier, "1.2.3.4");
    assert_eq!(monitor.active_blocks(later).unwrap().len(), 1);
    assert_eq!(store.submission_count().unwrap(), 1);
}

#[test]
fn other_clients_are_not_affected_by_a_block() {
    let (gateway, _) = gateway();
    let blocked = context("1.2.3.4");
    assert!(gateway.submit(&blocked, form("A first account of what happened")).success);
    assert!(!gateway.submit(&blocked, form("A second account of events")).success);

    let other = gateway.submit(&context("5.6.7.8"), form("An unrelated account of events"));
    assert!(other.success, "{other:?}");
}

#[test]
fn missing_consent_is_rejected() {
    let (gateway, store) = gateway();
    let mut body = form("A full account of what happened");
    body.take("consent_given");
    body.push("consent_given", "false");

    let response = gateway.submit(&context("198.51.100.3"), body);
    assert_eq!(response.code, Some(ErrorCode::ValidationError));
    assert!(response.field_errors.contains_key("consent_given"));
    assert_eq!(store.submission_count().unwrap(), 0);
}

#[test]
fn foreign_origin_is_rejected() {
    let (gateway, _) = gateway();
    let mut ctx = context("198.51.100.4");
    ctx.origin.origin = Some("https://evil.example.net".into());

    let response = gateway.submit(&ctx, form("A full account of what happened"));
    assert_eq!(response.code, Some(ErrorCode::InvalidOrigin));
    assert_eq!(response.http_status(), 403);
}

#[test]
fn subdomain_origin_is_accepted() {
    let (gateway, _) = gateway();
    let mut ctx = context("198.51.100.5");
    ctx.origin.origin = Some("https://forms.example.org".into());

    let response = gateway.submit(&ctx, form("A full account of what happened"));
    assert!(response.success, "{response:?}");
}

#[test]
fn token_failures_are_distinguished() {
    let (gateway, _) = gateway();

    let mut missing = form("A full account of what happened");
    missing.take("csrf_token");
    let response = gateway.submit(&context("198.51.100.6"), missing);
    assert_eq!(response.code, Some(ErrorCode::CsrfMissing));

    let mut wrong = form("A full account of what happened");
    wrong.take("csrf_token");
    wrong.push("csrf_token", "forged");
    let response = gateway.submit(&context("198.51.100.7"), wrong);
    assert_eq!(response.code, Some(ErrorCode::CsrfInvalid));
    assert_eq!(response.http_status(), 403);
}

#[test]
fn crisis_language_is_accepted_with_a_warning() {
    let (gateway, store) = gateway();
    let response = gateway.submit(
        &context("198.51.100.8"),
        form("Some days I feel like I want to die because of this"),
    );

    assert!(response.success, "{response:?}");
    assert_eq!(response.warnings.len(), 1);
    let Warning::CrisisResponse {
        question_id,
        resources,
    } = &response.warnings[0];
    assert_eq!(question_id, "description");
    assert!(!resources.is_empty());

    let record = store
        .get_submission(&response.data.unwrap().id)
        .unwrap()
        .unwrap();
    assert!(record.has_risk_flags);
}

#[test]
fn answers_to_inapplicable_questions_are_dropped() {
    let (gateway, store) = gateway();
    let mut body = form("A full account of what happened");
    body.take("parent_type");
    body.push("parent_type", "paying");

    let response = gateway.submit(&context("198.51.100.9"), body);
    assert!(response.success, "{response:?}");
    let record = store
        .get_submission(&response.data.unwrap().id)
        .unwrap()
        .unwrap();
    assert_eq!(record.category.as_deref(), Some("Paying parent"));
    assert!(!record.answers.contains("arrears"));
}

#[test]
fn response_json_uses_wire_names() {
    let (gateway, _) = gateway();
    let response = gateway.submit(&context("198.51.100.10"), form("short"));
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(json["field_errors"]["description"].is_string());
    assert!(json.get("data").is_none());

    let accepted = gateway.submit(
        &context("198.51.100.11"),
        form("A full account of what happened"),
    );
    let json = serde_json::to_value(&accepted).unwrap();
    assert_eq!(json["data"]["surveyId"], "maintenance");
}

#[test]
fn step_validation_checks_one_section() {
    let (gateway, store) = gateway();
    let body = RawForm::from_pairs([("parent_type", "receiving")]);

    let first = gateway.validate_step(&body, 0).unwrap();
    assert!(first.valid);

    let second = gateway.validate_step(&body, 1).unwrap();
    assert!(!second.valid);
    assert!(second.field_errors.contains_key("description"));
    assert!(second.applicable.iter().any(|id| id == "arrears"));

    assert!(gateway.validate_step(&body, 2).is_err());
    assert_eq!(store.submission_count().unwrap(), 0);
}
