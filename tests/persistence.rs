//! Persistence and recovery tests for the redb-backed store.
//!
//! These verify that submissions, blocks, and the duplicate index survive a
//! close + reopen cycle, and that attempt admission stays atomic under
//! concurrent callers.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};

use intake_gateway::gateway::{ErrorCode, RequestContext, SubmissionGateway};
use intake_gateway::guard::{ClientIdentity, RequestOrigin};
use intake_gateway::sanitize::sanitize_form;
use intake_gateway::store::{self, Admission, CounterKey, GatewayStore};
use intake_gateway::submission::SubmissionRecord;
use intake_gateway::survey::{RawForm, Survey};

const SURVEY: &str = r#"
id = "evidence"
title = "Evidence"
gateway_field = "role"

[security]
allowed_origins = ["example.org"]
csrf_enabled = false

[[sections]]
title = "Account"

[[sections.questions]]
id = "role"
label = "Which describes you?"
type = "select"
required = true
options = [{ value = "parent" }, { value = "advocate" }]

[[sections.questions]]
id = "description"
label = "What happened?"
type = "textarea"
required = true
min_length = 10
"#;

fn survey() -> Survey {
    Survey::from_toml_str(SURVEY).unwrap()
}

fn open(dir: &std::path::Path) -> Arc<dyn GatewayStore> {
    store::with_persistence(dir).unwrap()
}

fn context(ip: &str) -> RequestContext {
    RequestContext {
        client: ClientIdentity::new(ip, Some("curl/8.5")),
        origin: RequestOrigin {
            referer: Some("https://example.org/survey".into()),
            ..RequestOrigin::default()
        },
        session_token: None,
    }
}

fn body() -> RawForm {
    RawForm::from_pairs([
        ("role", "parent"),
        ("description", "The payments stopped in March"),
        ("consent_given", "yes"),
    ])
}

#[test]
fn submissions_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let id;
    // First session: accept one submission.
    {
        let gateway = SubmissionGateway::new(survey(), open(dir.path()));
        let response = gateway.submit(&context("203.0.113.1"), body());
        assert!(response.success, "{response:?}");
        id = response.data.unwrap().id;
    }

    // Second session: the record is still there.
    {
        let store = open(dir.path());
        assert_eq!(store.submission_count().unwrap(), 1);
        let record = store.get_submission(&id).unwrap().unwrap();
        assert_eq!(record.survey_id, "evidence");
        assert_eq!(
            record.answers.text("description"),
            Some("The payments stopped in March")
        );
    }
}

#[test]
fn blocks_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let ctx = context("203.0.113.2");

    {
        let gateway = SubmissionGateway::new(survey(), open(dir.path()));
        assert!(gateway.submit(&ctx, body()).success);
        let limited = gateway.submit(&ctx, body());
        assert_eq!(limited.code, Some(ErrorCode::RateLimited));
    }

    {
        let gateway = SubmissionGateway::new(survey(), open(dir.path()));
        let again = gateway.submit(&ctx, body());
        assert_eq!(again.code, Some(ErrorCode::RateLimited));
        assert!(again.blocked_until.unwrap() > Utc::now());
        assert_eq!(gateway.store().list_violations(None, 10).unwrap().len(), 1);
    }
}

#[test]
fn duplicate_index_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let survey = survey();
    let answers = sanitize_form(&body(), &survey);
    let now = Utc::now();

    let first = SubmissionRecord::build(&survey, answers.clone(), "203.0.113.3", false, now).unwrap();
    open(dir.path()).create_submission(&first).unwrap();

    let replay = SubmissionRecord::build(&survey, answers, "203.0.113.3", false, now).unwrap();
    assert_ne!(first.id, replay.id);
    assert_eq!(first.fingerprint, replay.fingerprint);

    let err = open(dir.path()).create_submission(&replay).unwrap_err();
    assert!(err.is_duplicate());
}

#[test]
fn concurrent_admission_is_exact() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = open(dir.path());
    let key = CounterKey::new("203.0.113.4", "submission");
    let now = Utc::now();
    let since = now - Duration::hours(1);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            thread::spawn(move || store.admit_attempt(&key, now, since, 5).unwrap())
        })
        .collect();

    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|admission| matches!(admission, Admission::Admitted { .. }))
        .count();
    assert_eq!(admitted, 5);
    assert_eq!(store.count_attempts_since(&key, since).unwrap().count, 5);
}
