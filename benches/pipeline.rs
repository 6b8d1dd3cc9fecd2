//! Benchmarks for the submission pipeline stages.

use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use intake_gateway::gateway::{RequestContext, SubmissionGateway};
use intake_gateway::guard::{ClientIdentity, RequestOrigin};
use intake_gateway::resolver::applicable_questions;
use intake_gateway::sanitize::{clean_text, sanitize_form};
use intake_gateway::schema::Schema;
use intake_gateway::store;
use intake_gateway::survey::{RawForm, Survey};

const SURVEY: &str = r#"
id = "bench"
title = "Bench"
gateway_field = "parent_type"

[security]
allowed_origins = ["example.org"]
csrf_enabled = false

[[sections]]
title = "About"

[[sections.questions]]
id = "parent_type"
type = "radio"
required = true
options = [{ value = "paying" }, { value = "receiving" }]

[[sections.questions]]
id = "description"
type = "textarea"
required = true
min_length = 20
crisis_check = true

[[sections.questions]]
id = "arrears"
type = "currency"
applies_to = ["receiving"]

[[sections.questions]]
id = "impacts"
type = "checkbox"
options = [{ value = "financial" }, { value = "health" }, { value = "housing" }]
"#;

fn form() -> RawForm {
    let description = "The <b>payments</b> stopped <script>x()</script> in March and \
                       nobody at the agency would return my calls. "
        .repeat(20);
    RawForm::from_pairs([
        ("parent_type", "receiving".to_string()),
        ("description", description),
        ("arrears", "£12,345.67".to_string()),
        ("impacts", "financial".to_string()),
        ("impacts", "housing".to_string()),
        ("consent_given", "true".to_string()),
    ])
}

fn bench_clean_text(c: &mut Criterion) {
    let input = "<p onclick=\"steal()\">Hello <i>there</i></p> javascript:alert(1) ".repeat(50);
    c.bench_function("clean_text_3k", |bench| {
        bench.iter(|| black_box(clean_text(black_box(&input), 10_000)))
    });
}

fn bench_sanitize_validate(c: &mut Criterion) {
    let survey = Survey::from_toml_str(SURVEY).unwrap();
    let schema = Schema::compile(&survey);
    let raw = form();

    c.bench_function("sanitize_resolve_validate", |bench| {
        bench.iter(|| {
            let answers = sanitize_form(&raw, &survey);
            let applicable = applicable_questions(&survey, &answers);
            black_box(schema.validate(&answers, &applicable).is_ok())
        })
    });
}

fn bench_submit(c: &mut Criterion) {
    let survey = Survey::from_toml_str(SURVEY).unwrap();
    let gateway = SubmissionGateway::new(survey, store::memory_only());
    let raw = form();
    let next_client = AtomicU64::new(0);

    c.bench_function("submit_memory_store", |bench| {
        bench.iter(|| {
            let n = next_client.fetch_add(1, Ordering::Relaxed);
            let context = RequestContext {
                client: ClientIdentity::new(format!("10.{}.{}.{}", n >> 16 & 255, n >> 8 & 255, n & 255), None),
                origin: RequestOrigin {
                    origin: Some("https://example.org".into()),
                    ..RequestOrigin::default()
                },
                session_token: None,
            };
            black_box(gateway.submit(&context, raw.clone()))
        })
    });
}

criterion_group!(benches, bench_clean_text, bench_sanitize_validate, bench_submit);
criterion_main!(benches);
