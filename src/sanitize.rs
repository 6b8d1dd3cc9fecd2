//! Type-aware normalisation of untrusted form values.
//!
//! Sanitization never fails: every raw value maps to a clean value of the
//! question's type (or `Null`). Applying it to its own output yields the same
//! output, which the tests check through [`AnswerSet::to_form`].

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::survey::{
    AnswerSet, AnswerValue, CONSENT_FIELD, CSRF_FIELD, Field, FieldKind, GroupField, NumberInput,
    Question, RawForm, Survey,
};

/// Length cap for single-line text without an explicit `max_length`.
pub const DEFAULT_TEXT_MAX_LEN: usize = 500;

/// Length cap for textareas without an explicit `max_length`.
pub const DEFAULT_TEXTAREA_MAX_LEN: usize = 10_000;

/// Length cap for values submitted under ids the survey does not define.
pub const UNKNOWN_FIELD_MAX_LEN: usize = 1_000;

/// Range for plain numbers without explicit bounds.
pub const DEFAULT_NUMBER_RANGE: (f64, f64) = (0.0, 1_000_000.0);

/// Range for currency amounts without explicit bounds.
pub const DEFAULT_CURRENCY_RANGE: (f64, f64) = (0.0, 10_000_000.0);

static RE_SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\s*(script|style)\b[^>]*>.*?<\s*/\s*(script|style)\s*>").unwrap()
});

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^<>]*>").unwrap());

// Browsers ignore whitespace and control characters inside a URL scheme.
const SCHEME_NOISE: &str = r"[\s\x00-\x1f]*";

static RE_SCRIPT_URI: LazyLock<Regex> = LazyLock::new(|| {
    let scheme = |name: &str| {
        name.chars()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(SCHEME_NOISE)
    };
    let pattern = format!(
        "(?i)(?:{}|{}){SCHEME_NOISE}:",
        scheme("javascript"),
        scheme("vbscript")
    );
    Regex::new(&pattern).unwrap()
});

static RE_EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bon[a-z]+\s*=").unwrap());

const CONSENT_TRUE: &[&str] = &["true", "on", "1", "yes"];

/// Effective character cap for a free-text field.
pub fn text_limit(field: &Field) -> usize {
    field.bounds.max_length.unwrap_or(match field.kind {
        FieldKind::Textarea => DEFAULT_TEXTAREA_MAX_LEN,
        _ => DEFAULT_TEXT_MAX_LEN,
    })
}

/// Effective inclusive range for a numeric field. A lone bound that falls
/// outside the default range widens it rather than inverting it. Non-finite
/// bounds are ignored.
pub fn numeric_range(currency: bool, min: Option<f64>, max: Option<f64>) -> (f64, f64) {
    let (lo, hi) = if currency {
        DEFAULT_CURRENCY_RANGE
    } else {
        DEFAULT_NUMBER_RANGE
    };
    let lo = min.filter(|v| v.is_finite()).unwrap_or(lo);
    let hi = max.filter(|v| v.is_finite()).unwrap_or(hi).max(lo);
    (lo, hi)
}

/// Sanitize the raw values submitted for one scalar field.
pub fn sanitize_field(raw: &[String], field: &Field) -> AnswerValue {
    match field.kind {
        FieldKind::Text | FieldKind::Textarea => match raw.first() {
            Some(first) => AnswerValue::Text(clean_text(first, text_limit(field))),
            None => AnswerValue::Null,
        },
        FieldKind::Number | FieldKind::Currency => clean_number(
            raw,
            field.kind == FieldKind::Currency,
            field.bounds.min,
            field.bounds.max,
        ),
        FieldKind::Select | FieldKind::Radio => raw
            .first()
            .map(|v| v.trim())
            .filter(|v| field.has_option(v))
            .map(|v| AnswerValue::Text(v.to_string()))
            .unwrap_or(AnswerValue::Null),
        FieldKind::Checkbox => {
            let submitted: Vec<&str> = raw.iter().map(|v| v.trim()).collect();
            AnswerValue::Choices(
                field
                    .option_values()
                    .filter(|v| submitted.contains(v))
                    .map(str::to_string)
                    .collect(),
            )
        }
        // Groups are sanitized per input; a bare field of this kind has no
        // scalar value.
        FieldKind::MultiNumber => AnswerValue::Null,
    }
}

/// Sanitize one sub-field of a multi-number group. Missing or blank input
/// takes the declared default.
pub fn sanitize_number_input(raw: &[String], input: &NumberInput) -> f64 {
    match clean_number(raw, false, input.min, input.max) {
        AnswerValue::Number(n) => n,
        _ => {
            let (lo, hi) = numeric_range(false, input.min, input.max);
            input.default.clamp(lo, hi)
        }
    }
}

/// Sanitize a value submitted under an id the survey does not define:
/// trimmed and capped, never coerced.
pub fn sanitize_unknown(raw: &[String]) -> AnswerValue {
    let cap = |v: &String| -> String {
        let capped: String = v.trim().chars().take(UNKNOWN_FIELD_MAX_LEN).collect();
        capped.trim_end().to_string()
    };
    match raw {
        [] => AnswerValue::Null,
        [single] => AnswerValue::Text(cap(single)),
        many => AnswerValue::Choices(many.iter().map(cap).collect()),
    }
}

/// Interpret the consent checkbox.
pub fn sanitize_consent(raw: &[String]) -> AnswerValue {
    let given = raw
        .first()
        .map(|v| v.trim().to_ascii_lowercase())
        .is_some_and(|v| CONSENT_TRUE.contains(&v.as_str()));
    AnswerValue::Bool(given)
}

/// Sanitize a whole request form against a survey. Every survey question
/// gets an entry; the anti-forgery token is never carried into the answers.
pub fn sanitize_form(form: &RawForm, survey: &Survey) -> AnswerSet {
    let mut answers = AnswerSet::new();
    let mut known: Vec<&str> = vec![CONSENT_FIELD, CSRF_FIELD];

    for question in survey.all_questions() {
        match question {
            Question::Scalar(field) | Question::WithFollowUp { parent: field, .. } => {
                known.push(&field.id);
                answers.insert(&field.id, sanitize_field(form.values(&field.id), field));
            }
            Question::Group(group) => {
                known.push(&group.id);
                known.extend(group.inputs.iter().map(|i| i.id.as_str()));
                answers.insert(&group.id, sanitize_group(form, group));
            }
        }
    }

    answers.insert(CONSENT_FIELD, sanitize_consent(form.values(CONSENT_FIELD)));

    for key in form.keys() {
        if !known.contains(&key) {
            answers.insert(key, sanitize_unknown(form.values(key)));
        }
    }
    answers
}

fn sanitize_group(form: &RawForm, group: &GroupField) -> AnswerValue {
    AnswerValue::Group(
        group
            .inputs
            .iter()
            .map(|input| {
                (
                    input.id.clone(),
                    sanitize_number_input(form.values(&input.id), input),
                )
            })
            .collect(),
    )
}

/// Normalise, strip markup, trim, and cap free text. Repeats until stable so
/// that stripping one layer can never expose another.
///
/// Once the text is in NFC every pass that changes it also shortens it, so
/// the loop ends.
pub fn clean_text(raw: &str, max_len: usize) -> String {
    let mut current = text_pass(raw, max_len);
    loop {
        let next = text_pass(&current, max_len);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn text_pass(raw: &str, max_len: usize) -> String {
    let normalized: String = raw.nfc().collect();
    let stripped = RE_SCRIPT_BLOCK.replace_all(&normalized, "");
    let stripped = RE_TAG.replace_all(&stripped, "");
    let stripped = RE_SCRIPT_URI.replace_all(&stripped, "");
    let stripped = RE_EVENT_HANDLER.replace_all(&stripped, "");
    let truncated: String = stripped.trim().chars().take(max_len).collect();
    truncated.trim_end().to_string()
}

/// Parse and clamp a numeric answer. Blank input is `Null`; anything else
/// that does not parse counts as zero before clamping.
pub fn clean_number(raw: &[String], currency: bool, min: Option<f64>, max: Option<f64>) -> AnswerValue {
    let Some(first) = raw.iter().map(|v| v.trim()).find(|v| !v.is_empty()) else {
        return AnswerValue::Null;
    };
    let (lo, hi) = numeric_range(currency, min, max);
    let parsed = parse_numeric(first, currency)
        .filter(|n| n.is_finite())
        .unwrap_or(0.0);

    let n = if currency {
        // Clamp to whole-cent bounds so re-rounding a boundary is a no-op.
        let lo_c = (lo * 100.0).ceil() / 100.0;
        let hi_c = ((hi * 100.0).floor() / 100.0).max(lo_c);
        ((parsed * 100.0).round() / 100.0).clamp(lo_c, hi_c)
    } else {
        parsed.clamp(lo, hi)
    };
    // Collapse -0 so it renders as "0".
    AnswerValue::Number(if n == 0.0 { 0.0 } else { n })
}

fn parse_numeric(value: &str, currency: bool) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .filter(|c| !currency || !matches!(c, '£' | '$' | '€'))
        .collect();
    cleaned.parse::<f64>().ok()
}
