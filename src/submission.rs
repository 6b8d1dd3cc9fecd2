//! The persisted form of an accepted submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::survey::{AnswerSet, AnswerValue, CONSENT_FIELD, Survey};

/// An accepted, validated submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: String,
    pub survey_id: String,
    /// Applicable answers only; consent is carried separately.
    pub answers: AnswerSet,
    pub consent_given: bool,
    /// Sum of the configured multi-number group, when there is one.
    pub total_affected: Option<f64>,
    /// Label of the chosen gateway option.
    pub category: Option<String>,
    pub has_risk_flags: bool,
    /// SHA-256 over survey, client, and answers. Unique per store.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl SubmissionRecord {
    /// Build a record from validated answers. `answers` must still hold the
    /// consent flag; it is moved onto the record.
    pub fn build(
        survey: &Survey,
        mut answers: AnswerSet,
        client_identifier: &str,
        has_risk_flags: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let consent_given = answers
            .remove(CONSENT_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let fingerprint = fingerprint(survey.id(), client_identifier, &answers)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            survey_id: survey.id().to_string(),
            total_affected: total_affected(survey, &answers),
            category: category(survey, &answers),
            answers,
            consent_given,
            has_risk_flags,
            fingerprint,
            created_at: now,
        })
    }
}

/// Sum of the derived total group's sub-values.
pub fn total_affected(survey: &Survey, answers: &AnswerSet) -> Option<f64> {
    let group = survey.derived().total_group.as_deref()?;
    match answers.get(group)? {
        AnswerValue::Group(values) => Some(values.values().sum()),
        _ => None,
    }
}

/// Label of the selected gateway option.
pub fn category(survey: &Survey, answers: &AnswerSet) -> Option<String> {
    let value = answers.text(survey.gateway_field())?;
    survey
        .gateway()
        .field()?
        .options
        .iter()
        .find(|o| o.value == value)
        .map(|o| o.label.clone())
}

/// Hex SHA-256 of the survey id, client identifier, and canonical answers.
/// Answers serialize in key order, so equal sets hash equally.
pub fn fingerprint(
    survey_id: &str,
    client_identifier: &str,
    answers: &AnswerSet,
) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(survey_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(client_identifier.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(answers)?);
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}
