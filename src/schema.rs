//! Validation schema compiled from a survey.
//!
//! One rule per answerable id: scalar questions, follow-ups, and every
//! multi-number sub-field (never the group id itself), plus the consent rule
//! every submission carries. Compilation is deterministic; the same survey
//! always yields an identical schema.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::resolver::Applicable;
use crate::sanitize::{numeric_range, text_limit};
use crate::survey::{AnswerSet, AnswerValue, CONSENT_FIELD, Field, FieldKind, Question, Survey};

/// Per-field error messages keyed by field id.
pub type FieldErrors = BTreeMap<String, String>;

pub const REQUIRED_MESSAGE: &str = "This field is required";
pub const INVALID_OPTION_MESSAGE: &str = "Invalid option selected";
pub const SELECT_ONE_MESSAGE: &str = "Please select at least one option";
pub const CONSENT_MESSAGE: &str = "You must consent to share your evidence before submitting";

/// The check applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCheck {
    Text {
        #[serde(skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        max_length: usize,
    },
    Number {
        min: f64,
        max: f64,
        currency: bool,
    },
    /// Exactly one of the allowed values.
    OneOf { allowed: Vec<String> },
    /// Any subset of the allowed values.
    AnyOf { allowed: Vec<String> },
    /// Must be literally `true`.
    Consent,
}

/// A compiled validation rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldRule {
    pub id: String,
    pub label: String,
    pub required: bool,
    /// Owning multi-number group, for sub-field rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub check: RuleCheck,
}

impl FieldRule {
    /// The question id whose applicability governs this rule.
    pub fn owner(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.id)
    }

    fn from_field(field: &Field) -> Self {
        let check = match field.kind {
            FieldKind::Text | FieldKind::Textarea => RuleCheck::Text {
                min_length: field.bounds.min_length,
                max_length: text_limit(field),
            },
            FieldKind::Number | FieldKind::Currency => {
                let currency = field.kind == FieldKind::Currency;
                let (min, max) = numeric_range(currency, field.bounds.min, field.bounds.max);
                RuleCheck::Number { min, max, currency }
            }
            FieldKind::Select | FieldKind::Radio => RuleCheck::OneOf {
                allowed: field.option_values().map(str::to_string).collect(),
            },
            FieldKind::Checkbox | FieldKind::MultiNumber => RuleCheck::AnyOf {
                allowed: field.option_values().map(str::to_string).collect(),
            },
        };
        Self {
            id: field.id.clone(),
            label: field.label.clone(),
            required: field.required,
            group: None,
            check,
        }
    }
}

/// Compiled validation schema for one survey.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    survey_id: String,
    rules: Vec<FieldRule>,
}

impl Schema {
    /// Compile the rule set for a survey. Surveys are validated when loaded,
    /// so compilation cannot fail.
    pub fn compile(survey: &Survey) -> Self {
        let mut rules = Vec::new();
        for question in survey.all_questions() {
            match question {
                Question::Scalar(field) | Question::WithFollowUp { parent: field, .. } => {
                    rules.push(FieldRule::from_field(field));
                }
                Question::Group(group) => {
                    for input in &group.inputs {
                        let (min, max) = numeric_range(false, input.min, input.max);
                        rules.push(FieldRule {
                            id: input.id.clone(),
                            label: input.label.clone(),
                            required: group.required,
                            group: Some(group.id.clone()),
                            check: RuleCheck::Number {
                                min,
                                max,
                                currency: false,
                            },
                        });
                    }
                }
            }
        }
        rules.push(FieldRule {
            id: CONSENT_FIELD.into(),
            label: "Consent".into(),
            required: true,
            group: None,
            check: RuleCheck::Consent,
        });
        Self {
            survey_id: survey.id().to_string(),
            rules,
        }
    }

    pub fn survey_id(&self) -> &str {
        &self.survey_id
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Validate answers against every applicable rule.
    pub fn validate(&self, answers: &AnswerSet, applicable: &Applicable<'_>) -> Result<(), FieldErrors> {
        self.validate_where(answers, applicable, |_| true)
    }

    /// Validate answers against the applicable rules the filter selects.
    pub fn validate_where(
        &self,
        answers: &AnswerSet,
        applicable: &Applicable<'_>,
        mut filter: impl FnMut(&FieldRule) -> bool,
    ) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        for rule in self.rules.iter().filter(|r| filter(r)) {
            if let Some(message) = check_rule(rule, answers, applicable) {
                errors.insert(rule.id.clone(), message);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check_rule(rule: &FieldRule, answers: &AnswerSet, applicable: &Applicable<'_>) -> Option<String> {
    if rule.check == RuleCheck::Consent {
        return match answers.get(&rule.id) {
            Some(AnswerValue::Bool(true)) => None,
            _ => Some(CONSENT_MESSAGE.into()),
        };
    }

    let owner = applicable.get(rule.owner())?;
    let value = match &rule.group {
        Some(group) => match answers.get(group) {
            Some(AnswerValue::Group(subs)) => subs.get(&rule.id).copied().map(AnswerValue::Number),
            _ => None,
        },
        None => answers.get(&rule.id).cloned(),
    };
    let value = value.unwrap_or(AnswerValue::Null);

    match &rule.check {
        RuleCheck::Text {
            min_length,
            max_length,
        } => {
            if value.is_empty() {
                return rule.required.then(|| REQUIRED_MESSAGE.into());
            }
            let Some(text) = value.as_text() else {
                return Some("Must be text".into());
            };
            let len = text.chars().count();
            if let Some(min) = min_length.filter(|min| len < *min) {
                return Some(format!("Minimum {min} characters required"));
            }
            (len > *max_length).then(|| format!("Maximum {max_length} characters allowed"))
        }
        RuleCheck::Number { min, max, .. } => {
            if value.is_empty() {
                return rule.required.then(|| REQUIRED_MESSAGE.into());
            }
            let Some(n) = value.as_number() else {
                return Some("Must be a number".into());
            };
            if n < *min {
                Some(format!("Must be at least {min}"))
            } else if n > *max {
                Some(format!("Must be at most {max}"))
            } else {
                None
            }
        }
        RuleCheck::OneOf { allowed } => {
            // Options narrowed away by the gateway leave nothing to choose,
            // so any posted value is one the client was never offered.
            if !owner.is_rendered() {
                return (!value.is_empty()).then(|| INVALID_OPTION_MESSAGE.into());
            }
            if value.is_empty() {
                return rule.required.then(|| REQUIRED_MESSAGE.into());
            }
            match value.as_text() {
                Some(v) if allowed.iter().any(|a| a == v) && owner.allows(v) => None,
                _ => Some(INVALID_OPTION_MESSAGE.into()),
            }
        }
        RuleCheck::AnyOf { allowed } => {
            let choices = match &value {
                AnswerValue::Choices(c) => c.as_slice(),
                AnswerValue::Null => &[],
                _ => return Some(INVALID_OPTION_MESSAGE.into()),
            };
            if !owner.is_rendered() {
                return (!choices.is_empty()).then(|| INVALID_OPTION_MESSAGE.into());
            }
            if choices.is_empty() {
                return rule.required.then(|| SELECT_ONE_MESSAGE.into());
            }
            let legal = choices
                .iter()
                .all(|c| allowed.contains(c) && owner.allows(c));
            (!legal).then(|| INVALID_OPTION_MESSAGE.into())
        }
        RuleCheck::Consent => None,
    }
}
