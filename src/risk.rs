//! Crisis-indicator scanning of free-text answers.
//!
//! Scanning never blocks a submission: a match produces a [`Warning`] carrying
//! support resources, and a detector failure is logged and skipped.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::Applicable;
use crate::survey::{AnswerSet, Field, RiskSettings};

/// Phrases that indicate a respondent may be at risk.
pub const DEFAULT_CRISIS_KEYWORDS: &[&str] = &[
    "suicide",
    "suicidal",
    "kill myself",
    "end my life",
    "ending my life",
    "take my own life",
    "want to die",
    "better off dead",
    "no reason to live",
    "self harm",
    "self-harm",
    "hurt myself",
    "harm myself",
    "can't go on",
    "cannot go on",
];

/// A support service offered alongside a crisis warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportResource {
    pub name: String,
    pub contact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SupportResource {
    pub fn new(name: impl Into<String>, contact: impl Into<String>, url: Option<&str>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
            url: url.map(str::to_string),
        }
    }
}

/// Resources offered when a survey configures none.
pub fn default_resources() -> Vec<SupportResource> {
    vec![
        SupportResource::new(
            "Samaritans",
            "Call 116 123 (free, 24 hours)",
            Some("https://www.samaritans.org"),
        ),
        SupportResource::new(
            "Shout",
            "Text SHOUT to 85258",
            Some("https://giveusashout.org"),
        ),
    ]
}

/// Non-blocking advisory attached to an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Warning {
    CrisisResponse {
        #[serde(rename = "questionId")]
        question_id: String,
        resources: Vec<SupportResource>,
    },
}

#[derive(Debug, Error, Diagnostic)]
pub enum RiskError {
    #[error("crisis detector failed on \"{question_id}\": {message}")]
    #[diagnostic(
        code(intake::risk::detector),
        help("The submission is still accepted; check the detector configuration.")
    )]
    Detector { question_id: String, message: String },
}

/// Decides whether a free-text answer contains crisis indicators.
pub trait CrisisDetector: Send + Sync {
    fn detect(&self, field: &Field, text: &str) -> Result<bool, RiskError>;
}

/// Case-insensitive substring match against a keyword list. A question's own
/// `crisis_keywords` replace the list for that question.
#[derive(Debug, Clone)]
pub struct KeywordDetector {
    keywords: Vec<String>,
}

impl KeywordDetector {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl Default for KeywordDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CRISIS_KEYWORDS)
    }
}

impl CrisisDetector for KeywordDetector {
    fn detect(&self, field: &Field, text: &str) -> Result<bool, RiskError> {
        let haystack = text.to_lowercase();
        let hit = match &field.crisis_keywords {
            Some(own) => own
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && haystack.contains(&k)),
            None => self.keywords.iter().any(|k| haystack.contains(k.as_str())),
        };
        Ok(hit)
    }
}

/// Scans applicable free-text answers on flagged questions.
pub struct RiskScanner {
    detector: Box<dyn CrisisDetector>,
    resources: Vec<SupportResource>,
}

impl RiskScanner {
    pub fn new(detector: Box<dyn CrisisDetector>, resources: Vec<SupportResource>) -> Self {
        Self {
            detector,
            resources,
        }
    }

    /// Keyword scanner configured from a survey's `[risk]` table.
    pub fn from_settings(settings: &RiskSettings) -> Self {
        let detector = match &settings.keywords {
            Some(keywords) if !keywords.is_empty() => KeywordDetector::new(keywords),
            _ => KeywordDetector::default(),
        };
        let resources = if settings.resources.is_empty() {
            default_resources()
        } else {
            settings.resources.clone()
        };
        Self::new(Box::new(detector), resources)
    }

    pub fn resources(&self) -> &[SupportResource] {
        &self.resources
    }

    /// One warning per flagged question whose answer matches. Detector errors
    /// are logged and that question is skipped.
    pub fn scan(&self, answers: &AnswerSet, applicable: &Applicable<'_>) -> Vec<Warning> {
        let mut warnings = Vec::new();
        for (id, entry) in applicable.iter() {
            let Some(field) = entry.question.field() else {
                continue;
            };
            if !field.crisis_check || !field.kind.is_free_text() {
                continue;
            }
            let Some(text) = answers.text(id).filter(|t| !t.is_empty()) else {
                continue;
            };
            match self.detector.detect(field, text) {
                Ok(true) => {
                    tracing::info!(
                        target: "intake::security",
                        question = id,
                        "crisis indicators detected; support resources attached"
                    );
                    warnings.push(Warning::CrisisResponse {
                        question_id: id.to_string(),
                        resources: self.resources.clone(),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(question = id, error = %e, "crisis scan failed, continuing");
                }
            }
        }
        warnings
    }
}

impl Default for RiskScanner {
    fn default() -> Self {
        Self::from_settings(&RiskSettings::default())
    }
}

impl std::fmt::Debug for RiskScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskScanner")
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::applicable_questions;
    use crate::survey::tests::maintenance_survey;
    use crate::survey::{AnswerValue, FieldKind};

    struct BrokenDetector;

    impl CrisisDetector for BrokenDetector {
        fn detect(&self, field: &Field, _text: &str) -> Result<bool, RiskError> {
            Err(RiskError::Detector {
                question_id: field.id.clone(),
                message: "model offline".into(),
            })
        }
    }

    fn answers(description: &str) -> AnswerSet {
        let mut set = AnswerSet::new();
        set.insert("parent_type", AnswerValue::Text("paying".into()));
        set.insert("description", AnswerValue::Text(description.into()));
        set
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let field = Field::new("d", FieldKind::Textarea);
        let detector = KeywordDetector::default();
        assert!(detector.detect(&field, "Some days I WANT TO DIE").unwrap());
        assert!(!detector.detect(&field, "payments were late").unwrap());
    }

    #[test]
    fn question_keywords_override_defaults() {
        let mut field = Field::new("d", FieldKind::Textarea);
        field.crisis_keywords = Some(vec!["Desperate".into()]);
        let detector = KeywordDetector::default();
        assert!(detector.detect(&field, "I am desperate").unwrap());
        assert!(!detector.detect(&field, "I want to die").unwrap());
    }

    #[test]
    fn scan_attaches_resources() {
        let survey = maintenance_survey();
        let set = answers("Honestly I feel like ending my life over this");
        let applicable = applicable_questions(&survey, &set);
        let warnings = RiskScanner::default().scan(&set, &applicable);
        assert_eq!(warnings.len(), 1);
        let Warning::CrisisResponse {
            question_id,
            resources,
        } = &warnings[0];
        assert_eq!(question_id, "description");
        assert_eq!(resources[0].name, "Samaritans");
    }

    #[test]
    fn unflagged_or_inapplicable_questions_are_not_scanned() {
        let survey = maintenance_survey();
        let mut set = answers("All fine");
        set.insert("agency_outcome", AnswerValue::Text("I want to die".into()));
        let applicable = applicable_questions(&survey, &set);
        assert!(RiskScanner::default().scan(&set, &applicable).is_empty());
    }

    #[test]
    fn detector_failure_yields_no_warnings() {
        let survey = maintenance_survey();
        let set = answers("I want to die");
        let applicable = applicable_questions(&survey, &set);
        let scanner = RiskScanner::new(Box::new(BrokenDetector), default_resources());
        assert!(scanner.scan(&set, &applicable).is_empty());
    }

    #[test]
    fn warning_wire_shape() {
        let warning = Warning::CrisisResponse {
            question_id: "description".into(),
            resources: vec![SupportResource::new("Shout", "85258", None)],
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["type"], "crisis_response");
        assert_eq!(json["questionId"], "description");
        assert!(json["resources"][0].get("url").is_none());
    }

    #[test]
    fn settings_override_resources() {
        let settings = RiskSettings {
            keywords: Some(vec!["overwhelmed".into()]),
            resources: vec![SupportResource::new("Local line", "0800 000", None)],
        };
        let scanner = RiskScanner::from_settings(&settings);
        assert_eq!(scanner.resources()[0].name, "Local line");
    }
}
