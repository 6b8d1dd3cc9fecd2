//! Survey configuration: sections of questions, the gateway field, and the
//! security/risk settings that travel with a survey.
//!
//! Surveys are authored as TOML and loaded through [`Survey::from_toml_str`]
//! or [`Survey::load`]. Loading converts the loosely-typed definition into the
//! closed [`Question`] shape set and checks every structural invariant once,
//! so the rest of the gateway never has to re-check configuration at request
//! time.
//!
//! ```toml
//! id = "maintenance"
//! gateway_field = "parent_type"
//!
//! [[sections]]
//! title = "About you"
//!
//! [[sections.questions]]
//! id = "parent_type"
//! type = "radio"
//! required = true
//! options = [
//!     { value = "paying", label = "Paying parent" },
//!     { value = "receiving", label = "Receiving parent" },
//! ]
//! ```

pub mod answers;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SurveyError, SurveyResult};
use crate::risk::SupportResource;

pub use answers::{AnswerSet, AnswerValue, RawForm};

/// Field id of the consent checkbox every submission must carry.
pub const CONSENT_FIELD: &str = "consent_given";

/// Form field that carries the per-session anti-forgery token.
pub const CSRF_FIELD: &str = "csrf_token";

const RESERVED_IDS: &[&str] = &[CONSENT_FIELD, CSRF_FIELD];

// ---------------------------------------------------------------------------
// Field kinds and options
// ---------------------------------------------------------------------------

/// Input type of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    Text,
    Textarea,
    Number,
    Currency,
    Select,
    Radio,
    Checkbox,
    MultiNumber,
}

impl FieldKind {
    /// Free-text kinds (sanitized as text, eligible for risk scanning).
    pub fn is_free_text(self) -> bool {
        matches!(self, Self::Text | Self::Textarea)
    }

    /// Scalar numeric kinds.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Number | Self::Currency)
    }

    /// Kinds whose legal values are exactly their option values.
    pub fn is_enumerated(self) -> bool {
        matches!(self, Self::Select | Self::Radio | Self::Checkbox)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Textarea => "textarea",
            Self::Number => "number",
            Self::Currency => "currency",
            Self::Select => "select",
            Self::Radio => "radio",
            Self::Checkbox => "checkbox",
            Self::MultiNumber => "multiNumber",
        };
        f.write_str(name)
    }
}

/// Which gateway values a question (or option) applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AppliesTo {
    /// Shown regardless of the gateway answer.
    #[default]
    All,
    /// Shown only for these gateway values.
    Only(BTreeSet<String>),
}

impl AppliesTo {
    /// Whether a given gateway value admits this question.
    pub fn admits(&self, gateway_value: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(values) => values.contains(gateway_value),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl From<Option<Vec<String>>> for AppliesTo {
    fn from(values: Option<Vec<String>>) -> Self {
        match values {
            None => Self::All,
            Some(v) => Self::Only(v.into_iter().collect()),
        }
    }
}

/// A legal value of an enumerated question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
    /// Narrows the option (not the question) to some gateway values.
    pub applies_to: AppliesTo,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
            applies_to: AppliesTo::All,
        }
    }
}

/// Declarative predicate deciding whether a follow-up is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowIf {
    /// Parent answer equals the value (or, for checkboxes, contains it).
    Equals(String),
    /// Parent answer is one of the values (or, for checkboxes, intersects them).
    AnyOf(Vec<String>),
    /// Parent has any non-empty answer.
    NotEmpty,
    /// Another answer in the set equals a value.
    FieldEquals { field: String, value: String },
}

// ---------------------------------------------------------------------------
// Questions
// ---------------------------------------------------------------------------

/// Numeric and length constraints of a scalar field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

/// A single-valued (or checkbox multi-valued) question.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub bounds: Bounds,
    pub options: Vec<SelectOption>,
    pub applies_to: AppliesTo,
    /// Answer is personal data; never logged.
    pub sensitive: bool,
    /// Free-text answer is scanned for crisis indicators.
    pub crisis_check: bool,
    /// Per-question keyword override for the crisis scan.
    pub crisis_keywords: Option<Vec<String>>,
}

impl Field {
    pub fn new(id: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            kind,
            required: false,
            bounds: Bounds::default(),
            options: Vec::new(),
            applies_to: AppliesTo::All,
            sensitive: false,
            crisis_check: false,
            crisis_keywords: None,
        }
    }

    pub fn option_values(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(|o| o.value.as_str())
    }

    pub fn has_option(&self, value: &str) -> bool {
        self.options.iter().any(|o| o.value == value)
    }
}

/// One numeric sub-field of a multi-number group.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberInput {
    pub id: String,
    pub label: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub default: f64,
}

/// A multi-number question. The group id is never validated itself; its
/// sub-field ids are.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupField {
    pub id: String,
    pub label: String,
    pub required: bool,
    pub applies_to: AppliesTo,
    pub inputs: Vec<NumberInput>,
}

/// A follow-up question revealed by a predicate on its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub show_if: ShowIf,
    pub question: Question,
}

/// The closed set of question shapes every component switches over.
#[derive(Debug, Clone, PartialEq)]
pub enum Question {
    Scalar(Field),
    Group(GroupField),
    WithFollowUp {
        parent: Field,
        follow_up: Box<FollowUp>,
    },
}

impl Question {
    pub fn id(&self) -> &str {
        match self {
            Self::Scalar(f) | Self::WithFollowUp { parent: f, .. } => &f.id,
            Self::Group(g) => &g.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Scalar(f) | Self::WithFollowUp { parent: f, .. } => &f.label,
            Self::Group(g) => &g.label,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Scalar(f) | Self::WithFollowUp { parent: f, .. } => f.kind,
            Self::Group(_) => FieldKind::MultiNumber,
        }
    }

    pub fn applies_to(&self) -> &AppliesTo {
        match self {
            Self::Scalar(f) | Self::WithFollowUp { parent: f, .. } => &f.applies_to,
            Self::Group(g) => &g.applies_to,
        }
    }

    /// The scalar field carrying this question's own answer, if any.
    pub fn field(&self) -> Option<&Field> {
        match self {
            Self::Scalar(f) | Self::WithFollowUp { parent: f, .. } => Some(f),
            Self::Group(_) => None,
        }
    }

    pub fn follow_up(&self) -> Option<&FollowUp> {
        match self {
            Self::WithFollowUp { follow_up, .. } => Some(follow_up),
            _ => None,
        }
    }

    /// This question and every nested follow-up, depth first.
    pub fn flatten(&self) -> Vec<&Question> {
        let mut out = vec![self];
        if let Some(fu) = self.follow_up() {
            out.extend(fu.question.flatten());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-survey abuse and forgery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default = "default_true")]
    pub csrf_enabled: bool,
    /// Hosts allowed to submit (exact host or any subdomain).
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_window_minutes")]
    pub rate_limit_window_minutes: u32,
    #[serde(default = "default_max_attempts")]
    pub rate_limit_max_attempts: u32,
    #[serde(default = "default_block_minutes")]
    pub block_duration_minutes: u32,
    #[serde(default = "default_action")]
    pub rate_limit_action: String,
}

fn default_true() -> bool {
    true
}
fn default_window_minutes() -> u32 {
    3 * 24 * 60
}
fn default_max_attempts() -> u32 {
    1
}
fn default_block_minutes() -> u32 {
    60
}
fn default_action() -> String {
    "submission".into()
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            csrf_enabled: default_true(),
            allowed_origins: Vec::new(),
            rate_limit_window_minutes: default_window_minutes(),
            rate_limit_max_attempts: default_max_attempts(),
            block_duration_minutes: default_block_minutes(),
            rate_limit_action: default_action(),
        }
    }
}

/// Crisis-scan settings. Empty fields fall back to built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub resources: Vec<SupportResource>,
}

/// Fields computed onto the submission record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedFields {
    /// Multi-number question whose sub-values sum to the affected total.
    #[serde(default)]
    pub total_group: Option<String>,
}

// ---------------------------------------------------------------------------
// Survey
// ---------------------------------------------------------------------------

/// An ordered group of questions (one step of the form).
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub title: String,
    pub questions: Vec<Question>,
}

/// A validated survey configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Survey {
    id: String,
    title: String,
    gateway_field: String,
    sections: Vec<Section>,
    security: SecuritySettings,
    risk: RiskSettings,
    derived: DerivedFields,
    /// (section, question) position of the gateway question.
    gateway_pos: (usize, usize),
}

/// Optional parts of a survey beyond its questions.
#[derive(Debug, Clone, Default)]
pub struct SurveySettings {
    pub title: String,
    pub security: SecuritySettings,
    pub risk: RiskSettings,
    pub derived: DerivedFields,
}

impl Survey {
    /// Build a survey from typed parts, checking every structural invariant.
    pub fn new(
        id: impl Into<String>,
        gateway_field: impl Into<String>,
        sections: Vec<Section>,
        settings: SurveySettings,
    ) -> SurveyResult<Self> {
        let id = id.into();
        let gateway_field = gateway_field.into();

        let mut seen = HashSet::new();
        for question in sections.iter().flat_map(|s| &s.questions) {
            check_question(question, &mut seen)?;
        }

        let gateway_pos = sections
            .iter()
            .enumerate()
            .find_map(|(si, s)| {
                s.questions
                    .iter()
                    .position(|q| q.id() == gateway_field)
                    .map(|qi| (si, qi))
            })
            .ok_or_else(|| SurveyError::UnknownGatewayField {
                id: gateway_field.clone(),
            })?;

        let gateway = &sections[gateway_pos.0].questions[gateway_pos.1];
        if !matches!(gateway.kind(), FieldKind::Select | FieldKind::Radio) {
            return Err(SurveyError::GatewayKind {
                id: gateway_field,
                kind: gateway.kind().to_string(),
            });
        }
        if !gateway.applies_to().is_unrestricted() {
            return Err(SurveyError::InvalidQuestion {
                id: gateway_field,
                message: "the gateway question cannot itself be restricted by applies_to".into(),
            });
        }

        if let Some(total) = &settings.derived.total_group {
            let is_group = sections
                .iter()
                .flat_map(|s| &s.questions)
                .flat_map(Question::flatten)
                .any(|q| q.id() == total && matches!(q, Question::Group(_)));
            if !is_group {
                return Err(SurveyError::InvalidDerivedGroup { id: total.clone() });
            }
        }

        Ok(Self {
            id,
            title: settings.title,
            gateway_field,
            sections,
            security: settings.security,
            risk: settings.risk,
            derived: settings.derived,
            gateway_pos,
        })
    }

    /// Parse and validate a TOML survey definition.
    pub fn from_toml_str(source: &str) -> SurveyResult<Self> {
        let def: SurveyDef = toml::from_str(source).map_err(|e| SurveyError::Parse {
            message: e.to_string(),
        })?;
        def.into_survey()
    }

    /// Load a survey definition from disk.
    pub fn load(path: &Path) -> SurveyResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| SurveyError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let survey = Self::from_toml_str(&source)?;
        tracing::info!(
            survey = %survey.id,
            sections = survey.sections.len(),
            path = %path.display(),
            "survey definition loaded"
        );
        Ok(survey)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn gateway_field(&self) -> &str {
        &self.gateway_field
    }

    /// The gateway question itself.
    pub fn gateway(&self) -> &Question {
        &self.sections[self.gateway_pos.0].questions[self.gateway_pos.1]
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub fn risk(&self) -> &RiskSettings {
        &self.risk
    }

    pub fn derived(&self) -> &DerivedFields {
        &self.derived
    }

    /// Top-level questions across all sections, in order.
    pub fn questions(&self) -> impl Iterator<Item = &Question> {
        self.sections.iter().flat_map(|s| s.questions.iter())
    }

    /// Every question including nested follow-ups.
    pub fn all_questions(&self) -> Vec<&Question> {
        self.questions().flat_map(Question::flatten).collect()
    }

    /// Find any question (top-level or follow-up) by id.
    pub fn find(&self, id: &str) -> Option<&Question> {
        self.all_questions().into_iter().find(|q| q.id() == id)
    }
}

fn check_question(question: &Question, seen: &mut HashSet<String>) -> SurveyResult<()> {
    claim_id(question.id(), seen)?;
    match question {
        Question::Scalar(field) => check_field(field),
        Question::WithFollowUp { parent, follow_up } => {
            check_field(parent)?;
            check_question(&follow_up.question, seen)
        }
        Question::Group(group) => {
            if group.inputs.is_empty() {
                return Err(SurveyError::InvalidQuestion {
                    id: group.id.clone(),
                    message: "multiNumber question needs at least one number input".into(),
                });
            }
            for input in &group.inputs {
                claim_id(&input.id, seen)?;
                check_range(&input.id, input.min, input.max)?;
                check_finite(&input.id, "default", Some(input.default))?;
            }
            Ok(())
        }
    }
}

fn claim_id(id: &str, seen: &mut HashSet<String>) -> SurveyResult<()> {
    if id.trim().is_empty() {
        return Err(SurveyError::InvalidQuestion {
            id: id.to_string(),
            message: "question id must not be empty".into(),
        });
    }
    if RESERVED_IDS.contains(&id) {
        return Err(SurveyError::ReservedId { id: id.to_string() });
    }
    if !seen.insert(id.to_string()) {
        return Err(SurveyError::DuplicateId { id: id.to_string() });
    }
    Ok(())
}

fn check_field(field: &Field) -> SurveyResult<()> {
    if field.kind == FieldKind::MultiNumber {
        return Err(SurveyError::InvalidQuestion {
            id: field.id.clone(),
            message: "multiNumber questions must be declared as groups".into(),
        });
    }
    if field.kind.is_enumerated() {
        if field.options.is_empty() {
            return Err(SurveyError::MissingOptions {
                id: field.id.clone(),
                kind: field.kind.to_string(),
            });
        }
        let mut values = HashSet::new();
        for option in &field.options {
            if !values.insert(option.value.as_str()) {
                return Err(SurveyError::InvalidQuestion {
                    id: field.id.clone(),
                    message: format!("option value \"{}\" appears twice", option.value),
                });
            }
        }
    }
    check_range(&field.id, field.bounds.min, field.bounds.max)?;
    if let Some(lo) = field.bounds.min_length {
        // Truncation runs before validation, so the cap bounds every answer.
        let cap = crate::sanitize::text_limit(field);
        if lo > cap {
            return Err(SurveyError::InvalidQuestion {
                id: field.id.clone(),
                message: format!("min_length {lo} exceeds the length cap {cap}"),
            });
        }
    }
    Ok(())
}

fn check_finite(id: &str, bound: &'static str, value: Option<f64>) -> SurveyResult<()> {
    match value {
        Some(v) if !v.is_finite() => Err(SurveyError::NonFiniteBound {
            id: id.to_string(),
            bound,
        }),
        _ => Ok(()),
    }
}

fn check_range(id: &str, min: Option<f64>, max: Option<f64>) -> SurveyResult<()> {
    check_finite(id, "min", min)?;
    check_finite(id, "max", max)?;
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(SurveyError::InvalidBounds {
                id: id.to_string(),
                min,
                max,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TOML definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SurveyDef {
    id: String,
    #[serde(default)]
    title: String,
    gateway_field: String,
    #[serde(default)]
    security: SecuritySettings,
    #[serde(default)]
    risk: RiskSettings,
    #[serde(default)]
    derived: DerivedFields,
    #[serde(default)]
    sections: Vec<SectionDef>,
}

#[derive(Debug, Deserialize)]
struct SectionDef {
    #[serde(default)]
    title: String,
    #[serde(default)]
    questions: Vec<QuestionDef>,
}

#[derive(Debug, Deserialize)]
struct OptionDef {
    value: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    applies_to: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct NumberInputDef {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    default: f64,
}

#[derive(Debug, Deserialize)]
struct QuestionDef {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(rename = "type")]
    kind: FieldKind,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    max_length: Option<usize>,
    #[serde(default)]
    options: Vec<OptionDef>,
    #[serde(default)]
    applies_to: Option<Vec<String>>,
    #[serde(default)]
    follow_up: Option<Box<FollowUpDef>>,
    #[serde(default)]
    number_inputs: Vec<NumberInputDef>,
    #[serde(default)]
    sensitive: bool,
    #[serde(default)]
    crisis_check: bool,
    #[serde(default)]
    crisis_keywords: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FollowUpDef {
    show_if: ShowIf,
    #[serde(flatten)]
    question: QuestionDef,
}

impl SurveyDef {
    fn into_survey(self) -> SurveyResult<Survey> {
        let sections = self
            .sections
            .into_iter()
            .map(|s| {
                Ok(Section {
                    title: s.title,
                    questions: s
                        .questions
                        .into_iter()
                        .map(QuestionDef::into_question)
                        .collect::<SurveyResult<_>>()?,
                })
            })
            .collect::<SurveyResult<Vec<_>>>()?;
        Survey::new(
            self.id,
            self.gateway_field,
            sections,
            SurveySettings {
                title: self.title,
                security: self.security,
                risk: self.risk,
                derived: self.derived,
            },
        )
    }
}

impl QuestionDef {
    fn into_question(self) -> SurveyResult<Question> {
        if self.kind == FieldKind::MultiNumber {
            if self.follow_up.is_some() {
                return Err(SurveyError::InvalidQuestion {
                    id: self.id,
                    message: "multiNumber questions cannot carry a follow-up".into(),
                });
            }
            return Ok(Question::Group(GroupField {
                id: self.id,
                label: self.label,
                required: self.required,
                applies_to: self.applies_to.into(),
                inputs: self
                    .number_inputs
                    .into_iter()
                    .map(|n| NumberInput {
                        id: n.id,
                        label: n.label,
                        min: n.min,
                        max: n.max,
                        default: n.default,
                    })
                    .collect(),
            }));
        }

        if !self.number_inputs.is_empty() {
            return Err(SurveyError::InvalidQuestion {
                id: self.id,
                message: format!("number_inputs are only valid on multiNumber, not {}", self.kind),
            });
        }

        let follow_up = self.follow_up;
        let field = Field {
            id: self.id,
            label: self.label,
            kind: self.kind,
            required: self.required,
            bounds: Bounds {
                min: self.min,
                max: self.max,
                min_length: self.min_length,
                max_length: self.max_length,
            },
            options: self
                .options
                .into_iter()
                .map(|o| SelectOption {
                    label: o.label.unwrap_or_else(|| o.value.clone()),
                    value: o.value,
                    applies_to: o.applies_to.into(),
                })
                .collect(),
            applies_to: self.applies_to.into(),
            sensitive: self.sensitive,
            crisis_check: self.crisis_check,
            crisis_keywords: self.crisis_keywords,
        };

        match follow_up {
            None => Ok(Question::Scalar(field)),
            Some(fu) => {
                let fu = *fu;
                Ok(Question::WithFollowUp {
                    parent: field,
                    follow_up: Box::new(FollowUp {
                        show_if: fu.show_if,
                        question: fu.question.into_question()?,
                    }),
                })
            }
        }
    }
}
