//! Diagnostic error types for the intake gateway.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. None of these ever reach
//! an anonymous caller verbatim: the gateway maps them onto the opaque
//! [`ErrorCode`](crate::gateway::ErrorCode) taxonomy and logs the detail.

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::paths::PathError;

/// Top-level error type for the intake gateway.
#[derive(Debug, Error, Diagnostic)]
pub enum GatewayError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Survey(#[from] SurveyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),

    #[error("section {index} does not exist (survey has {count} sections)")]
    #[diagnostic(
        code(intake::gateway::no_such_section),
        help("Step validation takes a zero-based section index.")
    )]
    NoSuchSection { index: usize, count: usize },
}

/// Result type for top-level gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

// ---------------------------------------------------------------------------
// Survey configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SurveyError {
    #[error("failed to read survey definition: {path}")]
    #[diagnostic(
        code(intake::survey::read),
        help("Check that the survey file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse survey definition: {message}")]
    #[diagnostic(
        code(intake::survey::parse),
        help("Check the TOML syntax and that every question has an `id` and a `type`.")
    )]
    Parse { message: String },

    #[error("duplicate question id \"{id}\"")]
    #[diagnostic(
        code(intake::survey::duplicate_id),
        help(
            "Question ids must be unique across the whole survey, \
             including follow-ups and multi-number sub-fields."
        )
    )]
    DuplicateId { id: String },

    #[error("question id \"{id}\" is reserved")]
    #[diagnostic(
        code(intake::survey::reserved_id),
        help("`consent_given` and `csrf_token` are managed by the gateway itself.")
    )]
    ReservedId { id: String },

    #[error("gateway field \"{id}\" is not a top-level question")]
    #[diagnostic(
        code(intake::survey::unknown_gateway),
        help("Set `gateway_field` to the id of a select or radio question in one of the sections.")
    )]
    UnknownGatewayField { id: String },

    #[error("gateway field \"{id}\" must be a select or radio question, found {kind}")]
    #[diagnostic(
        code(intake::survey::gateway_kind),
        help("The gateway answer selects the applicable question subset, so it must be single-choice.")
    )]
    GatewayKind { id: String, kind: String },

    #[error("question \"{id}\" of type {kind} has no options")]
    #[diagnostic(
        code(intake::survey::missing_options),
        help("Select, radio and checkbox questions need at least one `[[options]]` entry.")
    )]
    MissingOptions { id: String, kind: String },

    #[error("question \"{id}\" has min {min} greater than max {max}")]
    #[diagnostic(
        code(intake::survey::bounds),
        help("Swap the bounds or remove one of them.")
    )]
    InvalidBounds { id: String, min: f64, max: f64 },

    #[error("question \"{id}\" has a non-finite {bound}")]
    #[diagnostic(
        code(intake::survey::non_finite_bound),
        help("Numeric bounds and defaults must be ordinary numbers, not nan or inf.")
    )]
    NonFiniteBound { id: String, bound: &'static str },

    #[error("question \"{id}\" is invalid: {message}")]
    #[diagnostic(code(intake::survey::invalid_question))]
    InvalidQuestion { id: String, message: String },

    #[error("derived total group \"{id}\" is not a multi-number question")]
    #[diagnostic(
        code(intake::survey::derived_group),
        help("`[derived] total_group` must name a question of type multiNumber.")
    )]
    InvalidDerivedGroup { id: String },
}

/// Result type for survey loading.
pub type SurveyResult<T> = std::result::Result<T, SurveyError>;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(intake::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(intake::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             If another process holds the database open, stop it or point \
             this instance at a different data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(intake::store::serde),
        help(
            "Failed to serialize or deserialize a stored record. \
             The stored data format may have changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("a submission with fingerprint {fingerprint} already exists")]
    #[diagnostic(
        code(intake::store::duplicate),
        help("An identical submission was already accepted. No action needed.")
    )]
    Duplicate { fingerprint: String },

    #[error("store at {path} is locked by another process")]
    #[diagnostic(
        code(intake::store::locked),
        help(
            "One process owns a data directory at a time, usually a running intaked. \
             Use its /admin routes, or stop it before running this command."
        )
    )]
    Locked { path: String },

    #[error("store unavailable: {message}")]
    #[diagnostic(code(intake::store::unavailable))]
    Unavailable { message: String },
}

impl StoreError {
    /// Whether this error is a uniqueness-constraint violation.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}
