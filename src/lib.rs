// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # intake-gateway
//!
//! Submission gateway for anonymous evidence-intake surveys: everything
//! between "an untrusted client sent a form" and "a validated, sanitized
//! record is stored".
//!
//! ## Architecture
//!
//! - **Survey model** (`survey`): typed questions, gateway field, follow-ups
//! - **Resolver** (`resolver`): which questions apply to the current answers
//! - **Sanitizer** (`sanitize`): type-aware, idempotent normalisation
//! - **Schema** (`schema`): compiled per-field validation rules
//! - **Risk** (`risk`): non-blocking crisis-indicator scanning
//! - **Guards** (`guard`): origin allow-list, anti-forgery token, rate limiting
//! - **Store** (`store`): attempts, blocks, violations, submissions (DashMap or redb)
//! - **Gateway** (`gateway`): the ordered pipeline tying it together
//!
//! ## Library usage
//!
//! ```no_run
//! use intake_gateway::gateway::{RequestContext, SubmissionGateway};
//! use intake_gateway::guard::{ClientIdentity, RequestOrigin};
//! use intake_gateway::store;
//! use intake_gateway::survey::{RawForm, Survey};
//!
//! let survey = Survey::load(std::path::Path::new("survey.toml")).unwrap();
//! let gateway = SubmissionGateway::new(survey, store::memory_only());
//!
//! let context = RequestContext {
//!     client: ClientIdentity::new("203.0.113.7", Some("Mozilla/5.0")),
//!     origin: RequestOrigin {
//!         origin: Some("https://example.org".into()),
//!         ..RequestOrigin::default()
//!     },
//!     session_token: Some("token-from-session".into()),
//! };
//! let form = RawForm::from_pairs([
//!     ("parent_type", "paying"),
//!     ("consent_given", "true"),
//!     ("csrf_token", "token-from-session"),
//! ]);
//! let response = gateway.submit(&context, form);
//! println!("{}", serde_json::to_string(&response).unwrap());
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod paths;
pub mod resolver;
pub mod risk;
pub mod sanitize;
pub mod schema;
pub mod store;
pub mod submission;
pub mod survey;
