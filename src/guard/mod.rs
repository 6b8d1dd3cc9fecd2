//! Request guards that run before any answer is looked at.
//!
//! - [`forgery`]: origin allow-list and anti-forgery token checks
//! - [`rate_limit`]: per-client attempt counting with escalating blocks
//! - [`monitor`]: read-side views over the violation audit for operators

pub mod forgery;
pub mod monitor;
pub mod rate_limit;

pub use forgery::{ForgeryGuard, ForgeryRejection, OriginCheck, RequestOrigin};
pub use monitor::{AbuseMonitor, PurgeReport, ViolationSummary};
pub use rate_limit::{AbuseGuard, ClientIdentity, RateDecision, RateLimitConfig};
