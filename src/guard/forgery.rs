//! Cross-site request forgery defences: an origin allow-list and a
//! per-session anti-forgery token.
//!
//! Allow-list entries are hosts (`example.org`) or origins
//! (`https://example.org`). A request host matches an entry exactly or as a
//! subdomain of it. An empty allow-list admits nothing.

use serde::Serialize;
use subtle::ConstantTimeEq;
use url::Url;

use crate::survey::SecuritySettings;

/// Origin evidence carried by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    /// `Origin` header.
    pub origin: Option<String>,
    /// `Referer` header.
    pub referer: Option<String>,
    /// Origin of the page embedding the form, as reported by the embed script.
    pub embed_origin: Option<String>,
}

/// Why a request was rejected as a possible forgery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForgeryRejection {
    InvalidOrigin,
    CsrfMissing,
    CsrfInvalid,
}

/// A passed origin check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginCheck {
    /// The request came from an allowed embedding page.
    pub embedded: bool,
}

/// Origin and token checks for one survey.
#[derive(Debug, Clone)]
pub struct ForgeryGuard {
    allowed_hosts: Vec<String>,
    csrf_enabled: bool,
}

impl ForgeryGuard {
    pub fn new<I, S>(allowed_origins: I, csrf_enabled: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_hosts = allowed_origins
            .into_iter()
            .filter_map(|entry| normalize_entry(entry.as_ref()))
            .collect();
        Self {
            allowed_hosts,
            csrf_enabled,
        }
    }

    pub fn from_settings(settings: &SecuritySettings) -> Self {
        Self::new(&settings.allowed_origins, settings.csrf_enabled)
    }

    pub fn csrf_enabled(&self) -> bool {
        self.csrf_enabled
    }

    /// Whether a bare host is on the allow-list.
    pub fn host_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Whether a full origin or URL string names an allowed host.
    pub fn origin_allowed(&self, candidate: &str) -> bool {
        url_host(candidate).is_some_and(|host| self.host_allowed(&host))
    }

    /// Check where the request came from.
    ///
    /// A present `Origin` header is authoritative and must be allowed.
    /// Without one, either the `Referer` or the embed marker must be.
    pub fn check_origin(&self, request: &RequestOrigin) -> Result<OriginCheck, ForgeryRejection> {
        let embedded = request
            .embed_origin
            .as_deref()
            .is_some_and(|o| self.origin_allowed(o));

        if let Some(origin) = request.origin.as_deref().filter(|o| !o.trim().is_empty()) {
            return if self.origin_allowed(origin) {
                Ok(OriginCheck { embedded })
            } else {
                Err(ForgeryRejection::InvalidOrigin)
            };
        }

        let referer_ok = request
            .referer
            .as_deref()
            .is_some_and(|r| self.origin_allowed(r));
        if referer_ok || embedded {
            Ok(OriginCheck { embedded })
        } else {
            Err(ForgeryRejection::InvalidOrigin)
        }
    }

    /// Compare the submitted token with the one held by the session.
    ///
    /// A session with no token is accepted only when the request was
    /// independently verified as coming from an allowed embedding page.
    pub fn check_token(
        &self,
        submitted: Option<&str>,
        session: Option<&str>,
        origin: OriginCheck,
    ) -> Result<(), ForgeryRejection> {
        if !self.csrf_enabled {
            return Ok(());
        }
        let Some(expected) = session.filter(|s| !s.is_empty()) else {
            if origin.embedded {
                tracing::debug!("no session token; accepting verified embedded request");
                return Ok(());
            }
            return Err(ForgeryRejection::CsrfMissing);
        };
        let Some(submitted) = submitted.map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(ForgeryRejection::CsrfMissing);
        };
        if bool::from(submitted.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(ForgeryRejection::CsrfInvalid)
        }
    }
}

fn normalize_entry(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if entry.contains("://") {
        return url_host(entry);
    }
    let host = entry
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .trim_end_matches('.')
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

fn url_host(candidate: &str) -> Option<String> {
    let url = Url::parse(candidate.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()
        .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
}
