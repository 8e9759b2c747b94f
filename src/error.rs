//! Error taxonomy shared by every portal operation.
//!
//! Errors are classified once, at the point where they are produced, so the
//! orchestrator and fetcher can decide locally whether an operation is worth
//! retrying. Everything that is not transient propagates to the caller.

use std::time::Duration;

use chromiumoxide::error::CdpError;
use thiserror::Error;

/// Errors that can occur while driving the support portal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortalError {
    /// Credentials rejected, missing, or the challenge was denied
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Multi-factor challenge not approved within the wait window
    #[error("Multi-factor approval not received within {}s", .0.as_secs())]
    AuthenticationTimeout(Duration),

    /// A single navigation or query exceeded its time budget
    #[error("Navigation timed out after {ms}ms: {what}", ms = .0.as_millis(), what = .1)]
    NavigationTimeout(Duration, String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The portal showed its sign-in page where an authenticated view was expected
    #[error("Session is logged out: {0}")]
    LoggedOut(String),

    /// Page structure not recognized, most likely an upstream UI change
    #[error("Unrecognized page structure: {0}")]
    Parse(String),

    #[error("Query derivation failed: {0}")]
    Derivation(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Waited too long for the exclusive browsing context
    #[error("Browsing session busy for more than {}s", .0.as_secs())]
    LeaseTimeout(Duration),
}

impl PortalError {
    /// Whether an immediate retry is likely to succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PortalError::NavigationTimeout(..)
                | PortalError::TransientNetwork(_)
                | PortalError::LoggedOut(_)
        )
    }

    /// Whether the failure came out of the authentication flow
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            PortalError::Authentication(_) | PortalError::AuthenticationTimeout(_)
        )
    }

    /// Stable machine-readable code used in per-query error markers
    pub fn kind(&self) -> &'static str {
        match self {
            PortalError::Authentication(_) => "authentication_error",
            PortalError::AuthenticationTimeout(_) => "authentication_timeout",
            PortalError::NavigationTimeout(..) => "navigation_timeout",
            PortalError::TransientNetwork(_) => "transient_network_error",
            PortalError::LoggedOut(_) => "logged_out",
            PortalError::Parse(_) => "parse_error",
            PortalError::Derivation(_) => "derivation_error",
            PortalError::Browser(_) => "browser_error",
            PortalError::Storage(_) => "storage_error",
            PortalError::InvalidRequest(_) => "invalid_request",
            PortalError::LeaseTimeout(_) => "session_busy",
        }
    }
}

impl From<CdpError> for PortalError {
    fn from(err: CdpError) -> Self {
        match err {
            CdpError::Timeout => PortalError::NavigationTimeout(
                Duration::ZERO,
                "CDP request timed out".to_string(),
            ),
            CdpError::Ws(e) => PortalError::TransientNetwork(e.to_string()),
            CdpError::Io(e) => PortalError::TransientNetwork(e.to_string()),
            CdpError::NoResponse => {
                PortalError::TransientNetwork("no response from browser".to_string())
            }
            // Element lookups race with SPA re-renders
            CdpError::NotFound => PortalError::TransientNetwork("stale or missing element".to_string()),
            other => PortalError::Browser(other.to_string()),
        }
    }
}

impl From<std::io::Error> for PortalError {
    fn from(err: std::io::Error) -> Self {
        PortalError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(err: serde_json::Error) -> Self {
        PortalError::Storage(format!("JSON error: {err}"))
    }
}

pub type PortalResult<T> = Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PortalError::TransientNetwork("reset".into()).is_transient());
        assert!(PortalError::NavigationTimeout(Duration::from_secs(1), "q".into()).is_transient());
        assert!(PortalError::LoggedOut("sign-in page".into()).is_transient());

        assert!(!PortalError::Parse("layout".into()).is_transient());
        assert!(!PortalError::Authentication("bad password".into()).is_transient());
        assert!(!PortalError::AuthenticationTimeout(Duration::from_secs(120)).is_transient());
        assert!(!PortalError::Derivation("llm down".into()).is_transient());
    }

    #[test]
    fn test_kind_codes_are_distinct() {
        let errors = [
            PortalError::Authentication(String::new()),
            PortalError::AuthenticationTimeout(Duration::ZERO),
            PortalError::NavigationTimeout(Duration::ZERO, String::new()),
            PortalError::TransientNetwork(String::new()),
            PortalError::LoggedOut(String::new()),
            PortalError::Parse(String::new()),
            PortalError::Derivation(String::new()),
            PortalError::Browser(String::new()),
            PortalError::Storage(String::new()),
            PortalError::InvalidRequest(String::new()),
            PortalError::LeaseTimeout(Duration::ZERO),
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_display_includes_durations() {
        let err = PortalError::AuthenticationTimeout(Duration::from_secs(180));
        assert_eq!(err.to_string(), "Multi-factor approval not received within 180s");

        let err = PortalError::NavigationTimeout(Duration::from_millis(1500), "ORA-600".into());
        assert_eq!(err.to_string(), "Navigation timed out after 1500ms: ORA-600");
    }
}
