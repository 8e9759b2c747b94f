//! Driver seam between the orchestration core and the browser
//!
//! The core only ever talks to the portal through [`Portal`]. The production
//! implementation is [`crate::ChromePortal`]; tests use a scripted fake.

pub mod selectors;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Credentials;
use crate::error::PortalResult;
use crate::types::RenderedPage;

/// Outcome of submitting credentials on the sign-in page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    /// Dashboard reached without a second factor
    Authenticated,
    /// Portal is waiting for out-of-band approval
    ChallengeIssued,
    /// Credentials were not accepted
    Rejected(String),
}

/// State of a pending multi-factor challenge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Approved,
    /// A fresh prompt replaced the one being waited on
    Reissued,
    Denied,
}

/// Operations the core needs from one exclusive browsing context
///
/// Every method may navigate, so callers must hold the session lease.
#[async_trait]
pub trait Portal: Send + Sync {
    /// Load a previously exported storage-state blob into the browser
    async fn restore_state(&self, blob: &[u8]) -> PortalResult<()>;

    /// Export the current storage state as an opaque blob
    async fn export_state(&self) -> PortalResult<Vec<u8>>;

    /// Whether an authenticated-only view (the dashboard) is reachable
    async fn probe(&self) -> PortalResult<bool>;

    async fn submit_credentials(&self, credentials: &Credentials) -> PortalResult<LoginStep>;

    async fn challenge_status(&self) -> PortalResult<ChallengeStatus>;

    /// Run one search and return the rendered results view
    async fn search(&self, query: &str) -> PortalResult<RenderedPage>;

    /// Open a document view by identifier
    async fn open_document(&self, doc_id: &str) -> PortalResult<RenderedPage>;

    /// Release the browser; the default is a no-op for drivers without one
    async fn close(&self) -> PortalResult<()> {
        Ok(())
    }
}
