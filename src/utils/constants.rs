//! Browser constants shared by the launcher and the portal driver

/// User agent presented to the portal
///
/// Keep within a few releases of current Chrome stable; the identity
/// provider rejects very old agents.
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// First polling interval of [`super::wait_for_view`]
pub const INITIAL_POLL_MS: u64 = 100;

/// Polling interval cap of [`super::wait_for_view`]
pub const MAX_POLL_MS: u64 = 1_000;
