//! Authenticated browsing session
//!
//! One portal login is an expensive, partly human-driven process (the
//! multi-factor prompt must be approved on a phone), so the agent keeps a
//! single session alive and persists its storage state between runs.
//!
//! # State machine
//!
//! ```text
//!  Unauthenticated ──► Authenticating ──► AwaitingChallenge
//!        ▲                 │     │               │
//!        └──── failure ────┘     ▼               ▼
//!                           Authenticated ◄──────┘
//!                                │
//!                                ▼
//!                             Expired ──► Authenticating
//! ```
//!
//! Every transition goes through [`AuthState::can_transition_to`] and is
//! broadcast as a [`SessionEvent`].

mod manager;
mod store;

pub use manager::SessionManager;
pub use store::{SessionStore, StoredState};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::portal::Portal;

/// Authentication state of the shared session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    /// Waiting for a human to approve the multi-factor prompt
    AwaitingChallenge,
    Authenticated,
    /// Was authenticated; idle too long or the portal logged us out
    Expired,
}

impl AuthState {
    pub fn can_transition_to(self, next: AuthState) -> bool {
        use AuthState::*;
        matches!(
            (self, next),
            (Unauthenticated, Authenticating)
                | (Authenticating, AwaitingChallenge)
                | (Authenticating, Authenticated)
                | (Authenticating, Unauthenticated)
                | (AwaitingChallenge, Authenticated)
                | (AwaitingChallenge, Unauthenticated)
                | (Authenticated, Expired)
                | (Expired, Authenticating)
        )
    }

    /// States in which a login attempt is running
    pub fn is_in_flight(self) -> bool {
        matches!(self, AuthState::Authenticating | AuthState::AwaitingChallenge)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticating => "authenticating",
            AuthState::AwaitingChallenge => "awaiting_challenge",
            AuthState::Authenticated => "authenticated",
            AuthState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A state transition, as observed by subscribers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionEvent {
    pub from: AuthState,
    pub to: AuthState,
    pub at: DateTime<Utc>,
}

/// Serializable snapshot of the session
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub profile: String,
    pub state: AuthState,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    /// When the persisted storage state was last written or loaded
    pub stored_state_at: Option<DateTime<Utc>>,
    pub generation: u64,
}

/// Exclusive access to the authenticated browsing context
///
/// The lease is released when the handle is dropped. Only one handle exists
/// at a time, so everything done through [`SessionHandle::portal`] is
/// serialized.
pub struct SessionHandle {
    _lease: OwnedMutexGuard<()>,
    portal: Arc<dyn Portal>,
    generation: u64,
}

impl SessionHandle {
    pub(crate) fn new(lease: OwnedMutexGuard<()>, portal: Arc<dyn Portal>) -> Self {
        Self {
            _lease: lease,
            portal,
            generation: 0,
        }
    }

    pub fn portal(&self) -> &dyn Portal {
        self.portal.as_ref()
    }

    /// Authenticated lifetime this handle was issued for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
