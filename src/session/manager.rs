//! Owner of the session state machine and the exclusive browsing lease

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{AuthState, SessionEvent, SessionHandle, SessionStatus, SessionStore};
use crate::error::{PortalError, PortalResult};
use crate::portal::{ChallengeStatus, LoginStep, Portal};
use crate::{Credentials, SessionConfig};

const EVENT_CAPACITY: usize = 32;

/// Mutable session record, only touched under the state mutex
#[derive(Debug)]
struct Session {
    state: AuthState,
    created_at: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
    last_used_at: Option<Instant>,
    stored_state_at: Option<DateTime<Utc>>,
    generation: u64,
    /// Incremented every time a login attempt starts
    attempt_seq: u64,
    /// Most recent failed attempt, shared with callers that waited on it
    last_failure: Option<(u64, PortalError)>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            created_at: None,
            last_used: None,
            last_used_at: None,
            stored_state_at: None,
            generation: 0,
            attempt_seq: 0,
            last_failure: None,
        }
    }
}

/// Hands out authenticated [`SessionHandle`]s, logging in when needed
///
/// # Concurrency
///
/// The browsing context is a single-writer resource guarded by a
/// `tokio::sync::Mutex` lease held by each [`SessionHandle`]. Login runs while
/// holding that lease, so at most one attempt is in flight per profile. A
/// caller that queued behind an attempt receives that attempt's outcome
/// instead of starting another one.
///
/// The session record itself sits behind a `parking_lot::Mutex` and is never
/// held across an `.await`.
pub struct SessionManager {
    portal: Arc<dyn Portal>,
    store: SessionStore,
    credentials: Option<Credentials>,
    config: SessionConfig,
    lease: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        portal: Arc<dyn Portal>,
        store: SessionStore,
        credentials: Option<Credentials>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            portal,
            store,
            credentials,
            config,
            lease: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(Session::new()),
            events,
        }
    }

    pub fn profile(&self) -> &str {
        self.store.profile()
    }

    /// Acquire the authenticated browsing context
    ///
    /// Waits up to `acquire_timeout` for the lease, then restores stored state
    /// or logs in as needed. A multi-factor prompt is waited on for at most
    /// `challenge_timeout`.
    pub async fn acquire(&self) -> PortalResult<SessionHandle> {
        let (baseline, was_in_flight) = {
            let s = self.state.lock();
            (s.attempt_seq, s.state.is_in_flight())
        };

        let wait = self.config.acquire_timeout();
        let lease = tokio::time::timeout(wait, self.lease.clone().lock_owned())
            .await
            .map_err(|_| PortalError::LeaseTimeout(wait))?;
        let mut handle = SessionHandle::new(lease, self.portal.clone());

        self.expire_if_idle();
        {
            let s = self.state.lock();
            if s.state == AuthState::Authenticated {
                handle.set_generation(s.generation);
                drop(s);
                self.touch();
                return Ok(handle);
            }
            if let Some((seq, err)) = &s.last_failure {
                if *seq > baseline || (was_in_flight && *seq == baseline) {
                    debug!("Sharing outcome of login attempt #{}: {}", seq, err);
                    return Err(err.clone());
                }
            }
        }

        self.authenticate(&mut handle).await?;
        Ok(handle)
    }

    /// Re-probe the portal while holding the lease, logging in again if needed
    ///
    /// Used before retrying an operation whose failure may have been caused by
    /// a silently expired session.
    pub async fn revalidate(&self, handle: &mut SessionHandle) -> PortalResult<()> {
        self.expire_if_idle();
        if self.state() == AuthState::Authenticated {
            if self.probe_authenticated().await? {
                handle.set_generation(self.state.lock().generation);
                return Ok(());
            }
            self.mark_expired("probe landed on the sign-in page");
        }
        self.authenticate(handle).await
    }

    /// Record a logged-out signal observed by any operation
    pub fn mark_expired(&self, reason: &str) {
        if self.transition(AuthState::Expired, |_| ()).is_some() {
            warn!("Session for profile '{}' expired: {}", self.profile(), reason);
        }
    }

    /// Expire the session and discard its stored state
    pub async fn invalidate(&self) -> PortalResult<()> {
        self.mark_expired("invalidated on request");
        self.state.lock().stored_state_at = None;
        self.store.clear().await
    }

    /// Refresh the idle timer
    pub fn touch(&self) {
        let mut s = self.state.lock();
        s.last_used = Some(Utc::now());
        s.last_used_at = Some(Instant::now());
    }

    pub fn state(&self) -> AuthState {
        self.state.lock().state
    }

    /// Generation of the current authenticated lifetime, `None` if not authenticated
    pub fn current_generation(&self) -> Option<u64> {
        self.expire_if_idle();
        let s = self.state.lock();
        (s.state == AuthState::Authenticated).then_some(s.generation)
    }

    pub fn status(&self) -> SessionStatus {
        self.expire_if_idle();
        let s = self.state.lock();
        SessionStatus {
            profile: self.profile().to_string(),
            state: s.state,
            created_at: s.created_at,
            last_used: s.last_used,
            stored_state_at: s.stored_state_at,
            generation: s.generation,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn expire_if_idle(&self) {
        let idle = self.config.idle_timeout();
        let stale = {
            let s = self.state.lock();
            s.state == AuthState::Authenticated
                && s.last_used_at.is_some_and(|t| t.elapsed() > idle)
        };
        if stale {
            self.mark_expired(&format!("idle for more than {}s", idle.as_secs()));
        }
    }

    /// Apply a checked transition, running `update` under the same lock
    fn transition<R>(&self, next: AuthState, update: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let (event, out) = {
            let mut s = self.state.lock();
            if !s.state.can_transition_to(next) {
                debug!("Rejected session transition {} -> {}", s.state, next);
                return None;
            }
            let from = s.state;
            s.state = next;
            let out = update(&mut s);
            (
                SessionEvent {
                    from,
                    to: next,
                    at: Utc::now(),
                },
                out,
            )
        };
        info!(profile = %self.profile(), from = %event.from, to = %event.to, "Session state changed");
        // No subscribers is fine
        let _ = self.events.send(event);
        Some(out)
    }

    async fn authenticate(&self, handle: &mut SessionHandle) -> PortalResult<()> {
        let from = self.state();
        let Some(attempt) = self.transition(AuthState::Authenticating, |s| {
            s.attempt_seq += 1;
            s.attempt_seq
        }) else {
            return Err(PortalError::Authentication(format!(
                "cannot start login from state {from}"
            )));
        };
        debug!("Login attempt #{} for profile '{}'", attempt, self.profile());

        let mut guard = AttemptGuard {
            manager: self,
            armed: true,
        };
        let result = match self.run_attempt(from).await {
            Ok(()) => Ok(self.persist_state().await),
            Err(e) => Err(e),
        };
        guard.armed = false;

        match result {
            Ok(stored_at) => {
                let generation = self
                    .transition(AuthState::Authenticated, |s| {
                        let now = Utc::now();
                        s.generation += 1;
                        s.created_at = Some(now);
                        s.last_used = Some(now);
                        s.last_used_at = Some(Instant::now());
                        s.last_failure = None;
                        if stored_at.is_some() {
                            s.stored_state_at = stored_at;
                        }
                        s.generation
                    })
                    .ok_or_else(|| {
                        PortalError::Authentication("session state changed during login".to_string())
                    })?;
                handle.set_generation(generation);
                info!("Profile '{}' authenticated (generation {})", self.profile(), generation);
                Ok(())
            }
            Err(e) => {
                warn!("Login attempt #{} failed: {}", attempt, e);
                self.transition(AuthState::Unauthenticated, |s| {
                    s.last_failure = Some((attempt, e.clone()));
                });
                Err(e)
            }
        }
    }

    async fn run_attempt(&self, from: AuthState) -> PortalResult<()> {
        if from == AuthState::Unauthenticated {
            self.restore_stored_state().await;
        }

        if self.probe_authenticated().await? {
            info!("Existing portal session is still valid, no login needed");
            return Ok(());
        }

        let credentials = self.credentials.as_ref().ok_or_else(|| {
            PortalError::Authentication(
                "no login credentials configured (MOS_LOGIN_USER / MOS_LOGIN_PASSWORD)".to_string(),
            )
        })?;

        info!("Submitting credentials for {}", credentials.username);
        match self.portal.submit_credentials(credentials).await? {
            LoginStep::Authenticated => Ok(()),
            LoginStep::Rejected(reason) => Err(PortalError::Authentication(reason)),
            LoginStep::ChallengeIssued => {
                self.transition(AuthState::AwaitingChallenge, |_| ());
                warn!(
                    "Multi-factor approval required for profile '{}': approve the prompt within {}s",
                    self.profile(),
                    self.config.challenge_timeout().as_secs()
                );
                self.wait_for_challenge().await
            }
        }
    }

    async fn wait_for_challenge(&self) -> PortalResult<()> {
        let window = self.config.challenge_timeout();
        let poll = self.config.challenge_poll();

        let wait = async {
            loop {
                match self.portal.challenge_status().await {
                    Ok(ChallengeStatus::Pending) => {}
                    Ok(ChallengeStatus::Approved) => return Ok(()),
                    Ok(ChallengeStatus::Reissued) => {
                        warn!("A new multi-factor prompt replaced the pending one");
                        return Err(PortalError::AuthenticationTimeout(window));
                    }
                    Ok(ChallengeStatus::Denied) => {
                        return Err(PortalError::Authentication(
                            "multi-factor challenge was denied".to_string(),
                        ));
                    }
                    Err(e) if e.is_transient() => debug!("Challenge status check failed: {}", e),
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(window, wait).await {
            Ok(result) => result,
            Err(_) => Err(PortalError::AuthenticationTimeout(window)),
        }
    }

    async fn probe_authenticated(&self) -> PortalResult<bool> {
        match self.portal.probe().await {
            Ok(authenticated) => Ok(authenticated),
            Err(PortalError::LoggedOut(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn restore_stored_state(&self) {
        let stored = match self.store.load().await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!("No stored session state for profile '{}'", self.profile());
                return;
            }
            Err(e) => {
                warn!("Ignoring unreadable session state: {}", e);
                return;
            }
        };

        let age = stored.age(Utc::now());
        if age > self.config.state_max_age() {
            info!(
                "Stored session state is {}h old, not restoring",
                age.as_secs() / 3600
            );
            return;
        }

        match self.portal.restore_state(&stored.blob).await {
            Ok(()) => {
                debug!("Restored session state saved at {}", stored.saved_at);
                self.state.lock().stored_state_at = Some(stored.saved_at);
            }
            Err(e) => warn!("Failed to restore stored session state: {}", e),
        }
    }

    /// Export and save the browser storage state; failures only cost a future login
    async fn persist_state(&self) -> Option<DateTime<Utc>> {
        let blob = match self.portal.export_state().await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Could not export session state: {}", e);
                return None;
            }
        };
        match self.store.save(&blob).await {
            Ok(stored) => Some(stored.saved_at),
            Err(e) => {
                warn!("Could not persist session state: {}", e);
                None
            }
        }
    }
}

/// Returns the session to `Unauthenticated` if a login future is dropped mid-attempt
struct AttemptGuard<'a> {
    manager: &'a SessionManager,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Login attempt abandoned before completion");
            self.manager.transition(AuthState::Unauthenticated, |_| ());
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("profile", &self.profile())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::{FakePortal, FAKE_STATE, session_config, test_credentials};

    fn manager(portal: Arc<FakePortal>, dir: &std::path::Path) -> Arc<SessionManager> {
        manager_with(portal, dir, session_config())
    }

    fn manager_with(portal: Arc<FakePortal>, dir: &std::path::Path, config: SessionConfig) -> Arc<SessionManager> {
        let store = SessionStore::new(dir, "test").unwrap();
        Arc::new(SessionManager::new(portal, store, Some(test_credentials()), config))
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<(AuthState, AuthState)> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push((ev.from, ev.to));
        }
        out
    }

    #[tokio::test]
    async fn test_restored_state_skips_login() {
        let tmp = tempfile::tempdir().unwrap();
        SessionStore::new(tmp.path(), "test")
            .unwrap()
            .save(FAKE_STATE)
            .await
            .unwrap();

        let portal = Arc::new(FakePortal::new());
        let mgr = manager(portal.clone(), tmp.path());
        let handle = mgr.acquire().await.unwrap();

        assert_eq!(handle.generation(), 1);
        assert_eq!(portal.logins(), 0);
        assert_eq!(mgr.state(), AuthState::Authenticated);
        assert!(mgr.status().stored_state_at.is_some());
    }

    #[tokio::test]
    async fn test_login_persists_state() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let mgr = manager(portal.clone(), tmp.path());

        drop(mgr.acquire().await.unwrap());
        assert_eq!(portal.logins(), 1);

        let stored = SessionStore::new(tmp.path(), "test").unwrap().load().await.unwrap();
        assert_eq!(stored.unwrap().blob, FAKE_STATE);

        // Second acquire reuses the session
        drop(mgr.acquire().await.unwrap());
        assert_eq!(portal.logins(), 1);
    }

    #[tokio::test]
    async fn test_challenge_passes_through_awaiting_state() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(
            FakePortal::new()
                .with_login(LoginStep::ChallengeIssued)
                .with_challenge([ChallengeStatus::Pending, ChallengeStatus::Pending, ChallengeStatus::Approved]),
        );
        let mgr = manager(portal.clone(), tmp.path());
        let mut events = mgr.subscribe();

        drop(mgr.acquire().await.unwrap());

        assert_eq!(
            drain(&mut events),
            vec![
                (AuthState::Unauthenticated, AuthState::Authenticating),
                (AuthState::Authenticating, AuthState::AwaitingChallenge),
                (AuthState::AwaitingChallenge, AuthState::Authenticated),
            ]
        );
        assert_eq!(portal.challenge_checks(), 3);
    }

    #[tokio::test]
    async fn test_challenge_timeout_returns_to_unauthenticated() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::ChallengeIssued));
        let mgr = manager(portal.clone(), tmp.path());

        let started = Instant::now();
        let err = mgr.acquire().await.unwrap_err();

        assert!(matches!(err, PortalError::AuthenticationTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(mgr.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_reissued_prompt_is_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(
            FakePortal::new()
                .with_login(LoginStep::ChallengeIssued)
                .with_challenge([ChallengeStatus::Pending, ChallengeStatus::Reissued]),
        );
        let mgr = manager(portal, tmp.path());

        let err = mgr.acquire().await.unwrap_err();
        assert!(matches!(err, PortalError::AuthenticationTimeout(_)));
        assert_eq!(mgr.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_denied_prompt_is_authentication_error() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(
            FakePortal::new()
                .with_login(LoginStep::ChallengeIssued)
                .with_challenge([ChallengeStatus::Denied]),
        );
        let mgr = manager(portal, tmp.path());

        let err = mgr.acquire().await.unwrap_err();
        assert!(matches!(err, PortalError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_rejected_credentials_can_be_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Rejected("Invalid user name or password".into())));
        let mgr = manager(portal.clone(), tmp.path());

        let err = mgr.acquire().await.unwrap_err();
        assert_eq!(err, PortalError::Authentication("Invalid user name or password".into()));
        assert_eq!(mgr.state(), AuthState::Unauthenticated);

        portal.set_login(LoginStep::Authenticated);
        mgr.acquire().await.unwrap();
        assert_eq!(portal.logins(), 2);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_login() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new());
        let store = SessionStore::new(tmp.path(), "test").unwrap();
        let mgr = SessionManager::new(portal.clone(), store, None, session_config());

        let err = mgr.acquire().await.unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(portal.logins(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_login() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(
            FakePortal::new()
                .with_login(LoginStep::ChallengeIssued)
                .with_login_delay(Duration::from_millis(50))
                .with_challenge([ChallengeStatus::Pending, ChallengeStatus::Approved]),
        );
        let mgr = manager(portal.clone(), tmp.path());

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire().await.map(|h| h.generation()) })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }
        assert_eq!(portal.logins(), 1);
        assert_eq!(portal.max_concurrent_logins(), 1);
    }

    #[tokio::test]
    async fn test_waiters_share_failed_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(
            FakePortal::new()
                .with_login(LoginStep::Rejected("locked".into()))
                .with_login_delay(Duration::from_millis(50)),
        );
        let mgr = manager(portal.clone(), tmp.path());

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire().await.map(|_| ()) })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err, PortalError::Authentication("locked".into()));
        }
        assert_eq!(portal.logins(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_login_resets_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = session_config();
        config.challenge_timeout_secs = 30;
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::ChallengeIssued));
        let mgr = manager_with(portal, tmp.path(), config);

        let res = tokio::time::timeout(Duration::from_millis(50), mgr.acquire()).await;
        assert!(res.is_err());
        assert_eq!(mgr.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_mark_expired_bumps_generation_on_reacquire() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let mgr = manager(portal.clone(), tmp.path());

        drop(mgr.acquire().await.unwrap());
        assert_eq!(mgr.current_generation(), Some(1));

        mgr.mark_expired("sign-in page seen");
        assert_eq!(mgr.state(), AuthState::Expired);
        assert_eq!(mgr.current_generation(), None);

        let handle = mgr.acquire().await.unwrap();
        assert_eq!(handle.generation(), 2);
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = session_config();
        config.idle_timeout_secs = 0;
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let mgr = manager_with(portal, tmp.path(), config);

        drop(mgr.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mgr.status().state, AuthState::Expired);
        assert_eq!(mgr.current_generation(), None);
    }

    #[tokio::test]
    async fn test_revalidate_logs_in_again_after_logout() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let mgr = manager(portal.clone(), tmp.path());

        let mut handle = mgr.acquire().await.unwrap();
        portal.log_out();
        mgr.revalidate(&mut handle).await.unwrap();

        assert_eq!(portal.logins(), 2);
        assert_eq!(handle.generation(), 2);
        assert_eq!(mgr.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_invalidate_clears_store() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let mgr = manager(portal, tmp.path());

        drop(mgr.acquire().await.unwrap());
        mgr.invalidate().await.unwrap();

        assert_eq!(mgr.state(), AuthState::Expired);
        let store = SessionStore::new(tmp.path(), "test").unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = session_config();
        config.acquire_timeout_secs = 0;
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let mgr = manager_with(portal, tmp.path(), config);

        let _held = mgr.acquire().await.unwrap();
        let err = mgr.acquire().await.unwrap_err();
        assert!(matches!(err, PortalError::LeaseTimeout(_)));
    }
}
