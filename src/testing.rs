//! Scripted in-memory portal used by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{PortalError, PortalResult};
use crate::portal::{ChallengeStatus, LoginStep, Portal};
use crate::session::{SessionManager, SessionStore};
use crate::types::RenderedPage;
use crate::{Credentials, SessionConfig};

/// Storage blob the fake exports and accepts as a valid session
pub const FAKE_STATE: &[u8] = b"[{\"name\":\"ORA_UCM_INFO\",\"value\":\"fake\"}]";

pub const BASE_URL: &str = "https://support.oracle.com/";

pub fn test_credentials() -> Credentials {
    Credentials {
        username: "ops@example.com".to_string(),
        password: "hunter2".to_string(),
    }
}

/// Fast timings for tests
pub fn session_config() -> SessionConfig {
    SessionConfig {
        challenge_timeout_secs: 1,
        challenge_poll_ms: 10,
        acquire_timeout_secs: 5,
        ..SessionConfig::default()
    }
}

/// Manager over `portal` that logs in without a challenge
pub fn session_manager(portal: Arc<FakePortal>, dir: &std::path::Path) -> Arc<SessionManager> {
    let store = SessionStore::new(dir, "test").expect("valid profile");
    Arc::new(SessionManager::new(
        portal,
        store,
        Some(test_credentials()),
        session_config(),
    ))
}

/// Result listing the extractor recognizes, one entry per `(id, title)`
pub fn listing_html(entries: &[(&str, &str)]) -> String {
    let rows: String = entries
        .iter()
        .map(|(id, title)| {
            format!(
                r#"<div class="km-result"><a href="/epmos/faces/DocumentDisplay?id={id}">{title}</a><p class="km-result-snippet">About {title}</p></div>"#
            )
        })
        .collect();
    format!(r#"<html><body><div id="kmSearchResults">{rows}</div></body></html>"#)
}

pub fn document_html(id: &str, title: &str) -> String {
    format!(
        r#"<html><body><div id="docTitle">{title}</div><div id="docBody"><p>Body of {id}</p></div></body></html>"#
    )
}

/// A `Portal` whose behaviour is scripted per test
pub struct FakePortal {
    authenticated: AtomicBool,
    login: Mutex<LoginStep>,
    login_delay: Duration,
    challenge: Mutex<VecDeque<ChallengeStatus>>,
    pages: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<String, VecDeque<PortalError>>>,
    /// Queries that log the session out the next time they run
    logouts: Mutex<HashMap<String, usize>>,
    search_delay: Mutex<Duration>,
    /// Errors returned by the next session checks
    check_failures: Mutex<VecDeque<PortalError>>,
    logins: AtomicUsize,
    active_logins: AtomicUsize,
    max_active_logins: AtomicUsize,
    challenge_checks: AtomicUsize,
    navigations: AtomicUsize,
    searches: Mutex<Vec<String>>,
}

impl FakePortal {
    pub fn new() -> Self {
        Self {
            authenticated: AtomicBool::new(false),
            login: Mutex::new(LoginStep::Authenticated),
            login_delay: Duration::ZERO,
            challenge: Mutex::new(VecDeque::new()),
            pages: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            logouts: Mutex::new(HashMap::new()),
            search_delay: Mutex::new(Duration::ZERO),
            check_failures: Mutex::new(VecDeque::new()),
            logins: AtomicUsize::new(0),
            active_logins: AtomicUsize::new(0),
            max_active_logins: AtomicUsize::new(0),
            challenge_checks: AtomicUsize::new(0),
            navigations: AtomicUsize::new(0),
            searches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_login(self, step: LoginStep) -> Self {
        *self.login.lock() = step;
        self
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn with_challenge(self, script: impl IntoIterator<Item = ChallengeStatus>) -> Self {
        self.challenge.lock().extend(script);
        self
    }

    pub fn with_page(self, query: &str, html: impl Into<String>) -> Self {
        self.pages.lock().insert(query.to_string(), html.into());
        self
    }

    /// Queue errors returned by the next searches for `query`
    pub fn with_failures(self, query: &str, errors: impl IntoIterator<Item = PortalError>) -> Self {
        self.failures
            .lock()
            .entry(query.to_string())
            .or_default()
            .extend(errors);
        self
    }

    /// Log the session out the next `times` runs of `query`
    pub fn with_logout_on(self, query: &str, times: usize) -> Self {
        self.logouts.lock().insert(query.to_string(), times);
        self
    }

    pub fn with_search_delay(self, delay: Duration) -> Self {
        *self.search_delay.lock() = delay;
        self
    }

    /// Make the next session checks fail with `errors`, in order
    pub fn fail_next_checks(&self, errors: impl IntoIterator<Item = PortalError>) {
        self.check_failures.lock().extend(errors);
    }

    pub fn set_login(&self, step: LoginStep) {
        *self.login.lock() = step;
    }

    pub fn log_out(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_logins(&self) -> usize {
        self.max_active_logins.load(Ordering::SeqCst)
    }

    pub fn challenge_checks(&self) -> usize {
        self.challenge_checks.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    /// Query texts in the order they were run, retries included
    pub fn searches(&self) -> Vec<String> {
        self.searches.lock().clone()
    }

    fn require_session(&self, what: &str) -> PortalResult<()> {
        if self.authenticated.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PortalError::LoggedOut(format!("{what} redirected to sign-in")))
        }
    }
}

impl Default for FakePortal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Portal for FakePortal {
    async fn restore_state(&self, blob: &[u8]) -> PortalResult<()> {
        if blob == FAKE_STATE {
            self.authenticated.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn export_state(&self) -> PortalResult<Vec<u8>> {
        Ok(FAKE_STATE.to_vec())
    }

    async fn probe(&self) -> PortalResult<bool> {
        if let Some(err) = self.check_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.authenticated.load(Ordering::SeqCst))
    }

    async fn submit_credentials(&self, _credentials: &Credentials) -> PortalResult<LoginStep> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        let active = self.active_logins.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_logins.fetch_max(active, Ordering::SeqCst);

        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        let step = self.login.lock().clone();
        if step == LoginStep::Authenticated {
            self.authenticated.store(true, Ordering::SeqCst);
        }

        self.active_logins.fetch_sub(1, Ordering::SeqCst);
        Ok(step)
    }

    async fn challenge_status(&self) -> PortalResult<ChallengeStatus> {
        self.challenge_checks.fetch_add(1, Ordering::SeqCst);
        let status = self
            .challenge
            .lock()
            .pop_front()
            .unwrap_or(ChallengeStatus::Pending);
        if status == ChallengeStatus::Approved {
            self.authenticated.store(true, Ordering::SeqCst);
        }
        Ok(status)
    }

    async fn search(&self, query: &str) -> PortalResult<RenderedPage> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        self.searches.lock().push(query.to_string());

        let delay = *self.search_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let logout = {
            let mut logouts = self.logouts.lock();
            match logouts.get_mut(query) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if logout {
            self.log_out();
        }
        self.require_session("search")?;

        if let Some(err) = self
            .failures
            .lock()
            .get_mut(query)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let html = self
            .pages
            .lock()
            .get(query)
            .cloned()
            .unwrap_or_else(|| listing_html(&[("1000001.1", query)]));
        Ok(RenderedPage::new(
            format!("{BASE_URL}epmos/faces/KMConsolidatedSearch"),
            html,
        ))
    }

    async fn open_document(&self, doc_id: &str) -> PortalResult<RenderedPage> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        self.require_session("document")?;
        Ok(RenderedPage::new(
            format!("{BASE_URL}epmos/faces/DocumentDisplay?id={doc_id}"),
            document_html(doc_id, &format!("Document {doc_id}")),
        ))
    }
}
