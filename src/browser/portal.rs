//! [`Portal`] implementation driving the real site through Chrome
//!
//! Every lookup goes through the ordered selector lists in
//! [`crate::portal::selectors`], and every wait is bounded by the page
//! timeout. A navigation that lands on the identity provider's sign-in page
//! is reported as [`PortalError::LoggedOut`] so the session layer can
//! re-authenticate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::element::Element;
use chromiumoxide_cdp::cdp::browser_protocol::network::{
    Cookie, CookieParam, CookieSameSite, SetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide_cdp::cdp::browser_protocol::storage::GetCookiesParams;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{PortalError, PortalResult};
use crate::manager::BrowserManager;
use crate::portal::selectors::*;
use crate::portal::{ChallengeStatus, LoginStep, Portal};
use crate::types::RenderedPage;
use crate::utils::{find_first, wait_for_any, wait_for_view};
use crate::{Credentials, PortalConfig};

/// Cookie as kept in the stored session blob
///
/// Independent of the CDP `Cookie` layout so a stored session survives a
/// protocol upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    #[serde(default = "root_path")]
    path: String,
    /// Seconds since the epoch; `None` for session cookies
    #[serde(default)]
    expires: Option<f64>,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    http_only: bool,
    #[serde(default)]
    same_site: Option<CookieSameSite>,
}

fn root_path() -> String {
    "/".to_string()
}

impl From<Cookie> for StoredCookie {
    fn from(c: Cookie) -> Self {
        Self {
            expires: (!c.session && c.expires > 0.0).then_some(c.expires),
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            secure: c.secure,
            http_only: c.http_only,
            same_site: c.same_site,
        }
    }
}

impl StoredCookie {
    fn is_expired(&self, now_secs: f64) -> bool {
        self.expires.is_some_and(|t| t <= now_secs)
    }

    fn to_param(&self) -> PortalResult<CookieParam> {
        let mut builder = CookieParam::builder()
            .name(self.name.clone())
            .value(self.value.clone())
            .domain(self.domain.clone())
            .path(self.path.clone())
            .secure(self.secure)
            .http_only(self.http_only);
        if let Some(same_site) = self.same_site.clone() {
            builder = builder.same_site(same_site);
        }
        if let Some(expires) = self.expires {
            builder = builder.expires(TimeSinceEpoch::new(expires));
        }
        builder
            .build()
            .map_err(|e| PortalError::Storage(format!("Bad stored cookie '{}': {e}", self.name)))
    }
}

/// Parse a stored blob, dropping cookies that have expired since it was saved
fn restorable_cookies(blob: &[u8], now_secs: f64) -> PortalResult<Vec<StoredCookie>> {
    let cookies: Vec<StoredCookie> = serde_json::from_slice(blob)?;
    Ok(cookies.into_iter().filter(|c| !c.is_expired(now_secs)).collect())
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// What a polled page turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    SignIn,
    Dashboard,
    SearchTrigger,
    Results,
    Challenge,
    LoginError,
    Document,
}

pub struct ChromePortal {
    manager: Arc<BrowserManager>,
    dashboard_url: Url,
    knowledge_url: Url,
    document_url: Url,
    page_timeout: Duration,
}

impl ChromePortal {
    pub fn new(manager: Arc<BrowserManager>, config: &PortalConfig, page_timeout: Duration) -> PortalResult<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| PortalError::InvalidRequest(format!("Invalid portal base URL '{}': {e}", config.base_url)))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| PortalError::InvalidRequest(format!("Invalid portal path '{path}': {e}")))
        };
        Ok(Self {
            dashboard_url: join(&config.dashboard_path)?,
            knowledge_url: join(&config.knowledge_path)?,
            document_url: join(&config.document_path)?,
            manager,
            page_timeout,
        })
    }

    fn document_url(&self, doc_id: &str) -> Url {
        let mut url = self.document_url.clone();
        url.query_pairs_mut().append_pair("id", doc_id);
        url
    }

    async fn goto(&self, page: &Page, url: &Url) -> PortalResult<()> {
        debug!("Navigating to {}", url);
        let navigation = async {
            page.goto(url.as_str()).await?;
            page.wait_for_navigation().await?;
            Ok::<_, PortalError>(())
        };
        tokio::time::timeout(self.page_timeout, navigation)
            .await
            .map_err(|_| PortalError::NavigationTimeout(self.page_timeout, url.to_string()))?
    }

    async fn render(&self, page: &Page) -> PortalResult<RenderedPage> {
        let url = page.url().await?.unwrap_or_default();
        let html = page.content().await?;
        Ok(RenderedPage::new(url, html))
    }

    /// Open the search box, expanding it first when the header collapsed it
    async fn search_box(&self, page: &Page) -> PortalResult<Element> {
        let candidates: [(View, &[&'static str]); 3] = [
            (View::SignIn, LOGIN_PAGE_HINTS),
            (View::Dashboard, SEARCH_BOX_SELECTORS),
            (View::SearchTrigger, SEARCH_TRIGGER_SELECTORS),
        ];
        match wait_for_view(page, &candidates, self.page_timeout, "search box").await? {
            (View::SignIn, _) => Err(PortalError::LoggedOut("sign-in page shown instead of the dashboard".into())),
            (View::SearchTrigger, trigger) => {
                debug!("Search box collapsed, expanding it");
                click(page, &trigger).await?;
                wait_for_any(page, SEARCH_BOX_SELECTORS, self.page_timeout, "search box").await
            }
            (_, input) => Ok(input),
        }
    }
}

async fn click(page: &Page, element: &Element) -> PortalResult<()> {
    // Clicking the computed point avoids element.click() hanging on
    // IntersectionObserver-heavy pages
    element.scroll_into_view().await?;
    let point = element.clickable_point().await?;
    page.click(point).await?;
    Ok(())
}

async fn fill(page: &Page, element: &Element, text: &str) -> PortalResult<()> {
    click(page, element).await?;
    element.call_js_fn("function() { this.value = ''; }", false).await?;
    element.type_str(text).await?;
    Ok(())
}

#[async_trait]
impl Portal for ChromePortal {
    async fn restore_state(&self, blob: &[u8]) -> PortalResult<()> {
        let cookies = restorable_cookies(blob, now_secs())?;
        let params = cookies
            .iter()
            .map(StoredCookie::to_param)
            .collect::<PortalResult<Vec<_>>>()?;

        let page = self.manager.page().await?;
        let count = params.len();
        page.execute(SetCookiesParams::new(params)).await?;
        info!("Restored {} cookies into the browser", count);
        Ok(())
    }

    async fn export_state(&self) -> PortalResult<Vec<u8>> {
        let page = self.manager.page().await?;
        let cookies = page.execute(GetCookiesParams::default()).await?.result.cookies;
        let stored: Vec<StoredCookie> = cookies.into_iter().map(StoredCookie::from).collect();
        debug!("Exporting {} cookies", stored.len());
        Ok(serde_json::to_vec(&stored)?)
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> PortalResult<bool> {
        let page = self.manager.page().await?;
        self.goto(&page, &self.dashboard_url).await?;

        let candidates: [(View, &[&'static str]); 3] = [
            (View::SignIn, LOGIN_PAGE_HINTS),
            (View::Challenge, CHALLENGE_SELECTORS),
            (View::Dashboard, SEARCH_BOX_SELECTORS),
        ];
        let (view, _) = wait_for_view(&page, &candidates, self.page_timeout, "dashboard or sign-in page").await?;
        debug!("Probe landed on {:?}", view);
        Ok(view == View::Dashboard)
    }

    #[instrument(skip_all, fields(username = %credentials.username))]
    async fn submit_credentials(&self, credentials: &Credentials) -> PortalResult<LoginStep> {
        let page = self.manager.page().await?;
        if find_first(&page, LOGIN_USERNAME_SELECTORS).await.is_none() {
            self.goto(&page, &self.dashboard_url).await?;
        }

        let candidates: [(View, &[&'static str]); 2] = [
            (View::Dashboard, SEARCH_BOX_SELECTORS),
            (View::SignIn, LOGIN_USERNAME_SELECTORS),
        ];
        let (view, username) = wait_for_view(&page, &candidates, self.page_timeout, "sign-in form").await?;
        if view == View::Dashboard {
            info!("Already signed in, no credentials needed");
            return Ok(LoginStep::Authenticated);
        }

        info!("Submitting credentials");
        fill(&page, &username, &credentials.username).await?;

        // Two-step form: the password field only appears after "Next"
        let password = match find_first(&page, LOGIN_PASSWORD_SELECTORS).await {
            Some((_, field)) => field,
            None => {
                let (_, next) = find_first(&page, LOGIN_NEXT_SELECTORS)
                    .await
                    .ok_or_else(|| PortalError::Parse("sign-in form has neither password field nor Next button".into()))?;
                click(&page, &next).await?;
                wait_for_any(&page, LOGIN_PASSWORD_SELECTORS, self.page_timeout, "password field").await?
            }
        };
        fill(&page, &password, &credentials.password).await?;

        match find_first(&page, LOGIN_SUBMIT_SELECTORS).await {
            Some((_, submit)) => click(&page, &submit).await?,
            None => {
                password.press_key("Enter").await?;
            }
        }

        let candidates: [(View, &[&'static str]); 3] = [
            (View::LoginError, LOGIN_ERROR_SELECTORS),
            (View::Challenge, CHALLENGE_SELECTORS),
            (View::Dashboard, SEARCH_BOX_SELECTORS),
        ];
        match wait_for_view(&page, &candidates, self.page_timeout, "sign-in outcome").await? {
            (View::Dashboard, _) => Ok(LoginStep::Authenticated),
            (View::Challenge, _) => Ok(LoginStep::ChallengeIssued),
            (_, error) => {
                let reason = error
                    .inner_text()
                    .await?
                    .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "credentials rejected".to_string());
                warn!("Sign-in rejected: {}", reason);
                Ok(LoginStep::Rejected(reason))
            }
        }
    }

    async fn challenge_status(&self) -> PortalResult<ChallengeStatus> {
        let page = self.manager.page().await?;
        let checks: [(ChallengeStatus, &[&'static str]); 5] = [
            (ChallengeStatus::Denied, CHALLENGE_DENIED_SELECTORS),
            (ChallengeStatus::Reissued, CHALLENGE_RESENT_SELECTORS),
            (ChallengeStatus::Approved, SEARCH_BOX_SELECTORS),
            (ChallengeStatus::Pending, CHALLENGE_SELECTORS),
            // Back on the sign-in form: the prompt was declined or lapsed
            (ChallengeStatus::Denied, LOGIN_PAGE_HINTS),
        ];
        for (status, selectors) in checks {
            if find_first(&page, selectors).await.is_some() {
                return Ok(status);
            }
        }
        // Between views while the portal redirects
        Ok(ChallengeStatus::Pending)
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> PortalResult<RenderedPage> {
        let page = self.manager.page().await?;
        self.goto(&page, &self.dashboard_url).await?;

        let input = match self.search_box(&page).await {
            Err(PortalError::NavigationTimeout(..)) => {
                warn!("No search box on the dashboard, using the knowledge search page");
                self.goto(&page, &self.knowledge_url).await?;
                self.search_box(&page).await?
            }
            other => other?,
        };
        fill(&page, &input, query).await?;
        input.press_key("Enter").await?;

        let ready: Vec<&'static str> = search_ready_selectors().collect();
        let candidates: [(View, &[&'static str]); 2] = [
            (View::SignIn, LOGIN_PAGE_HINTS),
            (View::Results, ready.as_slice()),
        ];
        match wait_for_view(&page, &candidates, self.page_timeout, "search results").await? {
            (View::SignIn, _) => Err(PortalError::LoggedOut("sign-in page shown after searching".into())),
            _ => self.render(&page).await,
        }
    }

    #[instrument(skip(self))]
    async fn open_document(&self, doc_id: &str) -> PortalResult<RenderedPage> {
        let page = self.manager.page().await?;
        let url = self.document_url(doc_id);
        self.goto(&page, &url).await?;

        // The generic tail of the body list (article, main, body) matches any page
        let candidates: [(View, &[&'static str]); 2] = [
            (View::SignIn, LOGIN_PAGE_HINTS),
            (View::Document, &DOCUMENT_BODY_SELECTORS[..3]),
        ];
        match wait_for_view(&page, &candidates, self.page_timeout, "document body").await {
            Ok((View::SignIn, _)) => Err(PortalError::LoggedOut("sign-in page shown instead of the document".into())),
            Ok(_) => self.render(&page).await,
            Err(PortalError::NavigationTimeout(..)) => {
                debug!("No dedicated body container for {}, using the page as rendered", doc_id);
                self.render(&page).await
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> PortalResult<()> {
        if !self.manager.is_browser_running().await {
            debug!("Browser was never launched, nothing to close");
            return Ok(());
        }
        self.manager.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn portal() -> ChromePortal {
        let tmp = std::env::temp_dir().join("mos_agent_portal_test");
        let manager = Arc::new(BrowserManager::new(crate::BrowserConfig::default(), tmp, Duration::from_secs(5)));
        ChromePortal::new(manager, &PortalConfig::default(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_urls_are_resolved_against_base() {
        let portal = portal();
        assert_eq!(
            portal.dashboard_url.as_str(),
            "https://support.oracle.com/epmos/faces/Dashboard"
        );
        assert_eq!(
            portal.knowledge_url.as_str(),
            "https://support.oracle.com/epmos/faces/KMConsolidatedSearch"
        );
        assert_eq!(
            portal.document_url("1234567.1").as_str(),
            "https://support.oracle.com/epmos/faces/DocumentDisplay?id=1234567.1"
        );
    }

    #[tokio::test]
    async fn test_close_without_browser_is_noop() {
        let portal = portal();
        portal.close().await.unwrap();
        assert!(!portal.manager.is_browser_running().await);
    }

    #[test]
    fn test_invalid_base_url() {
        let manager = Arc::new(BrowserManager::new(
            crate::BrowserConfig::default(),
            std::env::temp_dir(),
            Duration::from_secs(5),
        ));
        let config = PortalConfig {
            base_url: "not a url".to_string(),
            ..PortalConfig::default()
        };
        assert!(matches!(
            ChromePortal::new(manager, &config, Duration::from_secs(5)),
            Err(PortalError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_expired_cookies_are_not_restored() {
        let blob = json!([
            { "name": "ORA_UCM_INFO", "value": "a", "domain": ".oracle.com", "expires": 2000.0 },
            { "name": "OAMAuthnCookie", "value": "b", "domain": "support.oracle.com", "secure": true },
            { "name": "stale", "value": "c", "domain": ".oracle.com", "expires": 500.0 }
        ])
        .to_string();

        let cookies = restorable_cookies(blob.as_bytes(), 1000.0).unwrap();
        let names: Vec<_> = cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ORA_UCM_INFO", "OAMAuthnCookie"]);
        assert_eq!(cookies[1].path, "/");
        assert!(cookies[1].expires.is_none());
    }

    #[test]
    fn test_cookie_param_carries_attributes() {
        let cookie = StoredCookie {
            name: "OAMAuthnCookie".into(),
            value: "token".into(),
            domain: "support.oracle.com".into(),
            path: "/epmos".into(),
            expires: Some(4_102_444_800.0),
            secure: true,
            http_only: true,
            same_site: Some(CookieSameSite::Lax),
        };
        let param = cookie.to_param().unwrap();
        assert_eq!(param.name, "OAMAuthnCookie");
        assert_eq!(param.domain.as_deref(), Some("support.oracle.com"));
        assert_eq!(param.path.as_deref(), Some("/epmos"));
        assert_eq!(param.secure, Some(true));
        assert_eq!(param.same_site, Some(CookieSameSite::Lax));
    }

    #[test]
    fn test_garbage_blob_is_storage_error() {
        let err = restorable_cookies(b"not json", 0.0).unwrap_err();
        assert!(matches!(err, PortalError::Storage(_)));
    }
}
