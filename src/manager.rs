//! Owner of the single Chrome process behind the portal session
//!
//! The browser is launched lazily on the persistent profile directory, so
//! cookies survive restarts even without the stored session file. Every
//! call to [`BrowserManager::page`] health-checks the browser and relaunches
//! it after a crash.
//!
//! # Async Lock Requirements
//!
//! Browser operations await, so the slots are `tokio::sync::Mutex`. Callers
//! additionally hold the session lease while they drive the page; the
//! mutexes here only guard launch and replacement.

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::page::Page;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::BrowserConfig;
use crate::browser::BrowserWrapper;
use crate::error::PortalResult;

/// Lazily launched browser with one tracked page
pub struct BrowserManager {
    config: BrowserConfig,
    user_data_dir: PathBuf,
    request_timeout: Duration,
    browser: Mutex<Option<BrowserWrapper>>,
    page: Mutex<Option<Page>>,
}

impl BrowserManager {
    /// Nothing is launched until the first [`page`](Self::page) call
    pub fn new(config: BrowserConfig, user_data_dir: PathBuf, request_timeout: Duration) -> Self {
        Self {
            config,
            user_data_dir,
            request_timeout,
            browser: Mutex::new(None),
            page: Mutex::new(None),
        }
    }

    /// The page all navigations go through, launching or relaunching Chrome
    /// as needed
    pub async fn page(&self) -> PortalResult<Page> {
        let mut browser = self.browser.lock().await;
        let mut page = self.page.lock().await;

        let wrapper = match browser.take() {
            Some(existing) => {
                if existing.is_alive().await {
                    debug!("Browser health check passed");
                    existing
                } else {
                    warn!("Browser is not responding, relaunching");
                    *page = None;
                    existing.close().await;
                    self.launch().await?
                }
            }
            None => {
                *page = None;
                self.launch().await?
            }
        };
        let wrapper = browser.insert(wrapper);

        if let Some(current) = page.as_ref() {
            // A crashed renderer leaves the browser alive but the target gone
            if current.url().await.is_ok() {
                return Ok(current.clone());
            }
            warn!("Tracked page is gone, opening a new one");
        }

        let fresh = wrapper.browser().new_page("about:blank").await?;
        info!("Opened portal page");
        *page = Some(fresh.clone());
        Ok(fresh)
    }

    async fn launch(&self) -> PortalResult<BrowserWrapper> {
        let (browser, handler) =
            crate::browser_setup::launch_browser(&self.config, &self.user_data_dir, self.request_timeout).await?;
        Ok(BrowserWrapper::new(browser, handler))
    }

    /// Close the browser; safe to call repeatedly
    pub async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        self.page.lock().await.take();
        if let Some(wrapper) = browser.take() {
            info!("Shutting down browser");
            wrapper.close().await;
        }
    }

    pub async fn is_browser_running(&self) -> bool {
        self.browser.lock().await.is_some()
    }
}

impl Drop for BrowserManager {
    fn drop(&mut self) {
        if self.browser.get_mut().is_some() {
            warn!("BrowserManager dropped without shutdown(), Chrome will be killed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_launched_until_first_page() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BrowserManager::new(BrowserConfig::default(), tmp.path().join("chrome"), Duration::from_secs(5));

        assert!(!manager.is_browser_running().await);

        // Shutdown before launch is a no-op
        manager.shutdown().await;
        assert!(!manager.is_browser_running().await);
    }
}
