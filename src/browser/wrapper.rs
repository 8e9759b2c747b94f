//! Browser process handle
//!
//! Owns a chromiumoxide [`Browser`] together with the task that drains its
//! CDP event stream. The handler is aborted on drop; call [`close`] first
//! for a clean exit, otherwise Chrome is killed with the `Browser`.
//!
//! [`close`]: BrowserWrapper::close

use chromiumoxide::browser::Browser;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct BrowserWrapper {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserWrapper {
    pub(crate) fn new(browser: Browser, handler: JoinHandle<()>) -> Self {
        Self { browser, handler }
    }

    pub(crate) fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Whether the browser still answers CDP commands
    pub(crate) async fn is_alive(&self) -> bool {
        match self.browser.version().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Browser health check failed: {}", e);
                false
            }
        }
    }

    /// Close Chrome and wait for the process to exit
    ///
    /// Both steps are best-effort: a crashed browser fails them and is
    /// reaped when the wrapper drops.
    pub(crate) async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Failed to wait for browser exit: {}", e);
        }
    }
}

impl Drop for BrowserWrapper {
    fn drop(&mut self) {
        info!("Dropping BrowserWrapper, aborting handler task");
        self.handler.abort();
    }
}
