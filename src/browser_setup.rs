use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::BrowserConfig;
use crate::error::{PortalError, PortalResult};
use crate::utils::constants::CHROME_USER_AGENT;

/// Files Chrome leaves in a user-data dir while it owns it
const PROFILE_LOCK_FILES: &[&str] = &["SingletonLock", "SingletonSocket", "SingletonCookie"];

/// Platform install locations, tried after `CHROMIUM_PATH`
fn candidate_paths() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"%LOCALAPPDATA%\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    }
}

/// Expand `~/` and Windows `%VAR%` tokens; unknown variables are kept verbatim
fn expand_path(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(rest) = raw.strip_prefix("~/") {
        return dirs::home_dir().map(|home| home.join(rest));
    }
    if !raw.contains('%') {
        return Some(PathBuf::from(raw));
    }

    let mut out = String::with_capacity(raw.len());
    let mut parts = raw.split('%');
    if let Some(head) = parts.next() {
        out.push_str(head);
    }
    // Odd-indexed pieces sit between a pair of '%'
    let rest: Vec<&str> = parts.collect();
    let mut i = 0;
    while i < rest.len() {
        let name = rest[i];
        match (lookup(name), i + 1 < rest.len()) {
            (Some(value), true) if !name.is_empty() => out.push_str(&value),
            (_, true) => {
                out.push('%');
                out.push_str(name);
                out.push('%');
            }
            (_, false) => {
                out.push('%');
                out.push_str(name);
                break;
            }
        }
        if let Some(text) = rest.get(i + 1) {
            out.push_str(text);
        }
        i += 2;
    }
    Some(PathBuf::from(out))
}

/// Locate an installed Chrome/Chromium
///
/// `CHROMIUM_PATH` wins when it points at a file; then the platform install
/// locations; then `which` on Unix.
pub fn find_browser_executable() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Some(path);
        }
        warn!("CHROMIUM_PATH points to a missing file: {}", path.display());
    }

    for raw in candidate_paths() {
        if let Some(path) = expand_path(raw, |k| std::env::var(k).ok())
            && path.exists()
        {
            info!("Found browser at: {}", path.display());
            return Some(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in ["chromium", "chromium-browser", "google-chrome", "chrome"] {
            let Ok(output) = Command::new("which").arg(cmd).output() else {
                continue;
            };
            let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() && !found.is_empty() {
                info!("Found browser using 'which {}': {}", cmd, found);
                return Some(PathBuf::from(found));
            }
        }
    }

    None
}

/// Download a managed Chromium into the user cache directory
pub async fn download_managed_browser() -> PortalResult<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(|| std::env::temp_dir().join(".cache"))
        .join("mos_agent/chromium");
    info!("Downloading managed Chromium into {}", cache_dir.display());

    tokio::fs::create_dir_all(&cache_dir)
        .await
        .map_err(|e| PortalError::Browser(format!("Failed to create {}: {e}", cache_dir.display())))?;

    let options = BrowserFetcherOptions::builder()
        .with_path(&cache_dir)
        .build()
        .map_err(|e| PortalError::Browser(format!("Invalid fetcher options: {e}")))?;
    let installation = BrowserFetcher::new(options)
        .fetch()
        .await
        .map_err(|e| PortalError::Browser(format!("Failed to download Chromium: {e}")))?;

    info!("Downloaded Chromium to {}", installation.folder_path.display());
    Ok(installation.executable_path)
}

/// Remove lock files left behind by a Chrome that did not exit cleanly
///
/// The profile belongs to this process alone, so a lock present before
/// launch can only be stale.
fn clear_stale_profile_lock(user_data_dir: &Path) {
    for name in PROFILE_LOCK_FILES {
        let path = user_data_dir.join(name);
        if path.symlink_metadata().is_ok() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale {}", path.display()),
                Err(e) => warn!("Could not remove stale {}: {}", path.display(), e),
            }
        }
    }
}

/// In containers the setuid sandbox is unavailable
fn should_disable_sandbox() -> bool {
    Path::new("/.dockerenv").exists()
        || std::env::var("container").is_ok()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}

/// Launch Chrome on a persistent profile and spawn its CDP event loop
///
/// The returned handler task must be aborted once the browser is closed.
pub async fn launch_browser(
    config: &BrowserConfig,
    user_data_dir: &Path,
    request_timeout: Duration,
) -> PortalResult<(Browser, JoinHandle<()>)> {
    let chrome_path = match find_browser_executable() {
        Some(path) => path,
        None => {
            warn!("No Chrome/Chromium executable found, falling back to the fetcher");
            download_managed_browser().await?
        }
    };

    std::fs::create_dir_all(user_data_dir)
        .map_err(|e| PortalError::Browser(format!("Cannot create {}: {e}", user_data_dir.display())))?;
    clear_stale_profile_lock(user_data_dir);

    let mut builder = BrowserConfigBuilder::default()
        .request_timeout(request_timeout)
        .window_size(config.window.width, config.window.height)
        .user_data_dir(user_data_dir)
        .chrome_executable(chrome_path);

    builder = if config.headless {
        builder.headless_mode(HeadlessMode::default())
    } else {
        builder.with_head()
    };

    builder = builder
        .arg(format!("--user-agent={CHROME_USER_AGENT}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-notifications")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-extensions")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-features=TranslateUI")
        .arg("--disable-hang-monitor")
        .arg("--password-store=basic")
        .arg("--use-mock-keychain")
        .arg("--mute-audio");

    if should_disable_sandbox() {
        info!("Detected containerized environment, disabling sandbox");
        builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
    }

    let browser_config = builder
        .build()
        .map_err(|e| PortalError::Browser(format!("Failed to build browser config: {e}")))?;

    info!(
        "Launching browser (headless={}, profile={})",
        config.headless,
        user_data_dir.display()
    );
    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .map_err(|e| PortalError::Browser(format!("Failed to launch browser: {e}")))?;

    let handler_task = task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                let msg = e.to_string();
                // chromiumoxide does not know every CDP event newer Chrome sends
                if msg.contains("data did not match any variant of untagged enum Message")
                    || msg.contains("Failed to deserialize WS response")
                {
                    trace!("Ignored unknown CDP message: {}", msg);
                } else {
                    error!("Browser handler error: {:?}", e);
                }
            }
        }
        info!("Browser handler task completed");
    });

    Ok((browser, handler_task))
}
