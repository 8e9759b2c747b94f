//! Guided search of the My Oracle Support knowledge portal
//!
//! Drives one long-lived, authenticated Chrome session via chromiumoxide to run
//! searches (literal or derived from a diagnostic log), extract structured
//! result listings, and fetch full documents.

mod browser;
pub mod browser_setup;
pub mod derive;
pub mod document;
pub mod error;
pub mod extract;
mod manager;
pub mod orchestrator;
pub mod portal;
pub mod server;
pub mod service;
pub mod session;
pub mod types;
mod utils;

#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Login credentials, only ever taken from the environment
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

/// Portal location and the views the agent navigates to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_dashboard_path")]
    pub dashboard_path: String,

    #[serde(default = "default_knowledge_path")]
    pub knowledge_path: String,

    #[serde(default = "default_document_path")]
    pub document_path: String,
}

/// Browser launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Window dimensions
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity the persisted storage state is keyed by
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Where the browser profile and stored session state live
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,

    /// Authenticated session is considered expired after this much inactivity
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long a human has to approve a multi-factor prompt
    #[serde(default = "default_challenge_timeout_secs")]
    pub challenge_timeout_secs: u64,

    #[serde(default = "default_challenge_poll_ms")]
    pub challenge_poll_ms: u64,

    /// Stored state older than this is not restored
    #[serde(default = "default_state_max_age_hours")]
    pub state_max_age_hours: u64,

    /// Upper bound on waiting for the browsing context (includes login)
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Per-navigation timeout inside the browser
    #[serde(default = "default_page_timeout_ms")]
    pub page_timeout_ms: u64,

    /// Budget for one query execution (navigate, wait, extract)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_results_per_query")]
    pub default_results_per_query: usize,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Portal login credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .finish()
    }
}

fn default_base_url() -> String {
    "https://support.oracle.com/".to_string()
}
fn default_dashboard_path() -> String {
    "epmos/faces/Dashboard".to_string()
}
fn default_knowledge_path() -> String {
    "epmos/faces/KMConsolidatedSearch".to_string()
}
fn default_document_path() -> String {
    "epmos/faces/DocumentDisplay".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_window_width() -> u32 {
    1920
}

fn default_window_height() -> u32 {
    1080
}

fn default_profile() -> String {
    "default".to_string()
}
fn default_idle_timeout_secs() -> u64 {
    30 * 60
}
fn default_challenge_timeout_secs() -> u64 {
    180
}
fn default_challenge_poll_ms() -> u64 {
    2_000
}
fn default_state_max_age_hours() -> u64 {
    7 * 24
}
fn default_acquire_timeout_secs() -> u64 {
    300
}

fn default_page_timeout_ms() -> u64 {
    30_000
}
fn default_query_timeout_ms() -> u64 {
    45_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    750
}
fn default_results_per_query() -> usize {
    types::DEFAULT_RESULTS_PER_QUERY
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f64 {
    0.2
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            dashboard_path: default_dashboard_path(),
            knowledge_path: default_knowledge_path(),
            document_path: default_document_path(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            profile_dir: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            challenge_timeout_secs: default_challenge_timeout_secs(),
            challenge_poll_ms: default_challenge_poll_ms(),
            state_max_age_hours: default_state_max_age_hours(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_timeout_ms: default_page_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            default_results_per_query: default_results_per_query(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn challenge_poll(&self) -> Duration {
        Duration::from_millis(self.challenge_poll_ms)
    }

    pub fn state_max_age(&self) -> Duration {
        Duration::from_secs(self.state_max_age_hours * 3600)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl SearchConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Load configuration from YAML, then apply environment overrides
///
/// The file is taken from `path`, else `MOS_CONFIG`, else `config.yaml` in the
/// working directory. A missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("MOS_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let mut config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        serde_yaml::from_str::<Config>(&contents)?
    } else {
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

impl Config {
    /// Apply `MOS_*` / `OPENAI_*` overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("MOS_PROFILE_DIR").filter(|v| !v.is_empty()) {
            self.session.profile_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = lookup("MOS_PAGE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.search.page_timeout_ms = ms;
        }
        if let Some(headless) = lookup("MOS_HEADLESS") {
            self.browser.headless = matches!(headless.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(bind) = lookup("MOS_BIND").filter(|v| !v.is_empty()) {
            self.server.bind = bind;
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
        if let Some(base) = lookup("OPENAI_BASE_URL").filter(|v| !v.is_empty()) {
            self.llm.base_url = base;
        }
        if let (Some(username), Some(password)) = (lookup("MOS_LOGIN_USER"), lookup("MOS_LOGIN_PASSWORD")) {
            self.credentials = Some(Credentials { username, password });
        }
    }

    /// Pick the first usable profile directory
    ///
    /// Candidates are the configured directory followed by `~/.mos_profile`.
    pub fn resolve_profile_dir(&self) -> anyhow::Result<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dir) = &self.session.profile_dir {
            candidates.push(dir.clone());
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".mos_profile"));
        }
        candidates.push(std::env::temp_dir().join("mos_profile"));

        for candidate in &candidates {
            match fs::create_dir_all(candidate) {
                Ok(()) => return Ok(candidate.clone()),
                Err(e) => tracing::warn!("Cannot use profile dir {}: {}", candidate.display(), e),
            }
        }
        anyhow::bail!("No usable profile directory among {:?}", candidates)
    }
}

pub use browser::ChromePortal;
pub use error::{PortalError, PortalResult};
pub use manager::BrowserManager;
pub use service::PortalAgent;
pub use types::{Document, QueryOutcome, QuerySource, SearchQuery, SearchResult};
