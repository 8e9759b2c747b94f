// HTTP front end for the My Oracle Support agent.
//
// Usage: mos-agent [config.yaml]
// Credentials and API keys come from the environment only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mos_agent::derive::{HeuristicDeriver, OpenAiDeriver, QueryDeriver};
use mos_agent::{BrowserManager, ChromePortal, PortalAgent, load_config, server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mos_agent=info")))
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;
    let profile_dir = config.resolve_profile_dir()?;
    info!("Using profile directory {}", profile_dir.display());

    if config.credentials.is_none() {
        warn!("MOS_LOGIN_USER / MOS_LOGIN_PASSWORD not set; only a stored or browser session can be used");
    }

    let manager = Arc::new(BrowserManager::new(
        config.browser.clone(),
        profile_dir.join("chrome"),
        config.search.page_timeout(),
    ));
    let portal = Arc::new(ChromePortal::new(manager, &config.portal, config.search.page_timeout())?);

    let deriver: Arc<dyn QueryDeriver> = match OpenAiDeriver::new(&config.llm) {
        Ok(deriver) => Arc::new(deriver),
        Err(e) => {
            warn!("{}; deriving log queries with the offline heuristic", e);
            Arc::new(HeuristicDeriver::new())
        }
    };

    let agent = Arc::new(PortalAgent::new(&config, &profile_dir, portal, deriver)?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down");
        signal.cancel();
    });

    server::serve(agent, &config.server.bind, shutdown).await
}
