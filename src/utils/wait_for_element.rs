//! Element polling for the portal's script-rendered views
//!
//! The portal renders most of its UI after the load event fires, so a
//! single `find_element` right after navigation is not reliable. Lookups
//! here take an ordered candidate list and poll with exponential backoff.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use chromiumoxide::Page;
use chromiumoxide::element::Element;
use tracing::trace;

use super::constants::{INITIAL_POLL_MS, MAX_POLL_MS};
use crate::error::{PortalError, PortalResult};

/// Try each selector once, in order, and return the first match
pub async fn find_first(page: &Page, selectors: &[&'static str]) -> Option<(&'static str, Element)> {
    for selector in selectors {
        if let Ok(element) = page.find_element(*selector).await {
            return Some((selector, element));
        }
    }
    None
}

/// Wait until one of several views shows
///
/// Each round checks the candidates in order, so an earlier entry wins when
/// two match at once. Polls every 100ms, doubling up to 1s between rounds,
/// until `timeout` has elapsed. A miss is reported as a navigation timeout
/// carrying `what`, so callers can retry it like any other slow page.
pub async fn wait_for_view<T: Copy + Debug>(
    page: &Page,
    candidates: &[(T, &[&'static str])],
    timeout: Duration,
    what: &str,
) -> PortalResult<(T, Element)> {
    let start = Instant::now();
    let mut poll_interval = Duration::from_millis(INITIAL_POLL_MS);
    let max_interval = Duration::from_millis(MAX_POLL_MS);

    loop {
        for (view, selectors) in candidates {
            if let Some((selector, element)) = find_first(page, selectors).await {
                trace!(
                    "Recognized {:?} via '{}' after {}ms",
                    view,
                    selector,
                    start.elapsed().as_millis()
                );
                return Ok((*view, element));
            }
        }

        if start.elapsed() >= timeout {
            return Err(PortalError::NavigationTimeout(
                timeout,
                format!("{what} did not appear"),
            ));
        }

        tokio::time::sleep(poll_interval).await;
        poll_interval = (poll_interval * 2).min(max_interval);
    }
}

/// Wait until any selector of the list matches
pub async fn wait_for_any(
    page: &Page,
    selectors: &[&'static str],
    timeout: Duration,
    what: &str,
) -> PortalResult<Element> {
    let (_, element) = wait_for_view(page, &[((), selectors)], timeout, what).await?;
    Ok(element)
}
