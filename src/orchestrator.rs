//! Serial execution of query batches against the shared session

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::SearchConfig;
use crate::error::{PortalError, PortalResult};
use crate::extract::ResultExtractor;
use crate::session::{SessionHandle, SessionManager};
use crate::types::{QueryOutcome, SearchQuery, SearchResult};

/// Runs batches of queries one at a time through a single session lease
///
/// The browsing context cannot serve two navigations at once, so a batch holds
/// the lease from its first query to its last. Concurrent batches queue on
/// [`SessionManager::acquire`].
pub struct SearchOrchestrator {
    sessions: Arc<SessionManager>,
    extractor: ResultExtractor,
    config: SearchConfig,
}

impl SearchOrchestrator {
    pub fn new(sessions: Arc<SessionManager>, extractor: ResultExtractor, config: SearchConfig) -> Self {
        Self {
            sessions,
            extractor,
            config,
        }
    }

    /// Run `queries` in sequence order, keeping at most `max_per_query` results each
    ///
    /// Only a failure to obtain an authenticated session fails the whole
    /// batch. Per-query failures are reported in the returned outcomes.
    pub async fn run(&self, mut queries: Vec<SearchQuery>, max_per_query: usize) -> PortalResult<Vec<QueryOutcome>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        queries.sort_by_key(|q| q.sequence);

        let batch = Uuid::new_v4();
        let span = info_span!("search_batch", %batch, queries = queries.len());
        self.run_batch(queries, max_per_query).instrument(span).await
    }

    async fn run_batch(&self, queries: Vec<SearchQuery>, max_per_query: usize) -> PortalResult<Vec<QueryOutcome>> {
        let mut handle = self.sessions.acquire().await?;
        let mut outcomes = Vec::with_capacity(queries.len());
        // Set once the session cannot be re-established; remaining queries are not attempted
        let mut fatal: Option<PortalError> = None;

        for query in queries {
            if let Some(err) = &fatal {
                outcomes.push(QueryOutcome {
                    query,
                    results: Err(err.clone()),
                    attempts: 0,
                });
                continue;
            }

            let (results, attempts) = self.run_query(&mut handle, &query, max_per_query).await;
            if let Err(e) = &results {
                if e.is_authentication() {
                    fatal = Some(e.clone());
                }
            }
            outcomes.push(QueryOutcome {
                query,
                results,
                attempts,
            });
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!("Batch finished: {} queries, {} failed", outcomes.len(), failed);
        Ok(outcomes)
    }

    /// One query with bounded retries of transient failures
    async fn run_query(
        &self,
        handle: &mut SessionHandle,
        query: &SearchQuery,
        max_per_query: usize,
    ) -> (PortalResult<Vec<SearchResult>>, u32) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut err = match self.execute(handle, query).await {
                Ok(mut results) => {
                    results.truncate(max_per_query);
                    self.sessions.touch();
                    debug!("Query '{}' returned {} results", query.text, results.len());
                    return (Ok(results), attempts);
                }
                Err(e) => e,
            };

            // A failed re-establishment uses up an attempt of its own
            loop {
                if !err.is_transient() {
                    warn!("Query '{}' failed: {}", query.text, err);
                    return (Err(err), attempts);
                }
                if attempts > self.config.max_retries {
                    warn!("Query '{}' failed after {} attempts: {}", query.text, attempts, err);
                    return (Err(err), attempts);
                }

                if matches!(err, PortalError::LoggedOut(_)) {
                    self.sessions.mark_expired(&err.to_string());
                }
                let delay = self.backoff_delay(attempts);
                warn!(
                    "Query '{}' attempt {} failed ({}), retrying in {}ms",
                    query.text,
                    attempts,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;

                match self.sessions.revalidate(handle).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("Session could not be re-established: {}", e);
                        attempts += 1;
                        err = e;
                    }
                }
            }
        }
    }

    async fn execute(&self, handle: &SessionHandle, query: &SearchQuery) -> PortalResult<Vec<SearchResult>> {
        let budget = self.config.query_timeout();
        let page = match tokio::time::timeout(budget, handle.portal().search(&query.text)).await {
            Ok(page) => page?,
            Err(_) => return Err(PortalError::NavigationTimeout(budget, query.text.clone())),
        };
        self.extractor.extract(&page, query)
    }

    /// Exponential backoff with up to 50% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff().saturating_mul(1 << attempt.saturating_sub(1).min(6));
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}
