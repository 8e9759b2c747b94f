//! Request-level facade over the session, search and document layers

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::derive::{DerivedQuerySet, QueryDeriver, log_hash};
use crate::document::DocumentFetcher;
use crate::error::{PortalError, PortalResult};
use crate::extract::ResultExtractor;
use crate::orchestrator::SearchOrchestrator;
use crate::portal::Portal;
use crate::session::{SessionManager, SessionStatus, SessionStore};
use crate::types::{
    Document, LogSearchReport, MAX_QUERIES_PER_REQUEST, QueryReport, RESULTS_PER_QUERY_LIMIT, SearchQuery,
    SearchReport,
};
use crate::Config;

/// Derived queries generated per log when the caller does not say
pub const DEFAULT_DERIVED_QUERIES: usize = 5;

/// Derived sets kept before the cache is reset
const DERIVED_CACHE_LIMIT: usize = 128;

/// Entry point used by the HTTP layer and the binary
pub struct PortalAgent {
    portal: Arc<dyn Portal>,
    sessions: Arc<SessionManager>,
    orchestrator: SearchOrchestrator,
    documents: DocumentFetcher,
    deriver: Arc<dyn QueryDeriver>,
    derived: Mutex<HashMap<(String, usize), DerivedQuerySet>>,
    default_results_per_query: usize,
}

impl PortalAgent {
    pub fn new(
        config: &Config,
        profile_dir: &Path,
        portal: Arc<dyn Portal>,
        deriver: Arc<dyn QueryDeriver>,
    ) -> PortalResult<Self> {
        let store = SessionStore::new(profile_dir, config.session.profile.clone())?;
        let sessions = Arc::new(SessionManager::new(
            portal.clone(),
            store,
            config.credentials.clone(),
            config.session.clone(),
        ));
        let extractor = ResultExtractor::new(&config.portal.base_url)?;
        let orchestrator = SearchOrchestrator::new(sessions.clone(), extractor, config.search.clone());
        let documents = DocumentFetcher::new(sessions.clone());

        info!(
            "Portal agent ready (profile '{}', query deriver: {})",
            config.session.profile,
            deriver.name()
        );
        Ok(Self {
            portal,
            sessions,
            orchestrator,
            documents,
            deriver,
            derived: Mutex::new(HashMap::new()),
            default_results_per_query: config
                .search
                .default_results_per_query
                .clamp(1, RESULTS_PER_QUERY_LIMIT),
        })
    }

    /// Run caller-supplied queries in order
    pub async fn search(&self, queries: Vec<String>, max_per_query: Option<usize>) -> PortalResult<SearchReport> {
        let max_per_query = self.results_per_query(max_per_query)?;
        if queries.is_empty() || queries.len() > MAX_QUERIES_PER_REQUEST {
            return Err(PortalError::InvalidRequest(format!(
                "between 1 and {MAX_QUERIES_PER_REQUEST} queries are required, got {}",
                queries.len()
            )));
        }
        let queries = queries
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let text = text.trim().to_string();
                if text.is_empty() {
                    Err(PortalError::InvalidRequest(format!("query {} is blank", i + 1)))
                } else {
                    Ok(SearchQuery::direct(text, i))
                }
            })
            .collect::<PortalResult<Vec<_>>>()?;

        let outcomes = self.orchestrator.run(queries, max_per_query).await?;
        Ok(SearchReport::from_outcomes(&outcomes))
    }

    /// Derive queries from a diagnostic log and run them as one batch
    pub async fn search_from_log(
        &self,
        log_text: &str,
        max_queries: Option<usize>,
        max_per_query: Option<usize>,
    ) -> PortalResult<LogSearchReport> {
        let max_per_query = self.results_per_query(max_per_query)?;
        let max_queries = max_queries.unwrap_or(DEFAULT_DERIVED_QUERIES);
        if !(1..=MAX_QUERIES_PER_REQUEST).contains(&max_queries) {
            return Err(PortalError::InvalidRequest(format!(
                "max_queries must be between 1 and {MAX_QUERIES_PER_REQUEST}, got {max_queries}"
            )));
        }
        if log_text.trim().is_empty() {
            return Err(PortalError::InvalidRequest("log_text must not be empty".to_string()));
        }

        let set = self.derive(log_text, max_queries).await?;
        info!(
            "Derived {} queries from log {}: {:?}",
            set.queries.len(),
            &set.log_hash[..12],
            set.queries
        );

        let outcomes = self.orchestrator.run(set.to_search_queries(), max_per_query).await?;
        Ok(LogSearchReport {
            log_hash: set.log_hash,
            generated_queries: set.queries,
            results: outcomes.iter().map(QueryReport::from).collect(),
        })
    }

    pub async fn get_document(&self, doc_id: &str) -> PortalResult<Document> {
        self.documents.fetch(doc_id).await
    }

    pub fn session_status(&self) -> SessionStatus {
        self.sessions.status()
    }

    /// Force a fresh session on the next request
    pub async fn invalidate_session(&self) -> PortalResult<()> {
        self.sessions.invalidate().await
    }

    /// Close the browser; in-flight requests fail with a browser error
    pub async fn shutdown(&self) {
        info!("Shutting down portal agent");
        if let Err(e) = self.portal.close().await {
            warn!("Browser did not close cleanly: {}", e);
        }
    }

    fn results_per_query(&self, requested: Option<usize>) -> PortalResult<usize> {
        let n = requested.unwrap_or(self.default_results_per_query);
        if (1..=RESULTS_PER_QUERY_LIMIT).contains(&n) {
            Ok(n)
        } else {
            Err(PortalError::InvalidRequest(format!(
                "max_per_query must be between 1 and {RESULTS_PER_QUERY_LIMIT}, got {n}"
            )))
        }
    }

    async fn derive(&self, log_text: &str, max_queries: usize) -> PortalResult<DerivedQuerySet> {
        let key = (log_hash(log_text), max_queries);
        if let Some(set) = self.derived.lock().get(&key).cloned() {
            info!("Reusing derived queries for log {}", &key.0[..12]);
            return Ok(set);
        }

        let candidates = self.deriver.derive(log_text, max_queries).await?;
        let set = DerivedQuerySet::new(log_text, candidates, max_queries)?;

        let mut cache = self.derived.lock();
        if cache.len() >= DERIVED_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(key, set.clone());
        Ok(set)
    }
}
