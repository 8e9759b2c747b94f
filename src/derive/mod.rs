//! Turning raw diagnostic logs into portal search queries
//!
//! The core only sees [`QueryDeriver`]: text in, candidate query strings out.
//! [`OpenAiDeriver`] asks an OpenAI-compatible model; [`HeuristicDeriver`]
//! works offline from error-code patterns.

mod heuristic;
mod openai;

pub use heuristic::HeuristicDeriver;
pub use openai::OpenAiDeriver;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{PortalError, PortalResult};
use crate::types::SearchQuery;

/// Longest query string kept; the portal search box truncates beyond this
const MAX_QUERY_CHARS: usize = 200;

/// Source of candidate queries for a log
#[async_trait]
pub trait QueryDeriver: Send + Sync {
    /// Propose up to `max_queries` search strings for `log_text`
    ///
    /// Failures of the underlying capability are reported as
    /// [`PortalError::Derivation`]; an empty list is never a success.
    async fn derive(&self, log_text: &str, max_queries: usize) -> PortalResult<Vec<String>>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Hex SHA-256 of the log text, used to identify and cache derivations
pub fn log_hash(log_text: &str) -> String {
    hex::encode(Sha256::digest(log_text.as_bytes()))
}

/// Cleaned, ordered candidates generated from one log
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DerivedQuerySet {
    pub log_hash: String,
    pub queries: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl DerivedQuerySet {
    /// Trim, drop blanks and case-insensitive duplicates, cap to `max_queries`
    pub fn new(log_text: &str, candidates: Vec<String>, max_queries: usize) -> PortalResult<Self> {
        let mut seen = HashSet::new();
        let queries: Vec<String> = candidates
            .into_iter()
            .map(|q| q.split_whitespace().collect::<Vec<_>>().join(" "))
            .map(|q| q.chars().take(MAX_QUERY_CHARS).collect::<String>())
            .filter(|q| !q.is_empty())
            .filter(|q| seen.insert(q.to_lowercase()))
            .take(max_queries)
            .collect();

        if queries.is_empty() {
            return Err(PortalError::Derivation(
                "no usable search queries could be derived from the log".to_string(),
            ));
        }

        Ok(Self {
            log_hash: log_hash(log_text),
            queries,
            generated_at: Utc::now(),
        })
    }

    /// Batch of derived [`SearchQuery`]s in candidate order
    pub fn to_search_queries(&self) -> Vec<SearchQuery> {
        self.queries
            .iter()
            .enumerate()
            .map(|(i, q)| SearchQuery::derived(q.clone(), self.log_hash.clone(), i))
            .collect()
    }
}
