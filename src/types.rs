//! Data model shared by the session, extraction and orchestration layers

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PortalError;

/// Upper bound on results kept per query
pub const RESULTS_PER_QUERY_LIMIT: usize = 20;

/// Default number of results kept per query
pub const DEFAULT_RESULTS_PER_QUERY: usize = 5;

/// Upper bound on queries in one batch (direct or derived)
pub const MAX_QUERIES_PER_REQUEST: usize = 25;

/// Where a query came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    Direct,
    DerivedFromLog,
}

/// One concrete search execution request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub source: QuerySource,
    /// Hash of the log a derived query was generated from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_log: Option<String>,
    /// Position in the originating request, used to keep output order
    pub sequence: usize,
}

impl SearchQuery {
    pub fn direct(text: impl Into<String>, sequence: usize) -> Self {
        Self {
            text: text.into(),
            source: QuerySource::Direct,
            parent_log: None,
            sequence,
        }
    }

    pub fn derived(text: impl Into<String>, parent_log: impl Into<String>, sequence: usize) -> Self {
        Self {
            text: text.into(),
            source: QuerySource::DerivedFromLog,
            parent_log: Some(parent_log.into()),
            sequence,
        }
    }
}

/// One entry of a search result listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    /// Portal document identifier (e.g. `2345678.1`)
    pub id: String,
    pub title: String,
    pub link: String,
    pub snippet: String,
    /// Position within one extraction, contiguous from 0
    pub rank: usize,
    /// Sequence index of the query that produced this result
    pub query_sequence: usize,
}

/// Full document view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
    pub fetched_at: DateTime<Utc>,
}

/// Snapshot of a rendered portal view handed from the browser to the parsers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
}

impl RenderedPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }
}

/// Result of one query within a batch
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub query: SearchQuery,
    pub results: Result<Vec<SearchResult>, PortalError>,
    /// Number of executions, including the first
    pub attempts: u32,
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        self.results.is_ok()
    }
}

/// Error marker attached to a failed query in responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMarker {
    pub kind: String,
    pub message: String,
}

impl From<&PortalError> for ErrorMarker {
    fn from(err: &PortalError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Wire shape of a single query's results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryReport {
    pub query: String,
    pub source: QuerySource,
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMarker>,
}

impl From<&QueryOutcome> for QueryReport {
    fn from(outcome: &QueryOutcome) -> Self {
        let (results, error) = match &outcome.results {
            Ok(results) => (results.clone(), None),
            Err(e) => (Vec::new(), Some(ErrorMarker::from(e))),
        };
        Self {
            query: outcome.query.text.clone(),
            source: outcome.query.source,
            results,
            error,
        }
    }
}

/// Response of a direct search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchReport {
    pub results: Vec<QueryReport>,
}

impl SearchReport {
    pub fn from_outcomes(outcomes: &[QueryOutcome]) -> Self {
        Self {
            results: outcomes.iter().map(QueryReport::from).collect(),
        }
    }
}

/// Response of a log-driven search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSearchReport {
    pub log_hash: String,
    pub generated_queries: Vec<String>,
    pub results: Vec<QueryReport>,
}
