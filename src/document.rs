//! Document retrieval with a per-session cache

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PortalError, PortalResult};
use crate::extract::parse_document;
use crate::session::SessionManager;
use crate::types::Document;

/// Cached documents of one authenticated lifetime
#[derive(Debug, Default)]
struct DocumentCache {
    generation: u64,
    documents: HashMap<String, Document>,
}

/// Fetches full documents through the shared session
///
/// Documents are cached for as long as the session generation they were
/// fetched under stays current; expiry or invalidation empties the cache.
pub struct DocumentFetcher {
    sessions: Arc<SessionManager>,
    cache: Mutex<DocumentCache>,
}

impl DocumentFetcher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            cache: Mutex::new(DocumentCache::default()),
        }
    }

    pub async fn fetch(&self, doc_id: &str) -> PortalResult<Document> {
        let doc_id = doc_id.trim();
        if doc_id.is_empty() {
            return Err(PortalError::InvalidRequest("document id must not be empty".to_string()));
        }

        if let Some(doc) = self.cached(doc_id) {
            debug!("Document {} served from cache", doc_id);
            self.sessions.touch();
            return Ok(doc);
        }

        match self.fetch_uncached(doc_id).await {
            Err(e) if e.is_transient() => {
                if matches!(e, PortalError::LoggedOut(_)) {
                    self.sessions.mark_expired(&e.to_string());
                }
                warn!("Fetching document {} failed ({}), retrying once", doc_id, e);
                self.fetch_uncached(doc_id).await
            }
            other => other,
        }
    }

    /// Number of cached documents valid for the current session
    pub fn cached_len(&self) -> usize {
        let current = self.sessions.current_generation();
        let cache = self.cache.lock();
        if Some(cache.generation) == current {
            cache.documents.len()
        } else {
            0
        }
    }

    fn cached(&self, doc_id: &str) -> Option<Document> {
        let current = self.sessions.current_generation()?;
        let mut cache = self.cache.lock();
        if cache.generation != current {
            if !cache.documents.is_empty() {
                debug!("Dropping {} cached documents from an earlier session", cache.documents.len());
            }
            cache.documents.clear();
            cache.generation = current;
            return None;
        }
        cache.documents.get(doc_id).cloned()
    }

    fn cached_in(&self, generation: u64, doc_id: &str) -> Option<Document> {
        let cache = self.cache.lock();
        if cache.generation != generation {
            return None;
        }
        cache.documents.get(doc_id).cloned()
    }

    async fn fetch_uncached(&self, doc_id: &str) -> PortalResult<Document> {
        let handle = self.sessions.acquire().await?;
        // Another caller may have fetched it while this one waited for the lease
        if let Some(doc) = self.cached_in(handle.generation(), doc_id) {
            drop(handle);
            debug!("Document {} fetched by a concurrent caller", doc_id);
            self.sessions.touch();
            return Ok(doc);
        }
        let page = handle.portal().open_document(doc_id).await?;
        let doc = parse_document(&page, doc_id)?;
        let generation = handle.generation();
        info!("Fetched document {} ({} chars)", doc_id, doc.body.len());
        {
            // Filled before the lease is released so queued callers see it
            let mut cache = self.cache.lock();
            if cache.generation != generation {
                cache.documents.clear();
                cache.generation = generation;
            }
            cache.documents.insert(doc_id.to_string(), doc.clone());
        }
        drop(handle);
        self.sessions.touch();
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::LoginStep;
    use crate::testing::{FakePortal, session_manager};

    #[tokio::test]
    async fn test_second_fetch_hits_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let fetcher = DocumentFetcher::new(session_manager(portal.clone(), tmp.path()));

        let first = fetcher.fetch("2345678.1").await.unwrap();
        let second = fetcher.fetch("2345678.1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.title, "Document 2345678.1");
        assert_eq!(portal.navigations(), 1);
        assert_eq!(fetcher.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_navigate_once() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let fetcher = DocumentFetcher::new(session_manager(portal.clone(), tmp.path()));

        let (a, b) = tokio::join!(fetcher.fetch("2345678.1"), fetcher.fetch("2345678.1"));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(portal.navigations(), 1);
    }

    #[tokio::test]
    async fn test_expiry_clears_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let sessions = session_manager(portal.clone(), tmp.path());
        let fetcher = DocumentFetcher::new(sessions.clone());

        fetcher.fetch("2345678.1").await.unwrap();
        sessions.mark_expired("test");
        assert_eq!(fetcher.cached_len(), 0);

        fetcher.fetch("2345678.1").await.unwrap();
        assert_eq!(portal.navigations(), 2);
    }

    #[tokio::test]
    async fn test_logged_out_fetch_reauthenticates_and_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new().with_login(LoginStep::Authenticated));
        let sessions = session_manager(portal.clone(), tmp.path());
        let fetcher = DocumentFetcher::new(sessions.clone());

        drop(sessions.acquire().await.unwrap());
        portal.log_out();

        let doc = fetcher.fetch("42.1").await.unwrap();
        assert_eq!(doc.id, "42.1");
        assert_eq!(portal.logins(), 2);
        assert_eq!(portal.navigations(), 2);
    }

    #[tokio::test]
    async fn test_blank_id_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let portal = Arc::new(FakePortal::new());
        let fetcher = DocumentFetcher::new(session_manager(portal.clone(), tmp.path()));

        let err = fetcher.fetch("  ").await.unwrap_err();
        assert!(matches!(err, PortalError::InvalidRequest(_)));
        assert_eq!(portal.navigations(), 0);
    }
}
