//! Structured extraction from rendered portal views
//!
//! Both parsers are pure functions of the rendered HTML: no browser access, no
//! clock reads beyond the document fetch timestamp.

mod document;

pub use document::parse_document;

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::error::{PortalError, PortalResult};
use crate::portal::selectors::{
    NO_RESULTS_PHRASES, NO_RESULTS_SELECTORS, RESULT_CONTAINER_SELECTORS, RESULT_ENTRY_SELECTORS,
    RESULT_LINK_SELECTORS, RESULT_SNIPPET_SELECTORS,
};
use crate::types::{RenderedPage, SearchQuery, SearchResult};

static DOC_ID_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdoc(?:ument)?\s*id\s*[:#]?\s*(\d+\.\d+)").expect("static regex")
});

static DOC_ID_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+$").expect("static regex"));

/// Turns a rendered results view into ranked [`SearchResult`]s
#[derive(Debug, Clone)]
pub struct ResultExtractor {
    base_url: Url,
}

/// Field set of one listing entry before ranking
#[derive(Debug)]
struct RawEntry {
    id: String,
    title: String,
    link: String,
    snippet: String,
}

impl ResultExtractor {
    pub fn new(base_url: &str) -> PortalResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PortalError::InvalidRequest(format!("Invalid portal base URL '{base_url}': {e}")))?;
        Ok(Self { base_url })
    }

    /// Extract the ordered result listing for `query`
    ///
    /// Ranks follow listing order and are contiguous from 0 after malformed
    /// entries and duplicate identifiers are dropped. `Parse` is returned when
    /// neither a listing nor an empty-results marker is present, and when a
    /// listing has content but none of it matches a known entry layout.
    pub fn extract(&self, page: &RenderedPage, query: &SearchQuery) -> PortalResult<Vec<SearchResult>> {
        let document = Html::parse_document(&page.html);

        let Some(container) = find_container(&document) else {
            if is_empty_listing(&document) {
                debug!("Empty result listing for query '{}'", query.text);
                return Ok(Vec::new());
            }
            warn!(
                "No result listing recognized at {} for query '{}'",
                page.url, query.text
            );
            return Err(PortalError::Parse(format!(
                "no result listing recognized at {}",
                page.url
            )));
        };

        let entries = self.entries(container);
        if entries.is_empty() && has_content(container) && !is_empty_listing(&document) {
            warn!(
                "Result listing at {} has content but no recognized entries for query '{}'",
                page.url, query.text
            );
            return Err(PortalError::Parse(format!(
                "result entries not recognized at {}",
                page.url
            )));
        }

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(entries.len());
        let mut skipped = 0usize;

        for entry in entries {
            let Some(raw) = self.parse_entry(entry) else {
                skipped += 1;
                continue;
            };
            if !seen.insert(raw.id.clone()) {
                continue;
            }
            results.push(SearchResult {
                id: raw.id,
                title: raw.title,
                link: raw.link,
                snippet: raw.snippet,
                rank: results.len(),
                query_sequence: query.sequence,
            });
        }

        debug!(
            "Extracted {} results for '{}' ({} entries skipped)",
            results.len(),
            query.text,
            skipped
        );
        Ok(results)
    }

    /// Entry elements of the container, using the first selector that matches
    fn entries<'a>(&self, container: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        for selector_str in RESULT_ENTRY_SELECTORS {
            let Ok(selector) = Selector::parse(selector_str) else {
                continue;
            };
            let found: Vec<_> = container.select(&selector).collect();
            if !found.is_empty() {
                // Nested matches (a row inside a row) would duplicate entries
                let outer: Vec<_> = found
                    .iter()
                    .copied()
                    .filter(|el| {
                        !el.ancestors()
                            .filter_map(ElementRef::wrap)
                            .take_while(|a| a.id() != container.id())
                            .any(|a| found.iter().any(|f| f.id() == a.id()))
                    })
                    .collect();
                return outer;
            }
        }
        Vec::new()
    }

    fn parse_entry(&self, entry: ElementRef<'_>) -> Option<RawEntry> {
        let anchor = first_match(entry, RESULT_LINK_SELECTORS)?;
        let href = anchor.value().attr("href")?.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            return None;
        }
        let link = self.base_url.join(href).ok()?;

        let id = entry_id(entry, &link)?;

        let mut title = collapse_whitespace(&anchor.text().collect::<String>());
        if title.is_empty() {
            title = anchor
                .value()
                .attr("title")
                .map(collapse_whitespace)
                .unwrap_or_default();
        }
        if title.is_empty() {
            title = id.clone();
        }

        let snippet = first_match(entry, RESULT_SNIPPET_SELECTORS)
            .filter(|el| el.id() != anchor.id())
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .unwrap_or_default();

        Some(RawEntry {
            id,
            title,
            link: link.to_string(),
            snippet,
        })
    }
}

fn find_container(document: &Html) -> Option<ElementRef<'_>> {
    RESULT_CONTAINER_SELECTORS.iter().find_map(|s| {
        let selector = Selector::parse(s).ok()?;
        document.select(&selector).next()
    })
}

/// Whether a container holds links or visible text
fn has_content(container: ElementRef<'_>) -> bool {
    let has_link = Selector::parse("a[href]")
        .map(|sel| container.select(&sel).next().is_some())
        .unwrap_or(false);
    has_link || container.text().any(|t| !t.trim().is_empty())
}

fn is_empty_listing(document: &Html) -> bool {
    let marker = NO_RESULTS_SELECTORS.iter().any(|s| {
        Selector::parse(s)
            .map(|sel| document.select(&sel).next().is_some())
            .unwrap_or(false)
    });
    if marker {
        return true;
    }
    let text = document.root_element().text().collect::<String>().to_lowercase();
    NO_RESULTS_PHRASES.iter().any(|p| text.contains(p))
}

fn first_match<'a>(element: ElementRef<'a>, selectors: &[&str]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|s| {
        let selector = Selector::parse(s).ok()?;
        element.select(&selector).next()
    })
}

/// Document identifier from data attributes, the link's `id` parameter, or entry text
fn entry_id(entry: ElementRef<'_>, link: &Url) -> Option<String> {
    let attr = ["data-doc-id", "data-docid"]
        .iter()
        .find_map(|name| entry.value().attr(name))
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(id) = attr {
        return Some(id.to_string());
    }

    let param = link
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("id"))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| DOC_ID_BARE.is_match(v));
    if param.is_some() {
        return param;
    }

    let text = entry.text().collect::<String>();
    DOC_ID_TEXT
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
