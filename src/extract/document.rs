//! Full document view parsing

use std::collections::BTreeMap;

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};

use super::{collapse_whitespace, first_match};
use crate::error::{PortalError, PortalResult};
use crate::portal::selectors::{DOCUMENT_BODY_SELECTORS, DOCUMENT_TITLE_SELECTORS};
use crate::types::{Document, RenderedPage};

/// Meta tags that describe the page chrome rather than the document
const IGNORED_META: &[&str] = &["viewport", "robots", "referrer", "theme-color", "format-detection"];

/// Parse a rendered document view into a [`Document`]
///
/// The body is converted to markdown-flavoured text. Metadata is gathered from
/// `<meta>` tags, two-column label rows and definition lists; the first
/// occurrence of a key wins.
pub fn parse_document(page: &RenderedPage, doc_id: &str) -> PortalResult<Document> {
    let html = Html::parse_document(&page.html);
    let root = html.root_element();

    let body_el = DOCUMENT_BODY_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| {
            root.select(&sel)
                .find(|el| !collapse_whitespace(&el.text().collect::<String>()).is_empty())
        })
        .ok_or_else(|| PortalError::Parse(format!("document {doc_id} has no readable body at {}", page.url)))?;

    let body = html2md::parse_html(&body_el.inner_html()).trim().to_string();
    if body.is_empty() {
        return Err(PortalError::Parse(format!("document {doc_id} body is empty")));
    }

    let title = first_match(root, DOCUMENT_TITLE_SELECTORS)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| format!("Doc ID {doc_id}"));

    let mut metadata = BTreeMap::new();
    collect_meta_tags(root, &mut metadata);
    collect_label_rows(root, &mut metadata);
    collect_definition_lists(root, &mut metadata);
    metadata
        .entry("url".to_string())
        .or_insert_with(|| page.url.clone());

    Ok(Document {
        id: doc_id.to_string(),
        title,
        body,
        metadata,
        fetched_at: Utc::now(),
    })
}

fn collect_meta_tags(root: ElementRef<'_>, out: &mut BTreeMap<String, String>) {
    let Ok(selector) = Selector::parse("meta[name][content], meta[property][content]") else {
        return;
    };
    for meta in root.select(&selector) {
        let attrs = meta.value();
        let Some(key) = attrs.attr("name").or_else(|| attrs.attr("property")) else {
            continue;
        };
        let key = key.trim().to_lowercase();
        if key.is_empty() || IGNORED_META.contains(&key.as_str()) {
            continue;
        }
        let value = collapse_whitespace(attrs.attr("content").unwrap_or_default());
        if !value.is_empty() {
            out.entry(key).or_insert(value);
        }
    }
}

fn collect_definition_lists(root: ElementRef<'_>, out: &mut BTreeMap<String, String>) {
    let (Ok(dl), Ok(dt)) = (Selector::parse("dl"), Selector::parse("dt")) else {
        return;
    };
    for list in root.select(&dl) {
        for term in list.select(&dt) {
            let value = term
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "dd");
            if let Some(value) = value {
                insert_pair(out, &term.text().collect::<String>(), &value.text().collect::<String>());
            }
        }
    }
}

fn collect_label_rows(root: ElementRef<'_>, out: &mut BTreeMap<String, String>) {
    let (Ok(tr), Ok(cell)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return;
    };
    for row in root.select(&tr) {
        let cells: Vec<_> = row.select(&cell).collect();
        if cells.len() != 2 {
            continue;
        }
        let label = collapse_whitespace(&cells[0].text().collect::<String>());
        if !label.ends_with(':') {
            continue;
        }
        insert_pair(out, &label, &cells[1].text().collect::<String>());
    }
}

fn insert_pair(out: &mut BTreeMap<String, String>, label: &str, value: &str) {
    let key = collapse_whitespace(label)
        .trim_end_matches(':')
        .trim()
        .to_lowercase()
        .replace(' ', "_");
    let value = collapse_whitespace(value);
    if !key.is_empty() && !value.is_empty() {
        out.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_VIEW: &str = r#"
        <html>
          <head>
            <title>Portal</title>
            <meta name="viewport" content="width=device-width">
            <meta name="description" content="ORA-7445 troubleshooting">
          </head>
          <body>
            <div id="kmPgTpl:docTitle">ORA-7445 [kghalo]   Core Dump</div>
            <table>
              <tr><td>Last Update:</td><td>Jan 3, 2026</td></tr>
              <tr><td>Type:</td><td>TROUBLESHOOTING</td></tr>
              <tr><td>no colon</td><td>ignored</td></tr>
            </table>
            <dl><dt>Status</dt><dd>PUBLISHED</dd><dt>Type</dt><dd>should not win</dd></dl>
            <div id="kmPgTpl:r1:docBody">
              <h2>Symptoms</h2>
              <p>The instance fails with <b>ORA-7445</b>.</p>
            </div>
          </body>
        </html>
    "#;

    #[test]
    fn test_parse_document_fields() {
        let page = RenderedPage::new(
            "https://support.oracle.com/epmos/faces/DocumentDisplay?id=2345678.1",
            DOC_VIEW,
        );
        let doc = parse_document(&page, "2345678.1").unwrap();

        assert_eq!(doc.id, "2345678.1");
        assert_eq!(doc.title, "ORA-7445 [kghalo] Core Dump");
        assert!(doc.body.contains("Symptoms"));
        assert!(doc.body.contains("ORA-7445"));
        assert!(!doc.body.contains("Last Update"));

        assert_eq!(doc.metadata.get("description").unwrap(), "ORA-7445 troubleshooting");
        assert_eq!(doc.metadata.get("last_update").unwrap(), "Jan 3, 2026");
        assert_eq!(doc.metadata.get("type").unwrap(), "TROUBLESHOOTING");
        assert_eq!(doc.metadata.get("status").unwrap(), "PUBLISHED");
        assert!(!doc.metadata.contains_key("viewport"));
        assert!(!doc.metadata.contains_key("no_colon"));
        assert_eq!(doc.metadata.get("url").unwrap(), &page.url);
    }

    #[test]
    fn test_parse_document_title_fallback() {
        let page = RenderedPage::new("https://support.oracle.com/x", "<html><body><p>Only text</p></body></html>");
        let doc = parse_document(&page, "42.1").unwrap();
        assert_eq!(doc.title, "Doc ID 42.1");
        assert_eq!(doc.body, "Only text");
    }

    #[test]
    fn test_blank_view_is_parse_error() {
        let page = RenderedPage::new("https://support.oracle.com/x", "<html><body>   </body></html>");
        let err = parse_document(&page, "42.1").unwrap_err();
        assert!(matches!(err, PortalError::Parse(_)));
    }
}
