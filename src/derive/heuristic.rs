//! Offline deriver based on error-code patterns

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::QueryDeriver;
use crate::error::{PortalError, PortalResult};

/// Product error codes, with the message text that follows them on the line
static ERROR_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b((?:ORA|TNS|PLS|RMAN|IMP|EXP|EXPDP|IMPDP|SP2|CRS|PRVF|PRCR|PRVG)-\d{3,5})\b:?\s*([^\r\n]*)",
    )
    .expect("static regex")
});

static JAVA_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?:[a-z_][\w$]*\.)+[A-Z][\w$]*(?:Exception|Error))\b:?\s*([^\r\n]*)").expect("static regex")
});

static OPATCH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bOPatch\b[^\r\n]*?\b(failed|error)\b[^\r\n]*").expect("static regex")
});

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9_$.-]{3,}").expect("static regex"));

/// Noise words that never make a useful search term
const STOP_WORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "were", "will", "when", "then", "than", "there", "their",
    "error", "errors", "failed", "failure", "warning", "info", "debug", "trace", "line", "file",
    "null", "true", "false", "value", "while", "into", "could", "would", "should", "after", "before",
    "caused", "thread", "main", "java", "oracle", "exception", "process", "unable",
];

/// Words of message text kept next to an error code
const MESSAGE_WORDS: usize = 6;

/// Extracts error codes and exception names; degrades to frequent terms
#[derive(Debug, Clone, Default)]
pub struct HeuristicDeriver;

impl HeuristicDeriver {
    pub fn new() -> Self {
        Self
    }

    fn candidates(log_text: &str) -> Vec<String> {
        let mut out = Vec::new();

        for caps in ERROR_CODE.captures_iter(log_text) {
            let code = caps[1].to_uppercase();
            let message = short_message(caps.get(2).map_or("", |m| m.as_str()));
            if message.is_empty() {
                out.push(code);
            } else {
                out.push(format!("{code} {message}"));
            }
        }

        for caps in JAVA_EXCEPTION.captures_iter(log_text) {
            let class = &caps[1];
            let message = short_message(caps.get(2).map_or("", |m| m.as_str()));
            if message.is_empty() {
                out.push(class.to_string());
            } else {
                out.push(format!("{class} {message}"));
            }
        }

        for m in OPATCH_FAILURE.find_iter(log_text) {
            out.push(short_message(m.as_str()));
        }

        out
    }

    /// Most frequent significant words, in first-seen order on ties
    fn frequent_terms(log_text: &str, limit: usize) -> Vec<String> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (pos, m) in WORD.find_iter(log_text).enumerate() {
            let word = m.as_str().trim_matches(|c: char| c == '.' || c == '-');
            let lower = word.to_lowercase();
            if lower.len() < 4 || STOP_WORDS.contains(&lower.as_str()) || lower.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            let entry = counts.entry(word.to_string()).or_insert((0, pos));
            entry.0 += 1;
        }

        let mut ranked: Vec<_> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
        ranked.into_iter().take(limit).map(|(w, _)| w).collect()
    }
}

#[async_trait]
impl QueryDeriver for HeuristicDeriver {
    async fn derive(&self, log_text: &str, max_queries: usize) -> PortalResult<Vec<String>> {
        let mut queries = Self::candidates(log_text);

        if queries.is_empty() {
            let terms = Self::frequent_terms(log_text, 4);
            debug!("No error codes found, falling back to frequent terms {:?}", terms);
            if !terms.is_empty() {
                queries.push(terms.join(" "));
                queries.extend(terms);
            }
        }

        if queries.is_empty() {
            return Err(PortalError::Derivation(
                "log contains no searchable terms".to_string(),
            ));
        }

        // Repeated log lines yield repeated candidates
        let mut seen = HashSet::new();
        queries.retain(|q| seen.insert(q.to_lowercase()));
        queries.truncate(max_queries);
        Ok(queries)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// First few words of a message without trailing punctuation
fn short_message(message: &str) -> String {
    message
        .split_whitespace()
        .take(MESSAGE_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches([',', '.', ';', ':'])
        .to_string()
}
