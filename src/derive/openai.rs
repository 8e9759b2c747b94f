//! OpenAI-compatible chat completion deriver

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::QueryDeriver;
use crate::LlmConfig;
use crate::error::{PortalError, PortalResult};

/// Logs longer than this are cut before being sent to the model
const MAX_LOG_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You turn Oracle diagnostic logs into My Oracle Support knowledge base searches. \
Pick the distinctive error codes (ORA-, TNS-, PLS-, RMAN-, OPatch, Java exceptions) and the key message text. \
Each query must be short and specific, as a support engineer would type it. \
Respond with a JSON object of the form {\"queries\": [\"...\"]} and nothing else.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct QueryList {
    queries: Vec<String>,
}

/// Derives queries with an OpenAI-compatible `chat/completions` endpoint
pub struct OpenAiDeriver {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl fmt::Debug for OpenAiDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiDeriver")
            .field("base_url", &self.base_url)
            .field("api_key", &mask_api_key(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiDeriver {
    pub fn new(config: &LlmConfig) -> PortalResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PortalError::Derivation("OPENAI_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PortalError::Derivation(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete(&self, user_prompt: String) -> PortalResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(user_prompt),
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat { r#type: "json_object" },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PortalError::Derivation(format!("LLM request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PortalError::Derivation(format!("LLM response unreadable: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| text.chars().take(300).collect());
            return Err(PortalError::Derivation(format!("LLM returned {status}: {message}")));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| PortalError::Derivation(format!("Unexpected LLM response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PortalError::Derivation("LLM response had no content".to_string()))
    }
}

#[async_trait]
impl QueryDeriver for OpenAiDeriver {
    #[instrument(skip(self, log_text), fields(model = %self.model, log_len = log_text.len()))]
    async fn derive(&self, log_text: &str, max_queries: usize) -> PortalResult<Vec<String>> {
        let log: String = log_text.chars().take(MAX_LOG_CHARS).collect();
        let prompt = format!(
            "Propose at most {max_queries} search queries for this log:\n\n{log}"
        );

        let content = self.complete(prompt).await?;
        debug!("LLM answered with {} chars", content.len());

        let queries = parse_query_list(&content)?;
        Ok(queries.into_iter().take(max_queries).collect())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Parse `{"queries": [...]}` or a bare array, tolerating a fenced code block
fn parse_query_list(content: &str) -> PortalResult<Vec<String>> {
    let body = strip_code_fence(content);
    if let Ok(list) = serde_json::from_str::<QueryList>(body) {
        return Ok(list.queries);
    }
    serde_json::from_str::<Vec<String>>(body).map_err(|e| {
        PortalError::Derivation(format!("LLM output is not a query list: {e}"))
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json") on the opening fence line
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_and_array() {
        assert_eq!(
            parse_query_list(r#"{"queries": ["ORA-00600 kcratr_scan_lastbwr", "ORA-00600"]}"#).unwrap(),
            vec!["ORA-00600 kcratr_scan_lastbwr", "ORA-00600"]
        );
        assert_eq!(parse_query_list(r#"["TNS-12514"]"#).unwrap(), vec!["TNS-12514"]);
    }

    #[test]
    fn test_parse_fenced_output() {
        let content = "```json\n{\"queries\": [\"ORA-04031 shared pool\"]}\n```";
        assert_eq!(parse_query_list(content).unwrap(), vec!["ORA-04031 shared pool"]);
    }

    #[test]
    fn test_prose_is_derivation_error() {
        let err = parse_query_list("Sure! Try searching for ORA-00600.").unwrap_err();
        assert!(matches!(err, PortalError::Derivation(_)));
    }

    #[test]
    fn test_missing_key_is_derivation_error() {
        let err = OpenAiDeriver::new(&LlmConfig::default()).unwrap_err();
        assert!(matches!(err, PortalError::Derivation(_)));
    }

    #[test]
    fn test_mask_handles_multibyte_keys() {
        assert_eq!(mask_api_key("ключ-1234567890-конец"), "ключ...конец");
        assert_eq!(mask_api_key("äöüßäöüß"), "****");
    }

    #[test]
    fn test_debug_masks_key() {
        let config = LlmConfig {
            api_key: Some("sk-abcdefghijklmnop".to_string()),
            ..LlmConfig::default()
        };
        let deriver = OpenAiDeriver::new(&config).unwrap();
        let debug = format!("{deriver:?}");
        assert!(debug.contains("sk-a...mnop"));
        assert!(!debug.contains("abcdefghijkl"));
    }
}
