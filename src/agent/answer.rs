//! Answer engines
//!
//! Producing an answer is outside the routing protocol. A node that holds a
//! matching capability asks its [`AnswerEngine`]; declining hands the request
//! back to routing.
//!
//! # Adapters
//!
//! - [`DecliningAnswerEngine`]: pure routers
//! - [`HttpAnswerEngine`]: POSTs `{"topic", "query"}` to an external service
//!   and expects `{"answered": bool, "payload": any}` back, validated against
//!   the schema generated from [`AnswerResponse`]

use crate::config::{AnswerEngineKind, AnswerSection};
use crate::protocol::topics::TopicPath;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_BACKOFF_MS: u64 = 5_000;

/// Answer engine errors
#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("Answer engine is not configured: {0}")]
    NotConfigured(String),
    #[error("Answer request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Answer service returned status {0}")]
    Status(u16),
    #[error("Answer service unreachable: {0}")]
    Network(String),
    #[error("Invalid answer response: {0}")]
    InvalidResponse(String),
    #[error("Schema error: {0}")]
    Schema(String),
}

/// What an engine made of a query
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    Answered(Value),
    /// Not answerable here; keep routing
    Declined,
}

#[async_trait::async_trait]
pub trait AnswerEngine: Send + Sync {
    async fn answer(&self, topic: &TopicPath, query: &str) -> Result<AnswerOutcome, AnswerError>;
}

/// Never answers
#[derive(Debug, Clone, Copy, Default)]
pub struct DecliningAnswerEngine;

#[async_trait::async_trait]
impl AnswerEngine for DecliningAnswerEngine {
    async fn answer(&self, _topic: &TopicPath, _query: &str) -> Result<AnswerOutcome, AnswerError> {
        Ok(AnswerOutcome::Declined)
    }
}

/// Build the engine selected in `[answer]`
pub fn answer_engine_from_config(
    section: &AnswerSection,
) -> Result<Arc<dyn AnswerEngine>, AnswerError> {
    match section.engine {
        AnswerEngineKind::None => Ok(Arc::new(DecliningAnswerEngine)),
        AnswerEngineKind::Http => {
            let url = section
                .url
                .clone()
                .ok_or_else(|| AnswerError::NotConfigured("answer.url is missing".into()))?;
            Ok(Arc::new(HttpAnswerEngine::new(
                url,
                Duration::from_millis(section.timeout_ms),
                section.retry_attempts,
            )?))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AnswerRequest<'a> {
    topic: String,
    query: &'a str,
}

/// Body an answer service must return
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnswerResponse {
    /// Whether the service produced an answer
    pub answered: bool,
    /// The answer itself; ignored when `answered` is false
    #[serde(default)]
    pub payload: Option<Value>,
}

impl AnswerResponse {
    pub fn json_schema() -> Result<Value, AnswerError> {
        let schema = schemars::schema_for!(AnswerResponse);
        serde_json::to_value(schema).map_err(|e| AnswerError::Schema(e.to_string()))
    }
}

/// Answer engine backed by an external HTTP service
pub struct HttpAnswerEngine {
    url: String,
    timeout: Duration,
    retry_attempts: usize,
    client: reqwest::Client,
    validator: jsonschema::Validator,
}

impl HttpAnswerEngine {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        retry_attempts: usize,
    ) -> Result<Self, AnswerError> {
        let schema = AnswerResponse::json_schema()?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| AnswerError::Schema(format!("Schema compilation error: {e}")))?;

        Ok(Self {
            url: url.into(),
            timeout,
            retry_attempts,
            client: reqwest::Client::new(),
            validator,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn parse_body(&self, body: &str) -> Result<AnswerOutcome, AnswerError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| AnswerError::InvalidResponse(format!("not JSON: {e}")))?;

        self.validator.validate(&value).map_err(|errors| {
            let messages: Vec<String> = errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect();
            AnswerError::InvalidResponse(messages.join("; "))
        })?;

        let response: AnswerResponse = serde_json::from_value(value)
            .map_err(|e| AnswerError::InvalidResponse(e.to_string()))?;

        Ok(match response {
            AnswerResponse {
                answered: true,
                payload,
            } => AnswerOutcome::Answered(payload.unwrap_or(Value::Null)),
            AnswerResponse {
                answered: false, ..
            } => AnswerOutcome::Declined,
        })
    }
}

#[async_trait::async_trait]
impl AnswerEngine for HttpAnswerEngine {
    async fn answer(&self, topic: &TopicPath, query: &str) -> Result<AnswerOutcome, AnswerError> {
        let request = AnswerRequest {
            topic: topic.to_string(),
            query,
        };
        let mut last_error = None;

        for attempt in 0..=self.retry_attempts {
            debug!(
                attempt = attempt + 1,
                max_attempts = self.retry_attempts + 1,
                url = %self.url,
                "Calling answer service"
            );

            match self
                .client
                .post(&self.url)
                .json(&request)
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response
                            .text()
                            .await
                            .map_err(|e| AnswerError::Network(e.to_string()))?;
                        let outcome = self.parse_body(&body)?;
                        info!(
                            topic = %topic,
                            answered = matches!(outcome, AnswerOutcome::Answered(_)),
                            "Answer service replied"
                        );
                        return Ok(outcome);
                    } else if status.is_server_error() && attempt < self.retry_attempts {
                        warn!(status = %status, attempt = attempt + 1, "Answer service error, retrying...");
                        last_error = Some(AnswerError::Status(status.as_u16()));
                    } else {
                        return Err(AnswerError::Status(status.as_u16()));
                    }
                }
                Err(e) if e.is_timeout() => return Err(AnswerError::Timeout(self.timeout)),
                Err(e) if attempt < self.retry_attempts => {
                    warn!(error = %e, attempt = attempt + 1, "Answer service network error, retrying...");
                    last_error = Some(AnswerError::Network(e.to_string()));
                }
                Err(e) => return Err(AnswerError::Network(e.to_string())),
            }

            tokio::time::sleep(retry_backoff(attempt)).await;
        }

        Err(last_error.unwrap_or_else(|| AnswerError::Network("retries exhausted".into())))
    }
}

/// Doubling delay from 100ms, capped at five seconds
fn retry_backoff(attempt: usize) -> Duration {
    let factor = u32::try_from(attempt)
        .ok()
        .and_then(|exp| 2_u64.checked_pow(exp))
        .unwrap_or(u64::MAX);
    Duration::from_millis(100u64.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn topic() -> TopicPath {
        TopicPath::parse("food/vegan").unwrap()
    }

    async fn engine(server: &MockServer, retries: usize) -> HttpAnswerEngine {
        HttpAnswerEngine::new(
            format!("{}/answer", server.uri()),
            Duration::from_secs(2),
            retries,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_answered_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/answer"))
            .and(body_json(json!({"topic": "food/vegan", "query": "dinner?"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "answered": true,
                "payload": {"place": "Green Leaf"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = engine(&server, 0).await.answer(&topic(), "dinner?").await.unwrap();
        assert_eq!(outcome, AnswerOutcome::Answered(json!({"place": "Green Leaf"})));
    }

    #[tokio::test]
    async fn test_declined() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answered": false})))
            .mount(&server)
            .await;

        let outcome = engine(&server, 0).await.answer(&topic(), "q").await.unwrap();
        assert_eq!(outcome, AnswerOutcome::Declined);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "answered": true,
                "payload": 42
            })))
            .mount(&server)
            .await;

        let outcome = engine(&server, 3).await.answer(&topic(), "q").await.unwrap();
        assert_eq!(outcome, AnswerOutcome::Answered(json!(42)));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let err = engine(&server, 3).await.answer(&topic(), "q").await.unwrap_err();
        assert!(matches!(err, AnswerError::Status(400)));
    }

    #[tokio::test]
    async fn test_response_must_match_schema() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answered": "yes"})))
            .mount(&server)
            .await;

        let err = engine(&server, 0).await.answer(&topic(), "q").await.unwrap_err();
        assert!(matches!(err, AnswerError::InvalidResponse(_)));
    }

    #[test]
    fn test_config_selection() {
        let section = AnswerSection::default();
        assert!(answer_engine_from_config(&section).is_ok());

        let missing_url = AnswerSection {
            engine: AnswerEngineKind::Http,
            ..AnswerSection::default()
        };
        assert!(matches!(
            answer_engine_from_config(&missing_url),
            Err(AnswerError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        assert_eq!(retry_backoff(0), Duration::from_millis(100));
        assert_eq!(retry_backoff(3), Duration::from_millis(800));
        assert_eq!(retry_backoff(6), Duration::from_millis(MAX_BACKOFF_MS));
        // Far past the point where 2^attempt overflows
        assert_eq!(retry_backoff(64), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(retry_backoff(usize::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }
}
