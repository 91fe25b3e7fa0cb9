use memefeed_core::{CoreError, Embedding, LlmError, OpenAiConfig};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

const PROVIDER: &str = "openai";
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Turns post text into a content embedding.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Embedding, CoreError>> + Send;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http_client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig, api_key: String) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            http_client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }
}

impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, CoreError> {
        if text.trim().is_empty() {
            return Err(CoreError::InvalidInput {
                message: "cannot embed empty text".to_string(),
            });
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
        };

        debug!("Requesting embedding from {} with model {}", PROVIDER, self.model);
        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Network error calling {}: {}", PROVIDER, e);
                if e.is_timeout() {
                    CoreError::Llm(LlmError::RequestTimeout {
                        provider: PROVIDER.to_string(),
                    })
                } else {
                    CoreError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            error!("Embedding request failed with status: {}", status);
            return Err(status_error(status, response.headers()).into());
        }

        let body = response.text().await?;
        parse_embedding_response(&body)
    }
}

/// Maps a non-success status from the embeddings endpoint to an error.
fn status_error(status: StatusCode, headers: &HeaderMap) -> LlmError {
    let provider = PROVIDER.to_string();
    match status.as_u16() {
        401 => LlmError::InvalidApiKey { provider },
        429 => {
            let retry_after = headers
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            warn!("Rate limited, retry after {} seconds", retry_after);
            LlmError::RateLimitExceeded {
                provider,
                retry_after,
            }
        }
        code if status.is_server_error() => {
            debug!("{} returned server error {}", PROVIDER, code);
            LlmError::ServiceUnavailable { provider }
        }
        status_code => LlmError::RequestRejected {
            provider,
            status_code,
        },
    }
}

/// Extracts the first embedding from an embeddings API response body.
pub fn parse_embedding_response(body: &str) -> Result<Embedding, CoreError> {
    let invalid = || {
        CoreError::Llm(LlmError::InvalidResponseFormat {
            provider: PROVIDER.to_string(),
        })
    };

    let response: EmbeddingResponse = serde_json::from_str(body).map_err(|e| {
        warn!("Unparseable embeddings response: {}", e);
        invalid()
    })?;

    match response.data.into_iter().next() {
        Some(data) if !data.embedding.is_empty() => Ok(data.embedding),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_embedding_response() {
        let body = r#"{
            "object": "list",
            "data": [{"object": "embedding", "index": 0, "embedding": [0.25, -0.5, 1.0]}],
            "model": "text-embedding-3-small",
            "usage": {"prompt_tokens": 5, "total_tokens": 5}
        }"#;

        let embedding = parse_embedding_response(body).unwrap();
        assert_eq!(embedding, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn test_parse_rejects_malformed_bodies() {
        for body in [
            "not json",
            r#"{"data": []}"#,
            r#"{"data": [{"embedding": []}]}"#,
            r#"{"error": {"message": "boom"}}"#,
        ] {
            let result = parse_embedding_response(body);
            assert!(
                matches!(result, Err(CoreError::Llm(LlmError::InvalidResponseFormat { .. }))),
                "accepted {}",
                body
            );
        }
    }

    #[test]
    fn test_status_mapping() {
        let headers = HeaderMap::new();

        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, &headers),
            LlmError::InvalidApiKey { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &headers),
            LlmError::ServiceUnavailable { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, &headers),
            LlmError::RequestRejected {
                status_code: 400,
                ..
            }
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers),
            LlmError::RateLimitExceeded {
                retry_after: DEFAULT_RETRY_AFTER_SECS,
                ..
            }
        ));
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("12"));

        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers),
            LlmError::RateLimitExceeded {
                retry_after: 12,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_text_is_rejected_without_request() {
        let config = OpenAiConfig {
            base_url: "http://127.0.0.1:9/v1/".to_string(),
            ..OpenAiConfig::default()
        };
        let provider = OpenAiProvider::new(&config, "sk-test".to_string()).unwrap();
        assert_eq!(provider.endpoint(), "http://127.0.0.1:9/v1/embeddings");

        let result = tokio_test::block_on(provider.embed("   "));
        assert!(matches!(result, Err(CoreError::InvalidInput { .. })));
    }
}
