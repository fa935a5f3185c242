//! OpenRouter API client
//!
//! Implements `GenerationEngine` over the chat completions endpoint. Rate
//! limiting is the only condition retried, with exponential backoff (honouring
//! `Retry-After`) up to `max_retries`; everything else fails at once.

use crate::agent::types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::config::GenerationConfig;
use crate::core::{GenerationEngine, Message};
use crate::error::{Error, GenerationFailure, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{header, Client, StatusCode};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

type Attempt = std::result::Result<String, backoff::Error<GenerationFailure>>;

/// OpenRouter API client
#[derive(Clone)]
pub struct OpenRouterClient {
    /// HTTP client
    client: Client,
    /// Configuration
    config: GenerationConfig,
    /// First wait between rate-limited attempts
    initial_retry_interval: Duration,
}

impl OpenRouterClient {
    /// Create a new OpenRouter client
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();

        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", config.api_key.expose_secret()))
                .map_err(|e| Error::Config(format!("Invalid API key format: {}", e)))?,
        );

        // Add OpenRouter-specific headers
        if let Some(ref site_url) = config.site_url {
            if let Ok(value) = header::HeaderValue::from_str(site_url) {
                headers.insert("HTTP-Referer", value);
            }
        }
        if let Some(ref site_name) = config.site_name {
            if let Ok(value) = header::HeaderValue::from_str(site_name) {
                headers.insert("X-Title", value);
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(OpenRouterClient {
            client,
            config,
            initial_retry_interval: Duration::from_millis(500),
        })
    }

    /// Override the first backoff interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.initial_retry_interval = interval;
        self
    }

    /// Model used for completions
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Run a chat completion, returning the first choice's text
    pub async fn chat(&self, messages: Vec<Message>) -> std::result::Result<String, GenerationFailure> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
            stream: Some(false),
        };

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_retry_interval)
            .with_max_elapsed_time(None)
            .build();
        let attempts = AtomicU32::new(0);
        let (attempts, request) = (&attempts, &request);

        backoff::future::retry(policy, || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            match self.send_request(request).await {
                Err(backoff::Error::Transient { err, .. }) if attempt >= self.config.max_retries => {
                    Err(backoff::Error::permanent(err))
                }
                other => other,
            }
        })
        .await
    }

    /// Send one request to the OpenRouter API
    async fn send_request(&self, request: &ChatCompletionRequest) -> Attempt {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        debug!("Sending request to OpenRouter: model={}", request.model);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| backoff::Error::permanent(transport_failure(e)))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let error_text = response.text().await.unwrap_or_default();
            warn!("Rate limit exceeded: {}", error_text);

            let failure = GenerationFailure::RateLimited(error_text);
            return Err(match retry_after {
                Some(wait) => backoff::Error::retry_after(failure, wait),
                None => backoff::Error::transient(failure),
            });
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let failure = if status == StatusCode::UNAUTHORIZED {
                GenerationFailure::Provider("invalid API key".to_string())
            } else {
                GenerationFailure::Provider(format!("API error ({}): {}", status, error_text))
            };
            return Err(backoff::Error::permanent(failure));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| backoff::Error::permanent(transport_failure(e)))?;

        if let Some(ref usage) = body.usage {
            info!(
                "OpenRouter response: model={}, tokens={}",
                body.model, usage.total_tokens
            );
        }

        if body.choices.first().and_then(|c| c.finish_reason.as_deref()) == Some("length") {
            warn!(max_tokens = self.config.max_tokens, "Completion hit the token limit");
        }

        match body.content().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(backoff::Error::permanent(GenerationFailure::EmptyResponse)),
        }
    }
}

fn transport_failure(e: reqwest::Error) -> GenerationFailure {
    if e.is_timeout() {
        GenerationFailure::Timeout
    } else if e.is_decode() {
        GenerationFailure::Malformed(e.to_string())
    } else {
        GenerationFailure::Provider(e.to_string())
    }
}

#[async_trait]
impl GenerationEngine for OpenRouterClient {
    fn id(&self) -> &str {
        "openrouter"
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, GenerationFailure> {
        self.chat(vec![Message::user(prompt)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> GenerationConfig {
        GenerationConfig {
            api_key: SecretString::from("test-key"),
            base_url: base_url.to_string(),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
            ..GenerationConfig::default()
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "id": "gen-1",
            "model": "deepseek/deepseek-chat",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    fn client(server: &MockServer) -> OpenRouterClient {
        OpenRouterClient::new(test_config(&server.uri()))
            .unwrap()
            .with_retry_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_client_creation() {
        let client = OpenRouterClient::new(test_config("https://openrouter.ai/api/v1"));
        assert!(client.is_ok());
        assert_eq!(client.unwrap().model(), "deepseek/deepseek-chat");
    }

    #[tokio::test]
    async fn test_complete_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header_matcher("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  SELECT 1;  ")))
            .expect(1)
            .mount(&server)
            .await;

        let text = client(&server).complete("count rows").await.unwrap();
        assert_eq!(text, "SELECT 1;");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("SELECT 2;")))
            .mount(&server)
            .await;

        let text = client(&server).complete("q").await.unwrap();
        assert_eq!(text, "SELECT 2;");
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).complete("q").await.unwrap_err();
        assert_eq!(err, GenerationFailure::RateLimited("slow down".to_string()));
    }

    #[tokio::test]
    async fn test_empty_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ")))
            .mount(&server)
            .await;

        let err = client(&server).complete("q").await.unwrap_err();
        assert_eq!(err, GenerationFailure::EmptyResponse);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).complete("q").await.unwrap_err();
        assert!(matches!(err, GenerationFailure::Provider(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("SELECT 1;"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let config = GenerationConfig {
            request_timeout: Duration::from_millis(100),
            ..test_config(&server.uri())
        };
        let err = OpenRouterClient::new(config).unwrap().complete("q").await.unwrap_err();
        assert_eq!(err, GenerationFailure::Timeout);
    }
}
