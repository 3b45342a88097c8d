use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Short-answer text inference. Callers treat every answer as untrusted and
/// keep a deterministic fallback.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> AppResult<String>;
}

pub fn from_config(config: &AppConfig) -> AppResult<Arc<dyn InferenceClient>> {
    match config.inference_api_key.clone() {
        Some(key) => Ok(Arc::new(HttpInferenceClient::new(
            &config.inference_endpoint,
            &config.inference_model,
            key,
        )?)),
        None => {
            debug!("no inference key configured; region and airport hints use fallbacks");
            Ok(Arc::new(DisabledInference))
        }
    }
}

pub struct DisabledInference;

#[async_trait]
impl InferenceClient for DisabledInference {
    async fn complete(&self, _prompt: &str, _max_tokens: u32) -> AppResult<String> {
        Err(AppError::Inference("inference is not configured".into()))
    }
}

pub struct HttpInferenceClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl HttpInferenceClient {
    pub fn new(endpoint: &str, model: &str, api_key: SecretString) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> AppResult<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Inference(format!("endpoint returned {status}")));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(text.trim().to_string())
    }
}


#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn extracts_text_blocks() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method("POST"),
                request::path("/v1/messages"),
            ])
            .respond_with(json_encoded(json!({
                "content": [{"type": "text", "text": "  Vienna, Austria\n"}]
            }))),
        );

        let client = HttpInferenceClient::new(
            &server.url_str("/v1/messages"),
            "test-model",
            SecretString::from("test-key".to_string()),
        )
        .unwrap();
        let answer = client.complete("Where?", 50).await.unwrap();
        assert_eq!(answer, "Vienna, Austria");
    }

    #[tokio::test]
    async fn surfaces_endpoint_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/v1/messages")).respond_with(status_code(529)),
        );
        let client = HttpInferenceClient::new(
            &server.url_str("/v1/messages"),
            "test-model",
            SecretString::from("k".to_string()),
        )
        .unwrap();
        assert!(matches!(
            client.complete("Where?", 50).await,
            Err(AppError::Inference(_))
        ));
    }

    #[tokio::test]
    async fn disabled_client_always_errors() {
        assert!(DisabledInference.complete("x", 10).await.is_err());
    }
}
