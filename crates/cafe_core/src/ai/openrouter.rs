//! OpenRouter chat-completions client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{CompletionProvider, CompletionRequest};
use crate::config::AiConfig;
use crate::error::CompletionError;

const REFERER: &str = "https://github.com/cafe-bot";
const TITLE: &str = "Cafe Bot Discord";

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
        }
    }

    fn headers(&self, api_key: &str) -> Result<HeaderMap, CompletionError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| CompletionError::Request(format!("invalid API key: {}", e)))?,
        );
        headers.insert("http-referer", HeaderValue::from_static(REFERER));
        headers.insert("x-title", HeaderValue::from_static(TITLE));
        Ok(headers)
    }

    fn to_api_request<'a>(&'a self, request: &'a CompletionRequest) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            messages: [
                ApiMessage {
                    role: "system",
                    content: &request.system,
                },
                ApiMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
        }
    }

    async fn send(&self, api_key: &str, request: &CompletionRequest) -> Result<String, CompletionError> {
        let response = self
            .client
            .post(&self.api_url)
            .headers(self.headers(api_key)?)
            .json(&self.to_api_request(request))
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;
        if !status.is_success() {
            tracing::error!("Completion API error {}: {}", status.as_u16(), body);
            return Err(CompletionError::Http {
                status: status.as_u16(),
                body,
            });
        }
        parse_completion(&body)
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(CompletionError::NotConfigured);
        };
        match tokio::time::timeout(request.timeout, self.send(api_key, &request)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout {
                after: request.timeout,
            }),
        }
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Extract the first choice's text from a chat-completions response body.
pub(crate) fn parse_completion(body: &str) -> Result<String, CompletionError> {
    let response: ApiResponse = serde_json::from_str(body).map_err(|e| {
        tracing::error!("Invalid completion response: {}", e);
        CompletionError::Empty
    })?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        return Err(CompletionError::Empty);
    }
    Ok(content)
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: [ApiMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn client(api_key: Option<&str>) -> OpenRouterClient {
        OpenRouterClient::new(&AiConfig {
            api_key: api_key.map(str::to_string),
            ..AiConfig::default()
        })
    }

    #[test]
    fn test_request_body() {
        let client = client(Some("k"));
        let request = CompletionRequest::new("sys", "hi", Duration::from_secs(1))
            .with_temperature(0.3)
            .with_max_tokens(50);
        let body = serde_json::to_value(client.to_api_request(&request)).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "openai/gpt-4-turbo-preview",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "hi"},
                ],
                "temperature": 0.3f32,
                "max_tokens": 50,
            })
        );

        let request = request.with_top_p(0.95).with_penalties(0.6);
        let body = serde_json::to_value(client.to_api_request(&request)).unwrap();
        assert_eq!(body["top_p"], json!(0.95f32));
        assert_eq!(body["frequency_penalty"], json!(0.6f32));
    }

    #[test]
    fn test_headers() {
        let headers = client(Some("secret")).headers("secret").unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer secret");
        assert_eq!(headers["http-referer"], REFERER);
        assert_eq!(headers["x-title"], TITLE);
    }

    #[test]
    fn test_parse_completion() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  salut \n"}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "salut");

        for body in [
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"content":"   "}}]}"#,
            r#"{"choices":[{"message":{"content":null}}]}"#,
            "not json",
        ] {
            assert!(matches!(parse_completion(body), Err(CompletionError::Empty)), "{body}");
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        for client in [client(None), client(Some("  "))] {
            assert!(!client.is_configured());
            let err = client
                .complete(CompletionRequest::new("s", "u", Duration::from_secs(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, CompletionError::NotConfigured));
        }
    }
}
