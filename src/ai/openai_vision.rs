use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{AiError, ChatMessage, ContentPart, Role, VisionProvider};

/// Upper bound on the description length the model may produce.
const MAX_OUTPUT_TOKENS: u32 = 300;
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// How the API key is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>` (OpenAI, OpenRouter, most local servers)
    #[default]
    Bearer,
    /// `api-key: <key>` (Azure OpenAI)
    ApiKey,
}

/// Client for any endpoint speaking the OpenAI chat-completions dialect.
pub struct OpenAiVisionClient {
    name: String,
    base_url: String,
    api_key: String,
    auth: AuthScheme,
    client: Client,
}

impl OpenAiVisionClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            auth: AuthScheme::Bearer,
            client: Client::new(),
        }
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    fn endpoint_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request_body(&self, model: &str, messages: &[ChatMessage]) -> Value {
        let messages: Vec<Value> = messages.iter().map(message_to_json).collect();
        json!({
            "model": model,
            "messages": messages,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "stream": false
        })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Text-only messages use the plain string form; anything with an image
/// uses the content-part array.
fn message_to_json(message: &ChatMessage) -> Value {
    if !message.has_image() {
        return json!({ "role": role_str(message.role), "content": message.text() });
    }
    let parts: Vec<Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({ "type": "text", "text": text }),
            ContentPart::ImageUrl(url) => json!({
                "type": "image_url",
                "image_url": { "url": url }
            }),
        })
        .collect();
    json!({ "role": role_str(message.role), "content": parts })
}

/// Pull `choices[0].message.content` out of a completion. Content may be a
/// string or an array of text parts; absent content is an empty answer.
fn parse_response_text(body: &Value) -> Result<String, AiError> {
    if let Some(err) = body.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(AiError::ModelError(message.to_string()));
    }

    let choices = body
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| AiError::InvalidResponse("missing choices".into()))?;
    let Some(content) = choices.first().and_then(|c| c.pointer("/message/content")) else {
        return Ok(String::new());
    };

    match content {
        Value::String(text) => Ok(text.trim().to_string()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()),
        Value::Null => Ok(String::new()),
        other => Err(AiError::InvalidResponse(format!(
            "unexpected content type: {other}"
        ))),
    }
}

fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(DEFAULT_RETRY_AFTER_MS)
}

#[async_trait]
impl VisionProvider for OpenAiVisionClient {
    async fn generate_text(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, AiError> {
        let body = self.build_request_body(model, messages);

        let mut req = self
            .client
            .post(self.endpoint_url())
            .header("Content-Type", "application/json");

        if !self.api_key.is_empty() {
            req = match self.auth {
                AuthScheme::Bearer => req.header("Authorization", format!("Bearer {}", self.api_key)),
                AuthScheme::ApiKey => req.header("api-key", &self.api_key),
            };
        }

        log::debug!("{}: sending vision request (model={})", self.name, model);
        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(response.headers());
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".into());

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(AiError::AuthError(error_body));
            }
            if status.as_u16() == 429 {
                return Err(AiError::RateLimited {
                    retry_after_ms: retry_after,
                });
            }
            return Err(AiError::ConnectionError(format!(
                "HTTP {}: {}",
                status, error_body
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
        parse_response_text(&parsed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
