use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::Settings;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_MODEL: &str = "gemini-2.0-flash";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_MODEL: &str = "gpt-4o-mini";

const OPENAI_SYSTEM_PROMPT: &str =
    "You are an expert AI fashion stylist. Always respond with valid JSON only.";

/// The external completion capability: prompt (optionally with a JPEG image)
/// in, text out. One implementation per provider; pipelines hold a trait
/// object so tests can substitute counting doubles.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn generate(&self, prompt: &str, image_jpeg: Option<&[u8]>) -> Result<String>;

    fn model_name(&self) -> &str;
}

pub fn http_client(settings: &Settings) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .build()
        .map_err(|err| anyhow!("failed to build http client: {err}"))
}

/// Vision-capable model used for attribute extraction.
pub fn vision_model(settings: &Settings, client: Client) -> Arc<dyn CompletionModel> {
    Arc::new(GeminiClient::new(client, settings.gemini_api_key.clone()))
}

/// Text model used for outfit styling, selected by configuration.
pub fn styling_model(settings: &Settings, client: Client) -> Arc<dyn CompletionModel> {
    match settings.default_styler.as_str() {
        "openai" => Arc::new(OpenAiClient::new(client, settings.openai_api_key.clone())),
        _ => Arc::new(GeminiClient::new(client, settings.gemini_api_key.clone())),
    }
}

async fn assert_ok_response(response: reqwest::Response, provider: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(anyhow!("{provider} request failed: {status} {text}"))
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    message: Option<String>,
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            model: GEMINI_MODEL.to_string(),
        }
    }
}

#[async_trait]
impl CompletionModel for GeminiClient {
    async fn generate(&self, prompt: &str, image_jpeg: Option<&[u8]>) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("GEMINI_API_KEY is not set in environment variables"));
        }

        let mut parts = vec![json!({ "text": prompt })];
        if let Some(bytes) = image_jpeg {
            parts.push(json!({
                "inline_data": {
                    "mime_type": "image/jpeg",
                    "data": BASE64.encode(bytes),
                }
            }));
        }

        let response = self
            .client
            .post(format!(
                "{GEMINI_BASE_URL}/models/{}:generateContent",
                self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({ "contents": [{ "parts": parts }] }))
            .send()
            .await?;

        let response = assert_ok_response(response, "Gemini").await?;
        let payload: GeminiResponse = response.json().await?;
        if let Some(message) = payload.error.and_then(|err| err.message) {
            return Err(anyhow!("Gemini returned an error: {message}"));
        }
        let content = payload
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .and_then(|parts| parts.into_iter().find_map(|part| part.text))
            .ok_or_else(|| anyhow!("Gemini returned no text content"))?;

        Ok(content.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Option<Vec<ChatChoice>>,
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            model: OPENAI_MODEL.to_string(),
        }
    }
}

#[async_trait]
impl CompletionModel for OpenAiClient {
    async fn generate(&self, prompt: &str, image_jpeg: Option<&[u8]>) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("OPENAI_API_KEY is not set in environment variables"));
        }

        let user_content = match image_jpeg {
            Some(bytes) => json!([
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:image/jpeg;base64,{}", BASE64.encode(bytes)),
                    }
                }
            ]),
            None => json!(prompt),
        };

        let response = self
            .client
            .post(format!("{OPENAI_BASE_URL}/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": OPENAI_SYSTEM_PROMPT },
                    { "role": "user", "content": user_content }
                ],
                "max_tokens": 1000,
                "temperature": 0.7,
            }))
            .send()
            .await?;

        let response = assert_ok_response(response, "OpenAI").await?;
        let payload: ChatCompletionResponse = response.json().await?;
        if let Some(message) = payload.error.and_then(|err| err.message) {
            return Err(anyhow!("OpenAI returned an error: {message}"));
        }
        let content = payload
            .choices
            .and_then(|choices| choices.into_iter().next())
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| anyhow!("OpenAI returned no message content"))?;

        Ok(content.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Parse a model response as one JSON value, salvaging the span between the
/// first `{` and the last `}` when strict parsing fails. Unsalvageable text
/// comes back as a structured error object carrying the raw response.
pub fn parse_json_with_salvage(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return value;
            }
        }
    }

    json!({
        "error": "Model response was not valid JSON",
        "raw_response": raw,
    })
}
