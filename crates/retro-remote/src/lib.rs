use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use retro_core::{CoreError, ImagePayload, RuntimeConfig, TransformBackend, TransformRequest};
use serde::{Deserialize, Serialize};

/// Read when the configured key variable is unset.
pub const FALLBACK_API_KEY_ENV: &str = "API_KEY";
const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiBackend {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(config: &RuntimeConfig, api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("api key must not be empty"));
        }
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("retro-lens/0.1"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            endpoint: generate_content_url(&config.api_base, &config.model),
            api_key,
        })
    }

    pub fn from_env(config: &RuntimeConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| env::var(FALLBACK_API_KEY_ENV).ok().filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| anyhow!("missing {} (or {}) for the remote model", config.api_key_env, FALLBACK_API_KEY_ENV))?;
        Self::new(config, api_key)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TransformBackend for GeminiBackend {
    fn generate(&self, request: &TransformRequest) -> Result<ImagePayload, CoreError> {
        let body = build_request_body(request);
        log::debug!("posting {} style request to {}", request.style, self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .map_err(|e| CoreError::Network(e.to_string()))?;
        let status = response.status();
        let text = response.text().map_err(|e| CoreError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(CoreError::Remote {
                status: status.as_u16(),
                message: remote_error_message(&text).unwrap_or_else(|| status.to_string()),
            });
        }
        let parsed: GenerateContentResponse =
            serde_json::from_str(&text).map_err(|e| CoreError::Backend(format!("invalid response body: {}", e)))?;
        extract_image(parsed)
    }
}

pub fn generate_content_url(api_base: &str, model: &str) -> String {
    format!("{}/models/{}:generateContent", api_base.trim_end_matches('/'), model)
}

/// Accepts raw base64 or a `data:<mime>;base64,<data>` URL.
pub fn strip_data_url_prefix(encoded: &str) -> &str {
    match encoded.split_once(',') {
        Some((_, data)) => data,
        None => encoded,
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateContentRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    InlineData { inline_data: RequestInlineData },
}

#[derive(Debug, Serialize)]
struct RequestInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

pub fn build_request_body(request: &TransformRequest) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![RequestContent {
            role: "user",
            parts: vec![
                RequestPart::Text {
                    text: request.style.config().prompt(),
                },
                RequestPart::InlineData {
                    inline_data: RequestInlineData {
                        mime_type: request.mime_type.clone(),
                        data: BASE64.encode(&request.image_bytes),
                    },
                },
            ],
        }],
        generation_config: GenerationConfig {
            response_modalities: vec!["TEXT", "IMAGE"],
        },
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(alias = "inline_data", rename = "inlineData")]
    inline_data: Option<ResponseInlineData>,
}

#[derive(Debug, Deserialize)]
struct ResponseInlineData {
    #[serde(alias = "mime_type", rename = "mimeType")]
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

/// Takes the first image part of the first candidate.
pub fn extract_image(response: GenerateContentResponse) -> Result<ImagePayload, CoreError> {
    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .unwrap_or_default();
    for part in parts {
        let Some(inline) = part.inline_data else {
            continue;
        };
        let Some(data) = inline.data.filter(|d| !d.is_empty()) else {
            continue;
        };
        let bytes = BASE64
            .decode(strip_data_url_prefix(&data).trim())
            .map_err(|e| CoreError::Backend(format!("invalid base64 image data: {}", e)))?;
        let mime_type = inline
            .mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "image/png".to_string());
        return Ok(ImagePayload::new(mime_type, bytes));
    }
    Err(CoreError::EmptyResponse)
}

fn remote_error_message(body: &str) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    match (envelope.error.status, envelope.error.message) {
        (Some(status), Some(message)) => Some(format!("{}: {}", status, message)),
        (None, Some(message)) => Some(message),
        (Some(status), None) => Some(status),
        (None, None) => None,
    }
}
