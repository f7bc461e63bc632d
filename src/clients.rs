use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::classify::ImageApiError;
use crate::config::Config;
use crate::images::{ImageModelClient, ImageRequest, ImageResponse};
use crate::relay::{ByteStream, GenerateRequest, IdentityProvider, TextModelClient};

pub fn create_text_model(config: &Config) -> Result<Arc<dyn TextModelClient>> {
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().context("Gemini config missing")?;
            Ok(Arc::new(GeminiTextModel::new(&cfg.api_key, &cfg.model)))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

pub fn create_image_model(config: &Config) -> Result<Box<dyn ImageModelClient>> {
    match config.image.provider.as_str() {
        "vertex" => {
            let base_url = config
                .image
                .base_url
                .as_deref()
                .context("Image base_url missing")?;
            Ok(Box::new(VertexImageClient::new(base_url, config.image.api_key.as_deref())))
        }
        _ => Err(anyhow!("Unknown image provider: {}", config.image.provider)),
    }
}

pub fn create_identity_provider(config: &Config) -> Result<Arc<dyn IdentityProvider>> {
    match config.auth.provider.as_str() {
        "none" => Ok(Arc::new(NoopIdentityProvider)),
        "http" => {
            let verify_url = config
                .auth
                .verify_url
                .as_deref()
                .context("Auth verify_url missing")?;
            Ok(Arc::new(HttpIdentityProvider::new(verify_url)))
        }
        _ => Err(anyhow!("Unknown auth provider: {}", config.auth.provider)),
    }
}

// --- Gemini streaming text model ---

struct GeminiTextModel {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiTextModel {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[async_trait]
impl TextModelClient for GeminiTextModel {
    async fn stream_generate(&self, request: &GenerateRequest) -> Result<ByteStream> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:streamGenerateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: request.story.clone() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: request.system_instructions.clone() }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
                response_mime_type: request.response_mime_type.clone(),
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini API error ({}): {}", status, error_text));
        }

        let stream = resp
            .bytes_stream()
            .map(|item| item.map(|bytes| bytes.to_vec()).map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }
}

// --- Vertex-style image endpoint ---

struct VertexImageClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl VertexImageClient {
    fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|k| k.to_string()),
            client: reqwest::Client::new(),
        }
    }
}

/// Error body shape the image endpoint answers with on rejection.
#[derive(Deserialize)]
struct VertexErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "raiReason")]
    rai_reason: Option<String>,
}

#[async_trait]
impl ImageModelClient for VertexImageClient {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageResponse> {
        let mut builder = self.client.post(&self.base_url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let resp = builder.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            // Rejections carry their safety reason in the body; keep it
            // structured so the classifier can find it.
            let parsed: Option<VertexErrorBody> = serde_json::from_str(&body).ok();
            let (message, rai_reason) = match parsed {
                Some(b) => (b.error.unwrap_or_else(|| body.clone()), b.rai_reason),
                None => (body, None),
            };
            return Err(anyhow::Error::new(ImageApiError {
                status: Some(status),
                message,
                rai_reason,
            }));
        }

        let response: ImageResponse =
            resp.json().await.context("Failed to parse image endpoint response")?;
        Ok(response)
    }
}

// --- Identity providers ---

/// Local runs: every credential maps to the same user.
struct NoopIdentityProvider;

#[async_trait]
impl IdentityProvider for NoopIdentityProvider {
    async fn verify(&self, _bearer: &str) -> Result<String> {
        Ok("local".to_string())
    }
}

struct HttpIdentityProvider {
    verify_url: String,
    client: reqwest::Client,
}

impl HttpIdentityProvider {
    fn new(verify_url: &str) -> Self {
        Self { verify_url: verify_url.to_string(), client: reqwest::Client::new() }
    }
}

#[derive(Deserialize)]
struct VerifyResponse {
    #[serde(rename = "userId")]
    user_id: String,
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify(&self, bearer: &str) -> Result<String> {
        if bearer.is_empty() {
            return Err(anyhow!("Missing bearer credential"));
        }

        let resp = self
            .client
            .get(&self.verify_url)
            .header("Authorization", format!("Bearer {}", bearer))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(anyhow!("Credential rejected ({})", resp.status()));
        }

        let verified: VerifyResponse =
            resp.json().await.context("Failed to parse verification response")?;
        Ok(verified.user_id)
    }
}
