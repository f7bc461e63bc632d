use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::images::ImageRunConfig;
use crate::relay::RelayOptions;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_tales_root")]
    pub tales_root: String,

    #[serde(default)]
    pub auth: AuthConfig,

    pub llm: LlmConfig,

    pub image: ImageConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini"
    pub gemini: Option<GeminiConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// "none" for local runs, "http" to verify against an endpoint.
    #[serde(default = "default_auth_provider")]
    pub provider: String,
    pub verify_url: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { provider: default_auth_provider(), verify_url: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    pub provider: String, // "vertex"
    pub base_url: Option<String>,
    pub api_key: Option<String>,

    #[serde(default = "default_image_model")]
    pub model: String,

    #[serde(default = "default_art_style")]
    pub art_style: String,

    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,

    #[serde(default = "default_base_seed")]
    pub base_seed: u64,

    /// Fixed pause between page calls; concurrency stays at exactly 1.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    #[serde(default = "default_sample_count")]
    pub sample_count: u32,

    #[serde(default = "default_safety_filter_level")]
    pub safety_filter_level: String,

    #[serde(default = "default_person_generation")]
    pub person_generation: String,

    #[serde(default)]
    pub add_watermark: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_progress_every")]
    pub progress_every_n_chunks: u64,
    #[serde(default = "default_pct_per_chunk")]
    pub pct_per_chunk: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            progress_every_n_chunks: default_progress_every(),
            pct_per_chunk: default_pct_per_chunk(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

fn default_tales_root() -> String {
    "tales".to_string()
}
fn default_auth_provider() -> String {
    "none".to_string()
}
fn default_image_model() -> String {
    "imagen-3.0-generate-002".to_string()
}
fn default_art_style() -> String {
    "Soft watercolor children's book".to_string()
}
fn default_aspect_ratio() -> String {
    "1:1".to_string()
}
fn default_base_seed() -> u64 {
    7000
}
fn default_page_delay_ms() -> u64 {
    2000
}
fn default_sample_count() -> u32 {
    1
}
fn default_safety_filter_level() -> String {
    "block_some".to_string()
}
fn default_person_generation() -> String {
    "allow_adult".to_string()
}
fn default_progress_every() -> u64 {
    5
}
fn default_pct_per_chunk() -> u64 {
    3
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    8192
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.tales_root)
            .with_context(|| format!("Failed to create {}", self.tales_root))?;
        Ok(())
    }
}

impl ImageConfig {
    pub fn run_config(&self) -> ImageRunConfig {
        ImageRunConfig {
            model: self.model.clone(),
            art_style: self.art_style.clone(),
            aspect_ratio: self.aspect_ratio.clone(),
            base_seed: self.base_seed,
            page_delay: Duration::from_millis(self.page_delay_ms),
            sample_count: self.sample_count,
            safety_filter_level: self.safety_filter_level.clone(),
            person_generation: self.person_generation.clone(),
            add_watermark: self.add_watermark,
        }
    }
}

impl RelayConfig {
    pub fn options(&self) -> RelayOptions {
        RelayOptions {
            progress_every_n_chunks: self.progress_every_n_chunks,
            pct_per_chunk: self.pct_per_chunk,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        }
    }
}
