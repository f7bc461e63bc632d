use anyhow::{bail, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::classify::{classify_image_error, ClassifiedError, ErrorKind, ImageApiError};
use crate::prompt::{build_page_prompt, negative_prompt, page_seed};
use crate::session::{AbortHandle, ProgressKind, ProgressSink};
use crate::tale::{CharacterProfile, PageDraft};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub prompt: String,
    pub page_index: usize,
    pub aspect_ratio: String,
    pub model: String,
    pub seed: u64,
    pub sample_count: u32,
    pub safety_filter_level: String,
    pub person_generation: String,
    pub add_watermark: bool,
    pub negative_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResponse {
    pub success: bool,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Safety-filter reason attached by the upstream on rejection.
    #[serde(default)]
    pub rai_reason: Option<String>,
}

#[async_trait]
pub trait ImageModelClient: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Pending,
    Generating,
    Regenerating,
    Success,
    Error,
}

/// Ephemeral per-page state, mutated only by the orchestrator and explicit
/// user edits. Transitions move forward only; the single exception is the
/// cancellation rollback `Generating -> Pending`.
#[derive(Debug)]
pub struct PageRuntimeState {
    pub index: usize,
    pub prompt: String,
    pub image_url: Option<String>,
    pub status: PageStatus,
    pub error: Option<ClassifiedError>,
}

/// Cloneable view of a page for UI and reporting.
#[derive(Debug, Clone)]
pub struct PageSummary {
    pub index: usize,
    pub status: PageStatus,
    pub image_url: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageRunConfig {
    pub model: String,
    pub art_style: String,
    pub aspect_ratio: String,
    pub base_seed: u64,
    /// Fixed pause between consecutive calls. Deliberate: rate-limit safety
    /// and keeping the seed/continuity contract meaningful across pages.
    pub page_delay: Duration,
    pub sample_count: u32,
    pub safety_filter_level: String,
    pub person_generation: String,
    pub add_watermark: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Drives per-page image synthesis, strictly one network call at a time, in
/// index order. Failed pages keep their classification and wait for a manual
/// regeneration; nothing is ever retried automatically.
pub struct ImageOrchestrator {
    client: Box<dyn ImageModelClient>,
    config: ImageRunConfig,
    pages: Mutex<Vec<PageRuntimeState>>,
}

impl ImageOrchestrator {
    pub fn new(
        client: Box<dyn ImageModelClient>,
        config: ImageRunConfig,
        drafts: &[PageDraft],
        characters: &HashMap<String, CharacterProfile>,
    ) -> Self {
        let mut pages: Vec<PageRuntimeState> = drafts
            .iter()
            .map(|draft| PageRuntimeState {
                index: draft.index,
                prompt: build_page_prompt(draft, characters, &config.art_style, &config.aspect_ratio),
                image_url: None,
                status: PageStatus::Pending,
                error: None,
            })
            .collect();
        pages.sort_by_key(|p| p.index);
        Self { client, config, pages: Mutex::new(pages) }
    }

    /// Generates every page not already successful. Returns how many pages
    /// ended up succeeded vs failed across the whole collection.
    pub async fn run(&self, abort: &AbortHandle, progress: &dyn ProgressSink) -> RunSummary {
        let total = self.pages.lock().await.len();
        let mut first_call = true;

        loop {
            let Some((index, prompt)) = self.claim_next_pending().await else {
                break;
            };

            if !first_call {
                tokio::select! {
                    _ = abort.aborted() => {
                        self.rollback_to_pending(index).await;
                        progress.progress("Image generation cancelled", ProgressKind::Info);
                        break;
                    }
                    _ = tokio::time::sleep(self.config.page_delay) => {}
                }
            }
            // Suspension point: the only place cancellation is observed
            // before a call goes out.
            if abort.is_aborted() {
                self.rollback_to_pending(index).await;
                progress.progress("Image generation cancelled", ProgressKind::Info);
                break;
            }
            first_call = false;

            progress.progress(
                &format!("Generating image for page {}/{}", index + 1, total),
                ProgressKind::Info,
            );

            let request = self.build_request(index, &prompt);
            let outcome = tokio::select! {
                _ = abort.aborted() => None,
                result = self.client.generate(&request) => Some(result),
            };

            match outcome {
                None => {
                    // Transport abort killed the in-flight call; the page
                    // stays resumable.
                    self.rollback_to_pending(index).await;
                    progress.progress("Image generation cancelled", ProgressKind::Info);
                    break;
                }
                Some(result) => {
                    self.settle_page(index, result, progress).await;
                }
            }
        }

        let summary = self.summary().await;
        progress.progress(
            &format!("{} succeeded, {} failed", summary.succeeded, summary.failed),
            if summary.failed == 0 { ProgressKind::Success } else { ProgressKind::Warning },
        );
        summary
    }

    /// Manual single-page retry, entered via the distinguished `Regenerating`
    /// status. A page that is currently in flight is busy: the status doubles
    /// as the per-page generation lock.
    pub async fn regenerate_page(&self, index: usize, progress: &dyn ProgressSink) -> Result<()> {
        let prompt = {
            let mut pages = self.pages.lock().await;
            let page = pages
                .iter_mut()
                .find(|p| p.index == index)
                .ok_or_else(|| anyhow::anyhow!("no page with index {}", index))?;
            match page.status {
                PageStatus::Generating | PageStatus::Regenerating => {
                    bail!("page {} is already being generated", index + 1)
                }
                PageStatus::Pending => bail!("page {} has not been generated yet", index + 1),
                PageStatus::Success | PageStatus::Error => {}
            }
            page.status = PageStatus::Regenerating;
            page.error = None;
            page.prompt.clone()
        };

        progress.progress(&format!("Regenerating image for page {}", index + 1), ProgressKind::Info);
        let request = self.build_request(index, &prompt);
        let result = self.client.generate(&request).await;
        self.settle_page(index, result, progress).await;
        Ok(())
    }

    /// Explicit user edit of a page's prompt. Refused while the page is in
    /// flight.
    pub async fn set_prompt(&self, index: usize, prompt: String) -> Result<()> {
        let mut pages = self.pages.lock().await;
        let page = pages
            .iter_mut()
            .find(|p| p.index == index)
            .ok_or_else(|| anyhow::anyhow!("no page with index {}", index))?;
        if matches!(page.status, PageStatus::Generating | PageStatus::Regenerating) {
            bail!("page {} is being generated, edit it afterwards", index + 1);
        }
        page.prompt = prompt;
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<PageSummary> {
        self.pages
            .lock()
            .await
            .iter()
            .map(|p| PageSummary {
                index: p.index,
                status: p.status,
                image_url: p.image_url.clone(),
                error_kind: p.error.as_ref().map(|e| e.kind),
                error_message: p.error.as_ref().map(|e| e.message.clone()),
                error_details: p.error.as_ref().map(|e| e.details.clone()),
            })
            .collect()
    }

    pub async fn summary(&self) -> RunSummary {
        let pages = self.pages.lock().await;
        RunSummary {
            succeeded: pages.iter().filter(|p| p.status == PageStatus::Success).count(),
            failed: pages.iter().filter(|p| p.status == PageStatus::Error).count(),
        }
    }

    fn build_request(&self, index: usize, prompt: &str) -> ImageRequest {
        ImageRequest {
            prompt: prompt.to_string(),
            page_index: index,
            aspect_ratio: self.config.aspect_ratio.clone(),
            model: self.config.model.clone(),
            seed: page_seed(self.config.base_seed, index),
            sample_count: self.config.sample_count,
            safety_filter_level: self.config.safety_filter_level.clone(),
            person_generation: self.config.person_generation.clone(),
            add_watermark: self.config.add_watermark,
            negative_prompt: negative_prompt(),
        }
    }

    async fn claim_next_pending(&self) -> Option<(usize, String)> {
        let mut pages = self.pages.lock().await;
        let page = pages.iter_mut().find(|p| p.status == PageStatus::Pending)?;
        page.status = PageStatus::Generating;
        Some((page.index, page.prompt.clone()))
    }

    async fn rollback_to_pending(&self, index: usize) {
        let mut pages = self.pages.lock().await;
        if let Some(page) = pages.iter_mut().find(|p| p.index == index) {
            page.status = PageStatus::Pending;
        }
    }

    async fn settle_page(
        &self,
        index: usize,
        result: Result<ImageResponse>,
        progress: &dyn ProgressSink,
    ) {
        let outcome = match result {
            Ok(response) if response.success && response.image_url.is_some() => Ok(response),
            Ok(response) => Err(anyhow::Error::new(ImageApiError {
                status: None,
                message: response.error.clone().unwrap_or_else(|| "no image data in response".to_string()),
                rai_reason: response.rai_reason.clone(),
            })),
            Err(e) => Err(e),
        };

        let mut pages = self.pages.lock().await;
        let Some(page) = pages.iter_mut().find(|p| p.index == index) else {
            warn!("settled unknown page index {}", index);
            return;
        };
        match outcome {
            Ok(response) => {
                page.image_url = response.image_url;
                page.status = PageStatus::Success;
                page.error = None;
                info!("page {} image generated", index + 1);
                progress.progress(&format!("Page {} ready", index + 1), ProgressKind::Success);
            }
            Err(e) => {
                let classified = classify_image_error(e, &self.config.model, index);
                warn!("page {} failed: {}", index + 1, classified.message);
                progress.progress(&classified.message, ProgressKind::Failure);
                page.status = PageStatus::Error;
                page.error = Some(classified);
            }
        }
    }
}
