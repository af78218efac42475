//! Layout extraction through a vision LLM.
//!
//! Used when no Document Intelligence endpoint is configured. The page is
//! rendered (or the image file loaded), sent as a base64 PNG next to the
//! layout prompt, and the model's answer is the page Markdown.
//!
//! ## Retry Strategy
//!
//! Transient API errors are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`): with 500 ms base and 3 retries the
//! waits are 500 ms → 1 s → 2 s.

use crate::config::VisionConfig;
use crate::error::{Doc2MdError, UnitError};
use crate::pipeline::document::DocumentBackend;
use crate::pipeline::layout::LayoutExtractor;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// System prompt used when [`VisionConfig::system_prompt`] is `None`.
pub const LAYOUT_SYSTEM_PROMPT: &str = r#"You convert one document page image to clean Markdown.

1. TEXT
   - Transcribe ALL text in reading order
   - Use # / ## / ### for headings as they appear visually
   - Use - for bullet lists and 1. 2. 3. for numbered lists

2. TABLES
   - Convert tables to GFM pipe format

3. IMAGE REFERENCES
   - The page may contain text of the form ![name](url)
   - Copy every such reference exactly as written, on its own line
   - Do NOT describe pictures and do NOT invent image references

4. OUTPUT
   - Output ONLY the Markdown content
   - Do NOT wrap in ```markdown fences
   - Do NOT add commentary"#;

/// [`LayoutExtractor`] backed by an `edgequake-llm` vision provider.
pub struct VisionLayoutExtractor {
    provider: Arc<dyn LLMProvider>,
    config: VisionConfig,
    documents: Arc<dyn DocumentBackend>,
}

impl VisionLayoutExtractor {
    pub fn new(config: VisionConfig, documents: Arc<dyn DocumentBackend>) -> Result<Self, Doc2MdError> {
        let provider = resolve_provider(&config)?;
        Ok(Self {
            provider,
            config,
            documents,
        })
    }

    async fn load_page(&self, path: &Path) -> Result<DynamicImage, UnitError> {
        let path = path.to_path_buf();
        let documents = Arc::clone(&self.documents);
        let max_pixels = self.config.max_rendered_pixels;

        tokio::task::spawn_blocking(move || {
            let is_pdf = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
            if is_pdf {
                documents.render_first_page(&path, max_pixels)
            } else {
                image::open(&path)
                    .map_err(|e| UnitError::extraction(format!("{}: {e}", path.display())))
            }
        })
        .await
        .map_err(|e| UnitError::extraction(format!("render task panicked: {e}")))?
    }
}

#[async_trait]
impl LayoutExtractor for VisionLayoutExtractor {
    async fn analyze(&self, path: &Path) -> Result<String, UnitError> {
        let start = Instant::now();
        let page = self.load_page(path).await?;
        let image_data =
            encode_page(&page).map_err(|e| UnitError::extraction(format!("PNG encoding: {e}")))?;

        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(LAYOUT_SYSTEM_PROMPT);
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_images("", vec![image_data]),
        ];
        let options = build_options(&self.config);

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    path.display(),
                    attempt,
                    self.config.max_retries,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "{}: {} input tokens, {} output tokens, {:?}",
                        path.display(),
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    warn!("{}: attempt {} failed: {}", path.display(), attempt + 1, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(UnitError::service(format!(
            "vision model failed after {} retries: {}",
            self.config.max_retries,
            last_err.unwrap_or_else(|| "unknown error".into())
        )))
    }
}

/// Encode a page as a base64 PNG for the multimodal request.
///
/// PNG keeps rendered text crisp; `detail: "high"` asks the model for its
/// full tile budget so small print survives.
fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(ImageData::new(STANDARD.encode(&buf), "image/png").with_detail("high"))
}

fn build_options(config: &VisionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Doc2MdError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Doc2MdError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider, from most-specific to least-specific:
///
/// 1. pre-built `config.provider`
/// 2. `config.provider_name` + model
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. `ProviderFactory::from_env` auto-detection
fn resolve_provider(config: &VisionConfig) -> Result<Arc<dyn LLMProvider>, Doc2MdError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Doc2MdError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "Set AZURE_AI_INTELLIGENCE_ENDPOINT and AZURE_AI_INTELLIGENCE_API_KEY,\n\
                or configure a vision LLM (OPENAI_API_KEY, ANTHROPIC_API_KEY, ...).\n\
                Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}
