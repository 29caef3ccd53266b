use image::DynamicImage;
use serde::Serialize;
use std::path::Path;
use tallyslip_core::{PipelineConfig, Receipt};
use tallyslip_extract::{ChatModel, OpenAiCompatibleChat, PromptError, PromptTemplates, StructuredExtractor};
use tallyslip_ocr::{AzureVisionRecognizer, ImagePreprocessor, OcrBackend};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::timing::{Stage, StageClock, TimingReport};

/// A validated receipt together with the timings of the run that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedReceipt {
    #[serde(rename = "result")]
    pub receipt: Receipt,
    #[serde(rename = "profiling")]
    pub timings: TimingReport,
}

#[derive(Clone, Copy)]
enum ImageSource<'a> {
    Bytes(&'a [u8]),
    Image(&'a DynamicImage),
    File(&'a Path),
}

/// Orchestrates: load templates → preprocess → OCR → assemble prompt → extract.
///
/// Stages run strictly in order and the first failure ends the run. Holds no
/// per-run state, so one pipeline can serve concurrent calls.
pub struct ReceiptPipeline<R: OcrBackend, M: ChatModel> {
    config: PipelineConfig,
    preprocessor: ImagePreprocessor,
    recognizer: R,
    extractor: StructuredExtractor<M>,
    verbose: bool,
}

impl ReceiptPipeline<AzureVisionRecognizer, OpenAiCompatibleChat> {
    /// Pipeline talking to Azure AI Vision and an OpenAI-compatible chat service.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let recognizer = AzureVisionRecognizer::from_config(&config.ocr);
        let model = OpenAiCompatibleChat::from_config(&config.llm)?;
        Self::new(config, recognizer, model)
    }
}

impl<R: OcrBackend, M: ChatModel> ReceiptPipeline<R, M> {
    /// Fails with [`PipelineError::Config`] if credentials or limits are
    /// missing, before any stage can run.
    pub fn new(config: PipelineConfig, recognizer: R, model: M) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            preprocessor: ImagePreprocessor::from_config(&config.image),
            config,
            recognizer,
            extractor: StructuredExtractor::new(model),
            verbose: false,
        })
    }

    /// Log the timing report at `info` instead of `debug`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process an encoded image (JPEG, PNG, WEBP, …).
    pub async fn process_bytes(&self, data: &[u8]) -> Result<ParsedReceipt, PipelineError> {
        self.run(ImageSource::Bytes(data)).await
    }

    pub async fn process_image(&self, image: &DynamicImage) -> Result<ParsedReceipt, PipelineError> {
        self.run(ImageSource::Image(image)).await
    }

    pub async fn process_file(&self, path: &Path) -> Result<ParsedReceipt, PipelineError> {
        info!("Processing receipt: {}", path.display());
        self.run(ImageSource::File(path)).await
    }

    async fn run(&self, source: ImageSource<'_>) -> Result<ParsedReceipt, PipelineError> {
        let mut clock = StageClock::start();

        // 1. Templates first, so a broken install fails before any network call.
        let templates = clock
            .run(Stage::LoadTemplates, PromptTemplates::from_config(&self.config.prompts))
            .await?;

        // 2. Downscale and re-encode.
        let preprocessor = self.preprocessor;
        let image = clock
            .run(Stage::Preprocess, async move {
                match source {
                    ImageSource::Bytes(data) => preprocessor.prepare_bytes(data),
                    ImageSource::Image(img) => preprocessor.prepare(img),
                    ImageSource::File(path) => preprocessor.prepare_file(path).await,
                }
            })
            .await?;

        // 3. OCR.
        let ocr_text = clock.run(Stage::Ocr, self.recognizer.recognize(&image)).await?;
        debug!(bytes = image.len(), lines = ocr_text.lines().count(), "Text recognized");

        // 4. Fill the templates.
        let prompt = clock
            .run(Stage::AssemblePrompt, async {
                Ok::<_, PromptError>(templates.assemble(&ocr_text, self.extractor.format_instructions()))
            })
            .await?;

        // 5. Structured extraction.
        let receipt = clock.run(Stage::Extract, self.extractor.extract(&prompt)).await?;

        let timings = clock.finish();
        if self.verbose {
            info!(target: "tallyslip::timing", "\n{timings}");
        } else {
            debug!(target: "tallyslip::timing", total_ms = timings.total().as_millis() as u64, "Receipt parsed");
        }
        Ok(ParsedReceipt { receipt, timings })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
