use tallyslip_core::ConfigError;
use tallyslip_extract::{ExtractError, LlmError, PromptError};
use tallyslip_ocr::{OcrError, PreprocessError};
use thiserror::Error;

use crate::timing::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to build LLM client: {0}")]
    Client(#[from] LlmError),
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },
}

impl PipelineError {
    /// The stage that failed, if the run got that far.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            PipelineError::Config(_) | PipelineError::Client(_) => None,
        }
    }
}

/// Cause of a stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}
