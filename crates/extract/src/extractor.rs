use tallyslip_core::Receipt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::{ChatModel, LlmError};
use crate::prompt::AssembledPrompt;
use crate::schema;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Language model unavailable: {0}")]
    LlmUnavailable(#[source] LlmError),
    #[error("Model output is not a JSON object: {0}")]
    MalformedResponse(String),
    #[error("Model output does not match the receipt schema: {0}")]
    SchemaValidation(String),
}

/// A reply that arrived but carried nothing usable is the model's fault, not
/// the service's.
impl From<LlmError> for ExtractError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::EmptyResponse => ExtractError::MalformedResponse("empty model output".into()),
            LlmError::InvalidResponse(reason) => ExtractError::MalformedResponse(reason),
            other => ExtractError::LlmUnavailable(other),
        }
    }
}

/// Sends an assembled prompt to a chat model and turns the reply into a
/// validated [`Receipt`].
pub struct StructuredExtractor<M> {
    model: M,
}

impl<M: ChatModel> StructuredExtractor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn format_instructions(&self) -> &'static str {
        schema::format_instructions()
    }

    pub async fn extract(&self, prompt: &AssembledPrompt) -> Result<Receipt, ExtractError> {
        let reply = self.model.complete(&prompt.messages()).await?;
        debug!(chars = reply.len(), "Model replied");
        schema::parse_response(&reply).inspect_err(|e| warn!(error = %e, "Rejected model output"))
    }
}
