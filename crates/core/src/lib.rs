pub mod config;
pub mod money;
pub mod receipt;

pub use config::{
    ConfigError, ImageConfig, LlmConfig, LlmProvider, OcrApi, OcrConfig, PipelineConfig,
    PromptConfig, Secret,
};
pub use money::Money;
pub use receipt::{Category, LineItem, Receipt, ReceiptError, UnvalidatedReceipt};
