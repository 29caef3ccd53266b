pub mod extractor;
pub mod llm;
pub mod prompt;
pub mod schema;

pub use extractor::{ExtractError, StructuredExtractor};
pub use llm::{ChatMessage, ChatModel, LlmError, MockChatModel, OpenAiCompatibleChat, Role};
pub use prompt::{AssembledPrompt, PromptError, PromptTemplates};
pub use schema::{format_instructions, parse_response, receipt_schema};
