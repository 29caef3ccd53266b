use regex::{Captures, Regex};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tallyslip_core::PromptConfig;
use thiserror::Error;

use crate::llm::ChatMessage;

pub const OCR_TEXT: &str = "ocr_text";
pub const FORMAT_INSTRUCTIONS: &str = "format_instructions";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt template not found: {}", .0.display())]
    TemplateNotFound(PathBuf),
    #[error("Failed to read prompt template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("User prompt template has no {{{0}}} placeholder")]
    MissingPlaceholder(&'static str),
}

/// `{{` / `}}` escapes, or one of the two known placeholders. Anything else in
/// braces is left alone so templates can carry literal JSON.
fn re_token() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{(ocr_text|format_instructions)\}").expect("invalid regex")
    })
}

/// The system and user templates for one extraction.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    system: String,
    user: String,
}

/// Final messages, system first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
}

impl AssembledPrompt {
    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![ChatMessage::system(self.system.clone()), ChatMessage::user(self.user.clone())]
    }
}

impl PromptTemplates {
    /// Fails if the user template lacks either placeholder, so a broken
    /// template is caught before any OCR or model call is made.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Result<Self, PromptError> {
        let user = user.into();
        let found: Vec<&str> = re_token()
            .captures_iter(&user)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        for required in [OCR_TEXT, FORMAT_INSTRUCTIONS] {
            if !found.contains(&required) {
                return Err(PromptError::MissingPlaceholder(required));
            }
        }
        Ok(Self { system: system.into(), user })
    }

    pub async fn load(system_path: &Path, user_path: &Path) -> Result<Self, PromptError> {
        let system = read_template(system_path).await?;
        let user = read_template(user_path).await?;
        Self::new(system, user)
    }

    pub async fn from_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::load(&config.system_path, &config.user_path).await
    }

    pub fn assemble(&self, ocr_text: &str, format_instructions: &str) -> AssembledPrompt {
        AssembledPrompt {
            system: render(&self.system, ocr_text, format_instructions),
            user: render(&self.user, ocr_text, format_instructions),
        }
    }
}

async fn read_template(path: &Path) -> Result<String, PromptError> {
    tokio::fs::read_to_string(path).await.map_err(|source| match source.kind() {
        ErrorKind::NotFound => PromptError::TemplateNotFound(path.to_path_buf()),
        _ => PromptError::Io { path: path.to_path_buf(), source },
    })
}

/// Single pass: text coming in through a placeholder is never expanded again.
fn render(template: &str, ocr_text: &str, format_instructions: &str) -> String {
    re_token()
        .replace_all(template, |caps: &Captures| match caps.get(1).map(|m| m.as_str()) {
            Some(OCR_TEXT) => ocr_text.to_string(),
            Some(_) => format_instructions.to_string(),
            None => caps[0][..1].to_string(),
        })
        .into_owned()
}
