use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("OCR endpoint is not configured (set AZURE_VISION_ENDPOINT)")]
    MissingOcrEndpoint,
    #[error("OCR key is not configured (set AZURE_VISION_KEY)")]
    MissingOcrKey,
    #[error("No API key configured for LLM provider {provider} (set {env_var} or LLM_API_KEY)")]
    MissingLlmKey { provider: LlmProvider, env_var: &'static str },
    #[error("LLM provider {0} needs an explicit base_url")]
    MissingBaseUrl(LlmProvider),
    #[error("LLM provider {0} needs an explicit model")]
    MissingModel(LlmProvider),
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

// ── OCR ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrApi {
    /// Azure Image Analysis 4.0, synchronous `features=read`.
    #[default]
    ImageAnalysis,
    /// Legacy Azure Read 3.2: submit, then poll `Operation-Location`.
    ReadV3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub endpoint: String,
    pub key: Option<Secret>,
    pub api: OcrApi,
    /// Only used by [`OcrApi::ReadV3`].
    pub poll_interval_ms: u64,
    /// Only used by [`OcrApi::ReadV3`].
    pub max_polls: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            key: None,
            api: OcrApi::default(),
            poll_interval_ms: 1000,
            max_polls: 10,
        }
    }
}

// ── LLM ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Groq,
    Github,
    Nvidia,
    #[serde(rename = "openai")]
    OpenAi,
    Custom,
}

impl LlmProvider {
    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            LlmProvider::Groq => Some("https://api.groq.com/openai/v1"),
            LlmProvider::Github => Some("https://models.github.ai/inference"),
            LlmProvider::Nvidia => Some("https://integrate.api.nvidia.com/v1"),
            LlmProvider::OpenAi => Some("https://api.openai.com/v1"),
            LlmProvider::Custom => None,
        }
    }

    pub fn default_model(self) -> Option<&'static str> {
        match self {
            LlmProvider::Groq => Some("openai/gpt-oss-20b"),
            LlmProvider::Github => Some("gpt-4o"),
            LlmProvider::Nvidia => Some("meta/llama-3.2-90b-vision-instruct"),
            LlmProvider::OpenAi => Some("gpt-4o-mini"),
            LlmProvider::Custom => None,
        }
    }

    /// Environment variable holding this provider's API key.
    pub fn key_env_var(self) -> &'static str {
        match self {
            LlmProvider::Groq => "GROQ_API_KEY",
            LlmProvider::Github => "GITHUB_TOKEN",
            LlmProvider::Nvidia => "NVIDIA_API_KEY",
            LlmProvider::OpenAi => "OPENAI_API_KEY",
            LlmProvider::Custom => "LLM_API_KEY",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Groq => write!(f, "groq"),
            LlmProvider::Github => write!(f, "github"),
            LlmProvider::Nvidia => write!(f, "nvidia"),
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "groq" => Ok(LlmProvider::Groq),
            "github" => Ok(LlmProvider::Github),
            "nvidia" => Ok(LlmProvider::Nvidia),
            "openai" => Ok(LlmProvider::OpenAi),
            "custom" => Ok(LlmProvider::Custom),
            other => Err(format!("Unknown LLM provider: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Overrides the provider's default endpoint.
    pub base_url: Option<String>,
    /// Overrides the provider's default model.
    pub model: Option<String>,
    /// Primary key first; later keys are tried when the service rate-limits.
    pub api_keys: Vec<Secret>,
    pub temperature: f32,
    pub max_retries: u32,
    /// Per-request timeout. `None` waits indefinitely.
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    /// Ask for `response_format: {"type": "json_object"}`.
    pub json_mode: bool,
    /// Groq-style `reasoning_format` for reasoning models (`parsed`, `hidden`, `raw`).
    pub reasoning_format: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: None,
            model: None,
            api_keys: Vec::new(),
            temperature: 0.2,
            max_retries: 2,
            timeout_secs: None,
            max_tokens: None,
            json_mode: false,
            reasoning_format: None,
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref().or_else(|| self.provider.default_base_url())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().or_else(|| self.provider.default_model())
    }
}

// ── Image / prompts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { max_dimension: 1000, jpeg_quality: 75 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system_path: PathBuf,
    pub user_path: PathBuf,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_path: PathBuf::from("prompts/system_prompt.txt"),
            user_path: PathBuf::from("prompts/user_prompt.txt"),
        }
    }
}

// ── Top level ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ocr: OcrConfig,
    pub llm: LlmConfig,
    pub image: ImageConfig,
    pub prompts: PromptConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay environment values on top of `self`. Blank values count as unset.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("AZURE_VISION_ENDPOINT") {
            self.ocr.endpoint = v;
        }
        if let Some(v) = get("AZURE_VISION_KEY") {
            self.ocr.key = Some(Secret::new(v));
        }

        if let Some(v) = get("LLM_PROVIDER") {
            self.llm.provider = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key: "LLM_PROVIDER", value: v })?;
        }
        if let Some(v) = get("LLM_API_KEY").or_else(|| get(self.llm.provider.key_env_var())) {
            self.llm.api_keys = vec![Secret::new(v)];
        }
        if let Some(v) = get("LLM_FALLBACK_API_KEYS") {
            self.llm.api_keys.extend(
                v.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(Secret::new),
            );
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(v) = get("LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = get("LLM_TEMPERATURE") {
            self.llm.temperature = parse_env("LLM_TEMPERATURE", v)?;
        }
        if let Some(v) = get("LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_env("LLM_MAX_RETRIES", v)?;
        }
        if let Some(v) = get("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = Some(parse_env("LLM_TIMEOUT_SECS", v)?);
        }

        if let Some(v) = get("MAX_IMAGE_DIMENSION") {
            self.image.max_dimension = parse_env("MAX_IMAGE_DIMENSION", v)?;
        }
        if let Some(v) = get("SYSTEM_PROMPT_PATH") {
            self.prompts.system_path = PathBuf::from(v);
        }
        if let Some(v) = get("USER_PROMPT_PATH") {
            self.prompts.user_path = PathBuf::from(v);
        }

        Ok(self)
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ocr.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingOcrEndpoint);
        }
        if self.ocr.key.as_ref().map_or(true, Secret::is_blank) {
            return Err(ConfigError::MissingOcrKey);
        }

        let provider = self.llm.provider;
        if self.llm.api_keys.iter().all(Secret::is_blank) {
            return Err(ConfigError::MissingLlmKey { provider, env_var: provider.key_env_var() });
        }
        if self.llm.base_url().is_none() {
            return Err(ConfigError::MissingBaseUrl(provider));
        }
        if self.llm.model().is_none() {
            return Err(ConfigError::MissingModel(provider));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::OutOfRange {
                field: "llm.temperature",
                value: self.llm.temperature.to_string(),
            });
        }

        if self.image.max_dimension == 0 {
            return Err(ConfigError::OutOfRange { field: "image.max_dimension", value: "0".into() });
        }
        if !(1..=100).contains(&self.image.jpeg_quality) {
            return Err(ConfigError::OutOfRange {
                field: "image.jpeg_quality",
                value: self.image.jpeg_quality.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue { key, value })
}
