use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR credentials missing: {0} is not configured")]
    MissingCredentials(&'static str),
    #[error("OCR service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OCR service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("OCR service response was not understood: {0}")]
    InvalidResponse(String),
    #[error("OCR analysis failed upstream")]
    AnalysisFailed,
    #[error("OCR analysis still running after {attempts} polls")]
    Timeout { attempts: u32 },
}

/// Abstraction over an OCR service.
/// Implementations accept encoded image bytes and return the recognized text,
/// one line per `\n`-terminated line.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError>;
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string and counts how often it was asked, so tests can
/// assert the OCR service was (or was not) contacted.
#[derive(Debug, Default)]
pub struct MockRecognizer {
    text: String,
    calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrBackend for MockRecognizer {
    async fn recognize(&self, _image_bytes: &[u8]) -> Result<String, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

#[async_trait]
impl<T: OcrBackend + ?Sized> OcrBackend for std::sync::Arc<T> {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<String, OcrError> {
        (**self).recognize(image_bytes).await
    }
}
