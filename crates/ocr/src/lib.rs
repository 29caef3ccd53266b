pub mod azure;
pub mod preprocess;
pub mod recognizer;

pub use azure::AzureVisionRecognizer;
pub use preprocess::{ImagePreprocessor, PreprocessError};
pub use recognizer::{MockRecognizer, OcrBackend, OcrError};
