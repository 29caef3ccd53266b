pub mod error;
pub mod pipeline;
pub mod timing;

pub use error::{PipelineError, StageError};
pub use pipeline::{ParsedReceipt, ReceiptPipeline};
pub use timing::{Stage, StageClock, StageTiming, TimingReport};
