use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, StageError};

/// The timed steps of one receipt run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    LoadTemplates,
    Preprocess,
    Ocr,
    AssemblePrompt,
    Extract,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::LoadTemplates,
        Stage::Preprocess,
        Stage::Ocr,
        Stage::AssemblePrompt,
        Stage::Extract,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::LoadTemplates => "load_templates",
            Stage::Preprocess => "preprocess",
            Stage::Ocr => "ocr",
            Stage::AssemblePrompt => "assemble_prompt",
            Stage::Extract => "extract",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

/// Per-stage durations of a completed run plus the wall-clock total.
///
/// Serializes as a flat `{"<stage>": seconds, ..., "total": seconds}` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingReport {
    stages: Vec<StageTiming>,
    total: Duration,
}

impl TimingReport {
    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.stages.iter().find(|t| t.stage == stage).map(|t| t.elapsed)
    }

    pub fn stage_sum(&self) -> Duration {
        self.stages.iter().map(|t| t.elapsed).sum()
    }
}

impl Serialize for TimingReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.stages.len() + 1))?;
        for t in &self.stages {
            map.serialize_entry(t.stage.name(), &t.elapsed.as_secs_f64())?;
        }
        map.serialize_entry("total", &self.total.as_secs_f64())?;
        map.end()
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "PROFILING RESULTS")?;
        writeln!(f, "{rule}")?;
        for t in &self.stages {
            writeln!(f, "{:.<40} {:.4}s", t.stage.name(), t.elapsed.as_secs_f64())?;
        }
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(f, "{:.<40} {:.4}s", "TOTAL TIME", self.total.as_secs_f64())?;
        write!(f, "{rule}")
    }
}

/// Times stage futures in the order they are run and tags their failures with
/// the stage name.
#[derive(Debug)]
pub struct StageClock {
    started: Instant,
    stages: Vec<StageTiming>,
}

impl StageClock {
    pub fn start() -> Self {
        Self { started: Instant::now(), stages: Vec::with_capacity(Stage::ALL.len()) }
    }

    /// Await `fut`, recording how long it took whether or not it succeeded.
    pub async fn run<T, E, F>(&mut self, stage: Stage, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StageError>,
    {
        let began = Instant::now();
        let result = fut.await;
        let elapsed = began.elapsed();
        tracing::debug!(stage = stage.name(), elapsed_ms = elapsed.as_millis() as u64, ok = result.is_ok(), "Stage finished");
        self.stages.push(StageTiming { stage, elapsed });
        result.map_err(|e| PipelineError::Stage { stage, source: e.into() })
    }

    pub fn finish(self) -> TimingReport {
        TimingReport { stages: self.stages, total: self.started.elapsed() }
    }
}
