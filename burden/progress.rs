use std::fmt;

/// Stages reported while running the burden pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    VariantFilter,
    Annotation,
    Aggregation,
    Covariates,
    Regression,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::VariantFilter => "allele frequency filtering",
            Self::Annotation => "gene interval annotation",
            Self::Aggregation => "per-gene aggregation",
            Self::Covariates => "principal component covariates",
            Self::Regression => "per-gene regression",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress. Stages that run on worker
/// threads call `on_stage_advance` concurrently with item deltas, so
/// implementations must be thread-safe.
pub trait ProgressObserver: Send + Sync {
    fn on_stage_start(&self, stage: PipelineStage, total_items: usize) {
        let _ = (stage, total_items);
    }
    fn on_stage_advance(&self, stage: PipelineStage, delta: usize) {
        let _ = (stage, delta);
    }
    fn on_stage_finish(&self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
