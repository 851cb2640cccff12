//! Progress reporting for a normalization run.
//!
//! [`run_pipeline`](crate::run_pipeline) announces each stage it enters
//! and each metric it finishes, so a renderer can draw a bar without
//! knowing how the run is organised. The CLI supplies `indicatif` bars;
//! tests use [`NullProgress`].

use std::sync::Arc;

use crate::pipeline::PipelineStage;

/// Receives progress events from a pipeline run.
///
/// Shared behind an `Arc`, so implementations must be `Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Number of [`metric_done`](Self::metric_done) events the run will
    /// send, known once metrics have been screened.
    fn set_total(&self, total: u64);

    /// The run has entered `stage`.
    fn enter_stage(&self, stage: PipelineStage);

    /// One metric's work in the current stage is written.
    fn metric_done(&self, metric_path: &str);

    /// The run is over.
    fn finish(&self, summary: String);
}

/// A [`ProgressCallback`] that ignores every event.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn enter_stage(&self, _stage: PipelineStage) {}
    fn metric_done(&self, _metric_path: &str) {}
    fn finish(&self, _summary: String) {}
}

/// Returns a shared [`NullProgress`] instance.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
