//! Progress-callback trait for per-stage and per-unit pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as stages start, units (pages, media items, chapters) finish and
//! stages commit.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2kb::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     units: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_unit_complete(&self, stage: Stage, unit: &str) {
//!         let n = self.units.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}: {unit} done ({n} so far)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { units: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::schema::{Stage, StageState};
use std::sync::Arc;

/// Called by the pipeline as it runs.
///
/// Implementations must be `Send + Sync`: stages of one document and units of
/// one stage run concurrently, so every method may be called from several
/// tasks at once. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once the document id is known and before any stage runs.
    ///
    /// # Arguments
    /// * `document_id`: content-addressed id of the document
    /// * `pending`: stages that will run in this invocation
    fn on_pipeline_start(&self, document_id: &str, pending: &[Stage]) {
        let _ = (document_id, pending);
    }

    /// Called when a stage starts.
    ///
    /// # Arguments
    /// * `stage`: the stage
    /// * `units`: number of pages / media items / chapters it will process
    fn on_stage_start(&self, stage: Stage, units: usize) {
        let _ = (stage, units);
    }

    /// Called when one unit of a stage finished successfully.
    fn on_unit_complete(&self, stage: Stage, unit: &str) {
        let _ = (stage, unit);
    }

    /// Called when one unit failed or fell back.
    fn on_unit_error(&self, stage: Stage, unit: &str, error: &str) {
        let _ = (stage, unit, error);
    }

    /// Called after the stage's result was committed to the store.
    fn on_stage_complete(&self, stage: Stage, state: &StageState) {
        let _ = (stage, state);
    }

    /// Called once after the last stage settled.
    ///
    /// # Arguments
    /// * `complete`: every stage is done or skipped
    /// * `degraded`: some stage failed, fell back, or is blocked
    fn on_pipeline_complete(&self, complete: bool, degraded: bool) {
        let _ = (complete, degraded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
