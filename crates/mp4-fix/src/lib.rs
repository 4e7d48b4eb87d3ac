//! Fast-start MP4 optimizer.
//!
//! Rewrites an ISO-BMFF file so the `moov` box precedes `mdat` on disk,
//! fixing up every absolute chunk-offset table so sample addresses stay
//! valid. No samples are re-encoded; the media payload is copied verbatim.
//!
//! The blocking core lives in [`Mp4Optimizer::optimize_blocking`];
//! [`Mp4Optimizer::optimize`] runs it on a worker task and reports progress
//! and the terminal outcome over a channel of [`OptimizerEvent`]s. An
//! already-optimized input degrades to a plain copy, and
//! [`Mp4Optimizer::optimize_stream`] serves callers whose bytes are not
//! files.
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512

mod error;
mod events;
mod optimizer;
mod writer;

pub use error::OptimizerError;
pub use events::OptimizerEvent;
pub use optimizer::{
    DEFAULT_COPY_CHUNK_SIZE, DEFAULT_MOOV_SIZE_CAP, Mp4Optimizer, OptimizerConfig,
    OptimizerConfigBuilder, is_optimized,
};
