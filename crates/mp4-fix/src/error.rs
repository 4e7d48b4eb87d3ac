use thiserror::Error;

/// Error type for one optimization run.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// The input's box structure is unusable (truncated, malformed, missing
    /// `moov`/`mdat`, or a chunk offset left its integer range).
    #[error("MP4 structure error: {0}")]
    Mp4(#[from] mp4::Mp4Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled via the optimizer's cancellation token.
    #[error("optimization cancelled")]
    Cancelled,
}
