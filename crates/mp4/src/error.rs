use thiserror::Error;

/// Error type for ISO-BMFF scanning, offset fixup and layout planning.
#[derive(Debug, Error)]
pub enum Mp4Error {
    /// Fewer than a full box header remained where one was expected.
    #[error("truncated box header at offset {offset}")]
    TruncatedBox { offset: u64 },

    /// A declared box size was below the header length or ran past EOF.
    #[error("invalid box size {size} at offset {offset}")]
    InvalidBoxSize { size: u64, offset: u64 },

    /// The nested box structure inside `moov` is inconsistent.
    #[error("malformed moov: {0}")]
    MalformedMoov(&'static str),

    /// A box required for the fast-start layout is absent.
    #[error("required '{0}' box not found")]
    MissingBox(&'static str),

    /// The `moov` payload exceeds the configured in-memory cap.
    #[error("moov payload of {size} bytes exceeds the {cap} byte cap")]
    MoovTooLarge { size: u64, cap: u64 },

    /// A shifted `stco` entry left the `[0, 2^31 - 1]` range.
    #[error("stco entry {entry} shifted by {delta} leaves the 32-bit offset range")]
    OffsetOverflow { entry: u32, delta: i64 },

    /// A shifted `co64` entry fell below zero.
    #[error("co64 entry {entry} shifted by {delta} underflows")]
    OffsetUnderflow { entry: u64, delta: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
