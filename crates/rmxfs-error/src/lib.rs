#![forbid(unsafe_code)]
//! Error types for rmxfs.
//!
//! Defines `RmxError` and a `Result<T>` alias used throughout the workspace.
//! The engine never recovers internally: every primitive returns its error
//! to the caller, and only the consistency checker accumulates instead of
//! propagating.

use rmxfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all rmxfs operations.
#[derive(Debug, Error)]
pub enum RmxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fnode {0} is not allocated")]
    NotAllocated(u16),

    #[error("no free blocks on volume")]
    NoFreeBlock,

    #[error("no free fnodes on volume")]
    NoFreeFnode,

    #[error("no contiguous free range of {0} blocks")]
    NoContiguousRange(usize),

    #[error("file needs {0} runs but the fnode has only 8 pointer slots")]
    TooManyRuns(usize),

    #[error("fnode already has the maximum number of accessors")]
    TooManyAccessors,

    #[error("fnode has no free pointer slot")]
    NoFreePointer,

    #[error("writing long files is not supported")]
    LongFileUnsupported,

    #[error("invalid container data: {0}")]
    Container(String),

    #[error("invalid request: {0}")]
    InvalidArgument(String),
}

/// Result alias using `RmxError`.
pub type Result<T> = std::result::Result<T, RmxError>;
