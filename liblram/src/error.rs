//! Error handling for liblram.
use std::fmt;

/// A custom error type to represent various errors in liblram.
#[derive(Debug)]
pub enum LramError {
    /// An IO error occurred.
    IoError(std::io::Error),

    /// A FASTA/FASTQ parsing error occurred.
    FastxParseError(String),

    /// A sequence parser hit an impossible state; the current file is abandoned.
    ParserBroken(String),

    /// An index or container stream did not start with the expected magic bytes.
    BadMagic(String),

    /// An index or container stream ended before its declared length.
    Truncated(String),

    /// A zlib-level failure while (de)compressing a container block.
    DeflateError(String),

    /// A parameter was out of its accepted range.
    InvalidParam(String),

    /// Error relating to worker threads.
    ThreadError(String),

    /// Error writing PAF records.
    PafWriteError(String),
}

impl fmt::Display for LramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LramError::IoError(err) => write!(f, "IO error: {}", err),
            LramError::FastxParseError(msg) => write!(f, "FASTA/FASTQ parse error: {}", msg),
            LramError::ParserBroken(msg) => write!(f, "Sequence parser broken: {}", msg),
            LramError::BadMagic(msg) => write!(f, "Bad magic: {}", msg),
            LramError::Truncated(msg) => write!(f, "Truncated stream: {}", msg),
            LramError::DeflateError(msg) => write!(f, "Deflate error: {}", msg),
            LramError::InvalidParam(msg) => write!(f, "Invalid parameter: {}", msg),
            LramError::ThreadError(msg) => write!(f, "Error relating to threads: {}", msg),
            LramError::PafWriteError(msg) => write!(f, "Error writing PAF file: {}", msg),
        }
    }
}

impl std::error::Error for LramError {}

/// Converts a `std::io::Error` into an [`LramError`].
impl From<std::io::Error> for LramError {
    fn from(error: std::io::Error) -> Self {
        LramError::IoError(error)
    }
}

/// Converts a `csv::Error` into an [`LramError`].
impl From<csv::Error> for LramError {
    fn from(error: csv::Error) -> Self {
        LramError::PafWriteError(error.to_string())
    }
}

/// Aborting out-of-memory handler for the extension hot path.
///
/// The DP engine treats allocation failure as fatal; there is nothing
/// sensible to unwind to once a fill is half-built.
pub(crate) fn oom_abort(what: &str) -> ! {
    eprintln!("[lram] out of memory while {}", what);
    std::process::exit(128);
}
