use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the rearrangement core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unknown iosystem, file, variable, dimension, or decomposition id.
    #[error("unknown id")]
    BadId,

    /// Null required buffer, out-of-range dims, start+count exceeds dim.
    #[error("invalid argument")]
    InvalidArgument,

    /// Async rearranger mismatch, or a rearranger unsupported by this build.
    #[error("bad rearranger")]
    BadRearranger,

    /// Allocation failure.
    #[error("out of memory")]
    NoMemory,

    /// Requested file type has no driver registered in this build.
    #[error("io type not available")]
    BadIoType,

    /// Multi-variable call with inconsistent shapes.
    #[error("variable dimensions do not match decomposition")]
    VarDimMismatch,

    /// Transport or file-driver failure, carrying the backend code.
    #[error("transport error (code={0})")]
    Transport(i32),

    /// Write attempted on a read-only decomposition.
    #[error("decomposition has duplicate offsets and is read-only")]
    InvalidDecomposition,

    /// Optional driver feature (deflate, chunking) not applicable.
    #[error("not supported by this driver")]
    Unsupported,
}

impl Error {
    /// Stable integer code, used when an error must cross the transport
    /// (error broadcast, sticky file errors observed on remote ranks).
    pub fn code(&self) -> i32 {
        match self {
            Error::BadId => -1,
            Error::InvalidArgument => -2,
            Error::BadRearranger => -3,
            Error::NoMemory => -4,
            Error::BadIoType => -5,
            Error::VarDimMismatch => -6,
            Error::Transport(c) => *c,
            Error::InvalidDecomposition => -8,
            Error::Unsupported => -9,
        }
    }

    /// Inverse of [`Error::code`]. Unknown codes map to `Transport`.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => Error::BadId,
            -2 => Error::InvalidArgument,
            -3 => Error::BadRearranger,
            -4 => Error::NoMemory,
            -5 => Error::BadIoType,
            -6 => Error::VarDimMismatch,
            -8 => Error::InvalidDecomposition,
            -9 => Error::Unsupported,
            c => Error::Transport(c),
        }
    }
}

/// Error handling mode, selectable per iosystem and globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandler {
    /// Abort the process on a collective error.
    #[default]
    Internal,
    /// Broadcast the error code across the computational comm; every rank
    /// returns the same code.
    Bcast,
    /// Local return only.
    Return,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        let all = [
            Error::BadId,
            Error::InvalidArgument,
            Error::BadRearranger,
            Error::NoMemory,
            Error::BadIoType,
            Error::VarDimMismatch,
            Error::Transport(-77),
            Error::InvalidDecomposition,
            Error::Unsupported,
        ];
        for e in all {
            assert_eq!(Error::from_code(e.code()), e);
        }
    }

    #[test]
    fn test_default_handler_is_internal() {
        assert_eq!(ErrorHandler::default(), ErrorHandler::Internal);
    }
}
