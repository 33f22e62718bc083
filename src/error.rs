use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Caller bug: bad stream index or an out-of-range offset. Reported
    /// synchronously, never enqueued.
    InvalidArgument(&'static str),
    /// Backing files absent (or holding a different key) although the index
    /// believed the entry existed. The caller evicts and recreates.
    NotFound,
    /// Trailer CRC disagrees with stream content. Poisons further reads of
    /// that stream until the entry is doomed.
    ChecksumMismatch,
    /// Malformed header or trailer, a key length that would read past the
    /// file, or a file shorter than its minimal records.
    Corrupt(String),
    /// Sparse call issued while another is outstanding or mid-cancellation.
    OperationNotSupported,
    /// The entry (or the whole backend) shut down before the operation ran.
    Cancelled,
    IoError(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            Error::NotFound => write!(f, "Entry not found"),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Corrupt(msg) => write!(f, "Corrupt entry: {}", msg),
            Error::OperationNotSupported => write!(f, "Operation not supported"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Copies the error for fan-out to multiple observers. `io::Error` is
    /// not `Clone`; the kind survives and the payload is stringified.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::InvalidArgument(what) => Error::InvalidArgument(what),
            Error::NotFound => Error::NotFound,
            Error::ChecksumMismatch => Error::ChecksumMismatch,
            Error::Corrupt(msg) => Error::Corrupt(msg.clone()),
            Error::OperationNotSupported => Error::OperationNotSupported,
            Error::Cancelled => Error::Cancelled,
            Error::IoError(err) => Error::IoError(io::Error::new(err.kind(), err.to_string())),
        }
    }
}
