use std::fmt::Display;

/// tidedb errors. All except Internal are expected errors that components
/// handle or surface to callers; Internal errors indicate a violated
/// invariant (e.g. a poisoned lock) and are not recoverable.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A write-ahead log registration waited for pool buffers beyond the
    /// rejection threshold. The registry contains no trace of the attempt.
    BufferExhausted,
    /// A blocking wait was woken by shutdown. The interrupted loop exits
    /// cleanly and performs no further retries.
    Cancelled,
    /// Invalid data, e.g. an undecodable wire message.
    InvalidData(String),
    /// Invalid user input, e.g. an out-of-range configuration value.
    InvalidInput(String),
    /// An IO error, e.g. a WAL sync or transport failure.
    IO(String),
    /// An internal error, e.g. a poisoned lock.
    Internal(String),
    /// A service failed to start.
    Startup(String),
}

/// A tidedb result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BufferExhausted => write!(f, "WAL buffer pool exhausted"),
            Error::Cancelled => write!(f, "operation cancelled by shutdown"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Startup(msg) => write!(f, "startup error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidInput via format!(), returnable as a Result.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

// Allows errinput!() to be used directly in return positions.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Startup(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("poisoned lock: {err}"))
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::IO("channel receiver disconnected".to_string())
    }
}
