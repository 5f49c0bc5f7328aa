use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the embedder.
///
/// Programming errors (operating on a reactor from a foreign thread,
/// creating two reactors on one thread, removing a channel that still has
/// interest) are not represented here; they panic with a diagnostic.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Address parsing or DNS resolution failure.
    Addr(String),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO Error: {}", e),
            Error::Addr(msg) => write!(f, "Address Error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
