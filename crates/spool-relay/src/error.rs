//! Error types for the relay

use ftp_client::FtpError;
use spool_cache::CacheError;
use std::fmt;

#[derive(Debug)]
pub enum RelayError {
    Ftp(Box<FtpError>),
    Cache(Box<CacheError>),
    Io(Box<std::io::Error>),
    /// Failure reported by a non-FTP remote session
    Remote(String),
    /// User name that has no remote directory encoding
    InvalidUser(String),
    InvalidUrl(String),
    NotConnected,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Ftp(err) => write!(f, "FTP error: {}", err),
            RelayError::Cache(err) => write!(f, "Cache error: {}", err),
            RelayError::Io(err) => write!(f, "IO error: {}", err),
            RelayError::Remote(msg) => write!(f, "Remote error: {}", msg),
            RelayError::InvalidUser(msg) => write!(f, "Invalid user name: {}", msg),
            RelayError::InvalidUrl(msg) => write!(f, "Invalid remote URL: {}", msg),
            RelayError::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Ftp(err) => Some(err.as_ref()),
            RelayError::Cache(err) => Some(err.as_ref()),
            RelayError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<FtpError> for RelayError {
    fn from(err: FtpError) -> Self {
        RelayError::Ftp(Box::new(err))
    }
}

impl From<CacheError> for RelayError {
    fn from(err: CacheError) -> Self {
        RelayError::Cache(Box::new(err))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(Box::new(err))
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
