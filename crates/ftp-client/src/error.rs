//! Error types for the FTP client

use crate::reply::Reply;
use std::fmt;

#[derive(Debug)]
pub enum FtpError {
    Io(Box<std::io::Error>),
    /// The server answered with a code the command does not allow
    UnexpectedReply(Reply),
    InvalidReply(String),
    InvalidArgument(String),
    Timeout,
    ConnectionClosed,
}

impl FtpError {
    /// Reply code, when the server rejected a command
    pub fn code(&self) -> Option<u16> {
        match self {
            FtpError::UnexpectedReply(reply) => Some(reply.code),
            _ => None,
        }
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtpError::Io(err) => write!(f, "IO error: {}", err),
            FtpError::UnexpectedReply(reply) => write!(f, "Unexpected reply: {}", reply),
            FtpError::InvalidReply(line) => write!(f, "Invalid reply: {}", line),
            FtpError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            FtpError::Timeout => write!(f, "Timed out waiting for server"),
            FtpError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for FtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FtpError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FtpError {
    fn from(err: std::io::Error) -> Self {
        FtpError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, FtpError>;
