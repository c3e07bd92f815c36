//! Minimal async FTP client
//!
//! Covers the subset of RFC 959 needed to push files to a server: login,
//! directory navigation, passive-mode uploads and name listings.

pub mod client;
pub mod error;
pub mod reply;

pub use client::{FtpStream, DEFAULT_TIMEOUT};
pub use error::{FtpError, Result};
pub use reply::Reply;
