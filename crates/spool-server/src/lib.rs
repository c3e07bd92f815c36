//! Spool relay service
//!
//! Accepts files over HTTP, spools them to disk and relays them to an FTP
//! endpoint. Observers can poll a user's delivered and pending files or
//! long-poll for the next change.

pub mod config;
pub mod context;
pub mod error;
pub mod server;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use context::AppContext;
pub use error::{ApiError, Result, ServerError};
pub use server::{create_router, start_server};
pub use snapshot::{load_percent, SpoolSnapshots, UserSnapshot};
