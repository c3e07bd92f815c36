//! Store-and-forward relay
//!
//! Files spooled by `spool-cache` are queued here and delivered one at a
//! time, in submission order, to a single FTP endpoint. The worker keeps
//! retrying the head of the queue through endpoint outages and records what
//! each user has had delivered. A per-user notification hub tells observers
//! when that picture changes.

mod delivered;
mod error;
pub mod notify;
mod queue;
pub mod remote;
mod uploader;
mod username;

pub use delivered::DeliveredFiles;
pub use error::{RelayError, Result};
pub use notify::{ChangeSink, Notifier, SnapshotSource, Subscription};
pub use queue::{DeliveryQueue, RingBuffer};
pub use remote::{Connector, FtpConnector, RemoteSession, RemoteTarget};
pub use uploader::{QueuedFile, RelayConfig, RelayStatus, Uploader, DEFAULT_USER_DIR_PREFIX};
pub use username::{decode_user, encode_user};
