//! PMS link server: listener, session and the shared link handle.

pub mod link;
pub mod listener;
pub mod session;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use link::{ConnectionState, Link, LinkStatus};
pub use listener::{ConnectionManager, LinkConfig};
pub use session::{Session, SessionOptions};

/// Sleep unless cancelled first. Returns false on cancellation.
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
