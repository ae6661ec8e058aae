//! Shared state for the admin web API.

use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::dispatch::LinkSettings;
use crate::guests::GuestRegistry;
use crate::logging::LogBuffer;
use crate::server::Link;

/// Handles the web API works through. None of them exposes the socket.
pub struct WebState {
    /// PMS link handle.
    pub link: Arc<Link>,
    /// Guest registry.
    pub registry: Arc<GuestRegistry>,
    /// Recent log events.
    pub logs: Arc<LogBuffer>,
    /// Interface settings, reported by the status endpoint.
    pub settings: Arc<LinkSettings>,
    /// Process start time.
    pub started_at: DateTime<Local>,
}

impl WebState {
    pub fn new(
        link: Arc<Link>,
        registry: Arc<GuestRegistry>,
        logs: Arc<LogBuffer>,
        settings: Arc<LinkSettings>,
    ) -> Self {
        Self {
            link,
            registry,
            logs,
            settings,
            started_at: Local::now(),
        }
    }

    /// Seconds since the web state was created.
    pub fn uptime_seconds(&self) -> i64 {
        (Local::now() - self.started_at).num_seconds()
    }
}
