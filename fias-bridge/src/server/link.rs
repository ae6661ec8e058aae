//! Shared handle onto the PMS link.
//!
//! The connection manager attaches the active session here; the web API and
//! other collaborators use it to query the state, push records and force a
//! disconnect without touching the socket.

use std::net::SocketAddr;

use bytes::Bytes;
use fias_protocol::{encode_message, encode_record, OutboundRecord, RecordId};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the single PMS connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Stopped,
    Listening,
    Connected,
    Closing,
}

/// Status notification published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LinkStatus {
    Listening,
    Connected { peer: String },
    Disconnected,
    Error { reason: String },
    Stopped,
}

struct ActiveSession {
    id: u64,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    disconnect: CancellationToken,
}

/// Link handle shared between the connection manager and collaborators.
pub struct Link {
    state: Mutex<ConnectionState>,
    session: Mutex<Option<ActiveSession>>,
    status_tx: broadcast::Sender<LinkStatus>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ConnectionState::Stopped),
            session: Mutex::new(None),
            status_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Address of the connected PMS, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.session.lock().as_ref().map(|s| s.peer)
    }

    /// Subscribe to status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    /// Encode a record and queue it on the active session.
    pub async fn send_directive<K, V>(&self, record_id: RecordId, fields: &[(K, V)]) -> Result<(), BridgeError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let frame = encode_message(&record_id, fields)?;
        self.enqueue(frame).await?;
        info!("Directive {} queued", record_id);
        Ok(())
    }

    /// Queue a prepared record on the active session.
    pub async fn send_record(&self, record: &OutboundRecord) -> Result<(), BridgeError> {
        let frame = encode_record(record)?;
        self.enqueue(frame).await
    }

    /// Close the active session. Returns false when nothing was connected.
    pub fn force_disconnect(&self) -> bool {
        match self.session.lock().as_ref() {
            Some(session) => {
                info!("[Session {}] Disconnect requested", session.id);
                session.disconnect.cancel();
                true
            }
            None => false,
        }
    }

    async fn enqueue(&self, frame: Bytes) -> Result<(), BridgeError> {
        // Clone the sender so the lock is released before awaiting.
        let (outbound, disconnect) = self
            .session
            .lock()
            .as_ref()
            .filter(|s| !s.disconnect.is_cancelled())
            .map(|s| (s.outbound.clone(), s.disconnect.clone()))
            .ok_or(BridgeError::NotConnected)?;

        tokio::select! {
            biased;
            _ = disconnect.cancelled() => Err(BridgeError::SessionClosed),
            sent = outbound.send(frame) => sent.map_err(|_| BridgeError::SessionClosed),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Link state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub(crate) fn publish(&self, status: LinkStatus) {
        // No receivers is fine.
        let _ = self.status_tx.send(status);
    }

    pub(crate) fn attach(
        &self,
        id: u64,
        peer: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        disconnect: CancellationToken,
    ) {
        *self.session.lock() = Some(ActiveSession {
            id,
            peer,
            outbound,
            disconnect,
        });
        self.set_state(ConnectionState::Connected);
        self.publish(LinkStatus::Connected {
            peer: peer.to_string(),
        });
    }

    pub(crate) fn detach(&self, id: u64) {
        let mut session = self.session.lock();
        if session.as_ref().map_or(false, |s| s.id == id) {
            *session = None;
        }
    }
}
