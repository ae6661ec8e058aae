//! Keeps the connection manager running for the process lifetime.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::server::{pause, ConnectionManager, ConnectionState, Link, LinkStatus};

/// Default delay before restarting a failed connection manager.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Handle to the supervised connection manager.
pub struct Supervisor {
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Bind the listener and start serving in the background.
    ///
    /// A bind failure here is returned to the caller instead of being retried.
    pub async fn start(manager: Arc<ConnectionManager>, restart_delay: Duration) -> Result<Self, BridgeError> {
        let listener = manager.bind().await?;
        let local_addr = listener
            .local_addr()
            .unwrap_or(manager.config().listen_addr);
        let link = Arc::clone(manager.link());
        let shutdown = CancellationToken::new();

        let first = Mutex::new(Some(listener));
        let token = shutdown.clone();
        let run = move || {
            let manager = Arc::clone(&manager);
            let listener: Option<TcpListener> = first.lock().take();
            let token = token.clone();
            async move {
                let listener = match listener {
                    Some(listener) => listener,
                    None => manager.bind().await?,
                };
                manager.serve(listener, token).await
            }
        };

        let task = tokio::spawn(supervise(run, link, restart_delay, shutdown.clone()));
        info!("Supervisor started for {}", local_addr);

        Ok(Self {
            shutdown,
            local_addr,
            task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request shutdown and wait until the listener and session are closed.
    pub async fn shutdown(self) {
        info!("Stopping FIAS server");
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("Supervisor task failed: {}", e);
        }
    }
}

/// Run `run` until it returns cleanly or `shutdown` is cancelled, restarting
/// it after `restart_delay` whenever it fails or panics.
pub(crate) async fn supervise<F, Fut>(
    mut run: F,
    link: Arc<Link>,
    restart_delay: Duration,
    shutdown: CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
{
    let mut restarts = 0u32;

    loop {
        let outcome = tokio::spawn(run()).await;

        let reason = match outcome {
            Ok(Ok(())) => break,
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => format!("connection manager panicked: {}", e),
            Err(e) => e.to_string(),
        };

        if shutdown.is_cancelled() {
            break;
        }

        restarts += 1;
        error!("FIAS server failed: {} (restart #{} in {:?})", reason, restarts, restart_delay);
        link.set_state(ConnectionState::Stopped);
        link.publish(LinkStatus::Error { reason });

        if !pause(restart_delay, &shutdown).await {
            break;
        }
        warn!("Restarting FIAS server");
    }

    link.set_state(ConnectionState::Stopped);
    link.publish(LinkStatus::Stopped);
    info!("FIAS server stopped");
}
