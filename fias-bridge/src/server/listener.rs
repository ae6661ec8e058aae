//! TCP listener serving one PMS session at a time.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::error::BridgeError;
use crate::server::link::{ConnectionState, Link, LinkStatus};
use crate::server::session::{run_writer, Session, SessionOptions};

/// Frames queued for the writer before senders wait.
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// How long the writer may take to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive accept failures before the accept loop gives up.
const MAX_ACCEPT_FAILURES: u32 = 10;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Upper bound of a single wait for inbound data.
    pub read_timeout: Duration,
    /// NAK and drop frames whose LRC does not match.
    pub strict_checksum: bool,
    /// Delay after a failed connection before accepting again.
    pub error_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5008)),
            read_timeout: Duration::from_secs(5),
            strict_checksum: false,
            error_delay: Duration::from_secs(1),
        }
    }
}

impl LinkConfig {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_timeout: self.read_timeout,
            strict_checksum: self.strict_checksum,
        }
    }
}

/// Accepts PMS connections and runs their sessions, one at a time.
pub struct ConnectionManager {
    config: LinkConfig,
    dispatcher: Arc<Dispatcher>,
    link: Arc<Link>,
    session_count: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig, dispatcher: Arc<Dispatcher>, link: Arc<Link>) -> Self {
        Self {
            config,
            dispatcher,
            link,
            session_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let addr = self.config.listen_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })
    }

    /// Accept connections on `listener` until `shutdown` is cancelled.
    ///
    /// Connection errors only end the session. An error is returned when
    /// accepting keeps failing.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let local_addr = listener
            .local_addr()
            .unwrap_or(self.config.listen_addr);
        info!("FIAS server listening on {}", local_addr);

        let mut accept_failures = 0u32;

        loop {
            if self.link.state() != ConnectionState::Listening {
                self.link.set_state(ConnectionState::Listening);
                self.link.publish(LinkStatus::Listening);
            }

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    accept_failures = 0;
                    let session_id = self.session_count.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("[Session {}] PMS connected from {}", session_id, peer);

                    let result = self.handle_connection(socket, peer, session_id, &shutdown).await;
                    self.link.publish(LinkStatus::Disconnected);

                    if let Err(e) = result {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        error!("[Session {}] Connection error: {}", session_id, e);
                        self.link.publish(LinkStatus::Error {
                            reason: e.to_string(),
                        });
                        if !super::pause(self.config.error_delay, &shutdown).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    accept_failures += 1;
                    if accept_failures >= MAX_ACCEPT_FAILURES {
                        return Err(BridgeError::Accept(e));
                    }
                    warn!("Failed to accept connection ({}/{}): {}", accept_failures, MAX_ACCEPT_FAILURES, e);
                    if !super::pause(self.config.error_delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("FIAS server on {} stopped", local_addr);
        Ok(())
    }

    /// Run one session to completion.
    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        session_id: u64,
        shutdown: &CancellationToken,
    ) -> io::Result<()> {
        socket.set_nodelay(true)?;
        let (reader, writer) = socket.into_split();

        let cancel = shutdown.child_token();
        let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_SIZE);
        let mut writer_task = tokio::spawn(run_writer(session_id, writer, rx, cancel.clone()));

        self.link.attach(session_id, peer, tx.clone(), cancel.clone());

        let mut session = Session::new(
            session_id,
            peer,
            reader,
            tx,
            Arc::clone(&self.dispatcher),
            self.config.session_options(),
            cancel.clone(),
        );
        let session_result = session.run().await;

        self.link.set_state(ConnectionState::Closing);
        self.link.detach(session_id);

        let reason = if shutdown.is_cancelled() {
            "shutdown"
        } else if cancel.is_cancelled() && session.close_reason() == "cancelled" {
            "disconnected"
        } else {
            session.close_reason()
        };
        let frames = session.frames_received();
        drop(session);

        // Every sender is gone now, so the writer drains and closes the socket.
        let writer_result = match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(io::Error::new(io::ErrorKind::Other, e)),
            Err(_) => {
                warn!("[Session {}] Writer did not drain in time, aborting", session_id);
                writer_task.abort();
                Ok(())
            }
        };

        info!(
            "[Session {}] Connection closed ({}), {} frame(s) received",
            session_id, reason, frames
        );

        session_result.and(writer_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LinkSettings;
    use crate::guests::GuestRegistry;
    use crate::server::test_client::{test_settings, TestClient};
    use fias_protocol::RecordId;
    use tokio::task::JoinHandle;

    struct Running {
        addr: SocketAddr,
        link: Arc<Link>,
        registry: Arc<GuestRegistry>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<(), BridgeError>>,
    }

    fn manager(settings: LinkSettings) -> (Arc<ConnectionManager>, Arc<GuestRegistry>) {
        let registry = Arc::new(GuestRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::new(settings)));
        let config = LinkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            error_delay: Duration::from_millis(10),
            ..LinkConfig::default()
        };
        (
            Arc::new(ConnectionManager::new(config, dispatcher, Arc::new(Link::new()))),
            registry,
        )
    }

    async fn start() -> Running {
        let (manager, registry) = manager(test_settings());
        let listener = manager.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let link = Arc::clone(manager.link());
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let task = tokio::spawn(async move { manager.serve(listener, token).await });

        Running {
            addr,
            link,
            registry,
            shutdown,
            task,
        }
    }

    async fn wait_for_state(link: &Link, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while link.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn test_bind_failure_names_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (manager, _) = manager(LinkSettings::default());
        let manager = ConnectionManager::new(
            LinkConfig {
                listen_addr: taken.local_addr().unwrap(),
                ..manager.config().clone()
            },
            Arc::clone(&manager.dispatcher),
            Link::new().into(),
        );

        let err = manager.bind().await.unwrap_err();
        assert!(err.is_bind());
        assert!(err.to_string().contains(&taken.local_addr().unwrap().to_string()));
    }

    #[tokio::test]
    async fn test_full_handshake_and_guest_sync() {
        let r = start().await;
        let mut status = r.link.subscribe();

        let mut client = TestClient::connect(r.addr).await;
        assert_eq!(client.read_frame().await.record_id(), &RecordId::LinkStart);
        wait_for_state(&r.link, ConnectionState::Connected).await;
        assert!(matches!(status.recv().await.unwrap(), LinkStatus::Connected { .. }));

        client.send("LS", &[]).await;
        client.expect_ack().await;
        assert_eq!(client.read_frame().await.record_id(), &RecordId::LinkDescription);
        for _ in fias_protocol::SUPPORTED_RECORDS {
            assert_eq!(client.read_frame().await.record_id(), &RecordId::LinkRecord);
        }
        assert_eq!(client.read_frame().await.record_id(), &RecordId::LinkAlive);

        client.send("GI", &[("RN", "101"), ("G#", "R1"), ("GN", "John Smith")]).await;
        client.expect_ack().await;
        client.send("PR", &[("RN", "101"), ("G#", "R1"), ("TA", "1050")]).await;
        client.expect_ack().await;
        let pa = client.read_frame().await;
        assert_eq!(pa.record_id(), &RecordId::PostingAnswer);
        assert_eq!(pa.field("AS"), Some("OK"));
        assert_eq!(r.registry.get("R1").unwrap().balance.to_string(), "10.50");

        r.shutdown.cancel();
        r.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_directive_reaches_pms() {
        let r = start().await;
        let mut client = TestClient::connect(r.addr).await;
        client.read_frame().await;
        wait_for_state(&r.link, ConnectionState::Connected).await;

        r.link
            .send_directive(RecordId::DatabaseResync, &[] as &[(&str, &str)])
            .await
            .unwrap();
        assert_eq!(client.read_frame().await.record_id(), &RecordId::DatabaseResync);

        r.shutdown.cancel();
        r.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_connection_waits_for_first() {
        let r = start().await;

        let mut first = TestClient::connect(r.addr).await;
        first.read_frame().await;
        let mut second = TestClient::connect(r.addr).await;

        // Nothing is sent to the queued connection while the first is active.
        let pending = tokio::time::timeout(Duration::from_millis(200), second.read_byte()).await;
        assert!(pending.is_err());

        drop(first);
        assert_eq!(second.read_frame().await.record_id(), &RecordId::LinkStart);

        r.shutdown.cancel();
        r.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_connection_error() {
        let r = start().await;
        let mut status = r.link.subscribe();

        let mut first = TestClient::connect(r.addr).await;
        first.read_frame().await;
        // Reset instead of a clean close.
        #[allow(deprecated)]
        first.stream().set_linger(Some(Duration::ZERO)).unwrap();
        drop(first);

        let mut second = TestClient::connect(r.addr).await;
        assert_eq!(second.read_frame().await.record_id(), &RecordId::LinkStart);
        second.send("LA", &[]).await;
        second.expect_ack().await;
        assert_eq!(second.read_frame().await.record_id(), &RecordId::LinkAlive);

        let mut saw_disconnect = false;
        while let Ok(event) = status.try_recv() {
            saw_disconnect |= event == LinkStatus::Disconnected;
        }
        assert!(saw_disconnect);

        r.shutdown.cancel();
        r.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_force_disconnect_returns_to_listening() {
        let r = start().await;

        let mut first = TestClient::connect(r.addr).await;
        first.read_frame().await;
        wait_for_state(&r.link, ConnectionState::Connected).await;

        assert!(r.link.force_disconnect());
        first.expect_eof().await;
        wait_for_state(&r.link, ConnectionState::Listening).await;
        assert!(!r.link.is_connected());

        let mut second = TestClient::connect(r.addr).await;
        assert_eq!(second.read_frame().await.record_id(), &RecordId::LinkStart);

        r.shutdown.cancel();
        r.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_session() {
        let r = start().await;

        let mut client = TestClient::connect(r.addr).await;
        client.read_frame().await;
        wait_for_state(&r.link, ConnectionState::Connected).await;

        r.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), r.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        client.expect_eof().await;
    }

    /// Connect with a small receive buffer, flood LS frames and never read.
    async fn stalled_peer(addr: SocketAddr) -> (tokio::net::tcp::OwnedReadHalf, JoinHandle<()>) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let stream = socket.connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();

        let flood = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let frame = fias_protocol::encode_message(&RecordId::LinkStart, &[] as &[(&str, &str)]).unwrap();
            for _ in 0..20_000 {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });
        (reader, flood)
    }

    #[tokio::test]
    async fn test_shutdown_with_peer_not_reading() {
        let r = start().await;
        let (_reader, flood) = stalled_peer(r.addr).await;
        wait_for_state(&r.link, ConnectionState::Connected).await;
        // Let the socket buffers and the outbound queue fill up.
        tokio::time::sleep(Duration::from_millis(500)).await;

        r.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), r.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        flood.abort();
    }

    #[tokio::test]
    async fn test_force_disconnect_with_peer_not_reading() {
        let r = start().await;
        let (_reader, flood) = stalled_peer(r.addr).await;
        wait_for_state(&r.link, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(r.link.force_disconnect());
        wait_for_state(&r.link, ConnectionState::Listening).await;
        flood.abort();

        let mut next = TestClient::connect(r.addr).await;
        assert_eq!(next.read_frame().await.record_id(), &RecordId::LinkStart);

        r.shutdown.cancel();
        r.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_listening() {
        let r = start().await;
        wait_for_state(&r.link, ConnectionState::Listening).await;

        r.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), r.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
