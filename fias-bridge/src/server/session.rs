//! PMS session handling.
//!
//! A session owns the read half of the socket. Everything that goes out,
//! acknowledgements included, is queued to a writer task that owns the write
//! half, so the read loop, the dispatcher and the web API never share the
//! socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fias_protocol::{
    decode_frame, encode_record, extract_frame, render_raw, take_trailing_frame, LrcCheck,
    OutboundRecord, ACK, NAK,
};
use log::{debug, error, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::handshake::link_start;
use crate::dispatch::{Dispatcher, Step};

const READ_CHUNK_SIZE: usize = 4096;

/// Per-session behaviour taken from the link configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Upper bound of a single wait for inbound data.
    pub read_timeout: Duration,
    /// NAK and drop frames whose LRC does not match.
    pub strict_checksum: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            strict_checksum: false,
        }
    }
}

/// A connected PMS session.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    reader: OwnedReadHalf,
    read_buf: BytesMut,
    outbound: mpsc::Sender<Bytes>,
    dispatcher: Arc<Dispatcher>,
    options: SessionOptions,
    cancel: CancellationToken,
    frames_received: u64,
    close_reason: &'static str,
}

impl Session {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        outbound: mpsc::Sender<Bytes>,
        dispatcher: Arc<Dispatcher>,
        options: SessionOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            reader,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            outbound,
            dispatcher,
            options,
            cancel,
            frames_received: 0,
            close_reason: "running",
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Why the read loop ended.
    pub fn close_reason(&self) -> &'static str {
        self.close_reason
    }

    /// Run the session until the peer closes, an I/O error occurs or the
    /// session is cancelled.
    pub async fn run(&mut self) -> io::Result<()> {
        match self.read_loop().await {
            // A send abandoned on cancellation is a normal stop.
            Err(_) if self.cancel.is_cancelled() => {
                self.close_reason = "cancelled";
                Ok(())
            }
            result => result,
        }
    }

    async fn read_loop(&mut self) -> io::Result<()> {
        debug!("[Session {}] Sending link start to {}", self.id, self.peer);
        self.send(&link_start()).await?;

        let mut tmp_buf = [0u8; READ_CHUNK_SIZE];
        loop {
            // Process any complete frames in the buffer first
            if !self.drain_frames().await? {
                self.close_reason = "cancelled";
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.close_reason = "cancelled";
                    return Ok(());
                }

                result = tokio::time::timeout(self.options.read_timeout, self.reader.read(&mut tmp_buf)) => {
                    match result {
                        Err(_) => {
                            trace!("[Session {}] No data for {:?}", self.id, self.options.read_timeout);
                        }
                        Ok(Ok(0)) => {
                            if let Some(frame) = take_trailing_frame(&mut self.read_buf) {
                                self.handle_frame(&frame).await?;
                            }
                            self.close_reason = "peer_closed";
                            return Ok(());
                        }
                        Ok(Ok(n)) => self.read_buf.extend_from_slice(&tmp_buf[..n]),
                        Ok(Err(e)) => {
                            self.close_reason = "read_error";
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Handle every complete frame in the read buffer. Returns false if the
    /// session was cancelled while doing so.
    async fn drain_frames(&mut self) -> io::Result<bool> {
        loop {
            match extract_frame(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    if !self.handle_frame(&frame).await? {
                        return Ok(false);
                    }
                }
                Ok(None) => return Ok(true),
                Err(e) => warn!("[Session {}] Discarding buffered bytes: {}", self.id, e),
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> io::Result<bool> {
        self.frames_received += 1;
        let raw = render_raw(frame);
        tracing::info!(raw = %raw, "[Session {}] Frame received", self.id);

        let decoded = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(raw = %raw, "[Session {}] Dropping malformed frame: {}", self.id, e);
                return Ok(true);
            }
        };

        match decoded.lrc {
            LrcCheck::Valid => {}
            LrcCheck::Missing => debug!("[Session {}] Frame has no LRC byte", self.id),
            LrcCheck::Mismatch { expected, received } if self.options.strict_checksum => {
                tracing::warn!(
                    raw = %raw,
                    "[Session {}] LRC mismatch (expected {:02X}, received {:02X}), frame rejected",
                    self.id, expected, received
                );
                self.send_control(NAK).await?;
                return Ok(true);
            }
            LrcCheck::Mismatch { expected, received } => {
                tracing::warn!(
                    raw = %raw,
                    "[Session {}] LRC mismatch (expected {:02X}, received {:02X}), processing anyway",
                    self.id, expected, received
                );
            }
        }

        self.send_control(ACK).await?;

        for step in self.dispatcher.dispatch(&decoded.message) {
            match step {
                Step::Send(record) => self.send(&record).await?,
                Step::Pause(delay) => {
                    if !self.pause(delay).await {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        super::pause(delay, &self.cancel).await
    }

    async fn send(&self, record: &OutboundRecord) -> io::Result<()> {
        match encode_record(record) {
            Ok(frame) => self.queue(frame).await,
            Err(e) => {
                error!("[Session {}] Failed to encode {} record: {}", self.id, record.record_id, e);
                Ok(())
            }
        }
    }

    async fn send_control(&self, byte: u8) -> io::Result<()> {
        self.queue(Bytes::copy_from_slice(&[byte])).await
    }

    /// Queue a frame for the writer. Gives up when the session is
    /// cancelled, so a peer that stops reading cannot stall the read loop.
    async fn queue(&self, frame: Bytes) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "session cancelled"))
            }
            sent = self.outbound.send(frame) => {
                sent.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session writer has stopped"))
            }
        }
    }
}

/// Write queued frames to the socket until every sender is dropped.
///
/// A write failure cancels the session so the read loop stops as well. A
/// write the peer does not drain is abandoned once the session is cancelled.
pub async fn run_writer(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> io::Result<()> {
    while let Some(frame) = rx.recv().await {
        let written = tokio::select! {
            biased;
            written = writer.write_all(&frame) => written,
            _ = cancel.cancelled() => {
                debug!("[Session {}] Session cancelled with a write pending, dropping queued frames", id);
                return Ok(());
            }
        };
        if let Err(e) = written {
            warn!("[Session {}] Write failed: {}", id, e);
            cancel.cancel();
            return Err(e);
        }

        match frame.as_ref() {
            [ACK] => trace!("[Session {}] ACK sent", id),
            [NAK] => debug!("[Session {}] NAK sent", id),
            _ => tracing::info!(raw = %render_raw(&frame), "[Session {}] Frame sent", id),
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("[Session {}] Socket shutdown failed: {}", id, e);
    }
    Ok(())
}
