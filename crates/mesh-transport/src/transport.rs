//! Owns the TCP socket to the radio: connect, framed send/receive,
//! reconnect with backoff, and stale-connection detection.

use crate::error::TransportError;
use crate::framing::{frame_payload, FrameDecoder};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Published on every transition so callers (the Protocol Engine, the
/// virtual-node hub) can react without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Reason a connection came down, distinguishing a deliberate
/// user-initiated disconnect (which must suppress auto-reconnect) from
/// everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Io,
    Stale,
    UserRequested,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// If no byte arrives within this window the link is declared stale
    /// and force-closed.
    pub stale_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TransportConfig {
            host: host.into(),
            port,
            stale_timeout: Duration::from_secs(120),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A decoded inbound frame paired with nothing else — the codec crate
/// turns this into a tagged `DecodedFrame`.
pub type InboundFrame = Vec<u8>;

/// The framed transport worker. `run` drives the reader and writer loops
/// until told to stop; frames go out on `inbound_tx`, and outbound bytes
/// come in on the returned sender half.
pub struct RadioLink {
    cfg: TransportConfig,
    status_tx: watch::Sender<ConnectionStatus>,
}

pub struct RadioLinkHandles {
    pub status_rx: watch::Receiver<ConnectionStatus>,
    pub outbound_tx: mpsc::Sender<Vec<u8>>,
    pub inbound_rx: mpsc::Receiver<InboundFrame>,
}

impl RadioLink {
    pub fn new(cfg: TransportConfig) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        (RadioLink { cfg, status_tx }, status_rx)
    }

    /// Run the connect/reconnect loop until `shutdown` fires. Returns
    /// when the caller requests shutdown; never returns on its own for
    /// transient I/O failures (those trigger backoff-and-retry instead).
    pub async fn run(
        self,
        inbound_tx: mpsc::Sender<InboundFrame>,
        mut outbound_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = self.cfg.initial_backoff;
        let mut user_disconnect_suppresses_reconnect = false;

        loop {
            if *shutdown.borrow() {
                return;
            }
            if user_disconnect_suppresses_reconnect {
                // Wait for either a shutdown or... there is no
                // programmatic "reconnect now" signal here; the caller
                // constructs a fresh RadioLink to resume. Block until
                // shutdown.
                let _ = shutdown.changed().await;
                continue;
            }

            let _ = self.status_tx.send(ConnectionStatus::Connecting);
            let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
            let stream = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                res = TcpStream::connect(&addr) => res,
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!(addr = %addr, error = %e, backoff_ms = backoff.as_millis(), "connect failed, backing off");
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.cfg.max_backoff);
                    continue;
                }
            };

            backoff = self.cfg.initial_backoff;
            let _ = self.status_tx.send(ConnectionStatus::Connected);
            info!(addr = %addr, "radio link connected");

            let reason = self
                .drive_connection(stream, &inbound_tx, &mut outbound_rx, &mut shutdown)
                .await;

            let _ = self.status_tx.send(ConnectionStatus::Disconnected);
            match reason {
                DisconnectReason::UserRequested => {
                    info!("radio link disconnected by user request, suppressing auto-reconnect");
                    user_disconnect_suppresses_reconnect = true;
                }
                DisconnectReason::Stale => warn!("radio link stale, reconnecting");
                DisconnectReason::Io => warn!("radio link lost, reconnecting"),
            }

            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn drive_connection(
        &self,
        stream: TcpStream,
        inbound_tx: &mpsc::Sender<InboundFrame>,
        outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DisconnectReason {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            let _ = writer.shutdown().await;
                            return DisconnectReason::UserRequested;
                        }
                        Ok(()) => {}
                        Err(_) => return DisconnectReason::UserRequested,
                    }
                }
                read_result = tokio::time::timeout(self.cfg.stale_timeout, reader.read(&mut buf)) => {
                    match read_result {
                        Err(_elapsed) => return DisconnectReason::Stale,
                        Ok(Ok(0)) => return DisconnectReason::Io,
                        Ok(Ok(n)) => {
                            for frame in decoder.feed(&buf[..n]) {
                                if frame.is_empty() {
                                    continue;
                                }
                                if inbound_tx.send(frame).await.is_err() {
                                    return DisconnectReason::Io;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "radio link read error");
                            return DisconnectReason::Io;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        None => return DisconnectReason::Io,
                        Some(payload) => {
                            let framed = frame_payload(&payload);
                            if let Err(e) = writer.write_all(&framed).await {
                                warn!(error = %e, "radio link write error");
                                return DisconnectReason::Io;
                            }
                            debug!(bytes = framed.len(), "sent frame");
                        }
                    }
                }
            }
        }
    }
}

/// Convenience constructor bundling the channels a caller needs to drive
/// a `RadioLink` without assembling the plumbing by hand.
pub fn spawn_link(
    cfg: TransportConfig,
    shutdown: watch::Receiver<bool>,
) -> (
    tokio::task::JoinHandle<()>,
    watch::Receiver<ConnectionStatus>,
    mpsc::Sender<Vec<u8>>,
    mpsc::Receiver<InboundFrame>,
) {
    let (link, status_rx) = RadioLink::new(cfg);
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let handle = tokio::spawn(link.run(inbound_tx, outbound_rx, shutdown));
    (handle, status_rx, outbound_tx, inbound_rx)
}

#[allow(dead_code)]
fn assert_send<T: Send>() {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_sends_and_receives_framed_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x94, 0xC3, 0x00, 0x02, 0x01, 0x02]);
            sock.write_all(&[0x94, 0xC3, 0x00, 0x01, 0x09]).await.unwrap();
        });

        let cfg = TransportConfig::new(addr.ip().to_string(), addr.port());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_handle, mut status_rx, outbound_tx, mut inbound_rx) = spawn_link(cfg, shutdown_rx);

        status_rx.changed().await.unwrap();
        while *status_rx.borrow() != ConnectionStatus::Connected {
            status_rx.changed().await.unwrap();
        }

        outbound_tx.send(vec![0x01, 0x02]).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, vec![0x09]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn user_shutdown_suppresses_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let cfg = TransportConfig::new(addr.ip().to_string(), addr.port());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mut status_rx, _outbound_tx, _inbound_rx) = spawn_link(cfg, shutdown_rx);

        while *status_rx.borrow() != ConnectionStatus::Connected {
            status_rx.changed().await.unwrap();
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
