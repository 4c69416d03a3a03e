//! Raw TCP listener exposing the `VirtualNodeHub`'s replay set plus live
//! broadcast to third-party Meshtastic apps, using the radio's own
//! magic/length framing rather than a browser-facing WebSocket surface.

use mesh_core::VirtualNodeHub;
use mesh_transport::frame_payload;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Accept loop: binds `bind`, spawns one task per subscriber connection.
/// `outgoing_tx` carries raw bytes a subscriber sent, tagged as a
/// `ToRadio` frame destined for the physical radio link.
pub async fn run(bind: String, hub: Arc<Mutex<VirtualNodeHub>>, outgoing_tx: mpsc::Sender<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            warn!(bind = %bind, error = %e, "virtual-node listener failed to bind");
            return;
        }
    };
    info!(bind = %bind, "virtual-node listener ready");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                debug!(%peer, "virtual-node subscriber connected");
                let hub = hub.clone();
                let outgoing_tx = outgoing_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(serve_subscriber(stream, hub, outgoing_tx, shutdown));
            }
        }
    }
}

async fn serve_subscriber(stream: TcpStream, hub: Arc<Mutex<VirtualNodeHub>>, outgoing_tx: mpsc::Sender<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
    let (mut reader, mut writer) = stream.into_split();

    let (replay, mut live_rx) = {
        let hub = hub.lock().await;
        (hub.replay_set().to_vec(), hub.subscribe())
    };
    for entry in &replay {
        if writer.write_all(&frame_payload(&entry.raw)).await.is_err() {
            return;
        }
    }

    let mut decoder = mesh_transport::FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            live = live_rx.recv() => {
                match live {
                    Ok(entry) => {
                        if writer.write_all(&frame_payload(&entry.raw)).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            read_result = reader.read(&mut buf) => {
                match read_result {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        for frame in decoder.feed(&buf[..n]) {
                            if frame.is_empty() {
                                continue;
                            }
                            if outgoing_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
