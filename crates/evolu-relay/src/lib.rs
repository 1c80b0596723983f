//! # Evolu Relay
//!
//! The untrusted store-and-forward endpoint. One WebSocket path accepts
//! clients; each binary frame is unpadded, decoded, dispatched through the
//! stateless protocol responder over shared storage, and answered with a
//! padded frame. The relay holds only `(owner, timestamp, ciphertext)`
//! rows and write keys; it never sees a decryption key.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

use evolu_protocol::{
    open_frame, respond, seal_frame, DecodeError, ErrorCode, ProtocolMessage, ReconcileConfig,
    PROTOCOL_VERSION,
};
use evolu_store::StorageHandle;

const HTTP_426: &[u8] = b"HTTP/1.1 426 Upgrade Required\r\n\
    upgrade: websocket\r\n\
    connection: close\r\n\
    content-length: 0\r\n\r\n";

/// Accept loop: serve every incoming connection until the listener fails.
pub async fn serve(
    listener: TcpListener,
    storage: StorageHandle,
    reconcile: ReconcileConfig,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "relay listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let storage = storage.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, addr, storage, reconcile).await {
                debug!(%addr, error = %err, "connection ended");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    storage: StorageHandle,
    reconcile: ReconcileConfig,
) -> anyhow::Result<()> {
    if !is_upgrade_request(&stream).await {
        debug!(%addr, "plain http request, answering 426");
        stream.write_all(HTTP_426).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let ws = accept_async(stream).await?;
    debug!(%addr, "websocket session open");
    session_loop(ws, storage, reconcile).await
}

/// Peek at the request head for a WebSocket upgrade before handing the
/// stream to the handshake. Headers land in the first segments in
/// practice; a short grace loop covers slow writers.
async fn is_upgrade_request(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 2048];
    for _ in 0..20 {
        let n = match stream.peek(&mut buf).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };
        let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
        if head.contains("upgrade: websocket") {
            return true;
        }
        if head.contains("\r\n\r\n") || n == buf.len() {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn session_loop(
    mut ws: WebSocketStream<TcpStream>,
    storage: StorageHandle,
    reconcile: ReconcileConfig,
) -> anyhow::Result<()> {
    let mut rng = ChaCha20Rng::from_rng(rand::rngs::OsRng)?;
    while let Some(message) = ws.next().await {
        let bytes = match message? {
            WsMessage::Binary(bytes) => bytes,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
            other => {
                warn!(?other, "unexpected websocket message");
                break;
            }
        };

        let reply = match open_frame(&bytes) {
            Ok(frame) => {
                // The relay stores ciphertext only, so the applied list is
                // not integrated further here.
                storage
                    .call(move |store| Ok(respond(store, frame, reconcile)))
                    .await?
                    .map(|step| step.reply)
            }
            Err(DecodeError::Version { peer }) => {
                warn!(peer, ours = PROTOCOL_VERSION, "version mismatch");
                Some(ProtocolMessage::Error {
                    code: ErrorCode::VersionUnsupported,
                    detail: format!("relay speaks version {PROTOCOL_VERSION}, got {peer}"),
                })
            }
            Err(err) => {
                warn!(error = %err, "malformed frame");
                Some(ProtocolMessage::Error {
                    code: ErrorCode::Protocol,
                    detail: "malformed frame".to_string(),
                })
            }
        };

        match reply {
            Some(reply) => {
                let terminal = matches!(reply, ProtocolMessage::Error { .. });
                let sealed = seal_frame(&reply, &mut rng)?;
                ws.send(WsMessage::Binary(sealed)).await?;
                if terminal {
                    break;
                }
            }
            None => break,
        }
    }
    let _ = ws.close(None).await;
    Ok(())
}
