//! Per-connection driver over a raw TCP socket.
//!
//! Runs the opening handshake, announces the connection to the hub, then
//! pumps frames both ways until either side closes. The socket is owned
//! by this task alone and is released when it returns.

use crate::config::ServerConfig;
use crate::hub::HubEvent;
use crate::relay::{ConnCommand, ConnectionId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use wschat_core::frame::{encode_close, CloseFrame, CLOSE_NORMAL};
use wschat_core::handshake::reject_response;
use wschat_core::{
    encode, ChatError, ChatResult, Frame, FrameDecoder, Message, OpCode, Reassembler, Role,
    UpgradeRequest,
};

const READ_CHUNK: usize = 8 * 1024;

/// Limits applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_message_size: usize,
    pub outbound_queue: usize,
    pub handshake_timeout: Duration,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            outbound_queue: config.outbound_queue,
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// Drive one accepted socket to completion.
pub async fn serve(
    mut stream: TcpStream,
    remote: SocketAddr,
    id: ConnectionId,
    settings: Arc<ConnectionSettings>,
    hub: mpsc::Sender<HubEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = Vec::with_capacity(1024);
    let handshake = tokio::select! {
        _ = shutdown_rx.recv() => {
            debug!(conn = id, "shutdown during handshake");
            return;
        }
        result = tokio::time::timeout(settings.handshake_timeout, read_request(&mut stream, &mut buf)) => result,
    };

    let (request, used) = match handshake {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(e @ ChatError::Handshake(_))) => {
            warn!(conn = id, remote = %remote, error = %e, "handshake rejected");
            let _ = stream.write_all(&reject_response(400, &e.to_string())).await;
            return;
        }
        Ok(Err(e)) => {
            warn!(conn = id, remote = %remote, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            warn!(conn = id, remote = %remote, timeout = ?settings.handshake_timeout, "handshake timed out");
            return;
        }
    };

    let (out_tx, out_rx) = mpsc::channel(settings.outbound_queue);
    let (admitted_tx, admitted_rx) = oneshot::channel();
    let announced = hub
        .send(HubEvent::Connected {
            id,
            remote_addr: remote,
            outbound: out_tx,
            admitted: admitted_tx,
        })
        .await;
    let admission = match announced {
        Ok(()) => admitted_rx
            .await
            .unwrap_or_else(|_| Err("server shutting down".into())),
        Err(_) => Err("server shutting down".into()),
    };
    if let Err(reason) = admission {
        warn!(conn = id, remote = %remote, reason = %reason, "upgrade refused");
        let _ = stream.write_all(&reject_response(503, &reason)).await;
        return;
    }

    if let Err(e) = stream.write_all(&request.accept_response()).await {
        let _ = hub
            .send(HubEvent::Disconnected {
                id,
                reason: format!("write failed: {e}"),
            })
            .await;
        return;
    }
    info!(conn = id, remote = %remote, path = %request.path, "websocket upgraded");

    let leftover = buf.split_off(used);
    let reason = match session_loop(&mut stream, id, &leftover, &settings, &hub, out_rx).await {
        Ok(reason) => reason,
        Err(e) => {
            if let Some(code) = e.close_code() {
                let _ = stream.write_all(&encode_close(code, &e.to_string())).await;
            }
            warn!(conn = id, error = %e, "connection error");
            e.to_string()
        }
    };
    let _ = stream.shutdown().await;

    // The hub may already be gone during shutdown.
    let _ = hub.send(HubEvent::Disconnected { id, reason }).await;
}

/// Read until a complete upgrade request is buffered.
async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> ChatResult<(UpgradeRequest, usize)> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(parsed) = UpgradeRequest::parse(buf)? {
            return Ok(parsed);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ChatError::Transport("connection closed during handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Pump frames until close. Returns a short description of why it ended.
async fn session_loop(
    stream: &mut TcpStream,
    id: ConnectionId,
    leftover: &[u8],
    settings: &ConnectionSettings,
    hub: &mpsc::Sender<HubEvent>,
    mut outbound: mpsc::Receiver<ConnCommand>,
) -> ChatResult<String> {
    let mut decoder = FrameDecoder::with_max_payload(Role::Server, settings.max_message_size);
    let mut reassembler = Reassembler::new(settings.max_message_size);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut frames = decoder.feed(leftover)?;

    loop {
        for frame in frames.drain(..) {
            if let Some(reason) = handle_frame(stream, id, frame, &mut reassembler, hub).await? {
                return Ok(reason);
            }
        }

        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(ConnCommand::Send(bytes)) => write_all(stream, &bytes).await?,
                Some(ConnCommand::Close { code, reason }) => {
                    let _ = stream.write_all(&encode_close(code, &reason)).await;
                    return Ok(format!("closed by server ({code} {reason})"));
                }
                None => return Ok("dropped by hub".into()),
            },
            read = stream.read(&mut chunk) => {
                let n = read.map_err(|e| ChatError::Transport(format!("read failed: {e}")))?;
                if n == 0 {
                    return Ok("peer closed the socket".into());
                }
                frames = decoder.feed(&chunk[..n])?;
            }
        }
    }
}

/// Handle one decoded frame. `Some(reason)` ends the session.
async fn handle_frame(
    stream: &mut TcpStream,
    id: ConnectionId,
    frame: Frame,
    reassembler: &mut Reassembler,
    hub: &mpsc::Sender<HubEvent>,
) -> ChatResult<Option<String>> {
    match frame.opcode {
        OpCode::Ping => {
            write_all(stream, &encode(OpCode::Pong, &frame.payload)).await?;
            Ok(None)
        }
        OpCode::Pong => Ok(None),
        OpCode::Close => {
            let code = CloseFrame::parse(&frame.payload)?.map_or(CLOSE_NORMAL, |c| c.code);
            let _ = stream.write_all(&encode_close(code, "")).await;
            Ok(Some(format!("peer sent close {code}")))
        }
        OpCode::Text | OpCode::Binary | OpCode::Continuation => {
            match reassembler.push(frame)? {
                Some(Message::Text(text)) => {
                    if hub.send(HubEvent::Text { id, text }).await.is_err() {
                        return Ok(Some("hub stopped".into()));
                    }
                }
                Some(Message::Binary(data)) => {
                    debug!(conn = id, len = data.len(), "ignoring binary message");
                }
                None => {}
            }
            Ok(None)
        }
    }
}

async fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> ChatResult<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| ChatError::Transport(format!("write failed: {e}")))
}
