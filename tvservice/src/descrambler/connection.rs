//! One card-server connection: connect, log in, then pump ECM requests and
//! replies until the link dies, with exponential backoff between attempts.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use cwc_protocol::{
    decode_header, decode_server_message, encode_client_message, ClientError, ClientMessage,
    ProtocolError, ServerMessage, HEADER_SIZE, PROTOCOL_VERSION,
};

use super::cwc::{CwcServerConfig, CwcShared};

/// Outgoing request queue per connection.
pub(crate) const REQUEST_QUEUE: usize = 64;

/// Missed keepalive intervals before the connection is declared dead.
const KEEPALIVE_MISSES: u32 = 3;

/// Keep a server connected until shutdown.
pub(crate) async fn run_server(
    shared: Arc<CwcShared>,
    index: usize,
    config: CwcServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = shared.config().backoff_min;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut logged_in = false;
        match session(&shared, index, &config, &mut shutdown, &mut logged_in).await {
            Ok(()) => debug!("[CWC] {}: session ended", config.address),
            Err(e) => warn!("[CWC] {}: {}", config.address, e),
        }
        shared.connection_lost(index);
        if *shutdown.borrow() {
            break;
        }
        if logged_in {
            backoff = shared.config().backoff_min;
        }
        debug!("[CWC] {}: reconnecting in {:?}", config.address, backoff);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(shared.config().backoff_max);
    }
    debug!("[CWC] {}: connection task ended", config.address);
}

async fn session(
    shared: &Arc<CwcShared>,
    index: usize,
    config: &CwcServerConfig,
    shutdown: &mut watch::Receiver<bool>,
    logged_in: &mut bool,
) -> Result<(), ClientError> {
    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.address)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e.to_string())),
        Err(_) => return Err(ClientError::Timeout),
    };
    stream
        .set_nodelay(true)
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(8192);

    write_message(
        &mut writer,
        &ClientMessage::Login {
            version: PROTOCOL_VERSION,
            username: config.username.clone(),
            password: config.password.clone(),
        },
    )
    .await?;

    let ack = tokio::time::timeout(config.connect_timeout, read_message(&mut reader, &mut read_buf))
        .await
        .map_err(|_| ClientError::Timeout)??;
    let cards = match ack {
        ServerMessage::LoginAck {
            version,
            success: true,
            cards,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    client: PROTOCOL_VERSION,
                    server: version,
                }
                .into());
            }
            cards
        }
        ServerMessage::LoginAck { success: false, .. } => {
            return Err(ClientError::LoginRejected(config.address.clone()));
        }
        other => {
            return Err(ProtocolError::DecodeError(format!(
                "expected login reply, got {:?}",
                other.message_type()
            ))
            .into());
        }
    };
    info!(
        "[CWC] {}: logged in, {} card(s): {}",
        config.address,
        cards.len(),
        cards
            .iter()
            .map(|c| format!("{:04X}", c.caid))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let (tx, mut rx) = mpsc::channel::<ClientMessage>(REQUEST_QUEUE);
    shared.connection_up(index, cards, tx);
    *logged_in = true;

    let keepalive_interval = shared.config().keepalive_interval;
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.tick().await;
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                trace!("[CWC] {}: sending {:?}", config.address, msg.message_type());
                write_message(&mut writer, &msg).await?;
            }

            result = reader.read_buf(&mut read_buf) => {
                let n = result.map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                last_rx = Instant::now();
                while let Some(msg) = try_decode(&mut read_buf)? {
                    shared.handle_reply(index, msg);
                }
            }

            _ = keepalive.tick() => {
                if last_rx.elapsed() >= keepalive_interval * KEEPALIVE_MISSES {
                    return Err(ClientError::KeepaliveTimeout);
                }
                write_message(&mut writer, &ClientMessage::Keepalive).await?;
            }

            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn write_message<W>(writer: &mut W, msg: &ClientMessage) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_client_message(msg)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))
}

async fn read_message<R>(reader: &mut R, buf: &mut BytesMut) -> Result<ServerMessage, ClientError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(msg) = try_decode(buf)? {
            return Ok(msg);
        }
        let n = reader
            .read_buf(buf)
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

/// Split one complete frame off `buf`, if there is one.
fn try_decode(buf: &mut BytesMut) -> Result<Option<ServerMessage>, ProtocolError> {
    let Some(header) = decode_header(buf)? else {
        return Ok(None);
    };
    if buf.len() < header.frame_len() {
        return Ok(None);
    }
    let _ = buf.split_to(HEADER_SIZE);
    let payload: Bytes = buf.split_to(header.payload_len as usize).freeze();
    decode_server_message(header.message_type, payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwc_protocol::encode_server_message;

    #[test]
    fn test_try_decode_waits_for_whole_frame() {
        let frame = encode_server_message(&ServerMessage::EcmReject { seq: 7, code: 2 }).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..HEADER_SIZE + 2]);
        assert_eq!(try_decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[HEADER_SIZE + 2..]);
        buf.extend_from_slice(&encode_server_message(&ServerMessage::KeepaliveAck).unwrap());
        assert_eq!(
            try_decode(&mut buf).unwrap(),
            Some(ServerMessage::EcmReject { seq: 7, code: 2 })
        );
        assert_eq!(try_decode(&mut buf).unwrap(), Some(ServerMessage::KeepaliveAck));
        assert!(buf.is_empty());
    }
}
