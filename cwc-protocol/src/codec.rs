//! Framing and payload layout of CWC messages.
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+------------------+
//! | Magic  | Length | Type   |     Payload      |
//! | "CWCP" | u32 LE | u16 LE |    (variable)    |
//! +--------+--------+--------+------------------+
//! | 4 bytes| 4 bytes| 2 bytes|  Length bytes    |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Magic, payload length and message type.
pub const HEADER_SIZE: usize = 10;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Message type.
    pub message_type: MessageType,
}

impl FrameHeader {
    /// Total frame length including the header.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// Serialise a request to the card server as one frame.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();

    match msg {
        ClientMessage::Login {
            version,
            username,
            password,
        } => {
            payload.put_u16_le(*version);
            encode_string(&mut payload, username)?;
            encode_string(&mut payload, password)?;
        }
        ClientMessage::EcmRequest {
            seq,
            mux,
            caid,
            pid,
            ecm,
        } => {
            if ecm.len() > MAX_ECM_SIZE {
                return Err(ProtocolError::EncodeError(format!(
                    "ECM section of {} bytes exceeds {}",
                    ecm.len(),
                    MAX_ECM_SIZE
                )));
            }
            payload.put_u32_le(*seq);
            payload.put_u32_le(mux.0);
            payload.put_u16_le(*caid);
            payload.put_u16_le(*pid);
            payload.put_u16_le(ecm.len() as u16);
            payload.put_slice(ecm);
        }
        ClientMessage::Keepalive => {
            // Empty payload
        }
    }

    encode_frame(msg.message_type(), payload.freeze())
}

/// Serialise a card-server reply as one frame.
pub fn encode_server_message(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();

    match msg {
        ServerMessage::LoginAck {
            version,
            success,
            cards,
        } => {
            payload.put_u16_le(*version);
            payload.put_u8(if *success { 1 } else { 0 });
            payload.put_u16_le(cards.len() as u16);
            for card in cards {
                payload.put_u16_le(card.caid);
                payload.put_u8(card.providers.len() as u8);
                for provider in &card.providers {
                    payload.put_u32_le(*provider);
                }
            }
        }
        ServerMessage::ControlWord { seq, even, odd } => {
            payload.put_u32_le(*seq);
            encode_control_word(&mut payload, even)?;
            encode_control_word(&mut payload, odd)?;
        }
        ServerMessage::EcmReject { seq, code } => {
            payload.put_u32_le(*seq);
            payload.put_u16_le(*code);
        }
        ServerMessage::KeepaliveAck => {
            // Empty payload
        }
    }

    encode_frame(msg.message_type(), payload.freeze())
}

fn encode_frame(msg_type: MessageType, payload: Bytes) -> Result<Bytes, ProtocolError> {
    let payload_len = payload.len() as u32;
    if payload_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_slice(&MAGIC);
    frame.put_u32_le(payload_len);
    frame.put_u16_le(msg_type.into());
    frame.put_slice(&payload);

    Ok(frame.freeze())
}

fn encode_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(ProtocolError::EncodeError(format!(
            "string of {} bytes too long",
            bytes.len()
        )));
    }
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
    Ok(())
}

fn decode_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    ensure_remaining(buf, 1)?;
    let len = buf.get_u8() as usize;
    ensure_remaining(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::DecodeError(e.to_string()))
}

fn encode_control_word(buf: &mut BytesMut, cw: &Option<Vec<u8>>) -> Result<(), ProtocolError> {
    match cw {
        Some(key) => {
            if key.len() != CW_LEN_CSA && key.len() != CW_LEN_AES {
                return Err(ProtocolError::InvalidControlWord(key.len()));
            }
            buf.put_u8(key.len() as u8);
            buf.put_slice(key);
        }
        None => {
            buf.put_u8(0); // Marker for None
        }
    }
    Ok(())
}

fn decode_control_word(buf: &mut Bytes) -> Result<Option<Vec<u8>>, ProtocolError> {
    ensure_remaining(buf, 1)?;
    let len = buf.get_u8() as usize;
    if len == 0 {
        return Ok(None);
    }
    if len != CW_LEN_CSA && len != CW_LEN_AES {
        return Err(ProtocolError::InvalidControlWord(len));
    }
    ensure_remaining(buf, len)?;
    Ok(Some(buf.copy_to_bytes(len).to_vec()))
}

fn ensure_remaining(buf: &Bytes, expected: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < expected {
        return Err(ProtocolError::IncompleteFrame {
            expected,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

/// Parse the frame header at the start of `buf`. `Ok(None)` means fewer
/// than `HEADER_SIZE` bytes are buffered.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    // Check magic
    let magic = [buf[0], buf[1], buf[2], buf[3]];
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    // Read length
    let payload_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if payload_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
    }

    // Read message type
    let type_val = u16::from_le_bytes([buf[8], buf[9]]);
    let message_type =
        MessageType::try_from(type_val).map_err(ProtocolError::UnknownMessageType)?;

    Ok(Some(FrameHeader {
        payload_len,
        message_type,
    }))
}

/// Decode a client message from a complete frame payload.
pub fn decode_client_message(
    msg_type: MessageType,
    mut payload: Bytes,
) -> Result<ClientMessage, ProtocolError> {
    match msg_type {
        MessageType::Login => {
            ensure_remaining(&payload, 2)?;
            let version = payload.get_u16_le();
            let username = decode_string(&mut payload)?;
            let password = decode_string(&mut payload)?;
            Ok(ClientMessage::Login {
                version,
                username,
                password,
            })
        }
        MessageType::EcmRequest => {
            ensure_remaining(&payload, 14)?;
            let seq = payload.get_u32_le();
            let mux = MuxId(payload.get_u32_le());
            let caid = payload.get_u16_le();
            let pid = payload.get_u16_le();
            let ecm_len = payload.get_u16_le() as usize;
            if ecm_len > MAX_ECM_SIZE {
                return Err(ProtocolError::DecodeError(format!(
                    "ECM section of {} bytes exceeds {}",
                    ecm_len, MAX_ECM_SIZE
                )));
            }
            ensure_remaining(&payload, ecm_len)?;
            let ecm = payload.copy_to_bytes(ecm_len).to_vec();
            Ok(ClientMessage::EcmRequest {
                seq,
                mux,
                caid,
                pid,
                ecm,
            })
        }
        MessageType::Keepalive => Ok(ClientMessage::Keepalive),
        _ => Err(ProtocolError::UnknownMessageType(msg_type as u16)),
    }
}

/// Decode a server message from a complete frame payload.
pub fn decode_server_message(
    msg_type: MessageType,
    mut payload: Bytes,
) -> Result<ServerMessage, ProtocolError> {
    match msg_type {
        MessageType::LoginAck => {
            ensure_remaining(&payload, 5)?;
            let version = payload.get_u16_le();
            let success = payload.get_u8() != 0;
            let count = payload.get_u16_le() as usize;
            let mut cards = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                ensure_remaining(&payload, 3)?;
                let caid = payload.get_u16_le();
                let provider_count = payload.get_u8() as usize;
                ensure_remaining(&payload, provider_count * 4)?;
                let providers = (0..provider_count).map(|_| payload.get_u32_le()).collect();
                cards.push(CardInfo { caid, providers });
            }
            Ok(ServerMessage::LoginAck {
                version,
                success,
                cards,
            })
        }
        MessageType::ControlWord => {
            ensure_remaining(&payload, 4)?;
            let seq = payload.get_u32_le();
            let even = decode_control_word(&mut payload)?;
            let odd = decode_control_word(&mut payload)?;
            Ok(ServerMessage::ControlWord { seq, even, odd })
        }
        MessageType::EcmReject => {
            ensure_remaining(&payload, 6)?;
            let seq = payload.get_u32_le();
            let code = payload.get_u16_le();
            Ok(ServerMessage::EcmReject { seq, code })
        }
        MessageType::KeepaliveAck => Ok(ServerMessage::KeepaliveAck),
        _ => Err(ProtocolError::UnknownMessageType(msg_type as u16)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_roundtrip(msg: &ServerMessage) -> ServerMessage {
        let encoded = encode_server_message(msg).unwrap();
        let header = decode_header(&encoded).unwrap().unwrap();
        assert_eq!(header.frame_len(), encoded.len());
        let payload = Bytes::copy_from_slice(&encoded[HEADER_SIZE..]);
        decode_server_message(header.message_type, payload).unwrap()
    }

    #[test]
    fn test_ecm_request_layout() {
        let msg = ClientMessage::EcmRequest {
            seq: 7,
            mux: MuxId::from_onid_tsid(1, 2),
            caid: 0x0B00,
            pid: 0x1FF,
            ecm: vec![0x80, 0x70, 0x03, 0xAA, 0xBB, 0xCC],
        };
        let encoded = encode_client_message(&msg).unwrap();

        assert_eq!(&encoded[0..4], &MAGIC);
        let header = decode_header(&encoded).unwrap().unwrap();
        assert_eq!(header.message_type, MessageType::EcmRequest);
        assert_eq!(header.payload_len as usize, 14 + 6);

        let payload = Bytes::copy_from_slice(&encoded[HEADER_SIZE..]);
        let decoded = decode_client_message(header.message_type, payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_control_word_single_parity() {
        let msg = ServerMessage::ControlWord {
            seq: 42,
            even: None,
            odd: Some(vec![0x11; CW_LEN_AES]),
        };
        assert_eq!(server_roundtrip(&msg), msg);
    }

    #[test]
    fn test_control_word_rejects_bad_length() {
        let msg = ServerMessage::ControlWord {
            seq: 1,
            even: Some(vec![0; 5]),
            odd: None,
        };
        assert_eq!(
            encode_server_message(&msg),
            Err(ProtocolError::InvalidControlWord(5))
        );
    }

    #[test]
    fn test_login_ack_cards() {
        let msg = ServerMessage::LoginAck {
            version: PROTOCOL_VERSION,
            success: true,
            cards: vec![
                CardInfo::new(0x0B00, vec![0x000000, 0x000001]),
                CardInfo::new(0x1830, vec![]),
            ],
        };
        assert_eq!(server_roundtrip(&msg), msg);
    }

    #[test]
    fn test_invalid_magic() {
        let bad_frame = b"BADPxxxx\x00\x00";
        let result = decode_header(bad_frame);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_incomplete_header() {
        let partial = b"CWCP\x00";
        let result = decode_header(partial).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        frame.extend_from_slice(&0x0101u16.to_le_bytes());
        assert!(matches!(
            decode_header(&frame),
            Err(ProtocolError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn test_truncated_ecm_request() {
        let payload = Bytes::from_static(&[1, 0, 0, 0, 0, 0]);
        let result = decode_client_message(MessageType::EcmRequest, payload);
        assert!(matches!(result, Err(ProtocolError::IncompleteFrame { .. })));
    }
}
