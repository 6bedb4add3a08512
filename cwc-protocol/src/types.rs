//! Message type definitions for the CWC card-server protocol.

use serde::{Deserialize, Serialize};

/// Protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Magic bytes for frame header: "CWCP" (Control Word Client Protocol).
pub const MAGIC: [u8; 4] = *b"CWCP";

/// Maximum frame payload size (64 KB). ECM sections are at most 4 KB, so
/// anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Maximum ECM section length accepted in a request.
pub const MAX_ECM_SIZE: usize = 4096;

/// Control word lengths accepted on the wire.
/// 8 bytes for CSA-style keys, 16 bytes for AES (CISSA) keys.
pub const CW_LEN_CSA: usize = 8;
pub const CW_LEN_AES: usize = 16;

/// Opaque multiplex identity.
///
/// The card server treats it as a routing tag; the client derives it from
/// the original network id and transport stream id of the mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MuxId(pub u32);

impl MuxId {
    /// Build a mux id from (original network id, transport stream id).
    pub fn from_onid_tsid(onid: u16, tsid: u16) -> Self {
        MuxId(((onid as u32) << 16) | tsid as u32)
    }

    pub fn onid(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn tsid(self) -> u16 {
        self.0 as u16
    }
}

impl std::fmt::Display for MuxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.onid(), self.tsid())
    }
}

/// A card announced by the server at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    /// Conditional access system id.
    pub caid: u16,
    /// Provider ids served by this card.
    pub providers: Vec<u32>,
}

impl CardInfo {
    pub fn new(caid: u16, providers: Vec<u32>) -> Self {
        Self { caid, providers }
    }
}

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    // Session (0x00xx)
    /// Client login with credentials.
    Login = 0x0001,
    /// Server login response with card list.
    LoginAck = 0x0002,

    // ECM resolution (0x01xx)
    /// ECM resolution request.
    EcmRequest = 0x0100,
    /// Control word reply.
    ControlWord = 0x0101,
    /// ECM rejected by the card.
    EcmReject = 0x0102,

    // Misc (0xFFxx)
    /// Keep-alive ping.
    Keepalive = 0xFF01,
    /// Keep-alive reply.
    KeepaliveAck = 0xFF02,
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0x0001 => Ok(MessageType::Login),
            0x0002 => Ok(MessageType::LoginAck),
            0x0100 => Ok(MessageType::EcmRequest),
            0x0101 => Ok(MessageType::ControlWord),
            0x0102 => Ok(MessageType::EcmReject),
            0xFF01 => Ok(MessageType::Keepalive),
            0xFF02 => Ok(MessageType::KeepaliveAck),
            _ => Err(value),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value as u16
    }
}

/// Messages sent from the client (us) to the card server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Open a session.
    Login {
        version: u16,
        username: String,
        password: String,
    },
    /// Resolve one ECM section.
    EcmRequest {
        /// Client-chosen sequence number echoed in the reply.
        seq: u32,
        mux: MuxId,
        caid: u16,
        pid: u16,
        /// Raw ECM section (table id 0x80/0x81 included).
        ecm: Vec<u8>,
    },
    /// Liveness check.
    Keepalive,
}

/// Messages sent from the card server to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Login response.
    LoginAck {
        version: u16,
        success: bool,
        cards: Vec<CardInfo>,
    },
    /// Control words resolved from an ECM. Either half may be absent when
    /// the card only refreshed one parity.
    ControlWord {
        seq: u32,
        even: Option<Vec<u8>>,
        odd: Option<Vec<u8>>,
    },
    /// The card refused the ECM.
    EcmReject { seq: u32, code: u16 },
    /// Keep-alive reply.
    KeepaliveAck,
}

impl ClientMessage {
    /// Returns the message type for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Login { .. } => MessageType::Login,
            ClientMessage::EcmRequest { .. } => MessageType::EcmRequest,
            ClientMessage::Keepalive => MessageType::Keepalive,
        }
    }
}

impl ServerMessage {
    /// Returns the message type for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::LoginAck { .. } => MessageType::LoginAck,
            ServerMessage::ControlWord { .. } => MessageType::ControlWord,
            ServerMessage::EcmReject { .. } => MessageType::EcmReject,
            ServerMessage::KeepaliveAck => MessageType::KeepaliveAck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::try_from(0x0100), Ok(MessageType::EcmRequest));
        assert_eq!(MessageType::try_from(0x1234), Err(0x1234));
        assert_eq!(u16::from(MessageType::KeepaliveAck), 0xFF02);
    }

    #[test]
    fn test_mux_id_parts() {
        let mux = MuxId::from_onid_tsid(0x0001, 0x044D);
        assert_eq!(mux.onid(), 0x0001);
        assert_eq!(mux.tsid(), 0x044D);
        assert_eq!(mux.to_string(), "0001:044D");
    }
}
