//! Error types for the CWC card-server protocol.

use thiserror::Error;

/// Malformed or unexpected data on the card-server link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad frame magic {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unknown CWC message type 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Declared payload length above `MAX_FRAME_SIZE`.
    #[error("frame payload of {0} bytes exceeds limit of {1}")]
    FrameTooLarge(u32, u32),

    #[error("truncated payload: need {expected} bytes, have {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Control word neither CSA (8) nor AES (16) sized.
    #[error("control word of {0} bytes")]
    InvalidControlWord(usize),

    #[error("bad payload: {0}")]
    DecodeError(String),

    #[error("cannot encode: {0}")]
    EncodeError(String),

    #[error("card server speaks version {server}, we speak {client}")]
    VersionMismatch { client: u16, server: u16 },
}

/// Why a card-server session ended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("connect/io: {0}")]
    ConnectionFailed(String),

    #[error("closed by peer")]
    ConnectionClosed,

    #[error("login rejected by {0}")]
    LoginRejected(String),

    /// Nothing received for three keepalive intervals.
    #[error("keepalive timeout")]
    KeepaliveTimeout,

    /// Connect or login took longer than the connect timeout.
    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reason code carried by [`ServerMessage::EcmReject`](crate::ServerMessage::EcmReject).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RejectCode {
    /// Unknown failure.
    Unknown = 0x0001,
    /// The card holds no entitlement for this service.
    NotEntitled = 0x0002,
    /// No card for this CAID on the server.
    UnknownCaid = 0x0003,
    /// The card failed to process the ECM.
    CardError = 0x0004,
    /// The server is overloaded, retry later.
    Busy = 0x0005,
}

impl From<u16> for RejectCode {
    fn from(value: u16) -> Self {
        match value {
            0x0002 => RejectCode::NotEntitled,
            0x0003 => RejectCode::UnknownCaid,
            0x0004 => RejectCode::CardError,
            0x0005 => RejectCode::Busy,
            _ => RejectCode::Unknown,
        }
    }
}

impl From<RejectCode> for u16 {
    fn from(value: RejectCode) -> Self {
        value as u16
    }
}

impl RejectCode {
    /// Returns true if the rejection is final for this ECM (retrying the
    /// same server will not help).
    pub fn is_denial(self) -> bool {
        matches!(self, RejectCode::NotEntitled | RejectCode::UnknownCaid)
    }
}
