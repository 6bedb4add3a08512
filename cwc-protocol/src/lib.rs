//! Wire protocol between the CWC client and a card server.
//!
//! The card server resolves ECM sections into control words. A client
//! holds one long-lived TCP connection per server, logs in, then streams
//! ECM requests and receives control words or rejections tagged with the
//! request sequence number.
//!
//! # Frame Format
//!
//! ```text
//! +--------+--------+--------+------------------+
//! | Magic  | Length | Type   |     Payload      |
//! | "CWCP" | u32 LE | u16 LE |    (variable)    |
//! +--------+--------+--------+------------------+
//! | 4 bytes| 4 bytes| 2 bytes|  Length bytes    |
//! ```
//!
//! # Example
//!
//! ```rust
//! use cwc_protocol::{ClientMessage, MuxId, encode_client_message, decode_header, decode_client_message, HEADER_SIZE};
//! use bytes::Bytes;
//!
//! let msg = ClientMessage::EcmRequest {
//!     seq: 1,
//!     mux: MuxId::from_onid_tsid(0x0001, 0x0401),
//!     caid: 0x0B00,
//!     pid: 0x0200,
//!     ecm: vec![0x80, 0x70, 0x00],
//! };
//! let encoded = encode_client_message(&msg).unwrap();
//!
//! let header = decode_header(&encoded).unwrap().unwrap();
//! let payload = Bytes::copy_from_slice(&encoded[HEADER_SIZE..]);
//! let decoded = decode_client_message(header.message_type, payload).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode_client_message, decode_header, decode_server_message, encode_client_message,
    encode_server_message, FrameHeader, HEADER_SIZE,
};
pub use error::{ClientError, ProtocolError, RejectCode};
pub use types::{
    CardInfo, ClientMessage, MessageType, MuxId, ServerMessage, CW_LEN_AES, CW_LEN_CSA, MAGIC,
    MAX_ECM_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
