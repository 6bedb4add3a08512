//! MPEG-TS packet layer.
//!
//! Header and adaptation field parsing, PCR extraction and resynchronisation
//! of an arbitrary byte stream onto 188-byte packet boundaries.

pub mod psi;

use bytes::BytesMut;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// Well-known PIDs.
pub mod pid {
    /// PAT.
    pub const PAT: u16 = 0x0000;
    /// CAT; carries EMM pointers.
    pub const CAT: u16 = 0x0001;
    /// Stuffing.
    pub const NULL: u16 = 0x1FFF;
}

/// Transport scrambling control values.
pub mod scrambling {
    pub const CLEAR: u8 = 0b00;
    pub const EVEN: u8 = 0b10;
    pub const ODD: u8 = 0b11;
}

/// Parsed 4-byte TS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Set by the demodulator on uncorrectable errors.
    pub transport_error: bool,
    /// A PES header or section pointer starts in this packet.
    pub payload_start: bool,
    pub pid: u16,
    /// Raw `transport_scrambling_control`; see [`scrambling`].
    pub scrambling: u8,
    /// `adaptation_field_control`: 1 payload, 2 adaptation, 3 both.
    pub adaptation_field: u8,
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the header of a TS packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 4 || packet[0] != SYNC_BYTE {
            return None;
        }
        Some(Self {
            transport_error: (packet[1] & 0x80) != 0,
            payload_start: (packet[1] & 0x40) != 0,
            pid: ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16,
            scrambling: (packet[3] >> 6) & 0x03,
            adaptation_field: (packet[3] >> 4) & 0x03,
            continuity_counter: packet[3] & 0x0F,
        })
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field & 0x01 != 0
    }

    pub fn has_adaptation(&self) -> bool {
        self.adaptation_field & 0x02 != 0
    }

    pub fn is_scrambled(&self) -> bool {
        self.scrambling & 0x02 != 0
    }
}

/// The parts of the adaptation field the data plane cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptationField {
    pub discontinuity: bool,
    pub random_access: bool,
    /// PCR base in 90 kHz units (33 bits).
    pub pcr: Option<u64>,
}

impl AdaptationField {
    /// Parse the adaptation field of a packet whose header says it has one.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 6 {
            return None;
        }
        let length = packet[4] as usize;
        if length == 0 {
            return Some(Self::default());
        }
        if 5 + length > packet.len() {
            return None;
        }
        let flags = packet[5];
        let mut field = Self {
            discontinuity: flags & 0x80 != 0,
            random_access: flags & 0x40 != 0,
            pcr: None,
        };
        if flags & 0x10 != 0 && length >= 7 {
            let p = &packet[6..12];
            let base = ((p[0] as u64) << 25)
                | ((p[1] as u64) << 17)
                | ((p[2] as u64) << 9)
                | ((p[3] as u64) << 1)
                | ((p[4] as u64) >> 7);
            field.pcr = Some(base);
        }
        Some(field)
    }
}

/// Return the payload of a packet, if any.
pub fn payload(packet: &[u8]) -> Option<&[u8]> {
    let header = TsHeader::parse(packet)?;
    payload_offset(packet, &header).map(|off| &packet[off..])
}

/// Offset of the payload within a packet.
pub fn payload_offset(packet: &[u8], header: &TsHeader) -> Option<usize> {
    let offset = match header.adaptation_field {
        1 => 4,
        3 => {
            if packet.len() < 5 {
                return None;
            }
            5 + packet[4] as usize
        }
        _ => return None,
    };
    if offset >= packet.len() {
        return None;
    }
    Some(offset)
}

/// Overwrite the scrambling control bits of a packet.
pub fn set_scrambling(packet: &mut [u8], value: u8) {
    if packet.len() >= 4 {
        packet[3] = (packet[3] & 0x3F) | ((value & 0x03) << 6);
    }
}

/// Re-aligns an arbitrary byte stream onto packet boundaries.
///
/// Bytes that do not belong to a whole packet are carried over to the next
/// call. Garbage between packets is skipped by hunting for a sync byte that
/// is followed by another one a packet later.
#[derive(Debug, Default)]
pub struct TsResync {
    pending: BytesMut,
    skipped: u64,
}

impl TsResync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every complete packet, concatenated.
    pub fn push(&mut self, data: &[u8]) -> BytesMut {
        self.pending.extend_from_slice(data);

        let mut out = BytesMut::with_capacity(self.pending.len());
        let mut offset = 0;
        let buf = &self.pending[..];

        while offset + TS_PACKET_SIZE <= buf.len() {
            if buf[offset] != SYNC_BYTE {
                offset += 1;
                self.skipped += 1;
                continue;
            }
            // Confirm alignment with the next packet when it is available.
            let next = offset + TS_PACKET_SIZE;
            if next < buf.len() && buf[next] != SYNC_BYTE {
                offset += 1;
                self.skipped += 1;
                continue;
            }
            out.extend_from_slice(&buf[offset..next]);
            offset = next;
        }

        let _ = self.pending.split_to(offset);
        out
    }

    /// Bytes thrown away while hunting for sync.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a packet with the given header fields and payload (padded with
    /// stuffing in the adaptation field when the payload is short).
    pub fn packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= TS_PACKET_SIZE - 4);
        let mut p = vec![0u8; TS_PACKET_SIZE];
        p[0] = SYNC_BYTE;
        p[1] = ((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0 };
        p[2] = pid as u8;
        let space = TS_PACKET_SIZE - 4;
        if payload.len() == space {
            p[3] = 0x10 | (cc & 0x0F);
            p[4..].copy_from_slice(payload);
        } else {
            p[3] = 0x30 | (cc & 0x0F);
            let af_len = space - payload.len() - 1;
            p[4] = af_len as u8;
            if af_len > 0 {
                p[5] = 0x00;
                for b in &mut p[6..5 + af_len] {
                    *b = 0xFF;
                }
            }
            p[5 + af_len..].copy_from_slice(payload);
        }
        p
    }

    /// Build an adaptation-only packet carrying a PCR.
    pub fn pcr_packet(pid: u16, cc: u8, pcr_base: u64) -> Vec<u8> {
        let mut p = vec![0xFFu8; TS_PACKET_SIZE];
        p[0] = SYNC_BYTE;
        p[1] = (pid >> 8) as u8 & 0x1F;
        p[2] = pid as u8;
        p[3] = 0x20 | (cc & 0x0F);
        p[4] = 183;
        p[5] = 0x10;
        p[6] = (pcr_base >> 25) as u8;
        p[7] = (pcr_base >> 17) as u8;
        p[8] = (pcr_base >> 9) as u8;
        p[9] = (pcr_base >> 1) as u8;
        p[10] = ((pcr_base & 1) << 7) as u8 | 0x7E;
        p[11] = 0;
        p
    }
}
