//! PES reassembly and the bits of codec parsing the demux needs.

use bytes::{Bytes, BytesMut};

/// PES packets larger than this are discarded as corrupt.
const MAX_PES_SIZE: usize = 4 * 1024 * 1024;

/// Timestamps decoded from a PES header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Offset of the elementary stream data within the PES packet.
    pub payload_offset: usize,
}

impl PesHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
            return None;
        }
        let stream_id = data[3];
        let header_len = data[8] as usize;
        let payload_offset = 9 + header_len;
        if payload_offset > data.len() {
            return None;
        }
        let flags = data[7] >> 6;
        let pts = if flags & 0x02 != 0 && data.len() >= 14 {
            Some(parse_timestamp(&data[9..14]))
        } else {
            None
        };
        let dts = if flags == 0x03 && data.len() >= 19 {
            Some(parse_timestamp(&data[14..19]))
        } else {
            pts
        };
        Some(Self {
            stream_id,
            pts,
            dts,
            payload_offset,
        })
    }
}

fn parse_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64) >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64) >> 1) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64) >> 1
}

/// Encode a 33-bit timestamp with the given 4-bit prefix.
pub fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 15) as u8) << 1) | 1,
        (ts >> 7) as u8,
        ((ts as u8) << 1) | 1,
    ]
}

/// A reassembled PES packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesPacket {
    pub header: PesHeader,
    /// Whole PES packet including its header.
    pub data: Bytes,
}

impl PesPacket {
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header.payload_offset.min(self.data.len())..]
    }
}

/// Collects TS payloads into PES packets.
///
/// A payload-unit-start flushes whatever was buffered. Packets announcing
/// their length are emitted as soon as they are complete.
#[derive(Debug, Default)]
pub struct PesAssembler {
    buf: BytesMut,
    expected: Option<usize>,
    started: bool,
    errors: u64,
}

impl PesAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one TS payload; completed packets are appended to `out`.
    pub fn push(&mut self, payload: &[u8], start: bool, out: &mut Vec<PesPacket>) {
        if start {
            if self.started && !self.buf.is_empty() {
                out.extend(self.finish());
            }
            self.buf.clear();
            self.started = true;
            self.expected = None;
            if payload.len() >= 6 {
                let len = ((payload[4] as usize) << 8) | payload[5] as usize;
                if len != 0 {
                    self.expected = Some(6 + len);
                }
            }
        } else if !self.started {
            // Mid-packet join: wait for the next start.
            return;
        }

        self.buf.extend_from_slice(payload);
        if self.buf.len() > MAX_PES_SIZE {
            self.errors += 1;
            self.reset();
            return;
        }

        if let Some(expected) = self.expected {
            if self.buf.len() >= expected {
                self.buf.truncate(expected);
                out.extend(self.finish());
                self.started = false;
            }
        }
    }

    fn finish(&mut self) -> Option<PesPacket> {
        let data = self.buf.split().freeze();
        match PesHeader::parse(&data) {
            Some(header) => Some(PesPacket { header, data }),
            None => {
                self.errors += 1;
                None
            }
        }
    }

    /// Malformed or oversized packets dropped so far.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
        self.started = false;
    }
}

/// Picture parameters from an MPEG-2 sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub width: u16,
    pub height: u16,
    /// Frame duration in 90 kHz ticks.
    pub frame_duration: u32,
}

/// Find and decode the first MPEG-2 sequence header (00 00 01 B3) in `es`.
pub fn mpeg2_sequence_header(es: &[u8]) -> Option<SequenceHeader> {
    let pos = es.windows(4).position(|w| w == [0x00, 0x00, 0x01, 0xB3])?;
    let h = es.get(pos + 4..pos + 8)?;
    let width = ((h[0] as u16) << 4) | (h[1] as u16 >> 4);
    let height = ((h[1] as u16 & 0x0F) << 8) | h[2] as u16;
    let frame_duration = match h[3] & 0x0F {
        1 => 3754, // 23.976
        2 => 3750, // 24
        3 => 3600, // 25
        4 => 3003, // 29.97
        5 => 3000, // 30
        6 => 1800, // 50
        7 => 1502, // 59.94
        8 => 1500, // 60
        _ => return None,
    };
    Some(SequenceHeader {
        width,
        height,
        frame_duration,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::encode_timestamp;

    /// Minimal PES packet with a PTS and the given payload. When `bounded`
    /// the PES length field is filled in.
    pub fn pes(stream_id: u8, pts: u64, payload: &[u8], bounded: bool) -> Vec<u8> {
        let mut p = vec![0x00, 0x00, 0x01, stream_id, 0, 0, 0x80, 0x80, 5];
        p.extend_from_slice(&encode_timestamp(0x2, pts));
        p.extend_from_slice(payload);
        if bounded {
            let len = p.len() - 6;
            p[4] = (len >> 8) as u8;
            p[5] = len as u8;
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::pes;
    use super::*;

    #[test]
    fn test_pes_header_pts() {
        let data = pes(0xE0, 0x1_0000_0001, b"abc", true);
        let header = PesHeader::parse(&data).unwrap();
        assert_eq!(header.stream_id, 0xE0);
        assert_eq!(header.pts, Some(0x1_0000_0001));
        assert_eq!(header.dts, header.pts);
        assert_eq!(&data[header.payload_offset..], b"abc");
    }

    #[test]
    fn test_unbounded_pes_flushed_by_next_start() {
        let first = pes(0xE0, 900, &[1; 300], false);
        let second = pes(0xE0, 4500, &[2; 10], false);

        let mut asm = PesAssembler::new();
        let mut out = Vec::new();
        asm.push(&first[..184], true, &mut out);
        asm.push(&first[184..], false, &mut out);
        assert!(out.is_empty());

        asm.push(&second, true, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header.pts, Some(900));
        assert_eq!(out[0].payload(), &[1; 300][..]);
    }

    #[test]
    fn test_bounded_pes_emitted_when_complete() {
        let packet = pes(0xC0, 1234, &[7; 200], true);
        let mut asm = PesAssembler::new();
        let mut out = Vec::new();
        asm.push(&packet[..184], true, &mut out);
        assert!(out.is_empty());
        asm.push(&packet[184..], false, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.len(), packet.len());
        assert_eq!(out[0].header.pts, Some(1234));
    }

    #[test]
    fn test_flush_and_short_packet_in_one_payload() {
        let long = pes(0xC0, 100, &[3; 300], false);
        let short = pes(0xC0, 200, &[4; 20], true);
        let mut asm = PesAssembler::new();
        let mut out = Vec::new();
        asm.push(&long[..184], true, &mut out);
        asm.push(&long[184..], false, &mut out);
        asm.push(&short, true, &mut out);
        let pts: Vec<_> = out.iter().map(|p| p.header.pts).collect();
        assert_eq!(pts, vec![Some(100), Some(200)]);
    }

    #[test]
    fn test_mid_packet_join_is_ignored() {
        let mut asm = PesAssembler::new();
        let mut out = Vec::new();
        asm.push(&[0x55; 184], false, &mut out);
        assert!(out.is_empty());
        assert_eq!(asm.errors(), 0);
    }

    #[test]
    fn test_sequence_header() {
        // 1920x1080, 25 fps
        let es = [0x00, 0x00, 0x01, 0xB3, 0x78, 0x04, 0x38, 0x33, 0xFF];
        let seq = mpeg2_sequence_header(&es).unwrap();
        assert_eq!(seq.width, 1920);
        assert_eq!(seq.height, 1080);
        assert_eq!(seq.frame_duration, 3600);
    }
}
