//! PSI section assembly and PMT parsing.
//!
//! A service's PMT lists its elementary streams with their stream types
//! and descriptors. CA descriptors in it name the ECM PIDs that carry the
//! keys for the service.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PsiError {
    #[error("section of {0} bytes is too short")]
    TooShort(usize),

    #[error("table id 0x{0:02X} is not a PMT")]
    NotPmt(u8),

    #[error("section length {0} does not fit")]
    SectionLength(usize),

    #[error("program info length {0} overruns the section")]
    ProgramInfoLength(usize),
}

/// Table IDs.
pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const CAT: u8 = 0x01;
    pub const PMT: u8 = 0x02;
    /// ECM, even parity.
    pub const ECM_EVEN: u8 = 0x80;
    /// ECM, odd parity.
    pub const ECM_ODD: u8 = 0x81;
}

/// Descriptor tags.
pub mod descriptor_tag {
    pub const CA: u8 = 0x09;
    pub const ISO_639_LANGUAGE: u8 = 0x0A;
    pub const TELETEXT: u8 = 0x56;
    pub const SUBTITLING: u8 = 0x59;
    pub const AC3: u8 = 0x6A;
    pub const EAC3: u8 = 0x7A;
    pub const AAC: u8 = 0x7C;
}

/// Collects PSI sections spread over several TS packets on one PID.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    data: Vec<u8>,
    continuity_counter: Option<u8>,
    /// When set, sections without the syntax indicator (ECMs) are accepted
    /// and CRC is not checked.
    raw: bool,
    crc_errors: u64,
}

impl SectionAssembler {
    /// Assembler for long-form tables (PMT): CRC checked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembler for private sections such as ECMs: no CRC.
    pub fn raw() -> Self {
        Self {
            raw: true,
            ..Self::default()
        }
    }

    /// Feed one packet payload. Returns every section completed by it.
    pub fn push(&mut self, payload: &[u8], start: bool, cc: u8) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();

        if start {
            // Pointer field
            if payload.is_empty() {
                return sections;
            }
            let pointer = payload[0] as usize;
            if pointer + 1 > payload.len() {
                return sections;
            }
            // Bytes before the pointer target finish the previous section.
            if self.continuity_ok(cc) && !self.data.is_empty() {
                self.data.extend_from_slice(&payload[1..1 + pointer]);
                self.drain_complete(&mut sections);
            }
            self.data.clear();
            self.data.extend_from_slice(&payload[1 + pointer..]);
        } else {
            if self.data.is_empty() {
                return sections;
            }
            if !self.continuity_ok(cc) {
                // Discontinuity, reset
                self.data.clear();
                self.continuity_counter = None;
                return sections;
            }
            self.data.extend_from_slice(payload);
        }
        self.continuity_counter = Some(cc);

        self.drain_complete(&mut sections);
        sections
    }

    fn continuity_ok(&self, cc: u8) -> bool {
        match self.continuity_counter {
            Some(prev) => cc == (prev + 1) & 0x0F,
            None => true,
        }
    }

    fn drain_complete(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            // 0xFF table id marks stuffing to the end of the packet.
            if self.data.first().map_or(true, |&b| b == 0xFF) {
                self.data.clear();
                return;
            }
            if self.data.len() < 3 {
                return;
            }
            let section_length = ((self.data[1] as usize & 0x0F) << 8) | self.data[2] as usize;
            let total_length = 3 + section_length;
            if self.data.len() < total_length {
                return; // Need more data
            }
            let section: Vec<u8> = self.data.drain(..total_length).collect();
            let syntax = section[1] & 0x80 != 0;
            if !self.raw && syntax && crc32_mpeg(&section) != 0 {
                self.crc_errors += 1;
                continue;
            }
            out.push(section);
        }
    }

    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.continuity_counter = None;
    }
}

/// MPEG-2 CRC-32 (poly 0x04C11DB7, no reflection). Running it over a
/// section including its trailing CRC yields zero.
pub fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Conditional access descriptor (tag 0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaDescriptor {
    pub caid: u16,
    /// PID carrying the ECMs.
    pub pid: u16,
}

/// Subtitling descriptor entry (tag 0x59).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitlingInfo {
    pub lang: String,
    pub subtitling_type: u8,
    pub composition_id: u16,
    pub ancillary_id: u16,
}

/// Teletext descriptor entry (tag 0x56).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeletextInfo {
    pub lang: String,
    pub teletext_type: u8,
    pub magazine: u8,
    pub page: u8,
}

/// Iterate `(tag, body)` pairs of a descriptor loop.
pub fn descriptors(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset + 2 > data.len() {
            return None;
        }
        let tag = data[offset];
        let length = data[offset + 1] as usize;
        if offset + 2 + length > data.len() {
            return None;
        }
        let body = &data[offset + 2..offset + 2 + length];
        offset += 2 + length;
        Some((tag, body))
    })
}

fn lang_code(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(3)
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Extract all CA descriptors of a loop.
pub fn ca_descriptors(data: &[u8]) -> Vec<CaDescriptor> {
    descriptors(data)
        .filter(|(tag, body)| *tag == descriptor_tag::CA && body.len() >= 4)
        .map(|(_, body)| CaDescriptor {
            caid: ((body[0] as u16) << 8) | body[1] as u16,
            pid: ((body[2] as u16 & 0x1F) << 8) | body[3] as u16,
        })
        .collect()
}

/// First ISO-639 language and its audio type.
pub fn language(data: &[u8]) -> Option<(String, u8)> {
    descriptors(data)
        .find(|(tag, body)| *tag == descriptor_tag::ISO_639_LANGUAGE && body.len() >= 4)
        .map(|(_, body)| (lang_code(&body[0..3]), body[3]))
}

pub fn subtitling(data: &[u8]) -> Option<SubtitlingInfo> {
    descriptors(data)
        .find(|(tag, body)| *tag == descriptor_tag::SUBTITLING && body.len() >= 8)
        .map(|(_, body)| SubtitlingInfo {
            lang: lang_code(&body[0..3]),
            subtitling_type: body[3],
            composition_id: ((body[4] as u16) << 8) | body[5] as u16,
            ancillary_id: ((body[6] as u16) << 8) | body[7] as u16,
        })
}

pub fn teletext(data: &[u8]) -> Option<TeletextInfo> {
    descriptors(data)
        .find(|(tag, body)| *tag == descriptor_tag::TELETEXT && body.len() >= 5)
        .map(|(_, body)| TeletextInfo {
            lang: lang_code(&body[0..3]),
            teletext_type: body[3] >> 3,
            magazine: body[3] & 0x07,
            page: body[4],
        })
}

pub fn has_descriptor(data: &[u8], wanted: u8) -> bool {
    descriptors(data).any(|(tag, _)| tag == wanted)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    /// Raw ES_info descriptor loop.
    pub descriptors: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmtTable {
    /// The service id.
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    /// Raw program_info descriptor loop; CA descriptors here apply to
    /// every stream.
    pub program_info: Vec<u8>,
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    /// Parse a PMT from a complete section (header and CRC included).
    pub fn parse(section: &[u8]) -> Result<Self, PsiError> {
        if section.len() < 16 {
            return Err(PsiError::TooShort(section.len()));
        }
        if section[0] != table_id::PMT {
            return Err(PsiError::NotPmt(section[0]));
        }
        let section_length = ((section[1] as usize & 0x0F) << 8) | section[2] as usize;
        if 3 + section_length > section.len() || section_length < 13 {
            return Err(PsiError::SectionLength(section_length));
        }

        let program_number = ((section[3] as u16) << 8) | section[4] as u16;
        let version_number = (section[5] >> 1) & 0x1F;
        // Elementary loop ends before the CRC.
        let data = &section[8..3 + section_length - 4];

        let pid13 = |hi: u8, lo: u8| (((hi & 0x1F) as u16) << 8) | lo as u16;
        let len12 = |hi: u8, lo: u8| (((hi & 0x0F) as usize) << 8) | lo as usize;

        let info_len = len12(data[2], data[3]);
        let Some(program_info) = data.get(4..4 + info_len) else {
            return Err(PsiError::ProgramInfoLength(info_len));
        };

        let mut streams = Vec::new();
        let mut rest = &data[4 + info_len..];
        while let [stream_type, p_hi, p_lo, l_hi, l_lo, tail @ ..] = rest {
            let es_info_len = len12(*l_hi, *l_lo);
            // A truncated entry ends the loop; what came before is kept.
            let Some(descriptors) = tail.get(..es_info_len) else {
                break;
            };
            streams.push(PmtStream {
                stream_type: *stream_type,
                elementary_pid: pid13(*p_hi, *p_lo),
                descriptors: descriptors.to_vec(),
            });
            rest = &tail[es_info_len..];
        }

        Ok(PmtTable {
            program_number,
            version_number,
            pcr_pid: pid13(data[0], data[1]),
            program_info: program_info.to_vec(),
            streams,
        })
    }

    /// Serialise into a section with a valid CRC.
    pub fn to_section(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0xE0 | ((self.pcr_pid >> 8) as u8 & 0x1F));
        body.push(self.pcr_pid as u8);
        body.push(0xF0 | ((self.program_info.len() >> 8) as u8 & 0x0F));
        body.push(self.program_info.len() as u8);
        body.extend_from_slice(&self.program_info);
        for s in &self.streams {
            body.push(s.stream_type);
            body.push(0xE0 | ((s.elementary_pid >> 8) as u8 & 0x1F));
            body.push(s.elementary_pid as u8);
            body.push(0xF0 | ((s.descriptors.len() >> 8) as u8 & 0x0F));
            body.push(s.descriptors.len() as u8);
            body.extend_from_slice(&s.descriptors);
        }

        let section_length = 5 + body.len() + 4;
        let mut section = vec![
            table_id::PMT,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
            (self.program_number >> 8) as u8,
            self.program_number as u8,
            0xC1 | ((self.version_number & 0x1F) << 1),
            0x00,
            0x00,
        ];
        section.extend_from_slice(&body);
        let crc = crc32_mpeg(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pmt() -> PmtTable {
        PmtTable {
            program_number: 0x0101,
            version_number: 3,
            pcr_pid: 0x0100,
            program_info: vec![descriptor_tag::CA, 4, 0x0B, 0x00, 0xE1, 0xFF],
            streams: vec![
                PmtStream {
                    stream_type: 0x02,
                    elementary_pid: 0x0100,
                    descriptors: vec![],
                },
                PmtStream {
                    stream_type: 0x04,
                    elementary_pid: 0x0110,
                    descriptors: vec![descriptor_tag::ISO_639_LANGUAGE, 4, b'e', b'n', b'g', 0],
                },
            ],
        }
    }

    #[test]
    fn test_parse_pmt() {
        let section = sample_pmt().to_section();
        assert_eq!(crc32_mpeg(&section), 0);

        let pmt = PmtTable::parse(&section).unwrap();
        assert_eq!(pmt, sample_pmt());
        assert_eq!(
            ca_descriptors(&pmt.program_info),
            vec![CaDescriptor {
                caid: 0x0B00,
                pid: 0x01FF
            }]
        );
        assert_eq!(
            language(&pmt.streams[1].descriptors),
            Some(("eng".to_string(), 0))
        );
    }

    #[test]
    fn test_section_spanning_packets() {
        let section = sample_pmt().to_section();
        let (first, rest) = section.split_at(20);

        let mut asm = SectionAssembler::new();
        let mut p1 = vec![0u8];
        p1.extend_from_slice(first);
        assert!(asm.push(&p1, true, 4).is_empty());

        let mut p2 = rest.to_vec();
        p2.extend_from_slice(&[0xFF; 10]);
        let out = asm.push(&p2, false, 5);
        assert_eq!(out, vec![section]);
    }

    #[test]
    fn test_section_discontinuity_drops_partial() {
        let section = sample_pmt().to_section();
        let (first, rest) = section.split_at(20);

        let mut asm = SectionAssembler::new();
        let mut p1 = vec![0u8];
        p1.extend_from_slice(first);
        asm.push(&p1, true, 4);
        assert!(asm.push(rest, false, 7).is_empty());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut section = sample_pmt().to_section();
        let last = section.len() - 1;
        section[last] ^= 0x01;

        let mut asm = SectionAssembler::new();
        let mut p = vec![0u8];
        p.extend_from_slice(&section);
        assert!(asm.push(&p, true, 0).is_empty());
        assert_eq!(asm.crc_errors(), 1);
    }

    #[test]
    fn test_subtitling_descriptor() {
        let desc = [descriptor_tag::SUBTITLING, 8, b'F', b'I', b'N', 0x10, 0x00, 0x02, 0x00, 0x03];
        let info = subtitling(&desc).unwrap();
        assert_eq!(info.lang, "fin");
        assert_eq!(info.composition_id, 2);
        assert_eq!(info.ancillary_id, 3);
    }
}
