//! Shared helpers for the integration tests: transport stream builders and
//! polling.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use tvservice::es::parser::encode_timestamp;
use tvservice::ts::psi::{PmtStream, PmtTable};
use tvservice::ts::{SYNC_BYTE, TS_PACKET_SIZE};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A TS packet carrying `payload`, padded through the adaptation field.
pub fn ts_packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
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

/// A section in a single packet, behind a zero pointer field.
pub fn section_packet(pid: u16, cc: u8, section: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8];
    payload.extend_from_slice(section);
    ts_packet(pid, true, cc, &payload)
}

/// CA descriptor for (CAID, ECM PID).
pub fn ca_descriptor(caid: u16, ecm_pid: u16) -> Vec<u8> {
    vec![
        0x09,
        4,
        (caid >> 8) as u8,
        caid as u8,
        0xE0 | ((ecm_pid >> 8) as u8 & 0x1F),
        ecm_pid as u8,
    ]
}

/// ISO 639 language descriptor.
pub fn language_descriptor(lang: &str) -> Vec<u8> {
    let mut d = vec![0x0A, 4];
    d.extend_from_slice(lang.as_bytes());
    d.push(0);
    d
}

pub struct PmtBuilder {
    pmt: PmtTable,
}

impl PmtBuilder {
    pub fn new(sid: u16, version: u8, pcr_pid: u16) -> Self {
        Self {
            pmt: PmtTable {
                program_number: sid,
                version_number: version,
                pcr_pid,
                program_info: Vec::new(),
                streams: Vec::new(),
            },
        }
    }

    pub fn program_ca(mut self, caid: u16, ecm_pid: u16) -> Self {
        self.pmt.program_info.extend(ca_descriptor(caid, ecm_pid));
        self
    }

    pub fn stream(mut self, stream_type: u8, pid: u16, descriptors: Vec<u8>) -> Self {
        self.pmt.streams.push(PmtStream {
            stream_type,
            elementary_pid: pid,
            descriptors,
        });
        self
    }

    pub fn packet(&self, pmt_pid: u16, cc: u8) -> Vec<u8> {
        section_packet(pmt_pid, cc, &self.pmt.to_section())
    }
}

/// ECM section with the given table id.
pub fn ecm_section(table_id: u8, body: &[u8]) -> Vec<u8> {
    let mut s = vec![table_id, 0x70 | ((body.len() >> 8) as u8 & 0x0F), body.len() as u8];
    s.extend_from_slice(body);
    s
}

/// PES header with a PTS, followed by `payload`. Unbounded length.
pub fn pes(stream_id: u8, pts: u64, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x00, 0x00, 0x01, stream_id, 0, 0, 0x80, 0x80, 5];
    p.extend_from_slice(&encode_timestamp(0x2, pts));
    p.extend_from_slice(payload);
    p
}

/// Poll `f` until it returns true or `timeout` passes.
pub fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}
