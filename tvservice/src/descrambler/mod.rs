//! Descrambling: the CA client seam and the per-service key runtime.
//!
//! A [`CaClient`] receives service lifecycle notifications and ECM sections
//! from the data plane, and hands control words back through a
//! [`CaService`] handle. The handle takes the service's stream lock, so a
//! client must never call into it while holding its own lock.

pub mod cissa;
pub mod connection;
pub mod cwc;

pub use cissa::Cissa;
pub use cwc::{CwcClient, CwcConfig, CwcError, CwcServerConfig, CwcStatus, EcmKey};

use std::collections::HashMap;
use std::sync::Weak;

use cwc_protocol::MuxId;
use log::{debug, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::es::CaId;
use crate::service::{Service, StreamingStatus};
use crate::ts::{self, scrambling, TsHeader};

#[derive(Debug, Error)]
pub enum DescrambleError {
    #[error("no control word available")]
    NoKey,

    #[error("unsupported control word length {0}")]
    KeyLength(usize),

    #[error("cipher error")]
    Cipher,
}

/// Control word parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Even,
    Odd,
}

/// Interface between the service layer and a conditional access client.
pub trait CaClient: Send + Sync {
    /// A service started with the given CA systems.
    fn service_start(&self, service: &CaService, ca: &[CaId]);

    /// A service stopped; drop every request it holds.
    fn service_stop(&self, service: &CaService);

    /// A CA system appeared (`valid`) or disappeared on an ECM PID.
    fn caid_update(&self, service: &CaService, caid: u16, pid: u16, valid: bool);

    /// An ECM section arrived.
    fn ecm_input(&self, service: &CaService, caid: u16, pid: u16, section: &[u8]);
}

/// A service as seen by a CA client.
#[derive(Debug, Clone)]
pub struct CaService {
    pub uuid: Uuid,
    pub mux: MuxId,
    pub nicename: String,
    service: Weak<Service>,
}

impl CaService {
    pub(crate) fn new(uuid: Uuid, mux: MuxId, nicename: String, service: Weak<Service>) -> Self {
        Self {
            uuid,
            mux,
            nicename,
            service,
        }
    }

    /// A handle not bound to any service. Keys and status raised through it
    /// are discarded.
    pub fn detached(uuid: Uuid, mux: MuxId, nicename: impl Into<String>) -> Self {
        Self::new(uuid, mux, nicename.into(), Weak::new())
    }

    pub fn is_alive(&self) -> bool {
        self.service.strong_count() > 0
    }

    /// Install control words for `ecm_pid`. Returns false when nothing was
    /// installed.
    pub fn deliver_key(&self, ecm_pid: u16, even: Option<&[u8]>, odd: Option<&[u8]>) -> bool {
        let Some(service) = self.service.upgrade() else {
            return false;
        };
        let mut st = service.stream();
        if !st.running {
            return false;
        }
        let Some(runtime) = st.descramble.as_mut() else {
            return false;
        };

        let mut result = Ok(());
        for (parity, key) in [(Parity::Even, even), (Parity::Odd, odd)] {
            if let Some(key) = key {
                if let Err(e) = runtime.set_key(ecm_pid, parity, key) {
                    result = Err(e);
                }
            }
        }
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("[Descrambler] {}: {}", st.nicename, e);
                service.raise_status(&mut st, StreamingStatus::NO_DESCRAMBLER);
                false
            }
        }
    }

    /// Raise status bits on the service.
    pub fn raise_status(&self, bits: u32) {
        if let Some(service) = self.service.upgrade() {
            let mut st = service.stream();
            service.raise_status(&mut st, bits);
        }
    }
}

#[derive(Debug, Default)]
struct KeySlots {
    even: Option<Cissa>,
    odd: Option<Cissa>,
}

impl KeySlots {
    fn get(&self, parity: Parity) -> Option<&Cissa> {
        match parity {
            Parity::Even => self.even.as_ref(),
            Parity::Odd => self.odd.as_ref(),
        }
    }
}

/// Per-service descrambler state: current keys per ECM PID.
#[derive(Debug, Default)]
pub struct DescramblerRuntime {
    keys: HashMap<u16, KeySlots>,
    descrambled: u64,
    dropped: u64,
    key_updates: u64,
}

impl DescramblerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_key(&mut self, ecm_pid: u16, parity: Parity, key: &[u8]) -> Result<(), DescrambleError> {
        let cissa = Cissa::new(key)?;
        let slots = self.keys.entry(ecm_pid).or_default();
        match parity {
            Parity::Even => slots.even = Some(cissa),
            Parity::Odd => slots.odd = Some(cissa),
        }
        self.key_updates += 1;
        debug!("[Descrambler] new {:?} key for ECM PID {}", parity, ecm_pid);
        Ok(())
    }

    /// Forget the keys for an ECM PID.
    pub fn clear_pid(&mut self, ecm_pid: u16) {
        self.keys.remove(&ecm_pid);
    }

    pub fn has_key(&self, ecm_pid: u16) -> bool {
        self.keys
            .get(&ecm_pid)
            .map(|s| s.even.is_some() || s.odd.is_some())
            .unwrap_or(false)
    }

    fn key_for(&self, caids: &[CaId], parity: Parity) -> Option<&Cissa> {
        if caids.is_empty() && self.keys.len() == 1 {
            return self.keys.values().next().and_then(|s| s.get(parity));
        }
        caids
            .iter()
            .find_map(|c| self.keys.get(&c.pid).and_then(|s| s.get(parity)))
    }

    /// Descramble one packet in place and mark it clear.
    ///
    /// `caids` are the CA systems of the packet's elementary stream; their
    /// ECM PIDs select the key. Packets without a matching key are left
    /// untouched and counted as dropped.
    pub fn descramble(&mut self, packet: &mut [u8], caids: &[CaId]) -> Result<(), DescrambleError> {
        let Some(header) = TsHeader::parse(packet) else {
            return Ok(());
        };
        let parity = match header.scrambling {
            scrambling::EVEN => Parity::Even,
            scrambling::ODD => Parity::Odd,
            _ => return Ok(()),
        };
        let Some(cissa) = self.key_for(caids, parity).cloned() else {
            self.dropped += 1;
            return Err(DescrambleError::NoKey);
        };
        if let Some(offset) = ts::payload_offset(packet, &header) {
            cissa.decrypt(&mut packet[offset..])?;
        }
        ts::set_scrambling(packet, scrambling::CLEAR);
        self.descrambled += 1;
        Ok(())
    }

    pub fn descrambled(&self) -> u64 {
        self.descrambled
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn key_updates(&self) -> u64 {
        self.key_updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::testutil;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn scrambled(pid: u16, parity: u8, clear: &[u8]) -> Vec<u8> {
        let mut p = testutil::packet(pid, false, 0, clear);
        let header = TsHeader::parse(&p).unwrap();
        let off = ts::payload_offset(&p, &header).unwrap();
        Cissa::new(&KEY).unwrap().encrypt(&mut p[off..]).unwrap();
        ts::set_scrambling(&mut p, parity);
        p
    }

    #[test]
    fn test_descramble_with_matching_parity() {
        let clear = [0x5Au8; 184];
        let caids = [CaId { caid: 0x4AE1, pid: 0x1FF }];
        let mut rt = DescramblerRuntime::new();
        rt.set_key(0x1FF, Parity::Odd, &KEY).unwrap();

        let mut p = scrambled(0x100, scrambling::ODD, &clear);
        rt.descramble(&mut p, &caids).unwrap();
        assert_eq!(TsHeader::parse(&p).unwrap().scrambling, scrambling::CLEAR);
        assert_eq!(&p[4..], &clear[..]);

        // Even slot is still empty.
        let mut p = scrambled(0x100, scrambling::EVEN, &clear);
        assert!(matches!(rt.descramble(&mut p, &caids), Err(DescrambleError::NoKey)));
        assert_eq!(rt.dropped(), 1);
        assert_eq!(rt.descrambled(), 1);
    }

    #[test]
    fn test_clear_pid_forgets_keys() {
        let mut rt = DescramblerRuntime::new();
        rt.set_key(0x1FF, Parity::Even, &KEY).unwrap();
        assert!(rt.has_key(0x1FF));
        rt.clear_pid(0x1FF);
        assert!(!rt.has_key(0x1FF));
    }

    #[test]
    fn test_detached_handle_discards_keys() {
        let handle = CaService::detached(Uuid::new_v4(), MuxId(1), "detached");
        assert!(!handle.is_alive());
        assert!(!handle.deliver_key(0x1FF, Some(&KEY), None));
        handle.raise_status(StreamingStatus::NO_ACCESS);
    }
}
