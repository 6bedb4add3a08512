//! Streaming status bitmask.
//!
//! The low half tracks how far input has progressed; the high half holds
//! sticky error bits that only a restart clears.

use serde::{Deserialize, Serialize};

/// Streaming status of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamingStatus(u32);

impl StreamingStatus {
    // Progress
    /// The feed delivered bytes.
    pub const INPUT_HARDWARE: u32 = 0x1;
    /// Packets for this service's PIDs arrived.
    pub const INPUT_SERVICE: u32 = 0x2;
    /// Well-formed TS packets arrived.
    pub const MUX_PACKETS: u32 = 0x4;
    /// Decoded packets reached the pad.
    pub const PACKETS: u32 = 0x8;

    pub const GRACEPERIOD: u32 = 0x8000;

    // Errors
    pub const NO_DESCRAMBLER: u32 = 0x10000;
    pub const NO_ACCESS: u32 = 0x20000;
    /// No input before the receive timeout.
    pub const TIMEOUT: u32 = 0x40000;

    pub const ERRORS: u32 = 0xffff_0000;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn intersects(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    /// Set `bits`. Returns true if any of them was not set before.
    pub fn raise(&mut self, bits: u32) -> bool {
        let changed = self.0 & bits != bits;
        self.0 |= bits;
        changed
    }

    pub fn clear(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub fn is_error(self) -> bool {
        is_error(self.0)
    }

    pub fn text(self) -> &'static str {
        streaming_status_text(self.0)
    }

    pub fn error_code(self) -> StatusCode {
        status_to_error_code(self.0)
    }
}

impl std::fmt::Display for StreamingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:05x})", self.text(), self.0)
    }
}

/// Whether any error bit is set.
pub fn is_error(flags: u32) -> bool {
    flags & StreamingStatus::ERRORS != 0
}

/// Human-readable text for the most significant condition in `flags`.
pub fn streaming_status_text(flags: u32) -> &'static str {
    if flags & StreamingStatus::NO_ACCESS != 0 {
        return "No access";
    }
    if flags & StreamingStatus::NO_DESCRAMBLER != 0 {
        return "No descrambler";
    }
    if flags & StreamingStatus::TIMEOUT != 0 {
        return "Data timeout";
    }
    if flags & StreamingStatus::PACKETS != 0 {
        return "Got valid packets";
    }
    if flags & StreamingStatus::MUX_PACKETS != 0 {
        return "Got multiplexed packets but could not decode further";
    }
    if flags & StreamingStatus::INPUT_SERVICE != 0 {
        return "Got packets for this service but could not decode further";
    }
    if flags & StreamingStatus::INPUT_HARDWARE != 0 {
        return "Sensed input from hardware but nothing for the service";
    }
    if flags & StreamingStatus::GRACEPERIOD != 0 {
        return "No input detected";
    }
    "No status"
}

/// Result code reported to subscribers for a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    NoDescrambler,
    NoAccess,
    NoInput,
}

pub fn status_to_error_code(flags: u32) -> StatusCode {
    if flags & StreamingStatus::NO_ACCESS != 0 {
        StatusCode::NoAccess
    } else if flags & StreamingStatus::NO_DESCRAMBLER != 0 {
        StatusCode::NoDescrambler
    } else if flags & (StreamingStatus::TIMEOUT | StreamingStatus::GRACEPERIOD) != 0
        && flags & StreamingStatus::PACKETS == 0
    {
        StatusCode::NoInput
    } else {
        StatusCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_reports_new_bits_only() {
        let mut s = StreamingStatus::default();
        assert!(s.raise(StreamingStatus::INPUT_HARDWARE));
        assert!(!s.raise(StreamingStatus::INPUT_HARDWARE));
        assert!(s.raise(StreamingStatus::INPUT_HARDWARE | StreamingStatus::PACKETS));
        assert!(!s.is_error());
        assert!(s.raise(StreamingStatus::NO_ACCESS));
        assert!(s.is_error());
    }

    #[test]
    fn test_text_priority() {
        let flags = StreamingStatus::PACKETS | StreamingStatus::NO_DESCRAMBLER;
        assert_eq!(streaming_status_text(flags), "No descrambler");
        assert_eq!(streaming_status_text(StreamingStatus::PACKETS), "Got valid packets");
        assert_eq!(streaming_status_text(0), "No status");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(status_to_error_code(StreamingStatus::TIMEOUT), StatusCode::NoInput);
        assert_eq!(
            status_to_error_code(StreamingStatus::NO_ACCESS | StreamingStatus::NO_DESCRAMBLER),
            StatusCode::NoAccess
        );
        assert_eq!(status_to_error_code(StreamingStatus::PACKETS), StatusCode::Ok);
    }
}
