//! Elementary streams of a service.
//!
//! Each service owns an [`EsTable`] mapping PIDs to per-stream demux state:
//! continuity and PCR tracking, PES reassembly, CA ids and the codec
//! parameters learned from the stream itself.

pub mod integrity;
pub mod parser;
pub mod table;

pub use integrity::{ContinuityTracker, PcrSample, PcrTracker};
pub use parser::{PesAssembler, PesHeader, PesPacket};
pub use table::{EsTable, FilterConfig};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stats::{AvgStat, LogLimiter};
use crate::ts::psi::{self, descriptor_tag, SectionAssembler};

/// Elementary stream kinds the demux distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamType {
    Mpeg2Video,
    H264,
    Hevc,
    Mpeg2Audio,
    Ac3,
    Eac3,
    Aac,
    DvbSub,
    Teletext,
    /// ECM carrier.
    Ca,
    Other,
}

impl StreamType {
    /// Classify a PMT entry.
    pub fn from_pmt(stream_type: u8, descriptors: &[u8]) -> Self {
        match stream_type {
            0x01 | 0x02 => StreamType::Mpeg2Video,
            0x1B => StreamType::H264,
            0x24 => StreamType::Hevc,
            0x03 | 0x04 => StreamType::Mpeg2Audio,
            0x0F | 0x11 => StreamType::Aac,
            0x81 => StreamType::Ac3,
            0x06 => {
                if psi::has_descriptor(descriptors, descriptor_tag::AC3) {
                    StreamType::Ac3
                } else if psi::has_descriptor(descriptors, descriptor_tag::EAC3) {
                    StreamType::Eac3
                } else if psi::has_descriptor(descriptors, descriptor_tag::AAC) {
                    StreamType::Aac
                } else if psi::has_descriptor(descriptors, descriptor_tag::SUBTITLING) {
                    StreamType::DvbSub
                } else if psi::has_descriptor(descriptors, descriptor_tag::TELETEXT) {
                    StreamType::Teletext
                } else {
                    StreamType::Other
                }
            }
            _ => StreamType::Other,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, StreamType::Mpeg2Video | StreamType::H264 | StreamType::Hevc)
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            StreamType::Mpeg2Audio | StreamType::Ac3 | StreamType::Eac3 | StreamType::Aac
        )
    }

    pub fn is_subtitle(self) -> bool {
        matches!(self, StreamType::DvbSub)
    }

    /// Presentation group used by sorting: video, audio, subtitles,
    /// teletext, everything else.
    pub fn sort_rank(self) -> u8 {
        if self.is_video() {
            0
        } else if self.is_audio() {
            1
        } else if self.is_subtitle() {
            2
        } else if self == StreamType::Teletext {
            3
        } else {
            4
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamType::Mpeg2Video => "MPEG2VIDEO",
            StreamType::H264 => "H264",
            StreamType::Hevc => "HEVC",
            StreamType::Mpeg2Audio => "MPEG2AUDIO",
            StreamType::Ac3 => "AC3",
            StreamType::Eac3 => "EAC3",
            StreamType::Aac => "AAC",
            StreamType::DvbSub => "DVBSUB",
            StreamType::Teletext => "TELETEXT",
            StreamType::Ca => "CA",
            StreamType::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A conditional access system referenced by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaId {
    pub caid: u16,
    /// ECM PID.
    pub pid: u16,
}

/// Persistable description of a stream, as carried in stream-start
/// messages and service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub pid: u16,
    pub stream_type: StreamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default)]
    pub audio_type: u8,
    #[serde(default)]
    pub composition_id: u16,
    #[serde(default)]
    pub ancillary_id: u16,
    #[serde(default)]
    pub parent_pid: u16,
    #[serde(default)]
    pub position: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caids: Vec<CaId>,
    #[serde(default)]
    pub width: u16,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub frame_duration: u32,
}

/// One demuxed component of a service.
#[derive(Debug)]
pub struct ElementaryStream {
    pub pid: u16,
    pub stream_type: StreamType,
    pub lang: Option<String>,
    pub audio_type: u8,
    pub composition_id: u16,
    pub ancillary_id: u16,
    /// For teletext subtitles, the teletext PID they are carried on.
    pub parent_pid: u16,
    /// Creation order; kept stable across sorts.
    pub position: u32,
    pub caids: Vec<CaId>,
    pub width: u16,
    pub height: u16,
    pub frame_duration: u32,
    /// Set while a PMT update is being applied; streams still flagged
    /// afterwards are gone from the PMT.
    pub delete_me: bool,
    pub nicename: String,

    pub continuity: ContinuityTracker,
    pub pcr: PcrTracker,
    pub pes: PesAssembler,
    /// ECM section assembly, used by CA streams only.
    pub sections: SectionAssembler,
    pub rate: AvgStat,
    pub cc_limiter: LogLimiter,
    pub last_pts: Option<u64>,
    pub last_dts: Option<u64>,
}

impl ElementaryStream {
    pub fn new(pid: u16, stream_type: StreamType, position: u32) -> Self {
        Self {
            pid,
            stream_type,
            lang: None,
            audio_type: 0,
            composition_id: 0,
            ancillary_id: 0,
            parent_pid: 0,
            position,
            caids: Vec::new(),
            width: 0,
            height: 0,
            frame_duration: 0,
            delete_me: false,
            nicename: String::new(),
            continuity: ContinuityTracker::new(),
            pcr: PcrTracker::new(),
            pes: PesAssembler::new(),
            sections: SectionAssembler::raw(),
            rate: AvgStat::new(Duration::from_secs(10)),
            cc_limiter: LogLimiter::default(),
            last_pts: None,
            last_dts: None,
        }
    }

    /// Build "<service>: <type> @ #<pid>".
    pub fn make_nicename(&mut self, service: &str) {
        self.nicename = format!("{}: {} @ #{}", service, self.stream_type, self.pid);
    }

    pub fn component(&self) -> Component {
        Component {
            pid: self.pid,
            stream_type: self.stream_type,
            lang: self.lang.clone(),
            audio_type: self.audio_type,
            composition_id: self.composition_id,
            ancillary_id: self.ancillary_id,
            parent_pid: self.parent_pid,
            position: self.position,
            caids: self.caids.clone(),
            width: self.width,
            height: self.height,
            frame_duration: self.frame_duration,
        }
    }

    /// Restore the descriptive fields from a saved component.
    pub fn apply_component(&mut self, c: &Component) {
        self.stream_type = c.stream_type;
        self.lang = c.lang.clone();
        self.audio_type = c.audio_type;
        self.composition_id = c.composition_id;
        self.ancillary_id = c.ancillary_id;
        self.parent_pid = c.parent_pid;
        self.caids = c.caids.clone();
        self.width = c.width;
        self.height = c.height;
        self.frame_duration = c.frame_duration;
    }

    /// Drop reassembly and integrity state, e.g. after a restart.
    pub fn reset_demux(&mut self) {
        self.continuity.reset();
        self.pcr.reset();
        self.pes.reset();
        self.sections.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_private_data() {
        let ac3 = [descriptor_tag::AC3, 0];
        assert_eq!(StreamType::from_pmt(0x06, &ac3), StreamType::Ac3);
        let sub = [descriptor_tag::SUBTITLING, 8, b'e', b'n', b'g', 0x10, 0, 1, 0, 1];
        assert_eq!(StreamType::from_pmt(0x06, &sub), StreamType::DvbSub);
        assert_eq!(StreamType::from_pmt(0x06, &[]), StreamType::Other);
        assert_eq!(StreamType::from_pmt(0x1B, &[]), StreamType::H264);
    }

    #[test]
    fn test_component_nicename() {
        let mut es = ElementaryStream::new(0x101, StreamType::Aac, 0);
        es.make_nicename("NHK/General");
        assert_eq!(es.nicename, "NHK/General: AAC @ #257");
    }
}
