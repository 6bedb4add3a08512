//! Data-plane input: transport stream bytes from a feed into a service.
//!
//! Runs on the feed's delivery thread with the service's stream lock held
//! for the duration of one chunk. Never takes the registry lock; anything
//! that needs the control plane goes through the deferred queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use serde::Serialize;

use super::{Service, ServiceStream, StreamingStatus};
use crate::es::parser::mpeg2_sequence_header;
use crate::es::{CaId, PcrSample, PesPacket, StreamType};
use crate::pad::{EsPacket, StreamingMessage};
use crate::stats::LogLimiter;
use crate::ts::psi::{self, PmtTable, SectionAssembler};
use crate::ts::{self, AdaptationField, TsHeader, TsResync, TS_PACKET_SIZE};

/// Per-service input counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub bytes: u64,
    pub packets: u64,
    pub tei_errors: u64,
    pub cc_errors: u64,
    pub pcr_errors: u64,
    pub scrambled_dropped: u64,
    pub pes_delivered: u64,
}

/// Demux state that is not tied to one elementary stream.
#[derive(Debug)]
pub(crate) struct InputState {
    resync: TsResync,
    pmt: SectionAssembler,
    tei_limiter: LogLimiter,
    pcr_limiter: LogLimiter,
    scrambled_limiter: LogLimiter,
}

impl Default for InputState {
    fn default() -> Self {
        Self {
            resync: TsResync::new(),
            pmt: SectionAssembler::new(),
            tei_limiter: LogLimiter::default(),
            pcr_limiter: LogLimiter::default(),
            scrambled_limiter: LogLimiter::new(Duration::from_secs(30)),
        }
    }
}

impl InputState {
    pub(crate) fn reset(&mut self) {
        self.resync.reset();
        self.pmt.reset();
    }
}

/// A CA system appearing on or vanishing from an ECM PID.
type CaUpdate = (u16, u16, bool);

impl Service {
    /// Feed transport stream bytes. Chunks need not be packet aligned.
    pub fn input(&self, data: &[u8]) {
        let mut guard = self.stream();
        let st = &mut *guard;
        if !st.running {
            return;
        }
        st.stats.bytes += data.len() as u64;
        st.rate.add(data.len() as u64);
        let mut raise = StreamingStatus::INPUT_HARDWARE;

        let mut aligned = st.input.resync.push(data);
        let now = Instant::now();
        for packet in aligned.chunks_exact_mut(TS_PACKET_SIZE) {
            raise |= self.input_packet(st, packet, now);
        }
        self.raise_status(st, raise);
    }

    /// Process one packet. Returns the status bits it earned.
    fn input_packet(&self, st: &mut ServiceStream, packet: &mut [u8], now: Instant) -> u32 {
        let Some(header) = TsHeader::parse(packet) else {
            return 0;
        };
        st.stats.packets += 1;
        let mut raise = StreamingStatus::MUX_PACKETS;

        if header.transport_error {
            st.stats.tei_errors += 1;
            if let Some(suppressed) = st.input.tei_limiter.allow_at(now) {
                warn!(
                    "[Input] {}: transport error on PID {} ({} more suppressed)",
                    st.nicename, header.pid, suppressed
                );
            }
            return raise;
        }

        if st.pmt_pid != 0 && header.pid == st.pmt_pid {
            raise |= StreamingStatus::INPUT_SERVICE;
            if let Some(payload) = ts::payload(packet) {
                let sections =
                    st.input
                        .pmt
                        .push(payload, header.payload_start, header.continuity_counter);
                for section in sections {
                    self.handle_pmt_section(st, &section);
                }
            }
            if st.pad.has_passthrough() {
                st.pad.deliver_mpegts(Bytes::copy_from_slice(packet));
            }
            return raise;
        }

        if st.es.find(header.pid).is_none() {
            return raise;
        }
        raise |= StreamingStatus::INPUT_SERVICE;

        let af = if header.has_adaptation() {
            AdaptationField::parse(packet).unwrap_or_default()
        } else {
            AdaptationField::default()
        };
        let offset = ts::payload_offset(packet, &header);
        let pcr_pid = st.pcr_pid;

        let mut ecms: Vec<(CaId, Vec<u8>)> = Vec::new();
        let mut pes_out: Vec<PesPacket> = Vec::new();

        let Some(es) = st.es.find_mut(header.pid) else {
            return raise;
        };

        if !es
            .continuity
            .check(header.continuity_counter, header.has_payload(), af.discontinuity)
        {
            st.stats.cc_errors += 1;
            if let Some(suppressed) = es.cc_limiter.allow_at(now) {
                warn!(
                    "[Input] {}: continuity error ({} more suppressed)",
                    es.nicename, suppressed
                );
            }
        }

        if header.pid == pcr_pid {
            if let Some(pcr) = af.pcr {
                if es.pcr.sample(now, pcr) == PcrSample::TimingError {
                    st.stats.pcr_errors += 1;
                    if let Some(suppressed) = st.input.pcr_limiter.allow_at(now) {
                        warn!(
                            "[Input] {}: PCR timing error, drift {} ({} more suppressed)",
                            es.nicename,
                            es.pcr.drift(),
                            suppressed
                        );
                    }
                }
            }
        }

        let Some(offset) = offset else {
            return raise;
        };

        if es.stream_type == StreamType::Ca {
            let sections = es.sections.push(
                &packet[offset..],
                header.payload_start,
                header.continuity_counter,
            );
            for section in sections {
                if matches!(
                    section.first(),
                    Some(&psi::table_id::ECM_EVEN) | Some(&psi::table_id::ECM_ODD)
                ) {
                    for ca in &es.caids {
                        ecms.push((*ca, section.clone()));
                    }
                }
            }
        } else {
            if header.is_scrambled() {
                let descrambled = match st.descramble.as_mut() {
                    Some(runtime) => runtime.descramble(packet, &es.caids).is_ok(),
                    None => {
                        raise |= StreamingStatus::NO_DESCRAMBLER;
                        false
                    }
                };
                if !descrambled {
                    st.scrambled_seen += 1;
                    st.stats.scrambled_dropped += 1;
                    if let Some(suppressed) = st.input.scrambled_limiter.allow_at(now) {
                        debug!(
                            "[Input] {}: dropping scrambled packets ({} more suppressed)",
                            es.nicename, suppressed
                        );
                    }
                    return raise;
                }
            }

            es.rate.add_at(now, TS_PACKET_SIZE as u64);
            if st.pad.has_passthrough() {
                st.pad.deliver_mpegts(Bytes::copy_from_slice(packet));
                raise |= StreamingStatus::PACKETS;
            }
            es.pes
                .push(&packet[offset..], header.payload_start, &mut pes_out);

            for pes in &pes_out {
                if es.stream_type == StreamType::Mpeg2Video {
                    if let Some(seq) = mpeg2_sequence_header(pes.payload()) {
                        es.width = seq.width;
                        es.height = seq.height;
                        es.frame_duration = seq.frame_duration;
                    }
                }
                if pes.header.pts.is_some() {
                    es.last_pts = pes.header.pts;
                }
                if pes.header.dts.is_some() {
                    es.last_dts = pes.header.dts;
                }
            }
        }

        let stream_type = es.stream_type;
        for pes in pes_out {
            if let Some(pts) = pes.header.pts {
                st.pts_cursor = Some(pts);
            }
            st.pad.deliver(StreamingMessage::Packet(Arc::new(EsPacket {
                pid: header.pid,
                stream_type,
                pts: pes.header.pts,
                dts: pes.header.dts,
                data: pes.data,
            })));
            st.stats.pes_delivered += 1;
            raise |= StreamingStatus::PACKETS;
        }

        if !ecms.is_empty() {
            if let Some(ca) = self.ca_client() {
                let handle = self.ca_handle(st);
                for (ca_id, section) in ecms {
                    ca.ecm_input(&handle, ca_id.caid, ca_id.pid, &section);
                }
            }
        }
        raise
    }

    fn handle_pmt_section(&self, st: &mut ServiceStream, section: &[u8]) {
        let pmt = match PmtTable::parse(section) {
            Ok(pmt) => pmt,
            Err(e) => {
                debug!("[Input] {}: bad PMT: {}", st.nicename, e);
                return;
            }
        };
        if st.sid != 0 && pmt.program_number != st.sid {
            return;
        }
        if st.pmt_version == Some(pmt.version_number) {
            return;
        }
        st.pmt_version = Some(pmt.version_number);

        let mut updates = Vec::new();
        let changed = apply_pmt(st, &pmt, &mut updates);

        if let Some(ca) = self.ca_client() {
            let handle = self.ca_handle(st);
            for &(caid, pid, valid) in &updates {
                if !valid {
                    if let Some(runtime) = st.descramble.as_mut() {
                        runtime.clear_pid(pid);
                    }
                }
                ca.caid_update(&handle, caid, pid, valid);
            }
        }

        if changed {
            info!(
                "[Input] {}: PMT version {} with {} streams",
                st.nicename,
                pmt.version_number,
                st.es.len()
            );
            self.request_save(st, false);
            let start = st.stream_start();
            st.pad.deliver(StreamingMessage::Start(Arc::new(start)));
        }
    }
}

fn ca_set(st: &ServiceStream) -> BTreeSet<(u16, u16)> {
    st.es
        .iter()
        .filter(|s| s.stream_type == StreamType::Ca)
        .flat_map(|s| s.caids.iter().map(|c| (c.caid, c.pid)))
        .collect()
}

/// Bring the stream table in line with a PMT. Returns true when anything
/// visible to subscribers changed; CA systems that appeared or vanished are
/// appended to `updates`.
fn apply_pmt(st: &mut ServiceStream, pmt: &PmtTable, updates: &mut Vec<CaUpdate>) -> bool {
    let mut changed = false;
    if st.pcr_pid != pmt.pcr_pid {
        st.pcr_pid = pmt.pcr_pid;
        changed = true;
    }
    let before = ca_set(st);

    for es in st.es.iter_mut() {
        es.delete_me = true;
    }

    let program_ca: Vec<CaId> = psi::ca_descriptors(&pmt.program_info)
        .into_iter()
        .map(|d| CaId { caid: d.caid, pid: d.pid })
        .collect();
    let mut ecm_pids: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
    for ca in &program_ca {
        ecm_pids.entry(ca.pid).or_default().push(ca.caid);
    }

    for s in &pmt.streams {
        let stream_type = StreamType::from_pmt(s.stream_type, &s.descriptors);
        let mut caids = program_ca.clone();
        for d in psi::ca_descriptors(&s.descriptors) {
            let ca = CaId { caid: d.caid, pid: d.pid };
            if !caids.contains(&ca) {
                caids.push(ca);
            }
            ecm_pids.entry(d.pid).or_default().push(d.caid);
        }

        let (lang, audio_type, composition_id, ancillary_id) =
            if let Some(sub) = psi::subtitling(&s.descriptors) {
                (Some(sub.lang), 0, sub.composition_id, sub.ancillary_id)
            } else if let Some(ttx) = psi::teletext(&s.descriptors) {
                (Some(ttx.lang), 0, 0, 0)
            } else if let Some((lang, audio_type)) = psi::language(&s.descriptors) {
                (Some(lang), audio_type, 0, 0)
            } else {
                (None, 0, 0, 0)
            };

        let es = st.es.create(s.elementary_pid, stream_type);
        if !es.delete_me && es.nicename.is_empty() {
            changed = true;
        }
        es.delete_me = false;
        if es.stream_type != stream_type
            || es.lang != lang
            || es.audio_type != audio_type
            || es.composition_id != composition_id
            || es.ancillary_id != ancillary_id
            || es.caids != caids
        {
            es.stream_type = stream_type;
            es.lang = lang;
            es.audio_type = audio_type;
            es.composition_id = composition_id;
            es.ancillary_id = ancillary_id;
            es.caids = caids;
            changed = true;
        }
        es.make_nicename(&st.nicename);
    }

    for (pid, mut caids) in ecm_pids {
        caids.sort_unstable();
        caids.dedup();
        let caids: Vec<CaId> = caids.into_iter().map(|caid| CaId { caid, pid }).collect();
        let es = st.es.create(pid, StreamType::Ca);
        if !es.delete_me && es.nicename.is_empty() {
            changed = true;
        }
        es.delete_me = false;
        if es.stream_type != StreamType::Ca || es.caids != caids {
            es.stream_type = StreamType::Ca;
            es.caids = caids;
            changed = true;
        }
        es.make_nicename(&st.nicename);
    }

    if !st.es.sweep_deleted().is_empty() {
        changed = true;
    }
    st.es.sort();
    let filter = st.filter.clone();
    st.es.build_filter(&filter);

    let after = ca_set(st);
    updates.extend(before.difference(&after).map(|&(caid, pid)| (caid, pid, false)));
    updates.extend(after.difference(&before).map(|&(caid, pid)| (caid, pid, true)));
    changed
}
