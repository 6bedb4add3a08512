//! PID-indexed elementary stream table with a single-entry lookup cache.
//!
//! The table lives inside the service's stream-locked state; every access
//! goes through `&mut self`, so the cache needs no synchronisation of its
//! own.

use std::collections::HashSet;

use super::{ElementaryStream, StreamType};

/// Language preferences applied by [`EsTable::build_filter`].
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Preferred subtitle/teletext languages. Empty keeps all of them.
    pub languages: Vec<String>,
}

/// Ordered set of elementary streams, unique by PID.
#[derive(Debug)]
pub struct EsTable {
    streams: Vec<ElementaryStream>,
    /// PIDs of the filtered view, in table order.
    filtered: Vec<u16>,
    /// (pid, index) of the last successful lookup.
    last: Option<(u16, usize)>,
    cache_enabled: bool,
    cache_hits: u64,
    next_position: u32,
}

impl Default for EsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EsTable {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            filtered: Vec::new(),
            last: None,
            cache_enabled: true,
            cache_hits: 0,
            next_position: 0,
        }
    }

    /// Table with the lookup cache switched off.
    pub fn without_cache() -> Self {
        Self {
            cache_enabled: false,
            ..Self::new()
        }
    }

    fn index_of(&mut self, pid: u16) -> Option<usize> {
        if let Some((last_pid, idx)) = self.last {
            if last_pid == pid {
                self.cache_hits += 1;
                return Some(idx);
            }
        }
        let idx = self.streams.iter().position(|s| s.pid == pid)?;
        if self.cache_enabled {
            self.last = Some((pid, idx));
        }
        Some(idx)
    }

    pub fn find(&mut self, pid: u16) -> Option<&ElementaryStream> {
        let idx = self.index_of(pid)?;
        self.streams.get(idx)
    }

    pub fn find_mut(&mut self, pid: u16) -> Option<&mut ElementaryStream> {
        let idx = self.index_of(pid)?;
        self.streams.get_mut(idx)
    }

    /// Create a stream for `pid`, or return the existing one untouched.
    pub fn create(&mut self, pid: u16, stream_type: StreamType) -> &mut ElementaryStream {
        self.last = None;
        let idx = match self.streams.iter().position(|s| s.pid == pid) {
            Some(idx) => idx,
            None => {
                let position = self.next_position;
                self.next_position += 1;
                self.streams
                    .push(ElementaryStream::new(pid, stream_type, position));
                self.streams.len() - 1
            }
        };
        &mut self.streams[idx]
    }

    /// Remove the stream for `pid`.
    pub fn destroy(&mut self, pid: u16) -> Option<ElementaryStream> {
        self.last = None;
        let idx = self.streams.iter().position(|s| s.pid == pid)?;
        self.filtered.retain(|&p| p != pid);
        Some(self.streams.remove(idx))
    }

    /// Remove every stream still flagged for deletion and return them.
    pub fn sweep_deleted(&mut self) -> Vec<ElementaryStream> {
        let pids: Vec<u16> = self
            .streams
            .iter()
            .filter(|s| s.delete_me)
            .map(|s| s.pid)
            .collect();
        pids.into_iter().filter_map(|pid| self.destroy(pid)).collect()
    }

    /// Order video, audio, subtitles, teletext, other; PID breaks ties.
    pub fn sort(&mut self) {
        self.last = None;
        self.streams
            .sort_by_key(|s| (s.stream_type.sort_rank(), s.pid));
        let order: Vec<u16> = self.streams.iter().map(|s| s.pid).collect();
        self.filtered
            .sort_by_key(|pid| order.iter().position(|p| p == pid));
    }

    /// Recompute the filtered view.
    ///
    /// Dropped: CA carriers, streams pending deletion, audio tracks that
    /// duplicate an earlier one's language and audio type, and
    /// subtitle/teletext streams outside the preferred languages.
    pub fn build_filter(&mut self, config: &FilterConfig) {
        let mut seen_audio: HashSet<(Option<String>, u8)> = HashSet::new();
        let mut filtered = Vec::with_capacity(self.streams.len());

        for s in &self.streams {
            if s.delete_me || s.stream_type == StreamType::Ca {
                continue;
            }
            if s.stream_type.is_audio() && !seen_audio.insert((s.lang.clone(), s.audio_type)) {
                continue;
            }
            let is_text = s.stream_type.is_subtitle() || s.stream_type == StreamType::Teletext;
            if is_text && !config.languages.is_empty() {
                let wanted = s
                    .lang
                    .as_deref()
                    .map(|l| config.languages.iter().any(|c| c.eq_ignore_ascii_case(l)))
                    .unwrap_or(false);
                if !wanted {
                    continue;
                }
            }
            filtered.push(s.pid);
        }
        self.filtered = filtered;
    }

    pub fn is_filtered(&self, pid: u16) -> bool {
        self.filtered.contains(&pid)
    }

    pub fn filtered(&self) -> impl Iterator<Item = &ElementaryStream> {
        self.streams
            .iter()
            .filter(move |s| self.filtered.contains(&s.pid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementaryStream> {
        self.streams.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ElementaryStream> {
        self.last = None;
        self.streams.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.filtered.clear();
        self.last = None;
        self.next_position = 0;
    }

    /// Lookups answered from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated(table: &mut EsTable) {
        table.create(0x100, StreamType::H264);
        table.create(0x110, StreamType::Aac).lang = Some("jpn".into());
        table.create(0x111, StreamType::Aac).lang = Some("jpn".into());
        table.create(0x112, StreamType::Aac).lang = Some("eng".into());
        table.create(0x130, StreamType::DvbSub).lang = Some("eng".into());
        table.create(0x131, StreamType::DvbSub).lang = Some("fin".into());
        table.create(0x1FF, StreamType::Ca);
    }

    #[test]
    fn test_find_same_with_and_without_cache() {
        let mut cached = EsTable::new();
        let mut uncached = EsTable::without_cache();
        populated(&mut cached);
        populated(&mut uncached);

        let lookups = [0x110, 0x110, 0x100, 0x999, 0x100, 0x1FF, 0x1FF, 0x131];
        for pid in lookups {
            let a = cached.find(pid).map(|s| (s.pid, s.stream_type, s.position));
            let b = uncached.find(pid).map(|s| (s.pid, s.stream_type, s.position));
            assert_eq!(a, b, "pid {:#x}", pid);
        }
        assert_eq!(cached.cache_hits(), 3);
        assert_eq!(uncached.cache_hits(), 0);
    }

    #[test]
    fn test_cache_cleared_by_destroy_and_create() {
        let mut table = EsTable::new();
        populated(&mut table);

        assert!(table.find(0x111).is_some());
        table.destroy(0x111);
        assert!(table.find(0x111).is_none());

        // Index of 0x112 moved; a stale cache would return the wrong entry.
        assert_eq!(table.find(0x112).unwrap().pid, 0x112);
        table.create(0x105, StreamType::Mpeg2Audio);
        table.sort();
        assert_eq!(table.find(0x112).unwrap().pid, 0x112);
        assert_eq!(table.find(0x105).unwrap().pid, 0x105);
    }

    #[test]
    fn test_create_returns_existing() {
        let mut table = EsTable::new();
        table.create(0x100, StreamType::H264).width = 1920;
        let again = table.create(0x100, StreamType::Other);
        assert_eq!(again.stream_type, StreamType::H264);
        assert_eq!(again.width, 1920);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sort_order() {
        let mut table = EsTable::new();
        table.create(0x300, StreamType::Teletext);
        table.create(0x200, StreamType::Aac);
        table.create(0x150, StreamType::Other);
        table.create(0x120, StreamType::DvbSub);
        table.create(0x201, StreamType::Mpeg2Video);
        table.create(0x110, StreamType::Ac3);
        table.sort();

        let pids: Vec<u16> = table.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![0x201, 0x110, 0x200, 0x120, 0x300, 0x150]);
    }

    #[test]
    fn test_filter_rules() {
        let mut table = EsTable::new();
        populated(&mut table);
        table.build_filter(&FilterConfig {
            languages: vec!["eng".into()],
        });

        let pids: Vec<u16> = table.filtered().map(|s| s.pid).collect();
        assert_eq!(pids, vec![0x100, 0x110, 0x112, 0x130]);
        for pid in &pids {
            assert!(table.find(*pid).is_some());
        }
    }

    #[test]
    fn test_sweep_deleted() {
        let mut table = EsTable::new();
        populated(&mut table);
        for s in table.iter_mut() {
            s.delete_me = s.stream_type.is_audio();
        }
        table.build_filter(&FilterConfig::default());
        let gone: Vec<u16> = table.sweep_deleted().iter().map(|s| s.pid).collect();
        assert_eq!(gone, vec![0x110, 0x111, 0x112]);
        assert_eq!(table.len(), 4);
        assert!(table.filtered().all(|s| !s.stream_type.is_audio()));
    }
}
