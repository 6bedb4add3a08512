mod common;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cwc_protocol::MuxId;
use parking_lot::Mutex;
use tvservice::feed::{Feed, TsSource, TunerFeed};
use tvservice::pad::{StopReason, StreamingMessage};
use tvservice::service::{
    InstanceList, Registry, RegistryConfig, SelectError, ServiceSettings, ServiceState,
    SubscriptionOptions,
};

const NULL_PID: u16 = 0x1FFF;

/// Hands out queued chunks once the gate opens.
struct GatedSource {
    gate: Arc<AtomicBool>,
    chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl TsSource for GatedSource {
    fn open(&mut self, _mux: MuxId) -> io::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.gate.load(Ordering::Acquire) {
            return Ok(0);
        }
        let Some(chunk) = self.chunks.lock().pop_front() else {
            return Ok(0);
        };
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn close(&mut self) {}
}

fn settings(sid: u16, tsid: u16) -> ServiceSettings {
    ServiceSettings {
        sid,
        onid: 1,
        tsid,
        name: Some(format!("svc{}", sid)),
        ..ServiceSettings::default()
    }
}

fn null_chunk(packets: usize, first_cc: u8) -> Vec<u8> {
    (0..packets)
        .flat_map(|i| common::ts_packet(NULL_PID, false, first_cc.wrapping_add(i as u8), &[]))
        .collect()
}

fn snapshot_bytes(registry: &Registry, uuid: uuid::Uuid) -> u64 {
    registry
        .snapshot()
        .into_iter()
        .find(|s| s.uuid == uuid)
        .map(|s| s.stats.bytes)
        .unwrap_or(0)
}

#[test]
fn test_services_on_one_mux_all_see_every_chunk() {
    common::init_logger();
    let gate = Arc::new(AtomicBool::new(false));
    let chunks: VecDeque<Vec<u8>> = (0..5).map(|i| null_chunk(10, i * 10)).collect();
    let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();

    let feed = Arc::new(TunerFeed::new("dvb"));
    feed.add_adapter(
        "adapter0",
        10,
        Box::new(GatedSource {
            gate: gate.clone(),
            chunks: Arc::new(Mutex::new(chunks)),
        }),
    );
    let registry = Registry::init(RegistryConfig::default(), None);
    let first = registry.create(feed.clone() as Arc<dyn Feed>, &settings(1, 0x401));
    let second = registry.create(feed.clone() as Arc<dyn Feed>, &settings(2, 0x401));

    let mut list = InstanceList::new();
    for service in [&first, &second] {
        let chosen = registry
            .find_instance(Some(service), None, &mut list, 10)
            .unwrap();
        assert_eq!(chosen.instance, "adapter0");
    }
    assert_eq!(feed.adapter_users("adapter0").len(), 2);

    gate.store(true, Ordering::Release);
    assert!(common::wait_for(Duration::from_secs(2), || {
        snapshot_bytes(&registry, first.uuid()) == total
            && snapshot_bytes(&registry, second.uuid()) == total
    }));
    assert_eq!(feed.bytes_read("adapter0"), total);

    registry.stop(&first);
    assert_eq!(feed.adapter_users("adapter0"), vec![second.uuid()]);
    assert!(feed.tuned_mux("adapter0").is_some());

    registry.stop(&second);
    assert!(feed.adapter_users("adapter0").is_empty());
    assert_eq!(feed.tuned_mux("adapter0"), None);
}

#[test]
fn test_busy_adapter_needs_heavier_request() {
    common::init_logger();
    let feed = Arc::new(TunerFeed::new("dvb"));
    feed.add_adapter(
        "adapter0",
        10,
        Box::new(GatedSource {
            gate: Arc::new(AtomicBool::new(false)),
            chunks: Arc::new(Mutex::new(VecDeque::new())),
        }),
    );
    let registry = Registry::init(RegistryConfig::default(), None);
    let holder = registry.create(feed.clone() as Arc<dyn Feed>, &settings(1, 0x401));
    let other = registry.create(feed.clone() as Arc<dyn Feed>, &settings(2, 0x402));

    let recording = registry
        .add_subscriber(
            &holder,
            "recording",
            SubscriptionOptions {
                weight: 50,
                ..SubscriptionOptions::default()
            },
        )
        .unwrap();
    let mut holder_list = InstanceList::new();
    registry
        .find_instance(Some(&holder), None, &mut holder_list, 50)
        .unwrap();
    assert_eq!(feed.tuned_mux("adapter0"), Some(MuxId::from_onid_tsid(1, 0x401)));

    let mut list = InstanceList::new();
    let light = registry.find_instance(Some(&other), None, &mut list, 10);
    assert!(matches!(light, Err(SelectError::NoServiceAvailable)));
    assert_eq!(list.entries()[0].weight, 50);
    assert_eq!(holder.state(), ServiceState::Running);

    let chosen = registry
        .find_instance(Some(&other), None, &mut list, 60)
        .unwrap();
    assert_eq!(chosen.instance, "adapter0");
    assert_eq!(holder.state(), ServiceState::Idle);
    assert_eq!(other.state(), ServiceState::Running);
    assert_eq!(feed.adapter_users("adapter0"), vec![other.uuid()]);
    assert_eq!(feed.tuned_mux("adapter0"), Some(MuxId::from_onid_tsid(1, 0x402)));

    let mut preempted = false;
    while let Some(msg) = recording.try_recv() {
        preempted |= msg == StreamingMessage::Stop(StopReason::Preempted);
    }
    assert!(preempted);
}
