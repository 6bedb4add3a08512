mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tvservice::feed::synthetic::SyntheticFeed;
use tvservice::feed::Feed;
use tvservice::pad::{StopReason, StreamingMessage};
use tvservice::service::{
    InstanceList, Registry, RegistryConfig, ServiceSettings, ServiceState, StartError,
    StatusCode, StreamingStatus, SubscriptionOptions,
};

fn settings(sid: u16) -> ServiceSettings {
    ServiceSettings {
        sid,
        pmt_pid: 0x1F0,
        provider: Some("Test".into()),
        name: Some(format!("Channel {}", sid)),
        ..ServiceSettings::default()
    }
}

fn setup(config: RegistryConfig) -> (Arc<Registry>, Arc<SyntheticFeed>) {
    common::init_logger();
    let feed = Arc::new(SyntheticFeed::new("synthetic"));
    feed.add_instance("adapter0", 5, 1);
    (Registry::init(config, None), feed)
}

#[test]
fn test_release_happens_on_last_unref_after_destroy() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(1));
    let uuid = service.uuid();
    assert_eq!(service.nicename(), "Test/Channel 1");

    let a = service.acquire();
    let b = a.clone();
    assert_eq!(service.refcount(), 3);

    registry.destroy(&service, false);
    assert_eq!(service.state(), ServiceState::Zombie);
    assert!(!service.is_released());
    assert_eq!(service.refcount(), 2);
    assert!(registry.find(uuid).is_none());
    assert!(registry.services().is_empty());

    drop(a);
    assert!(!service.is_released());
    b.release();
    assert!(service.is_released());
    assert_eq!(service.refcount(), 0);
    assert_eq!(feed.deleted(), vec![(uuid, false)]);
}

#[test]
fn test_zombie_hidden_from_reference_holders() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed as Arc<dyn Feed>, &settings(2));
    let held = registry.find(service.uuid()).unwrap();

    {
        let reg = registry.lock();
        assert!(held.upgrade(&reg).is_some());
    }
    registry.destroy(&service, false);
    {
        let reg = registry.lock();
        assert!(held.upgrade(&reg).is_none());
    }
    drop(held);
    assert!(service.is_released());
}

#[test]
fn test_destroy_with_concurrent_reference_holders() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed as Arc<dyn Feed>, &settings(3));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads + 1));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let held = service.acquire();
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut visits = 0u64;
                loop {
                    {
                        let reg = registry.lock();
                        match held.upgrade(&reg) {
                            Some(s) => {
                                assert!(!s.is_released());
                                let _ = s.control(&reg).enabled;
                                visits += 1;
                            }
                            None => break,
                        }
                    }
                    thread::yield_now();
                }
                visits
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(20));
    registry.destroy(&service, false);

    for h in handles {
        h.join().unwrap();
    }
    assert!(service.is_released());
    assert_eq!(service.refcount(), 0);
}

#[test]
fn test_start_on_zombie_fails_without_side_effects() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(4));
    let _keep = service.acquire();
    registry.destroy(&service, false);

    assert!(matches!(registry.start(&service, "adapter0"), Err(StartError::Zombie)));
    assert!(feed.starts().is_empty());
}

#[test]
fn test_start_failure_leaves_service_idle() {
    let (registry, feed) = setup(RegistryConfig::default());
    feed.fail_start("adapter0", true);
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(5));

    assert!(matches!(registry.start(&service, "adapter0"), Err(StartError::Feed(_))));
    assert_eq!(service.state(), ServiceState::Idle);
    assert!(!service.stream().running);
}

#[test]
fn test_disabled_service_does_not_start() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(
        feed as Arc<dyn Feed>,
        &ServiceSettings {
            enabled: false,
            ..settings(6)
        },
    );
    assert!(matches!(registry.start(&service, "adapter0"), Err(StartError::Disabled)));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "registry lock acquired while holding a stream lock")]
fn test_registry_lock_under_stream_lock_panics() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed as Arc<dyn Feed>, &settings(7));
    let _st = service.stream();
    let _reg = registry.lock();
}

#[test]
fn test_receive_timeout_raises_timeout_until_restart() {
    let (registry, feed) = setup(RegistryConfig {
        receive_timeout: Duration::from_millis(50),
        ..RegistryConfig::default()
    });
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(8));
    registry.start(&service, "adapter0").unwrap();

    let status = registry.wait_for_status(&service, Duration::from_secs(5));
    assert!(status.contains(StreamingStatus::TIMEOUT));
    assert!(status.is_error());
    assert_eq!(status.text(), "Data timeout");
    assert_eq!(status.error_code(), StatusCode::NoInput);

    registry.restart(&service).unwrap();
    assert!(!service.streaming_status().contains(StreamingStatus::TIMEOUT));
    assert_eq!(feed.starts().len(), 2);
    assert_eq!(feed.stops(), vec![service.uuid()]);
}

#[test]
fn test_wait_for_status_raises_graceperiod() {
    let (registry, feed) = setup(RegistryConfig {
        receive_timeout: Duration::from_secs(60),
        ..RegistryConfig::default()
    });
    let service = registry.create(feed as Arc<dyn Feed>, &settings(9));
    registry.start(&service, "adapter0").unwrap();

    let status = registry.wait_for_status(&service, Duration::from_millis(30));
    assert!(status.contains(StreamingStatus::GRACEPERIOD));
    assert!(!status.is_error());
}

#[test]
fn test_last_subscriber_leaving_stops_service() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(10));

    let first = registry
        .add_subscriber(&service, "first", SubscriptionOptions::default())
        .unwrap();
    let second = registry
        .add_subscriber(&service, "second", SubscriptionOptions { weight: 50, ..Default::default() })
        .unwrap();
    assert_eq!(registry.max_subscriber_weight(&service), Some(50));

    let mut candidates = InstanceList::new();
    registry
        .find_instance(Some(&service), None, &mut candidates, 100)
        .unwrap();
    assert_eq!(service.state(), ServiceState::Running);

    registry.remove_subscriber(second, StopReason::Unsubscribed);
    assert_eq!(service.state(), ServiceState::Running);

    registry.remove_subscriber(first, StopReason::Unsubscribed);
    assert_eq!(service.state(), ServiceState::Idle);
    assert_eq!(feed.stops(), vec![service.uuid()]);
}

#[test]
fn test_dropping_last_subscription_stops_service() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(14));
    let subscription = registry
        .add_subscriber(&service, "viewer", SubscriptionOptions::default())
        .unwrap();
    let queue = subscription.queue().clone();
    registry.start(&service, "adapter0").unwrap();
    assert_eq!(service.refcount(), 3);

    drop(subscription);
    assert!(queue.is_closed());
    assert_eq!(service.state(), ServiceState::Idle);
    assert_eq!(feed.stops(), vec![service.uuid()]);
    assert_eq!(registry.max_subscriber_weight(&service), None);
    assert_eq!(service.refcount(), 1);
}

#[test]
fn test_subscription_dropped_under_stream_lock_detaches_later() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(15));
    let other = registry.create(feed.clone() as Arc<dyn Feed>, &settings(16));
    let subscription = registry
        .add_subscriber(&service, "viewer", SubscriptionOptions::default())
        .unwrap();
    registry.start(&service, "adapter0").unwrap();

    {
        let _st = other.stream();
        drop(subscription);
    }
    assert_eq!(service.state(), ServiceState::Running);
    assert_eq!(registry.pending_deferred(), 1);

    assert_eq!(registry.process_deferred(), 1);
    assert_eq!(service.state(), ServiceState::Idle);
    assert_eq!(registry.max_subscriber_weight(&service), None);
}

#[test]
fn test_restart_rearms_receive_timer() {
    let (registry, feed) = setup(RegistryConfig {
        receive_timeout: Duration::from_millis(300),
        ..RegistryConfig::default()
    });
    let service = registry.create(feed as Arc<dyn Feed>, &settings(17));
    registry.start(&service, "adapter0").unwrap();

    thread::sleep(Duration::from_millis(150));
    registry.restart(&service).unwrap();
    thread::sleep(Duration::from_millis(230));
    assert!(!service.streaming_status().contains(StreamingStatus::TIMEOUT));

    let status = registry.wait_for_status(&service, Duration::from_secs(5));
    assert!(status.contains(StreamingStatus::TIMEOUT));
}

#[test]
fn test_destroy_notifies_and_persists() {
    let (registry, feed) = setup(RegistryConfig::default());
    let service = registry.create(feed.clone() as Arc<dyn Feed>, &settings(11));
    let uuid = service.uuid();
    let subscription = registry
        .add_subscriber(&service, "viewer", SubscriptionOptions::default())
        .unwrap();
    registry.start(&service, "adapter0").unwrap();

    registry.destroy(&service, true);

    let mut stopped = None;
    while let Some(msg) = subscription.try_recv() {
        if let StreamingMessage::Stop(reason) = msg {
            stopped = Some(reason);
        }
    }
    assert_eq!(stopped, Some(StopReason::ServiceDeleted));
    assert!(subscription.queue().is_closed());

    let saved = feed.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, uuid);
    assert_eq!(saved[0].1.sid, 11);
    assert_eq!(feed.deleted(), vec![(uuid, true)]);

    assert!(!service.is_released());
    drop(subscription);
    assert!(service.is_released());
}

#[test]
fn test_settings_round_trip_through_service() {
    let (registry, feed) = setup(RegistryConfig::default());
    let mut original = settings(12);
    original.onid = 4;
    original.tsid = 0x4010;
    let service = registry.create(feed as Arc<dyn Feed>, &original);

    let saved = registry.service_save(&service);
    assert_eq!(saved.uuid, Some(service.uuid()));
    assert_eq!(saved.sid, 12);
    assert_eq!(saved.onid, 4);
    assert_eq!(saved.tsid, 0x4010);
    assert_eq!(saved.name.as_deref(), Some("Channel 12"));

    registry.service_load(
        &service,
        &ServiceSettings {
            name: Some("Renamed".into()),
            ..saved
        },
    );
    assert_eq!(service.nicename(), "Test/Renamed");
}

#[test]
fn test_shutdown_destroys_everything() {
    let (registry, feed) = setup(RegistryConfig::default());
    let a = registry.create(feed.clone() as Arc<dyn Feed>, &settings(13));
    let b = registry.create(feed.clone() as Arc<dyn Feed>, &settings(14));
    registry.start(&a, "adapter0").unwrap();

    registry.shutdown();
    assert!(a.is_released());
    assert!(b.is_released());
    assert_eq!(feed.saved().len(), 2);
    assert!(matches!(registry.start(&a, "adapter0"), Err(StartError::Shutdown)));
}
