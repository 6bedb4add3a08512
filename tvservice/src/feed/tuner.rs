//! Feed backed by tuner adapters.
//!
//! Each adapter wraps a [`TsSource`] that can be tuned to one mux at a
//! time. One reader thread per tuned adapter hands every chunk to all the
//! services on that mux. An adapter tuned to another mux is still offered,
//! carrying its users as holders, so a heavier request can take it over.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cwc_protocol::MuxId;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Feed, FeedError, InstanceOffer, SourceInfo};
use crate::service::{Service, ServiceRef, ServiceSettings};

/// Size of each TS data chunk to read from an adapter.
const TS_CHUNK_SIZE: usize = 188 * 348;

/// A tunable transport stream source.
///
/// `read` should return within a few hundred milliseconds; `Ok(0)` and
/// `WouldBlock`/`TimedOut` errors mean "no data yet".
pub trait TsSource: Send {
    fn open(&mut self, mux: MuxId) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&mut self);
}

type Users = Arc<Mutex<Vec<ServiceRef>>>;

struct Reader {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Reader {
    fn spawn(
        name: &str,
        source: Arc<Mutex<Box<dyn TsSource>>>,
        users: Users,
        bytes_read: Arc<AtomicU64>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("tuner-{}", name))
                .spawn(move || read_loop(&name, source, users, bytes_read, stop))?
        };
        Ok(Self { stop, handle })
    }

    fn stop(self, adapter: &str) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            warn!("[Tuner] reader thread for {} panicked", adapter);
        }
    }
}

fn read_loop(
    adapter: &str,
    source: Arc<Mutex<Box<dyn TsSource>>>,
    users: Users,
    bytes_read: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; TS_CHUNK_SIZE];
    while !stop.load(Ordering::Acquire) {
        let result = source.lock().read(&mut buf);
        match result {
            Ok(0) => thread::sleep(Duration::from_millis(10)),
            Ok(n) => {
                bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                // Holding the user list keeps stop_feed from returning while a
                // chunk is still being handed to the leaving service.
                for user in users.lock().iter() {
                    user.service().input(&buf[..n]);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                error!("[Tuner] read failed on {}: {}", adapter, e);
                break;
            }
        }
    }
}

struct Adapter {
    name: String,
    priority: i32,
    source: Arc<Mutex<Box<dyn TsSource>>>,
    tuned: Option<MuxId>,
    users: Users,
    reader: Option<Reader>,
    bytes_read: Arc<AtomicU64>,
}

impl Adapter {
    fn user_ids(&self) -> Vec<Uuid> {
        self.users.lock().iter().map(|u| u.uuid()).collect()
    }
}

pub struct TunerFeed {
    name: String,
    adapters: Mutex<Vec<Adapter>>,
    /// Adapter index each running service reads from.
    placement: Mutex<HashMap<Uuid, usize>>,
    settings: Mutex<HashMap<Uuid, ServiceSettings>>,
    grace_period: Duration,
}

impl TunerFeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            adapters: Mutex::new(Vec::new()),
            placement: Mutex::new(HashMap::new()),
            settings: Mutex::new(HashMap::new()),
            grace_period: Duration::from_secs(10),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn add_adapter(&self, name: impl Into<String>, priority: i32, source: Box<dyn TsSource>) {
        self.adapters.lock().push(Adapter {
            name: name.into(),
            priority,
            source: Arc::new(Mutex::new(source)),
            tuned: None,
            users: Arc::new(Mutex::new(Vec::new())),
            reader: None,
            bytes_read: Arc::new(AtomicU64::new(0)),
        });
    }

    /// Services currently reading `adapter`.
    pub fn adapter_users(&self, adapter: &str) -> Vec<Uuid> {
        self.adapters
            .lock()
            .iter()
            .find(|a| a.name == adapter)
            .map(Adapter::user_ids)
            .unwrap_or_default()
    }

    /// Mux `adapter` is tuned to, if any.
    pub fn tuned_mux(&self, adapter: &str) -> Option<MuxId> {
        self.adapters
            .lock()
            .iter()
            .find(|a| a.name == adapter)
            .and_then(|a| a.tuned)
    }

    pub fn bytes_read(&self, adapter: &str) -> u64 {
        self.adapters
            .lock()
            .iter()
            .find(|a| a.name == adapter)
            .map(|a| a.bytes_read.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Last settings persisted for `uuid`.
    pub fn saved_settings(&self, uuid: Uuid) -> Option<ServiceSettings> {
        self.settings.lock().get(&uuid).cloned()
    }

    /// Take `uuid` off its adapter. The last user leaving stops the reader
    /// and closes the source.
    fn leave(&self, uuid: Uuid) {
        let Some(idx) = self.placement.lock().remove(&uuid) else {
            return;
        };
        let mut adapters = self.adapters.lock();
        let Some(adapter) = adapters.get_mut(idx) else {
            return;
        };
        let (removed, now_idle) = {
            let mut users = adapter.users.lock();
            let removed = users
                .iter()
                .position(|u| u.uuid() == uuid)
                .map(|i| users.remove(i));
            (removed, users.is_empty())
        };
        if now_idle {
            if let Some(reader) = adapter.reader.take() {
                reader.stop(&adapter.name);
            }
            adapter.tuned = None;
            adapter.source.lock().close();
            debug!("[Tuner] {} idle", adapter.name);
        }
        drop(adapters);
        drop(removed);
    }
}

impl Feed for TunerFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn enlist(&self, service: &Service, offers: &mut Vec<InstanceOffer>) {
        let mux = service.mux();
        for adapter in self.adapters.lock().iter() {
            let offer = InstanceOffer::new(adapter.name.clone(), adapter.priority, 0);
            match adapter.tuned {
                Some(tuned) if tuned != mux => offers.push(offer.held_by(adapter.user_ids())),
                _ => offers.push(offer),
            }
        }
    }

    fn start_feed(&self, service: ServiceRef, instance: &str) -> Result<(), FeedError> {
        let uuid = service.uuid();
        let mux = service.service().mux();
        self.leave(uuid);

        let mut adapters = self.adapters.lock();
        let idx = adapters
            .iter()
            .position(|a| a.name == instance)
            .ok_or_else(|| FeedError::UnknownInstance(instance.to_string()))?;
        let adapter = &mut adapters[idx];
        match adapter.tuned {
            Some(tuned) if tuned != mux => return Err(FeedError::Busy(instance.to_string())),
            Some(_) => {}
            None => {
                adapter.source.lock().open(mux)?;
                adapter.tuned = Some(mux);
                info!("[Tuner] {} tuned to {}", adapter.name, mux);
            }
        }
        if adapter.reader.is_none() {
            let spawned = Reader::spawn(
                &adapter.name,
                adapter.source.clone(),
                adapter.users.clone(),
                adapter.bytes_read.clone(),
            );
            match spawned {
                Ok(reader) => adapter.reader = Some(reader),
                Err(e) => {
                    adapter.tuned = None;
                    adapter.source.lock().close();
                    return Err(e.into());
                }
            }
        }
        adapter.users.lock().push(service);
        drop(adapters);

        self.placement.lock().insert(uuid, idx);
        Ok(())
    }

    fn stop_feed(&self, service: &Service) {
        self.leave(service.uuid());
    }

    fn grace_period(&self, _service: &Service) -> Duration {
        self.grace_period
    }

    fn config_save(&self, service: &Service, settings: &ServiceSettings) {
        self.settings.lock().insert(service.uuid(), settings.clone());
    }

    fn set_source_info(&self, service: &Service, info: &mut SourceInfo) {
        let idx = self.placement.lock().get(&service.uuid()).copied();
        info.adapter = match idx {
            Some(idx) => self.adapters.lock().get(idx).map(|a| a.name.clone()),
            None => Some(self.name.clone()),
        };
    }

    fn delete(&self, service: &Service, persist: bool) {
        if !persist {
            self.settings.lock().remove(&service.uuid());
        }
    }
}
