//! In-memory feed driven from code: scripted instances, injectable data and
//! a record of every call. Used by tests and the demo mode of the daemon.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Feed, FeedError, InstanceOffer, SourceInfo};
use crate::service::{Service, ServiceRef, ServiceSettings};

#[derive(Debug, Clone)]
struct ScriptedInstance {
    offer: InstanceOffer,
    fail_start: bool,
}

struct Worker {
    tx: mpsc::Sender<Bytes>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Journal {
    started: Vec<(Uuid, String)>,
    stopped: Vec<Uuid>,
    saved: Vec<(Uuid, ServiceSettings)>,
    deleted: Vec<(Uuid, bool)>,
}

pub struct SyntheticFeed {
    name: String,
    enabled: Mutex<bool>,
    instances: Mutex<Vec<ScriptedInstance>>,
    /// Played to every service right after it starts.
    script: Mutex<Vec<Bytes>>,
    workers: Mutex<HashMap<Uuid, Worker>>,
    journal: Mutex<Journal>,
    grace_period: Mutex<Duration>,
}

impl SyntheticFeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: Mutex::new(true),
            instances: Mutex::new(Vec::new()),
            script: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            journal: Mutex::new(Journal::default()),
            grace_period: Mutex::new(Duration::from_secs(10)),
        }
    }

    pub fn add_instance(&self, instance: &str, prio: i32, weight: i32) {
        self.instances.lock().push(ScriptedInstance {
            offer: InstanceOffer::new(instance, prio, weight),
            fail_start: false,
        });
    }

    pub fn remove_instance(&self, instance: &str) {
        self.instances.lock().retain(|i| i.offer.instance != instance);
    }

    /// Make starts on `instance` fail.
    pub fn fail_start(&self, instance: &str, fail: bool) {
        for i in self.instances.lock().iter_mut() {
            if i.offer.instance == instance {
                i.fail_start = fail;
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    pub fn set_grace_period(&self, grace_period: Duration) {
        *self.grace_period.lock() = grace_period;
    }

    pub fn set_script(&self, chunks: Vec<Bytes>) {
        *self.script.lock() = chunks;
    }

    /// Queue bytes for a running service. Returns false if it is not
    /// running on this feed.
    pub fn push(&self, uuid: Uuid, data: Bytes) -> bool {
        self.workers
            .lock()
            .get(&uuid)
            .map(|w| w.tx.send(data).is_ok())
            .unwrap_or(false)
    }

    pub fn is_delivering(&self, uuid: Uuid) -> bool {
        self.workers.lock().contains_key(&uuid)
    }

    pub fn starts(&self) -> Vec<(Uuid, String)> {
        self.journal.lock().started.clone()
    }

    pub fn stops(&self) -> Vec<Uuid> {
        self.journal.lock().stopped.clone()
    }

    pub fn saved(&self) -> Vec<(Uuid, ServiceSettings)> {
        self.journal.lock().saved.clone()
    }

    pub fn deleted(&self) -> Vec<(Uuid, bool)> {
        self.journal.lock().deleted.clone()
    }
}

impl Feed for SyntheticFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self, _service: &Service) -> bool {
        *self.enabled.lock()
    }

    fn enlist(&self, _service: &Service, offers: &mut Vec<InstanceOffer>) {
        offers.extend(self.instances.lock().iter().map(|i| i.offer.clone()));
    }

    fn start_feed(&self, service: ServiceRef, instance: &str) -> Result<(), FeedError> {
        let scripted = self
            .instances
            .lock()
            .iter()
            .find(|i| i.offer.instance == instance)
            .cloned()
            .ok_or_else(|| FeedError::UnknownInstance(instance.to_string()))?;
        if scripted.fail_start {
            return Err(FeedError::Other(format!("scripted failure on {}", instance)));
        }

        let uuid = service.uuid();
        let script = self.script.lock().clone();
        let (tx, rx) = mpsc::channel::<Bytes>();
        let handle = thread::Builder::new()
            .name(format!("synthetic-{}", instance))
            .spawn(move || {
                for chunk in script {
                    service.service().input(&chunk);
                }
                while let Ok(chunk) = rx.recv() {
                    service.service().input(&chunk);
                }
            })?;

        if let Some(old) = self.workers.lock().insert(uuid, Worker { tx, handle }) {
            join_worker(old);
        }
        self.journal.lock().started.push((uuid, instance.to_string()));
        debug!("[Synthetic] {} started on {}", uuid, instance);
        Ok(())
    }

    fn stop_feed(&self, service: &Service) {
        let worker = self.workers.lock().remove(&service.uuid());
        if let Some(worker) = worker {
            join_worker(worker);
        }
        self.journal.lock().stopped.push(service.uuid());
    }

    fn grace_period(&self, _service: &Service) -> Duration {
        *self.grace_period.lock()
    }

    fn config_save(&self, service: &Service, settings: &ServiceSettings) {
        self.journal
            .lock()
            .saved
            .push((service.uuid(), settings.clone()));
    }

    fn set_source_info(&self, _service: &Service, info: &mut SourceInfo) {
        info.adapter = Some(self.name.clone());
    }

    fn delete(&self, service: &Service, persist: bool) {
        self.journal.lock().deleted.push((service.uuid(), persist));
    }
}

fn join_worker(worker: Worker) {
    drop(worker.tx);
    if worker.handle.join().is_err() {
        error!("[Synthetic] delivery thread panicked");
    }
}
