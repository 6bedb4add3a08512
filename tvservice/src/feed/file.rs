//! Feed that replays a recorded transport stream file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Feed, FeedError, InstanceOffer, SourceInfo};
use crate::service::{Service, ServiceRef, ServiceSettings};

const DEFAULT_CHUNK_SIZE: usize = 188 * 256;

struct Worker {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Replays one file to every service started on it.
pub struct FileFeed {
    name: String,
    path: PathBuf,
    chunk_size: usize,
    repeat: bool,
    /// Delay between chunks; `None` reads as fast as possible.
    pace: Option<Duration>,
    settings_dir: Option<PathBuf>,
    grace_period: Duration,
    workers: Mutex<HashMap<Uuid, Worker>>,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Self {
            name,
            path,
            chunk_size: DEFAULT_CHUNK_SIZE,
            repeat: false,
            pace: None,
            settings_dir: None,
            grace_period: Duration::from_secs(5),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_pace(mut self, pace: Option<Duration>) -> Self {
        self.pace = pace;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(188);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Store service settings as `<dir>/<uuid>.json`.
    pub fn with_settings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings_dir = Some(dir.into());
        self
    }

    fn instance_name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn settings_path(&self, uuid: Uuid) -> Option<PathBuf> {
        self.settings_dir
            .as_ref()
            .map(|d| d.join(format!("{}.json", uuid)))
    }

    /// Load settings previously stored for `uuid`.
    pub fn load_settings(&self, uuid: Uuid) -> Option<ServiceSettings> {
        let path = self.settings_path(uuid)?;
        let data = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&data) {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!("[FileFeed] ignoring {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Whether delivery to `uuid` reached the end of the file.
    pub fn is_finished(&self, uuid: Uuid) -> bool {
        self.workers
            .lock()
            .get(&uuid)
            .map(|w| w.finished.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn run(
        service: ServiceRef,
        mut file: File,
        chunk_size: usize,
        repeat: bool,
        pace: Option<Duration>,
        stop: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; chunk_size];
        while !stop.load(Ordering::Acquire) {
            let n = match file.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    error!("[FileFeed] read failed: {}", e);
                    break;
                }
            };
            if n == 0 {
                if repeat {
                    if let Err(e) = file.seek(SeekFrom::Start(0)) {
                        error!("[FileFeed] rewind failed: {}", e);
                        break;
                    }
                    continue;
                }
                debug!("[FileFeed] end of file for {}", service.uuid());
                break;
            }
            service.service().input(&buf[..n]);
            if let Some(pace) = pace {
                thread::sleep(pace);
            }
        }
        finished.store(true, Ordering::Release);
    }
}

impl Feed for FileFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn enlist(&self, _service: &Service, offers: &mut Vec<InstanceOffer>) {
        if self.path.is_file() {
            offers.push(InstanceOffer::new(self.instance_name(), 0, 0));
        }
    }

    fn start_feed(&self, service: ServiceRef, instance: &str) -> Result<(), FeedError> {
        if instance != self.instance_name() {
            return Err(FeedError::UnknownInstance(instance.to_string()));
        }
        let file = File::open(&self.path)?;
        let uuid = service.uuid();
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let handle = {
            let (stop, finished) = (stop.clone(), finished.clone());
            let (chunk_size, repeat, pace) = (self.chunk_size, self.repeat, self.pace);
            thread::Builder::new()
                .name(format!("file-feed-{}", &uuid.to_string()[..8]))
                .spawn(move || Self::run(service, file, chunk_size, repeat, pace, stop, finished))?
        };

        let previous = self.workers.lock().insert(
            uuid,
            Worker {
                stop,
                finished,
                handle: Some(handle),
            },
        );
        if let Some(previous) = previous {
            stop_worker(previous);
        }
        info!("[FileFeed] streaming {} to {}", self.path.display(), uuid);
        Ok(())
    }

    fn stop_feed(&self, service: &Service) {
        let worker = self.workers.lock().remove(&service.uuid());
        if let Some(worker) = worker {
            stop_worker(worker);
        }
    }

    fn grace_period(&self, _service: &Service) -> Duration {
        self.grace_period
    }

    fn config_save(&self, service: &Service, settings: &ServiceSettings) {
        let Some(path) = self.settings_path(service.uuid()) else {
            return;
        };
        let result = serde_json::to_string_pretty(settings)
            .map_err(std::io::Error::other)
            .and_then(|json| write_atomic(&path, json.as_bytes()));
        if let Err(e) = result {
            error!("[FileFeed] failed to save {}: {}", path.display(), e);
        }
    }

    fn set_source_info(&self, _service: &Service, info: &mut SourceInfo) {
        info.adapter = Some("file".to_string());
        info.mux = Some(self.name.clone());
    }

    fn delete(&self, service: &Service, persist: bool) {
        if persist {
            return;
        }
        if let Some(path) = self.settings_path(service.uuid()) {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("[FileFeed] failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn stop_worker(mut worker: Worker) {
    worker.stop.store(true, Ordering::Release);
    if let Some(handle) = worker.handle.take() {
        if handle.join().is_err() {
            error!("[FileFeed] delivery thread panicked");
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}
