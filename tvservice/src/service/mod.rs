//! Services: one multiplexed program, its lifecycle and streaming state.
//!
//! A [`Service`] is split along the two lock tiers:
//!
//! - control-plane fields ([`ServiceControl`]) are only reachable through a
//!   held registry guard,
//! - streaming fields ([`ServiceStream`]) sit behind the service's own
//!   stream lock and are what the data plane touches per packet.
//!
//! Lifetime is reference counted. The registry owns one reference from
//! `create` until `destroy`; `destroy` turns the service into a zombie and
//! drops that reference. Resources are released when the last
//! [`ServiceRef`] goes away, exactly once.

pub mod input;
pub mod instance;
pub mod lock;
pub mod registry;
pub mod status;
mod timer;

pub use input::StreamStats;
pub use instance::{ChannelServices, InstanceList, SelectError, ServiceInstance};
pub use lock::{stream_lock_depth, RegistryGuard, RegistryLock, StreamGuard, StreamLock};
pub use registry::{
    Registry, RegistryConfig, RegistryInner, ServiceSnapshot, StartError, Subscription,
    SubscriptionOptions,
};
pub use status::{
    is_error, status_to_error_code, streaming_status_text, StatusCode, StreamingStatus,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use cwc_protocol::MuxId;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descrambler::{CaClient, CaService, DescramblerRuntime};
use crate::es::{Component, EsTable, FilterConfig};
use crate::feed::{Feed, SourceInfo};
use crate::pad::{StopReason, StreamStart, StreamingMessage, StreamingPad, SubscriberQueue};
use crate::stats::AvgStat;

use self::input::InputState;
use self::timer::ReceiveTimer;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ServiceState {
    Idle = 0,
    Running = 1,
    /// Destroyed; waiting for the last reference to drain.
    Zombie = 2,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServiceState::Running,
            2 => ServiceState::Zombie,
            _ => ServiceState::Idle,
        }
    }
}

/// Container format the feed delivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    TransportStream,
    ProgramStream,
    Other,
}

/// Broadcast service kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    None,
    Other,
    Sdtv,
    Hdtv,
    Radio,
}

impl ServiceType {
    /// Map a DVB service_type byte.
    pub fn from_dvb(service_type: u8) -> Self {
        match service_type {
            0x01 | 0x04 | 0x05 | 0x16 | 0x17 | 0x18 | 0xA5 => ServiceType::Sdtv,
            0x11 | 0x19 | 0x1A | 0x1B | 0x1C | 0x1D | 0x1E | 0x1F | 0x20 | 0xA6 => {
                ServiceType::Hdtv
            }
            0x02 | 0x07 | 0x0A => ServiceType::Radio,
            0x00 => ServiceType::None,
            _ => ServiceType::Other,
        }
    }

    pub fn is_sdtv(self) -> bool {
        self == ServiceType::Sdtv
    }

    pub fn is_hdtv(self) -> bool {
        self == ServiceType::Hdtv
    }

    pub fn is_radio(self) -> bool {
        self == ServiceType::Radio
    }

    pub fn is_other(self) -> bool {
        self == ServiceType::Other
    }

    pub fn is_tv(self) -> bool {
        self.is_sdtv() || self.is_hdtv()
    }
}

pub fn servicetype_text(t: ServiceType) -> &'static str {
    match t {
        ServiceType::None => "None",
        ServiceType::Other => "Other",
        ServiceType::Sdtv => "SDTV",
        ServiceType::Hdtv => "HDTV",
        ServiceType::Radio => "Radio",
    }
}

/// Persistable service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub uuid: Option<Uuid>,
    pub enabled: bool,
    /// Service (program) id.
    pub sid: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    /// Original network id of the mux.
    pub onid: u16,
    /// Transport stream id of the mux.
    pub tsid: u16,
    pub provider: Option<String>,
    pub name: Option<String>,
    pub service_type: ServiceType,
    pub source_type: SourceType,
    pub debug: bool,
    #[serde(rename = "stream")]
    pub components: Vec<Component>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            uuid: None,
            enabled: true,
            sid: 0,
            pmt_pid: 0,
            pcr_pid: 0,
            onid: 0,
            tsid: 0,
            provider: None,
            name: None,
            service_type: ServiceType::None,
            source_type: SourceType::TransportStream,
            debug: false,
            components: Vec::new(),
        }
    }
}

/// Build the display name of a service: "provider/channel" when both are
/// known, otherwise the adapter and mux it rides on plus the service id.
pub fn make_nicename(
    provider: Option<&str>,
    name: Option<&str>,
    info: &SourceInfo,
    sid: u16,
) -> String {
    match (provider, name) {
        (Some(p), Some(n)) => format!("{}/{}", p, n),
        (None, Some(n)) => n.to_string(),
        _ => {
            let mut parts: Vec<String> = Vec::new();
            if let Some(adapter) = &info.adapter {
                parts.push(adapter.clone());
            }
            if let Some(mux) = &info.mux {
                parts.push(mux.clone());
            }
            parts.push(format!("#{}", sid));
            parts.join("/")
        }
    }
}

/// One subscriber as seen by the control plane.
#[derive(Debug, Clone)]
pub struct SubscriberEntry {
    pub queue: Arc<SubscriberQueue>,
    pub weight: i32,
}

/// Control-plane fields. Guarded by the registry lock.
#[derive(Debug)]
pub struct ServiceControl {
    pub enabled: bool,
    pub provider: Option<String>,
    pub name: Option<String>,
    pub service_type: ServiceType,
    pub source_type: SourceType,
    pub debug: bool,
    /// Instance the service is running on.
    pub instance: Option<String>,
    pub start_time: Option<DateTime<Local>>,
    pub subscribers: Vec<SubscriberEntry>,
    /// Last known component list; seeds the stream table on start.
    pub components: Vec<Component>,
    pub source_info: SourceInfo,
    pub(crate) timer: Option<ReceiveTimer>,
}

/// Streaming fields. Guarded by the stream lock.
#[derive(Debug)]
pub struct ServiceStream {
    pub status: StreamingStatus,
    pub running: bool,
    pub sid: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub mux: MuxId,
    pub nicename: String,
    pub es: EsTable,
    pub filter: FilterConfig,
    pub pad: StreamingPad,
    pub descramble: Option<DescramblerRuntime>,
    /// Scrambled packets seen without a usable descrambler.
    pub scrambled_seen: u64,
    /// Presentation time of the last delivered packet.
    pub pts_cursor: Option<u64>,
    pub rate: AvgStat,
    pub stats: StreamStats,
    pub pmt_version: Option<u8>,
    /// A save is queued on the deferred queue.
    pub save_pending: bool,
    /// Bumped on every start.
    pub epoch: u64,
    pub(crate) input: InputState,
}

impl ServiceStream {
    fn new(filter: FilterConfig) -> Self {
        Self {
            status: StreamingStatus::default(),
            running: false,
            sid: 0,
            pmt_pid: 0,
            pcr_pid: 0,
            mux: MuxId(0),
            nicename: String::new(),
            es: EsTable::new(),
            filter,
            pad: StreamingPad::new(),
            descramble: None,
            scrambled_seen: 0,
            pts_cursor: None,
            rate: AvgStat::new(Duration::from_secs(10)),
            stats: StreamStats::default(),
            pmt_version: None,
            save_pending: false,
            epoch: 0,
            input: InputState::default(),
        }
    }

    /// Component list of the filtered view, for stream-start messages.
    pub fn stream_start(&self) -> StreamStart {
        StreamStart {
            service: self.nicename.clone(),
            pcr_pid: self.pcr_pid,
            pmt_pid: self.pmt_pid,
            components: self.es.filtered().map(|s| s.component()).collect(),
        }
    }

    fn set_nicename(&mut self, nicename: String) {
        for es in self.es.iter_mut() {
            es.make_nicename(&nicename);
        }
        self.nicename = nicename;
    }
}

/// Work the data plane hands to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredWork {
    Save,
    Restart,
    /// Detach the subscriber with this id.
    Detach(u64),
}

/// Leaf-locked queue between the data plane and `process_deferred`.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    items: Mutex<VecDeque<(Uuid, DeferredWork)>>,
}

impl DeferredQueue {
    pub fn push(&self, uuid: Uuid, work: DeferredWork) {
        let mut items = self.items.lock();
        if !items.iter().any(|&(u, w)| u == uuid && w == work) {
            items.push_back((uuid, work));
        }
    }

    pub fn drain(&self) -> Vec<(Uuid, DeferredWork)> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A multiplexed program.
pub struct Service {
    uuid: Uuid,
    refcount: AtomicUsize,
    /// Written under the registry lock only; readable anywhere.
    state: AtomicU8,
    released: AtomicBool,
    feed: Arc<dyn Feed>,
    control: Mutex<ServiceControl>,
    stream: StreamLock<ServiceStream>,
    /// Signalled whenever a status bit is raised. Interlocked with the
    /// stream lock.
    tss_cond: Condvar,
    deferred: Arc<DeferredQueue>,
    ca: Option<Arc<dyn CaClient>>,
    weak: Weak<Service>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl Service {
    pub(crate) fn new(
        uuid: Uuid,
        feed: Arc<dyn Feed>,
        filter: FilterConfig,
        deferred: Arc<DeferredQueue>,
        ca: Option<Arc<dyn CaClient>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            uuid,
            refcount: AtomicUsize::new(0),
            state: AtomicU8::new(ServiceState::Idle as u8),
            released: AtomicBool::new(false),
            feed,
            control: Mutex::new(ServiceControl {
                enabled: true,
                provider: None,
                name: None,
                service_type: ServiceType::None,
                source_type: SourceType::TransportStream,
                debug: false,
                instance: None,
                start_time: None,
                subscribers: Vec::new(),
                components: Vec::new(),
                source_info: SourceInfo::default(),
                timer: None,
            }),
            stream: StreamLock::new(ServiceStream::new(filter)),
            tss_cond: Condvar::new(),
            deferred,
            ca,
            weak: weak.clone(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_zombie(&self) -> bool {
        self.state() == ServiceState::Zombie
    }

    pub(crate) fn set_state(&self, _held: &RegistryGuard<'_, RegistryInner>, state: ServiceState) {
        let prev = self.state();
        debug_assert!(
            prev != ServiceState::Zombie || state == ServiceState::Zombie,
            "zombie services cannot be revived"
        );
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Whether the service's resources have been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn feed(&self) -> &Arc<dyn Feed> {
        &self.feed
    }

    /// Control-plane fields. Requires the registry lock to be held.
    pub fn control<'a>(&'a self, _held: &RegistryGuard<'_, RegistryInner>) -> MutexGuard<'a, ServiceControl> {
        self.control.lock()
    }

    /// Take the stream lock.
    pub fn stream(&self) -> StreamGuard<'_, ServiceStream> {
        self.stream.lock()
    }

    /// Take a counted reference.
    pub fn acquire(self: &Arc<Self>) -> ServiceRef {
        debug_assert!(!self.is_released(), "reference taken on a released service");
        self.refcount.fetch_add(1, Ordering::AcqRel);
        ServiceRef {
            service: Arc::clone(self),
        }
    }

    fn unref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "service refcount underflow");
        if prev == 1 {
            debug_assert!(self.is_zombie(), "last reference dropped on a live service");
            if self.is_zombie() {
                self.release();
            }
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut st = self.stream();
        st.running = false;
        st.es.clear();
        st.descramble = None;
        st.pad.stop_all(StopReason::ServiceDeleted);
        debug!("[Service] {} released", st.nicename);
    }

    pub fn nicename(&self) -> String {
        self.stream().nicename.clone()
    }

    pub fn mux(&self) -> MuxId {
        self.stream().mux
    }

    pub fn streaming_status(&self) -> StreamingStatus {
        self.stream().status
    }

    /// First CA system id in use, if the service is scrambled.
    pub fn encryption_state(&self) -> Option<u16> {
        let st = self.stream();
        let caid = st.es.iter().flat_map(|s| s.caids.iter()).map(|c| c.caid).next();
        caid
    }

    /// Raise status bits; wakes waiters and notifies subscribers when any
    /// bit is new.
    pub(crate) fn raise_status(&self, st: &mut ServiceStream, bits: u32) {
        if st.status.raise(bits) {
            trace!("[Service] {} status {}", st.nicename, st.status);
            self.tss_cond.notify_all();
            st.pad.deliver(StreamingMessage::ServiceStatus(st.status));
        }
    }

    pub(crate) fn tss_cond(&self) -> &Condvar {
        &self.tss_cond
    }

    /// Queue a settings save (and optionally a restart) for the control
    /// plane. Called from the data plane with the stream lock held.
    pub fn request_save(&self, st: &mut ServiceStream, restart: bool) {
        if !st.save_pending {
            st.save_pending = true;
            self.deferred.push(self.uuid, DeferredWork::Save);
        }
        if restart {
            self.deferred.push(self.uuid, DeferredWork::Restart);
        }
    }

    /// Handle handed to the CA client.
    pub(crate) fn ca_handle(&self, st: &ServiceStream) -> CaService {
        CaService::new(self.uuid, st.mux, st.nicename.clone(), self.weak.clone())
    }

    pub(crate) fn ca_client(&self) -> Option<&Arc<dyn CaClient>> {
        self.ca.as_ref()
    }

    /// Raise `TIMEOUT` if nothing was delivered since start `epoch`.
    pub(crate) fn check_receive_timeout(&self, epoch: u64) {
        let mut st = self.stream();
        if st.running && st.epoch == epoch && !st.status.intersects(StreamingStatus::PACKETS) {
            log::warn!("[Service] {}: no input detected", st.nicename);
            self.raise_status(&mut st, StreamingStatus::TIMEOUT);
        }
    }
}

/// Counted reference to a service.
///
/// Holding a `ServiceRef` keeps the service from being released, but not
/// from being destroyed. Control-plane code must go through
/// [`ServiceRef::upgrade`] under the registry lock, which hides zombies.
pub struct ServiceRef {
    service: Arc<Service>,
}

impl ServiceRef {
    /// The service, if it is not a zombie. Requires the registry lock.
    pub fn upgrade<'a>(&'a self, _held: &RegistryGuard<'_, RegistryInner>) -> Option<&'a Arc<Service>> {
        if self.service.is_zombie() {
            None
        } else {
            Some(&self.service)
        }
    }

    /// The service without the zombie check. Data-plane code only touches
    /// it through the stream lock, which sees `running == false` once the
    /// service has been stopped.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    pub fn ptr_eq(&self, other: &Arc<Service>) -> bool {
        Arc::ptr_eq(&self.service, other)
    }

    /// Explicit unref; same as dropping.
    pub fn release(self) {}
}

impl Clone for ServiceRef {
    fn clone(&self) -> Self {
        self.service.acquire()
    }
}

impl Drop for ServiceRef {
    fn drop(&mut self) {
        self.service.unref();
    }
}

impl std::fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ServiceRef").field(&self.service.uuid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nicename_fallbacks() {
        let info = SourceInfo {
            adapter: Some("adapter0".into()),
            mux: Some("0001:0401".into()),
            ..SourceInfo::default()
        };
        assert_eq!(
            make_nicename(Some("NHK"), Some("General"), &info, 1024),
            "NHK/General"
        );
        assert_eq!(make_nicename(None, Some("General"), &info, 1024), "General");
        assert_eq!(make_nicename(None, None, &info, 1024), "adapter0/0001:0401/#1024");
    }

    #[test]
    fn test_service_type_classification() {
        assert!(ServiceType::from_dvb(0x01).is_sdtv());
        assert!(ServiceType::from_dvb(0x19).is_hdtv());
        assert!(ServiceType::from_dvb(0x19).is_tv());
        assert!(ServiceType::from_dvb(0x02).is_radio());
        assert!(!ServiceType::from_dvb(0x02).is_tv());
        assert!(ServiceType::from_dvb(0xC0).is_other());
        assert_eq!(servicetype_text(ServiceType::Hdtv), "HDTV");
    }

    #[test]
    fn test_settings_defaults_from_toml() {
        let settings: ServiceSettings = toml::from_str(
            r#"
            sid = 1024
            pmt_pid = 0x1F0
            name = "General"

            [[stream]]
            pid = 0x111
            stream_type = "H264"
            "#,
        )
        .unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.pmt_pid, 0x1F0);
        assert_eq!(settings.components.len(), 1);
        assert_eq!(settings.components[0].pid, 0x111);
    }

    #[test]
    fn test_deferred_queue_dedups() {
        let q = DeferredQueue::default();
        let id = Uuid::new_v4();
        q.push(id, DeferredWork::Save);
        q.push(id, DeferredWork::Save);
        q.push(id, DeferredWork::Restart);
        assert_eq!(q.drain(), vec![(id, DeferredWork::Save), (id, DeferredWork::Restart)]);
        assert!(q.is_empty());
    }
}
