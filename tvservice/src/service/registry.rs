//! The service registry: the process-wide list of services and every
//! control-plane operation on them.
//!
//! All lifecycle transitions happen here with the registry lock held.
//! Stream locks are only ever taken after it, never the other way round.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Local;
use cwc_protocol::MuxId;
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Runtime;
use uuid::Uuid;

use super::instance::{ChannelServices, InstanceList, SelectError, ServiceInstance};
use super::lock::{stream_lock_depth, RegistryGuard, RegistryLock};
use super::timer::ReceiveTimer;
use super::{
    make_nicename, servicetype_text, DeferredQueue, DeferredWork, Service, ServiceRef,
    ServiceSettings, ServiceState, StreamStats, StreamingStatus, SubscriberEntry,
};
use crate::descrambler::{CaClient, DescramblerRuntime};
use crate::es::{Component, FilterConfig};
use crate::feed::{Feed, FeedError};
use crate::pad::{StopReason, StreamingMessage, SubscriberQueue, DEFAULT_QUEUE_LEN};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("service is being destroyed")]
    Zombie,

    #[error("service is disabled")]
    Disabled,

    #[error("service is not running")]
    NotRunning,

    #[error("registry is shut down")]
    Shutdown,

    #[error("feed failed to start: {0}")]
    Feed(#[from] FeedError),
}

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A started service that delivers nothing for this long gets `TIMEOUT`.
    pub receive_timeout: Duration,
    /// How long a failed instance is skipped by arbitration.
    pub instance_error_hold: Duration,
    /// Queue length for subscribers that do not ask for one.
    pub pad_queue_len: usize,
    /// Preferred subtitle and teletext languages.
    pub filter_languages: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(10),
            instance_error_hold: Duration::from_secs(30),
            pad_queue_len: DEFAULT_QUEUE_LEN,
            filter_languages: Vec::new(),
        }
    }
}

/// State behind the registry lock.
#[derive(Debug)]
pub struct RegistryInner {
    services: Vec<ServiceRef>,
    active: bool,
}

impl RegistryInner {
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn find(&self, uuid: Uuid) -> Option<Arc<Service>> {
        self.services
            .iter()
            .find(|r| r.uuid() == uuid)
            .map(|r| r.service().clone())
    }
}

/// Options for [`Registry::add_subscriber`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub weight: i32,
    /// Also receive the descrambled transport stream.
    pub passthrough: bool,
    pub queue_len: Option<usize>,
}

/// A subscriber attached to a service. Holds a service reference until it
/// is removed.
///
/// Dropping a subscription detaches it like
/// [`Registry::remove_subscriber`]. When the dropping thread holds a stream
/// lock the detach is queued for [`Registry::process_deferred`] instead.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    service: ServiceRef,
    queue: Arc<SubscriberQueue>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    pub fn queue(&self) -> &Arc<SubscriberQueue> {
        &self.queue
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamingMessage> {
        self.queue.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<StreamingMessage> {
        self.queue.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Closed queues were already detached by remove_subscriber or destroy.
        if self.queue.is_closed() {
            return;
        }
        self.queue.close();
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if stream_lock_depth() > 0 {
            registry
                .deferred
                .push(self.service.uuid(), DeferredWork::Detach(self.id));
            return;
        }
        let mut reg = registry.lock();
        registry.detach_locked(&mut reg, self.service.service(), self.id);
    }
}

/// Serializable view of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub uuid: Uuid,
    pub nicename: String,
    pub state: ServiceState,
    pub service_type: &'static str,
    pub instance: Option<String>,
    pub started: Option<String>,
    pub status: StreamingStatus,
    pub status_text: &'static str,
    pub subscribers: usize,
    pub streams: usize,
    pub encrypted: Option<u16>,
    pub bitrate: f64,
    pub stats: StreamStats,
}

pub struct Registry {
    inner: RegistryLock<RegistryInner>,
    config: RegistryConfig,
    ca: Option<Arc<dyn CaClient>>,
    deferred: Arc<DeferredQueue>,
    next_subscriber: AtomicU64,
    /// Runs the receive timers.
    timers: Option<Runtime>,
    weak: Weak<Registry>,
}

impl Registry {
    pub fn init(config: RegistryConfig, ca: Option<Arc<dyn CaClient>>) -> Arc<Self> {
        info!(
            "[Registry] initialised (receive timeout {:?}, descrambler {})",
            config.receive_timeout,
            if ca.is_some() { "enabled" } else { "disabled" }
        );
        let timers = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rx-timer")
            .enable_time()
            .build()
        {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                error!("[Registry] no timer runtime, receive timeouts disabled: {}", e);
                None
            }
        };
        Arc::new_cyclic(|weak| Self {
            inner: RegistryLock::new(RegistryInner {
                services: Vec::new(),
                active: true,
            }),
            config,
            ca,
            deferred: Arc::new(DeferredQueue::default()),
            next_subscriber: AtomicU64::new(1),
            timers,
            weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Take the registry lock.
    pub fn lock(&self) -> RegistryGuard<'_, RegistryInner> {
        self.inner.lock()
    }

    fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            languages: self.config.filter_languages.clone(),
        }
    }

    /// Create a service on `feed` and register it.
    pub fn create(&self, feed: Arc<dyn Feed>, settings: &ServiceSettings) -> Arc<Service> {
        let uuid = settings.uuid.unwrap_or_else(Uuid::new_v4);
        let service = Service::new(
            uuid,
            feed,
            self.filter_config(),
            self.deferred.clone(),
            self.ca.clone(),
        );
        let mut reg = self.lock();
        self.service_load_locked(&reg, &service, settings);
        reg.services.push(service.acquire());
        info!("[Registry] created {} ({})", service.nicename(), uuid);
        service
    }

    /// Look up a live service.
    pub fn find(&self, uuid: Uuid) -> Option<ServiceRef> {
        let reg = self.lock();
        reg.services
            .iter()
            .find(|r| r.uuid() == uuid)
            .and_then(|r| r.upgrade(&reg))
            .map(|s| s.acquire())
    }

    /// References to every live service.
    pub fn services(&self) -> Vec<ServiceRef> {
        let reg = self.lock();
        reg.services
            .iter()
            .filter_map(|r| r.upgrade(&reg))
            .map(|s| s.acquire())
            .collect()
    }

    /// Apply settings to a service.
    pub fn service_load(&self, service: &Arc<Service>, settings: &ServiceSettings) {
        let reg = self.lock();
        self.service_load_locked(&reg, service, settings);
    }

    fn service_load_locked(
        &self,
        reg: &RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
        settings: &ServiceSettings,
    ) {
        let mut ctl = service.control(reg);
        ctl.enabled = settings.enabled;
        ctl.provider = settings.provider.clone();
        ctl.name = settings.name.clone();
        ctl.service_type = settings.service_type;
        ctl.source_type = settings.source_type;
        ctl.debug = settings.debug;
        ctl.components = settings.components.clone();
        service.feed().set_source_info(service, &mut ctl.source_info);

        let name = ctl.name.clone().or_else(|| service.feed().channel_name(service));
        let nicename = make_nicename(
            ctl.provider.as_deref(),
            name.as_deref(),
            &ctl.source_info,
            settings.sid,
        );

        let mut st = service.stream();
        st.sid = settings.sid;
        st.pmt_pid = settings.pmt_pid;
        st.pcr_pid = settings.pcr_pid;
        st.mux = MuxId::from_onid_tsid(settings.onid, settings.tsid);
        st.set_nicename(nicename);
    }

    /// Current settings of a service.
    pub fn service_save(&self, service: &Arc<Service>) -> ServiceSettings {
        let reg = self.lock();
        self.service_save_locked(&reg, service)
    }

    fn service_save_locked(
        &self,
        reg: &RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
    ) -> ServiceSettings {
        let mut ctl = service.control(reg);
        let mut st = service.stream();
        if !st.es.is_empty() {
            ctl.components = current_components(&st.es);
        }
        st.save_pending = false;
        ServiceSettings {
            uuid: Some(service.uuid()),
            enabled: ctl.enabled,
            sid: st.sid,
            pmt_pid: st.pmt_pid,
            pcr_pid: st.pcr_pid,
            onid: st.mux.onid(),
            tsid: st.mux.tsid(),
            provider: ctl.provider.clone(),
            name: ctl.name.clone(),
            service_type: ctl.service_type,
            source_type: ctl.source_type,
            debug: ctl.debug,
            components: ctl.components.clone(),
        }
    }

    /// Start `service` on `instance`.
    pub fn start(&self, service: &Arc<Service>, instance: &str) -> Result<(), StartError> {
        let mut reg = self.lock();
        self.start_locked(&mut reg, service, instance)
    }

    fn start_locked(
        &self,
        reg: &mut RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
        instance: &str,
    ) -> Result<(), StartError> {
        if !reg.active {
            return Err(StartError::Shutdown);
        }
        if service.is_zombie() {
            return Err(StartError::Zombie);
        }
        {
            let ctl = service.control(reg);
            if !ctl.enabled {
                return Err(StartError::Disabled);
            }
            if service.state() == ServiceState::Running {
                if ctl.instance.as_deref() == Some(instance) {
                    service.feed().refresh_feed(service);
                    return Ok(());
                }
                drop(ctl);
                self.stop_locked(reg, service, None);
            }
        }

        let mut ctl = service.control(reg);
        let epoch = {
            let mut st = service.stream();
            st.epoch += 1;
            st.status = StreamingStatus::default();
            st.es.clear();
            for c in &ctl.components {
                let es = st.es.create(c.pid, c.stream_type);
                es.apply_component(c);
            }
            let nicename = st.nicename.clone();
            for es in st.es.iter_mut() {
                es.make_nicename(&nicename);
            }
            st.es.sort();
            let filter = st.filter.clone();
            st.es.build_filter(&filter);
            st.descramble = self.ca.as_ref().map(|_| DescramblerRuntime::new());
            st.input.reset();
            st.pmt_version = None;
            st.pts_cursor = None;
            st.scrambled_seen = 0;
            st.running = true;
            st.epoch
        };

        if let Err(e) = service.feed().start_feed(service.acquire(), instance) {
            let mut st = service.stream();
            st.running = false;
            st.es.clear();
            st.descramble = None;
            warn!("[Registry] {}: start on '{}' failed: {}", st.nicename, instance, e);
            return Err(e.into());
        }

        ctl.instance = Some(instance.to_string());
        ctl.start_time = Some(Local::now());
        service.set_state(reg, ServiceState::Running);

        let (handle, ca_ids, start) = {
            let st = service.stream();
            let ca_ids: Vec<_> = st
                .es
                .iter()
                .filter(|s| s.stream_type == crate::es::StreamType::Ca)
                .flat_map(|s| s.caids.iter().copied())
                .collect();
            let start = (!st.es.is_empty()).then(|| st.stream_start());
            (service.ca_handle(&st), ca_ids, start)
        };
        if let Some(ca) = &self.ca {
            ca.service_start(&handle, &ca_ids);
        }

        ctl.timer = self.timers.as_ref().map(|runtime| {
            ReceiveTimer::arm(
                runtime.handle(),
                Arc::downgrade(service),
                epoch,
                self.config.receive_timeout,
            )
        });

        if let Some(start) = start {
            let st = service.stream();
            st.pad.deliver(StreamingMessage::Start(Arc::new(start)));
        }
        info!("[Registry] {} started on '{}'", handle.nicename, instance);
        Ok(())
    }

    /// Stop `service`. Subscribers stay attached and receive `Stop`.
    pub fn stop(&self, service: &Arc<Service>) {
        let mut reg = self.lock();
        self.stop_locked(&mut reg, service, Some(StopReason::ServiceStopped));
    }

    fn stop_locked(
        &self,
        reg: &mut RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
        notify: Option<StopReason>,
    ) {
        if service.state() != ServiceState::Running {
            return;
        }
        let mut ctl = service.control(reg);
        if let Some(timer) = ctl.timer.take() {
            timer.cancel();
        }

        // Quiesce the data plane before tearing anything down.
        service.feed().stop_feed(service);

        let handle = {
            let mut st = service.stream();
            st.running = false;
            if !st.es.is_empty() {
                ctl.components = current_components(&st.es);
            }
            st.es.clear();
            st.descramble = None;
            st.input.reset();
            if let Some(reason) = notify {
                st.pad.deliver(StreamingMessage::Stop(reason));
            }
            service.ca_handle(&st)
        };
        if let Some(ca) = &self.ca {
            ca.service_stop(&handle);
        }

        ctl.instance = None;
        ctl.start_time = None;
        drop(ctl);
        service.set_state(reg, ServiceState::Idle);
        info!("[Registry] {} stopped", handle.nicename);
    }

    /// Stop and start again on the same instance.
    pub fn restart(&self, service: &Arc<Service>) -> Result<(), StartError> {
        let mut reg = self.lock();
        self.restart_locked(&mut reg, service)
    }

    fn restart_locked(
        &self,
        reg: &mut RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
    ) -> Result<(), StartError> {
        if service.is_zombie() {
            return Err(StartError::Zombie);
        }
        let instance = service
            .control(reg)
            .instance
            .clone()
            .ok_or(StartError::NotRunning)?;
        self.stop_locked(reg, service, None);
        self.start_locked(reg, service, &instance)
    }

    /// Destroy `service`: stop it, turn it into a zombie and drop the
    /// registry's reference. `persist` keeps the stored settings.
    pub fn destroy(&self, service: &Arc<Service>, persist: bool) {
        let mut reg = self.lock();
        self.destroy_locked(&mut reg, service, persist);
    }

    fn destroy_locked(
        &self,
        reg: &mut RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
        persist: bool,
    ) {
        if service.is_zombie() {
            return;
        }
        self.stop_locked(reg, service, None);

        if persist {
            let settings = self.service_save_locked(reg, service);
            service.feed().config_save(service, &settings);
        }

        let subscribers = std::mem::take(&mut service.control(reg).subscribers);
        {
            let mut st = service.stream();
            for sub in &subscribers {
                st.pad.detach(sub.queue.id());
                sub.queue.push(StreamingMessage::Stop(StopReason::ServiceDeleted));
                sub.queue.close();
            }
        }

        service.set_state(reg, ServiceState::Zombie);
        service.feed().delete(service, persist);

        let nicename = service.nicename();
        let removed = reg
            .services
            .iter()
            .position(|r| r.ptr_eq(service))
            .map(|idx| reg.services.remove(idx));
        info!(
            "[Registry] {} destroyed ({} references outstanding)",
            nicename,
            service.refcount().saturating_sub(removed.is_some() as usize)
        );
        drop(removed);
    }

    /// Attach a subscriber. It receives `Start` right away if the service
    /// is running with a known component list.
    pub fn add_subscriber(
        &self,
        service: &Arc<Service>,
        name: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, StartError> {
        let reg = self.lock();
        if service.is_zombie() {
            return Err(StartError::Zombie);
        }
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let queue = SubscriberQueue::new(
            id,
            name,
            options.queue_len.unwrap_or(self.config.pad_queue_len),
            options.passthrough,
        );
        service.control(&reg).subscribers.push(SubscriberEntry {
            queue: queue.clone(),
            weight: options.weight,
        });
        {
            let mut st = service.stream();
            st.pad.attach(queue.clone());
            if st.running && !st.es.is_empty() {
                queue.push(StreamingMessage::Start(Arc::new(st.stream_start())));
                queue.push(StreamingMessage::ServiceStatus(st.status));
            }
        }
        debug!("[Registry] subscriber '{}' (#{}) attached", name, id);
        Ok(Subscription {
            id,
            service: service.acquire(),
            queue,
            registry: self.weak.clone(),
        })
    }

    /// Detach a subscriber. The last one leaving stops the service.
    pub fn remove_subscriber(&self, subscription: Subscription, reason: StopReason) {
        let mut reg = self.lock();
        subscription.queue.push(StreamingMessage::Stop(reason));
        subscription.queue.close();
        self.detach_locked(&mut reg, subscription.service.service(), subscription.id);
    }

    fn detach_locked(
        &self,
        reg: &mut RegistryGuard<'_, RegistryInner>,
        service: &Arc<Service>,
        id: u64,
    ) {
        let remaining = {
            let mut ctl = service.control(reg);
            let before = ctl.subscribers.len();
            ctl.subscribers.retain(|s| s.queue.id() != id);
            if ctl.subscribers.len() == before {
                return;
            }
            ctl.subscribers.len()
        };
        if let Some(queue) = service.stream().pad.detach(id) {
            queue.close();
        }
        debug!("[Registry] subscriber #{} detached, {} left", id, remaining);

        if remaining == 0 && !service.is_zombie() {
            self.stop_locked(reg, service, None);
        }
    }

    /// Highest weight among a service's subscribers.
    pub fn max_subscriber_weight(&self, service: &Arc<Service>) -> Option<i32> {
        let reg = self.lock();
        let ctl = service.control(&reg);
        ctl.subscribers.iter().map(|s| s.weight).max()
    }

    /// Choose and start the best (service, instance) pair for a request.
    ///
    /// With `request` set only that service is considered; otherwise the
    /// services of `channel` are. Errored entries are skipped until their
    /// hold expires, and entries whose occupying weight exceeds `weight`
    /// are not eligible.
    pub fn find_instance<'a>(
        &self,
        request: Option<&Arc<Service>>,
        channel: Option<(&dyn ChannelServices, &str)>,
        list: &'a mut InstanceList,
        weight: i32,
    ) -> Result<&'a ServiceInstance, SelectError> {
        let candidates: Vec<Arc<Service>> = match (request, channel) {
            (Some(service), _) => vec![service.clone()],
            (None, Some((resolver, name))) => resolver.services(name),
            (None, None) => Vec::new(),
        };

        let mut reg = self.lock();
        let now = Instant::now();

        list.mark_all();
        for service in &candidates {
            if service.is_zombie() {
                continue;
            }
            if !service.control(&reg).enabled || !service.feed().is_enabled(service) {
                continue;
            }
            let mut offers = Vec::new();
            service.feed().enlist(service, &mut offers);
            for offer in &mut offers {
                offer.weight = offer.weight.max(holder_weight(&reg, service, &offer.holders));
                list.add(service, offer);
            }
        }
        list.sweep();

        let idx = list
            .select(weight, now, self.config.instance_error_hold)
            .ok_or(SelectError::NoServiceAvailable)?;
        let (service, instance, holders) = match list.get(idx) {
            Some(e) => (e.service.service().clone(), e.instance.clone(), e.holders.clone()),
            None => return Err(SelectError::NoServiceAvailable),
        };

        let running_here = service.state() == ServiceState::Running
            && service.control(&reg).instance.as_deref() == Some(instance.as_str());
        if !running_here {
            for uuid in holders {
                let Some(holder) = reg.find(uuid) else {
                    continue;
                };
                if !Arc::ptr_eq(&holder, &service) {
                    info!(
                        "[Registry] {} preempted on '{}' by {}",
                        holder.nicename(),
                        instance,
                        service.nicename()
                    );
                    self.stop_locked(&mut reg, &holder, Some(StopReason::Preempted));
                }
            }
            if let Err(source) = self.start_locked(&mut reg, &service, &instance) {
                if let Some(e) = list.get_mut(idx) {
                    e.error = Some(now);
                }
                return Err(SelectError::StartFailed { instance, source });
            }
        }
        drop(reg);

        match list.get_mut(idx) {
            Some(e) => {
                e.error = None;
                Ok(&*e)
            }
            None => Err(SelectError::NoServiceAvailable),
        }
    }

    /// Block until the service delivers packets or reports an error, at
    /// most `timeout`. On timeout `GRACEPERIOD` is raised.
    pub fn wait_for_status(&self, service: &Arc<Service>, timeout: Duration) -> StreamingStatus {
        let deadline = Instant::now() + timeout;
        let mut st = service.stream();
        loop {
            if st.status.intersects(StreamingStatus::PACKETS | StreamingStatus::ERRORS) {
                return st.status;
            }
            if st.wait_until(service.tss_cond(), deadline) {
                if !st.status.intersects(StreamingStatus::PACKETS | StreamingStatus::ERRORS) {
                    service.raise_status(&mut st, StreamingStatus::GRACEPERIOD);
                }
                return st.status;
            }
        }
    }

    /// Wait out the feed's grace period for a service just selected on
    /// `instance`. If no packets arrived the candidate is marked errored, so
    /// the next [`find_instance`](Self::find_instance) passes it over until
    /// the error hold expires.
    pub fn wait_for_instance(
        &self,
        list: &mut InstanceList,
        service: &Arc<Service>,
        instance: &str,
    ) -> StreamingStatus {
        let grace = {
            let _reg = self.lock();
            service.feed().grace_period(service)
        };
        let status = self.wait_for_status(service, grace);
        if !status.contains(StreamingStatus::PACKETS) {
            warn!(
                "[Registry] {}: no packets on '{}' within {:?} ({})",
                service.nicename(),
                instance,
                grace,
                status.text()
            );
            if let Some(entry) = list.find_mut(service, instance) {
                entry.error = Some(Instant::now());
            }
        }
        status
    }

    /// Run saves, restarts and detaches queued by the data plane. Returns
    /// the number of items processed.
    pub fn process_deferred(&self) -> usize {
        let items = self.deferred.drain();
        if items.is_empty() {
            return 0;
        }
        let mut reg = self.lock();
        let mut done = 0;
        for (uuid, work) in items {
            let Some(service) = reg.find(uuid) else {
                continue;
            };
            if service.is_zombie() {
                continue;
            }
            match work {
                DeferredWork::Save => {
                    let settings = self.service_save_locked(&reg, &service);
                    service.feed().config_save(&service, &settings);
                }
                DeferredWork::Restart => {
                    if let Err(e) = self.restart_locked(&mut reg, &service) {
                        warn!("[Registry] deferred restart of {} failed: {}", uuid, e);
                    }
                }
                DeferredWork::Detach(id) => self.detach_locked(&mut reg, &service, id),
            }
            done += 1;
        }
        done
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let reg = self.lock();
        reg.services
            .iter()
            .filter_map(|r| r.upgrade(&reg))
            .map(|service| {
                let ctl = service.control(&reg);
                let mut st = service.stream();
                let encrypted = st
                    .es
                    .iter()
                    .flat_map(|s| s.caids.iter())
                    .map(|c| c.caid)
                    .next();
                ServiceSnapshot {
                    uuid: service.uuid(),
                    nicename: st.nicename.clone(),
                    state: service.state(),
                    service_type: servicetype_text(ctl.service_type),
                    instance: ctl.instance.clone(),
                    started: ctl.start_time.map(|t| t.to_rfc3339()),
                    status: st.status,
                    status_text: st.status.text(),
                    subscribers: ctl.subscribers.len(),
                    streams: st.es.len(),
                    encrypted,
                    bitrate: st.rate.rate() * 8.0,
                    stats: st.stats,
                }
            })
            .collect()
    }

    /// Destroy every service and refuse further starts.
    pub fn shutdown(&self) {
        let mut reg = self.lock();
        reg.active = false;
        while let Some(service) = reg.services.last().map(|r| r.service().clone()) {
            self.destroy_locked(&mut reg, &service, true);
        }
        info!("[Registry] shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.lock().active {
            self.shutdown();
        }
        if let Some(runtime) = self.timers.take() {
            runtime.shutdown_background();
        }
    }
}

/// Highest subscriber weight among the services holding an instance, other
/// than `requester`.
fn holder_weight(
    reg: &RegistryGuard<'_, RegistryInner>,
    requester: &Arc<Service>,
    holders: &[Uuid],
) -> i32 {
    let mut weight = 0;
    for holder in holders.iter().filter_map(|uuid| reg.find(*uuid)) {
        if Arc::ptr_eq(&holder, requester) {
            continue;
        }
        let held = holder.control(reg).subscribers.iter().map(|s| s.weight).max();
        weight = weight.max(held.unwrap_or(0));
    }
    weight
}

fn current_components(es: &crate::es::EsTable) -> Vec<Component> {
    es.iter().map(|s| s.component()).collect()
}
