//! CWC client: resolves ECMs into control words through card servers.
//!
//! Requests are keyed by (mux, CAID, ECM PID) and shared by every service
//! that needs the same key. Only ECM table-id toggles (0x80/0x81) are sent
//! to the server. Control words go back to every interested service once
//! the client lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use cwc_protocol::{CardInfo, ClientMessage, MuxId, RejectCode, ServerMessage, MAX_ECM_SIZE};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::connection;
use super::{CaClient, CaService};
use crate::es::CaId;
use crate::service::StreamingStatus;

#[derive(Debug, Error)]
pub enum CwcError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("invalid server address '{0}'")]
    InvalidAddress(String),
}

/// One card server.
#[derive(Debug, Clone)]
pub struct CwcServerConfig {
    /// host:port
    pub address: String,
    pub username: String,
    pub password: String,
    /// CAIDs this server may be asked for, in addition to the cards it
    /// announces at login.
    pub caids: Vec<u16>,
    pub connect_timeout: Duration,
}

impl CwcServerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: String::new(),
            password: String::new(),
            caids: Vec::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CwcConfig {
    pub servers: Vec<CwcServerConfig>,
    /// A request unanswered for this long reports `NO_DESCRAMBLER`.
    pub key_timeout: Duration,
    pub keepalive_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// How often request timeouts are checked.
    pub housekeeping_interval: Duration,
}

impl Default for CwcConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            key_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(1),
        }
    }
}

/// Identity of a shared ECM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EcmKey {
    pub mux: MuxId,
    pub caid: u16,
    pub pid: u16,
}

#[derive(Debug)]
struct EcmRequest {
    interested: Vec<CaService>,
    server: Option<usize>,
    last_table_id: Option<u8>,
    /// Latest ECM not yet sent.
    pending: Option<Vec<u8>>,
    /// ECM sent and not answered yet, requeued if its server goes away.
    awaiting: Option<Vec<u8>>,
    sent_at: Option<Instant>,
    created: Instant,
    resolved: Option<Instant>,
    timed_out: bool,
}

impl EcmRequest {
    fn new(now: Instant) -> Self {
        Self {
            interested: Vec::new(),
            server: None,
            last_table_id: None,
            pending: None,
            awaiting: None,
            sent_at: None,
            created: now,
            resolved: None,
            timed_out: false,
        }
    }

    /// The reply to the outstanding ECM arrived.
    fn answered(&mut self) {
        self.awaiting = None;
        self.sent_at = None;
    }

    /// Start of the current wait for a control word. Before the first one
    /// that is creation; afterwards only a sent ECM waits.
    fn waiting_since(&self) -> Option<Instant> {
        match self.resolved {
            None => Some(self.created),
            Some(_) => self.sent_at,
        }
    }
}

#[derive(Debug)]
struct ServerSlot {
    address: String,
    caids: Vec<u16>,
    cards: Vec<CardInfo>,
    tx: Option<mpsc::Sender<ClientMessage>>,
    in_flight: HashMap<u32, EcmKey>,
    connected_since: Option<DateTime<Local>>,
    ecm_sent: u64,
    cw_received: u64,
    rejects: u64,
}

impl ServerSlot {
    fn is_connected(&self) -> bool {
        self.tx.is_some()
    }

    fn serves(&self, caid: u16) -> bool {
        self.caids.contains(&caid) || self.cards.iter().any(|c| c.caid == caid)
    }
}

#[derive(Debug, Default)]
struct CwcState {
    servers: Vec<ServerSlot>,
    requests: HashMap<EcmKey, EcmRequest>,
}

impl CwcState {
    fn pick_server(&self, caid: u16, exclude: Option<usize>) -> Option<usize> {
        self.servers
            .iter()
            .enumerate()
            .find(|(i, s)| Some(*i) != exclude && s.is_connected() && s.serves(caid))
            .map(|(i, _)| i)
    }

    fn add_interest(&mut self, key: EcmKey, service: &CaService, now: Instant) {
        if !self.requests.contains_key(&key) {
            let mut request = EcmRequest::new(now);
            request.server = self.pick_server(key.caid, None);
            debug!(
                "[CWC] new request {:04X}/{} on {} (server {:?})",
                key.caid, key.pid, key.mux, request.server
            );
            self.requests.insert(key, request);
        }
        if let Some(request) = self.requests.get_mut(&key) {
            if !request.interested.iter().any(|s| s.uuid == service.uuid) {
                request.interested.push(service.clone());
            }
        }
    }

    fn remove_interest(&mut self, key: EcmKey, uuid: Uuid) {
        let Some(request) = self.requests.get_mut(&key) else {
            return;
        };
        request.interested.retain(|s| s.uuid != uuid);
        if request.interested.is_empty() {
            let server = request.server;
            self.requests.remove(&key);
            if let Some(slot) = server.and_then(|i| self.servers.get_mut(i)) {
                slot.in_flight.retain(|_, k| *k != key);
            }
            debug!("[CWC] dropped request {:04X}/{} on {}", key.caid, key.pid, key.mux);
        }
    }

    /// Send the pending ECM of `key`, if it has one and a connected server.
    fn send_pending(&mut self, key: EcmKey, seq: u32) {
        let Some(request) = self.requests.get_mut(&key) else {
            return;
        };
        let Some(slot) = request.server.and_then(|i| self.servers.get_mut(i)) else {
            return;
        };
        let Some(tx) = slot.tx.as_ref() else {
            return;
        };
        let Some(ecm) = request.pending.take() else {
            return;
        };
        let msg = ClientMessage::EcmRequest {
            seq,
            mux: key.mux,
            caid: key.caid,
            pid: key.pid,
            ecm: ecm.clone(),
        };
        match tx.try_send(msg) {
            Ok(()) => {
                slot.in_flight.insert(seq, key);
                slot.ecm_sent += 1;
                request.awaiting = Some(ecm);
                request.sent_at = Some(Instant::now());
            }
            Err(mpsc::error::TrySendError::Full(ClientMessage::EcmRequest { ecm, .. })) => {
                warn!("[CWC] {}: request queue full", slot.address);
                request.pending = Some(ecm);
            }
            Err(_) => {
                slot.tx = None;
            }
        }
    }
}

pub(crate) struct CwcShared {
    config: CwcConfig,
    state: Mutex<CwcState>,
    next_seq: AtomicU32,
}

impl CwcShared {
    pub(crate) fn config(&self) -> &CwcConfig {
        &self.config
    }

    fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// A connection logged in: claim requests nobody is serving and send
    /// what they have pending.
    pub(crate) fn connection_up(&self, index: usize, cards: Vec<CardInfo>, tx: mpsc::Sender<ClientMessage>) {
        let mut state = self.state.lock();
        let Some(slot) = state.servers.get_mut(index) else {
            return;
        };
        slot.cards = cards;
        slot.tx = Some(tx);
        slot.connected_since = Some(Local::now());
        let slot_caids: Vec<u16> = slot
            .caids
            .iter()
            .copied()
            .chain(slot.cards.iter().map(|c| c.caid))
            .collect();

        let claimed: Vec<EcmKey> = state
            .requests
            .iter_mut()
            .filter(|(key, r)| r.server.is_none() && slot_caids.contains(&key.caid))
            .map(|(key, r)| {
                r.server = Some(index);
                *key
            })
            .collect();
        for key in claimed {
            let seq = self.next_seq();
            state.send_pending(key, seq);
        }
    }

    /// A connection went away: requeue its requests on another server.
    /// ECMs it never answered go out again.
    pub(crate) fn connection_lost(&self, index: usize) {
        let mut state = self.state.lock();
        let Some(slot) = state.servers.get_mut(index) else {
            return;
        };
        if slot.tx.take().is_some() {
            info!("[CWC] {}: disconnected", slot.address);
        }
        slot.connected_since = None;
        let unanswered: Vec<EcmKey> = slot.in_flight.drain().map(|(_, key)| key).collect();
        for key in unanswered {
            if let Some(request) = state.requests.get_mut(&key) {
                if request.pending.is_none() {
                    request.pending = request.awaiting.take();
                }
                request.sent_at = None;
            }
        }

        let orphaned: Vec<EcmKey> = state
            .requests
            .iter()
            .filter(|(_, r)| r.server == Some(index))
            .map(|(k, _)| *k)
            .collect();
        for key in orphaned {
            let server = state.pick_server(key.caid, Some(index));
            if let Some(request) = state.requests.get_mut(&key) {
                request.server = server;
                request.last_table_id = None;
            }
            if server.is_some() {
                let seq = self.next_seq();
                state.send_pending(key, seq);
            }
        }
    }

    pub(crate) fn handle_reply(&self, index: usize, msg: ServerMessage) {
        match msg {
            ServerMessage::ControlWord { seq, even, odd } => {
                let (key, targets) = {
                    let mut state = self.state.lock();
                    let Some(slot) = state.servers.get_mut(index) else {
                        return;
                    };
                    let Some(key) = slot.in_flight.remove(&seq) else {
                        trace!("[CWC] stale control word #{}", seq);
                        return;
                    };
                    slot.cw_received += 1;
                    let Some(request) = state.requests.get_mut(&key) else {
                        return;
                    };
                    request.answered();
                    request.resolved = Some(Instant::now());
                    request.timed_out = false;
                    (key, request.interested.clone())
                };
                for target in &targets {
                    target.deliver_key(key.pid, even.as_deref(), odd.as_deref());
                }
                trace!("[CWC] control word for {:04X}/{} to {} service(s)", key.caid, key.pid, targets.len());
            }
            ServerMessage::EcmReject { seq, code } => {
                let code = RejectCode::from(code);
                let targets = {
                    let mut state = self.state.lock();
                    let Some(slot) = state.servers.get_mut(index) else {
                        return;
                    };
                    let Some(key) = slot.in_flight.remove(&seq) else {
                        return;
                    };
                    slot.rejects += 1;
                    debug!("[CWC] {}: ECM {:04X}/{} rejected ({:?})", slot.address, key.caid, key.pid, code);
                    if let Some(request) = state.requests.get_mut(&key) {
                        request.answered();
                    }
                    if !code.is_denial() {
                        return;
                    }
                    state
                        .requests
                        .get(&key)
                        .map(|r| r.interested.clone())
                        .unwrap_or_default()
                };
                for target in &targets {
                    warn!("[CWC] {}: access denied", target.nicename);
                    target.raise_status(StreamingStatus::NO_ACCESS);
                }
            }
            ServerMessage::KeepaliveAck => trace!("[CWC] keepalive ack"),
            ServerMessage::LoginAck { .. } => debug!("[CWC] unexpected login reply"),
        }
    }

    fn check_timeouts(&self, now: Instant) {
        let targets: Vec<CaService> = {
            let mut state = self.state.lock();
            let unassigned: Vec<EcmKey> = state
                .requests
                .iter()
                .filter(|(_, r)| r.server.is_none())
                .map(|(k, _)| *k)
                .collect();
            for key in unassigned {
                let Some(server) = state.pick_server(key.caid, None) else {
                    continue;
                };
                if let Some(request) = state.requests.get_mut(&key) {
                    request.server = Some(server);
                }
                let seq = self.next_seq();
                state.send_pending(key, seq);
            }

            let key_timeout = self.config.key_timeout;
            let mut targets = Vec::new();
            for (key, request) in state.requests.iter_mut() {
                let expired = request
                    .waiting_since()
                    .is_some_and(|since| now.saturating_duration_since(since) >= key_timeout);
                if expired && !request.timed_out {
                    request.timed_out = true;
                    warn!(
                        "[CWC] no control word for {:04X}/{} on {} within {:?}",
                        key.caid, key.pid, key.mux, key_timeout
                    );
                    targets.extend(request.interested.iter().cloned());
                }
            }
            targets
        };
        for target in &targets {
            target.raise_status(StreamingStatus::NO_DESCRAMBLER);
        }
    }
}

/// Status of one card server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub address: String,
    pub connected: bool,
    pub connected_since: Option<String>,
    pub cards: Vec<CardInfo>,
    pub in_flight: usize,
    pub ecm_sent: u64,
    pub cw_received: u64,
    pub rejects: u64,
}

/// Status of one shared request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub key: EcmKey,
    pub services: usize,
    pub server: Option<String>,
    pub resolved: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CwcStatus {
    pub servers: Vec<ServerStatus>,
    pub requests: Vec<RequestStatus>,
}

/// The CWC client. Owns its own runtime for the server connections.
pub struct CwcClient {
    shared: Arc<CwcShared>,
    runtime: Mutex<Option<Runtime>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CwcClient {
    pub fn new(config: CwcConfig) -> Result<Arc<Self>, CwcError> {
        for server in &config.servers {
            if server.address.trim().is_empty() || !server.address.contains(':') {
                return Err(CwcError::InvalidAddress(server.address.clone()));
            }
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cwc")
            .enable_all()
            .build()?;

        let servers = config
            .servers
            .iter()
            .map(|s| ServerSlot {
                address: s.address.clone(),
                caids: s.caids.clone(),
                cards: Vec::new(),
                tx: None,
                in_flight: HashMap::new(),
                connected_since: None,
                ecm_sent: 0,
                cw_received: 0,
                rejects: 0,
            })
            .collect();

        let shared = Arc::new(CwcShared {
            config: config.clone(),
            state: Mutex::new(CwcState {
                servers,
                ..CwcState::default()
            }),
            next_seq: AtomicU32::new(1),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for (index, server) in config.servers.iter().enumerate() {
            runtime.spawn(connection::run_server(
                shared.clone(),
                index,
                server.clone(),
                shutdown_rx.clone(),
            ));
        }

        {
            let shared = shared.clone();
            let mut shutdown = shutdown_rx;
            let period = config.housekeeping_interval;
            runtime.spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = tick.tick() => shared.check_timeouts(Instant::now()),
                        _ = shutdown.changed() => break,
                    }
                }
            });
        }

        info!("[CWC] client started with {} server(s)", config.servers.len());
        Ok(Arc::new(Self {
            shared,
            runtime: Mutex::new(Some(runtime)),
            shutdown_tx,
        }))
    }

    /// Raise `NO_DESCRAMBLER` on services whose request stayed unanswered
    /// past the key timeout.
    pub fn check_timeouts(&self, now: Instant) {
        self.shared.check_timeouts(now);
    }

    /// Number of distinct (mux, CAID, PID) requests.
    pub fn outstanding_requests(&self) -> usize {
        self.shared.state.lock().requests.len()
    }

    /// Number of services sharing a request.
    pub fn request_refcount(&self, mux: MuxId, caid: u16, pid: u16) -> Option<usize> {
        self.shared
            .state
            .lock()
            .requests
            .get(&EcmKey { mux, caid, pid })
            .map(|r| r.interested.len())
    }

    pub fn status(&self) -> CwcStatus {
        let state = self.shared.state.lock();
        CwcStatus {
            servers: state
                .servers
                .iter()
                .map(|s| ServerStatus {
                    address: s.address.clone(),
                    connected: s.is_connected(),
                    connected_since: s.connected_since.map(|t| t.to_rfc3339()),
                    cards: s.cards.clone(),
                    in_flight: s.in_flight.len(),
                    ecm_sent: s.ecm_sent,
                    cw_received: s.cw_received,
                    rejects: s.rejects,
                })
                .collect(),
            requests: state
                .requests
                .iter()
                .map(|(key, r)| RequestStatus {
                    key: *key,
                    services: r.interested.len(),
                    server: r
                        .server
                        .and_then(|i| state.servers.get(i))
                        .map(|s| s.address.clone()),
                    resolved: r.resolved.is_some(),
                    timed_out: r.timed_out,
                })
                .collect(),
        }
    }

    /// Close every connection and stop the runtime.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            info!("[CWC] client stopped");
        }
    }
}

impl Drop for CwcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CaClient for CwcClient {
    fn service_start(&self, service: &CaService, ca: &[CaId]) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        for c in ca {
            let key = EcmKey {
                mux: service.mux,
                caid: c.caid,
                pid: c.pid,
            };
            state.add_interest(key, service, now);
        }
    }

    fn service_stop(&self, service: &CaService) {
        let mut state = self.shared.state.lock();
        let keys: Vec<EcmKey> = state
            .requests
            .iter()
            .filter(|(_, r)| r.interested.iter().any(|s| s.uuid == service.uuid))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            state.remove_interest(key, service.uuid);
        }
    }

    fn caid_update(&self, service: &CaService, caid: u16, pid: u16, valid: bool) {
        let key = EcmKey {
            mux: service.mux,
            caid,
            pid,
        };
        let mut state = self.shared.state.lock();
        if valid {
            state.add_interest(key, service, Instant::now());
        } else {
            state.remove_interest(key, service.uuid);
        }
    }

    fn ecm_input(&self, service: &CaService, caid: u16, pid: u16, section: &[u8]) {
        let Some(&table_id) = section.first() else {
            return;
        };
        if !matches!(table_id, 0x80 | 0x81) || section.len() > MAX_ECM_SIZE {
            return;
        }
        let key = EcmKey {
            mux: service.mux,
            caid,
            pid,
        };
        let mut state = self.shared.state.lock();
        let Some(request) = state.requests.get_mut(&key) else {
            return;
        };
        if request.last_table_id == Some(table_id) {
            return;
        }
        request.last_table_id = Some(table_id);
        request.pending = Some(section.to_vec());
        let seq = self.shared.next_seq();
        state.send_pending(key, seq);
    }
}
