//! Instance arbitration: choosing which (service, instance) pair serves a
//! request.
//!
//! Candidates are kept in an [`InstanceList`] across calls so error marks
//! survive between attempts. Each call marks every entry, re-enlists the
//! offers of the candidate services and sweeps whatever was not offered
//! again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use super::{Service, ServiceRef, StartError};
use crate::feed::InstanceOffer;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no service available")]
    NoServiceAvailable,

    #[error("failed to start instance '{instance}': {source}")]
    StartFailed {
        instance: String,
        #[source]
        source: StartError,
    },
}

/// Resolves a channel name to its candidate services.
///
/// Called without the registry lock held.
pub trait ChannelServices {
    fn services(&self, channel: &str) -> Vec<Arc<Service>>;
}

/// A candidate (service, instance) pair.
#[derive(Debug)]
pub struct ServiceInstance {
    pub service: ServiceRef,
    pub instance: String,
    pub prio: i32,
    pub weight: i32,
    /// Services that have to be stopped to start this pair.
    pub holders: Vec<Uuid>,
    /// When the last start attempt on this pair failed.
    pub error: Option<Instant>,
    mark: bool,
}

impl ServiceInstance {
    pub fn is_errored(&self, now: Instant, hold: Duration) -> bool {
        matches!(self.error, Some(t) if now.saturating_duration_since(t) < hold)
    }
}

/// Candidate list kept by a requester between arbitration rounds.
#[derive(Debug, Default)]
pub struct InstanceList {
    entries: Vec<ServiceInstance>,
}

impl InstanceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ServiceInstance] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, service: &Arc<Service>, instance: &str) -> Option<&ServiceInstance> {
        self.entries
            .iter()
            .find(|e| e.service.ptr_eq(service) && e.instance == instance)
    }

    pub fn find_mut(
        &mut self,
        service: &Arc<Service>,
        instance: &str,
    ) -> Option<&mut ServiceInstance> {
        self.entries
            .iter_mut()
            .find(|e| e.service.ptr_eq(service) && e.instance == instance)
    }

    pub(crate) fn mark_all(&mut self) {
        for e in &mut self.entries {
            e.mark = true;
        }
    }

    /// Add or refresh a candidate. Existing entries keep their error mark.
    pub(crate) fn add(&mut self, service: &Arc<Service>, offer: &InstanceOffer) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.service.ptr_eq(service) && e.instance == offer.instance)
        {
            Some(e) => {
                e.prio = offer.prio;
                e.weight = offer.weight;
                e.holders.clone_from(&offer.holders);
                e.mark = false;
            }
            None => self.entries.push(ServiceInstance {
                service: service.acquire(),
                instance: offer.instance.clone(),
                prio: offer.prio,
                weight: offer.weight,
                holders: offer.holders.clone(),
                error: None,
                mark: false,
            }),
        }
    }

    /// Drop entries that were not re-enlisted.
    pub(crate) fn sweep(&mut self) {
        self.entries.retain(|e| !e.mark);
    }

    /// Pick the best eligible entry: highest priority, then highest weight,
    /// then earliest added. Entries in error hold and entries whose weight
    /// exceeds the request weight are not eligible.
    pub(crate) fn select(&self, weight: i32, now: Instant, hold: Duration) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_errored(now, hold) || e.weight > weight {
                continue;
            }
            best = match best {
                Some(b) if (self.entries[b].prio, self.entries[b].weight) >= (e.prio, e.weight) => {
                    Some(b)
                }
                _ => Some(i),
            };
        }
        best
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&ServiceInstance> {
        self.entries.get(idx)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut ServiceInstance> {
        self.entries.get_mut(idx)
    }
}
