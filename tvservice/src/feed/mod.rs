//! Feeds: where a service's transport stream comes from.
//!
//! A feed enlists the instances that could deliver a service, starts and
//! stops delivery on one of them, and persists the service's settings.
//! Every method is called with the registry lock held; a feed must not
//! call back into the registry from them. Delivery threads hand bytes to
//! [`Service::input`](crate::service::Service::input).

pub mod file;
pub mod synthetic;
pub mod tuner;

pub use file::FileFeed;
pub use synthetic::SyntheticFeed;
pub use tuner::{TsSource, TunerFeed};

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::service::{Service, ServiceRef, ServiceSettings};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("instance '{0}' is busy")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// One way a feed could deliver a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceOffer {
    pub instance: String,
    /// Higher is preferred.
    pub prio: i32,
    /// Weight of whatever currently occupies the instance. A request with a
    /// lower weight cannot take it over.
    pub weight: i32,
    /// Services currently running on the instance. The registry raises
    /// `weight` to their heaviest subscriber and stops them when the
    /// instance is taken over.
    pub holders: Vec<Uuid>,
}

impl InstanceOffer {
    pub fn new(instance: impl Into<String>, prio: i32, weight: i32) -> Self {
        Self {
            instance: instance.into(),
            prio,
            weight,
            holders: Vec::new(),
        }
    }

    pub fn held_by(mut self, holders: Vec<Uuid>) -> Self {
        self.holders = holders;
        self
    }
}

/// Where a service physically comes from, for naming and status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub adapter: Option<String>,
    pub network: Option<String>,
    pub mux: Option<String>,
    pub provider: Option<String>,
    pub service: Option<String>,
}

/// Backend of a service.
pub trait Feed: Send + Sync {
    fn name(&self) -> &str;

    /// Feed-level veto on top of the service's own enabled flag.
    fn is_enabled(&self, _service: &Service) -> bool {
        true
    }

    /// Append the instances that could deliver `service`.
    fn enlist(&self, service: &Service, offers: &mut Vec<InstanceOffer>);

    /// Start delivery on `instance`. The feed keeps `service` for as long
    /// as it delivers.
    fn start_feed(&self, service: ServiceRef, instance: &str) -> Result<(), FeedError>;

    /// The service is already running on the instance it was asked to start
    /// on.
    fn refresh_feed(&self, _service: &Service) {}

    /// Stop delivery. Must not return before the delivery thread has
    /// stopped calling into the service.
    fn stop_feed(&self, service: &Service);

    /// How long a fresh start may go without input before it is reported.
    fn grace_period(&self, _service: &Service) -> Duration {
        Duration::from_secs(10)
    }

    /// Persist settings.
    fn config_save(&self, service: &Service, settings: &ServiceSettings);

    fn set_source_info(&self, service: &Service, info: &mut SourceInfo);

    /// The service is being destroyed. `persist` keeps stored settings;
    /// otherwise they are removed.
    fn delete(&self, _service: &Service, _persist: bool) {}

    /// Channel name the feed knows the service by, if any.
    fn channel_name(&self, _service: &Service) -> Option<String> {
        None
    }
}
