//! Receive timer: raises `TIMEOUT` when a started service delivers nothing.
//!
//! Timers are sleeping tasks on the registry's timer runtime. Each start
//! bumps the service's start epoch, so a timer that fires after the service
//! was restarted finds a different epoch and does nothing.

use std::sync::Weak;
use std::time::Duration;

use log::trace;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::Service;

#[derive(Debug)]
pub(crate) struct ReceiveTimer {
    task: JoinHandle<()>,
}

impl ReceiveTimer {
    pub(crate) fn arm(runtime: &Handle, service: Weak<Service>, epoch: u64, timeout: Duration) -> Self {
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(service) = service.upgrade() {
                service.check_receive_timeout(epoch);
            }
        });
        Self { task }
    }

    pub(crate) fn cancel(self) {
        self.task.abort();
        trace!("[Service] receive timer cancelled");
    }
}

impl Drop for ReceiveTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
