//! Blocking request/response over the asynchronous relay queue.
//!
//! A dispatch pushes one command on the device's outbound channel and waits
//! for the next entry on its inbound channel. Replies are matched on device
//! identity only: anything else popping the same inbound channel (another
//! process, a manual tool) can take a reply meant for this caller, and the
//! caller then sees `NoResponse`.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::settings::DispatchConfig;
use crate::config::DispatchLockMode;
use crate::error::AppError;
use crate::models::terminal::CMD_REBOOT;
use crate::models::{Envelope, EnvelopeKind};
use crate::services::relay_queue::{Direction, RelayQueue};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The terminal's answer, as it arrived on the inbound channel
    Reply(Envelope),
    /// Sent a command the terminal never answers (reboot)
    NoResponseExpected,
}

#[derive(Clone)]
enum DispatchLocks {
    Global(Arc<Mutex<()>>),
    PerDevice(Arc<DashMap<String, Arc<Mutex<()>>>>),
}

impl DispatchLocks {
    fn new(mode: DispatchLockMode) -> Self {
        match mode {
            DispatchLockMode::Global => DispatchLocks::Global(Arc::new(Mutex::new(()))),
            DispatchLockMode::PerDevice => DispatchLocks::PerDevice(Arc::new(DashMap::new())),
        }
    }

    fn lock_for(&self, device_sn: &str) -> Arc<Mutex<()>> {
        match self {
            DispatchLocks::Global(lock) => lock.clone(),
            DispatchLocks::PerDevice(locks) => locks.entry(device_sn.to_string()).or_default().clone(),
        }
    }

    /// Forgets a device's lock once no dispatch holds or waits on it.
    fn release_idle(&self, device_sn: &str) {
        if let DispatchLocks::PerDevice(locks) = self {
            locks.remove_if(device_sn, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    #[cfg(test)]
    fn tracked_devices(&self) -> usize {
        match self {
            DispatchLocks::Global(_) => 0,
            DispatchLocks::PerDevice(locks) => locks.len(),
        }
    }
}

#[derive(Clone)]
pub struct DispatchBridge {
    queue: RelayQueue,
    locks: DispatchLocks,
    wait_timeout: Duration,
    lock_timeout: Duration,
}

impl DispatchBridge {
    pub fn new(queue: RelayQueue, config: &DispatchConfig) -> Self {
        Self {
            queue,
            locks: DispatchLocks::new(config.lock_mode),
            wait_timeout: config.wait_timeout,
            lock_timeout: config.lock_timeout,
        }
    }

    pub fn default_wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn queue(&self) -> &RelayQueue {
        &self.queue
    }

    /// Held until the returned guard drops, on every exit path.
    async fn acquire(&self, device_sn: &str) -> Result<OwnedMutexGuard<()>, AppError> {
        let lock = self.locks.lock_for(device_sn);
        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!(device_sn = %device_sn, "Dispatch lock wait exceeded");
                AppError::TooManyRequests(format!(
                    "Another dispatch is still in progress for {} after {}ms",
                    device_sn,
                    self.lock_timeout.as_millis()
                ))
            })
    }

    pub async fn dispatch(
        &self,
        device_sn: &str,
        command: Envelope,
        wait_timeout: Duration,
    ) -> Result<DispatchOutcome, AppError> {
        if let EnvelopeKind::Reply(ret) = command.kind() {
            return Err(AppError::Validation(format!(
                "Only commands can be dispatched (got ret {})",
                ret
            )));
        }

        let outcome = self.dispatch_locked(device_sn, command, wait_timeout).await;
        self.locks.release_idle(device_sn);
        outcome
    }

    async fn dispatch_locked(
        &self,
        device_sn: &str,
        command: Envelope,
        wait_timeout: Duration,
    ) -> Result<DispatchOutcome, AppError> {
        let _guard = self.acquire(device_sn).await?;
        debug!(device_sn = %device_sn, kind = %command.kind(), "Dispatch lock acquired");

        self.queue.enqueue(device_sn, Direction::Outbound, &command).await?;

        if command.is_command(CMD_REBOOT) {
            info!(device_sn = %device_sn, "Reboot queued; no reply expected");
            return Ok(DispatchOutcome::NoResponseExpected);
        }

        match self.queue.wait_dequeue(device_sn, Direction::Inbound, wait_timeout).await {
            Ok(Some(reply)) => {
                info!(
                    device_sn = %device_sn,
                    command = %command.kind(),
                    reply = %reply.kind(),
                    "Dispatch answered"
                );
                Ok(DispatchOutcome::Reply(reply))
            }
            Ok(None) => {
                self.purge_outbound(device_sn).await;
                warn!(
                    device_sn = %device_sn,
                    command = %command.kind(),
                    wait_ms = wait_timeout.as_millis() as u64,
                    "Dispatch timed out without a reply"
                );
                Err(AppError::NoResponse(format!(
                    "No response from {} within {}ms",
                    device_sn,
                    wait_timeout.as_millis()
                )))
            }
            Err(e) => {
                self.purge_outbound(device_sn).await;
                Err(e.into())
            }
        }
    }

    /// Best-effort: the command may already be with the terminal.
    async fn purge_outbound(&self, device_sn: &str) {
        match self.queue.purge(device_sn, Direction::Outbound).await {
            Ok(removed) => debug!(device_sn = %device_sn, removed, "Outbound channel purged after failed dispatch"),
            Err(e) => warn!(device_sn = %device_sn, error = %e, "Could not purge outbound channel"),
        }
    }
}
