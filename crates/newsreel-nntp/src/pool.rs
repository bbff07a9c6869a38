//! Per-provider connection pooling and the priority-ordered pool set.
//!
//! Each pool owns two bounded resources: a slot semaphore sized to the
//! provider's connection budget (a held permit is an open connection) and an
//! idle deque of authenticated clients ready for reuse. A background reaper
//! closes connections that idle past their keep-alive window.

use crate::client::NntpClient;
use crate::config::ProviderConfig;
use crate::error::{NntpError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Reaper wake-up cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(15);
/// Idle connections older than this are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of a pool's accounting, used by diagnostics and tests.
///
/// Invariant: `idle + in_use() == max_connections − available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub available: usize,
    pub max_connections: usize,
}

impl PoolStats {
    /// Connections currently handed out to callers.
    pub fn in_use(&self) -> usize {
        self.max_connections - self.available - self.idle
    }
}

/// Tracks one slot of a pool's connection budget.
///
/// Dropping the guard frees the slot, which is what happens on
/// cancellation, timeouts, and any error path that loses the client.
/// Returning the client with [`ConnectionPool::put`] disarms it first.
#[must_use = "dropping the guard releases the connection slot"]
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<Semaphore>,
    armed: bool,
}

impl SlotGuard {
    fn new(slots: Arc<Semaphore>) -> Self {
        Self { slots, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slots.add_permits(1);
        }
    }
}

/// Connection pool for one provider.
pub struct ConnectionPool {
    config: Arc<ProviderConfig>,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<NntpClient>>,
    idle_notify: Notify,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    /// Create a pool and start its reaper. Requires a tokio runtime.
    pub fn new(config: ProviderConfig) -> Arc<Self> {
        let max = config.max_connections.max(1);
        let pool = Arc::new(Self {
            config: Arc::new(config),
            slots: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(VecDeque::with_capacity(max)),
            idle_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        Self::spawn_reaper(&pool);
        pool
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections.max(1)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            available: self.slots.available_permits(),
            max_connections: self.max_connections(),
        }
    }

    fn guard(&self) -> SlotGuard {
        SlotGuard::new(self.slots.clone())
    }

    /// Non-blocking acquisition: prefer an idle client, else dial within the
    /// connection budget.
    ///
    /// `Ok(None)` means the budget is exhausted; `Err` means a dial or
    /// authentication failure (the slot is returned).
    pub async fn try_get(&self) -> Result<Option<(NntpClient, SlotGuard)>> {
        if self.shutdown.is_cancelled() {
            return Err(NntpError::PoolClosed);
        }
        if let Some(client) = self.pop_idle() {
            return Ok(Some((client, self.guard())));
        }
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            return Ok(None);
        };
        match NntpClient::connect(self.config.clone()).await {
            Ok(client) => {
                permit.forget();
                Ok(Some((client, self.guard())))
            }
            Err(e) => {
                warn!(
                    provider = self.config.display_name(),
                    error = %e,
                    "dial failed"
                );
                drop(permit);
                Err(e)
            }
        }
    }

    /// Blocking acquisition: wait for whichever arrives first, an idle
    /// client or a free slot. Cancellable via `token`.
    pub async fn get(&self, token: &CancellationToken) -> Result<(NntpClient, SlotGuard)> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(NntpError::PoolClosed);
            }
            if let Some(client) = self.pop_idle() {
                return Ok((client, self.guard()));
            }

            // Arm the notification before the re-check so a concurrent put
            // cannot slip between them unseen.
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(client) = self.pop_idle() {
                return Ok((client, self.guard()));
            }

            tokio::select! {
                permit = self.slots.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| NntpError::PoolClosed)?;
                    match NntpClient::connect(self.config.clone()).await {
                        Ok(client) => {
                            permit.forget();
                            return Ok((client, self.guard()));
                        }
                        Err(e) => {
                            warn!(
                                provider = self.config.display_name(),
                                error = %e,
                                "dial failed"
                            );
                            return Err(e);
                        }
                    }
                }
                () = &mut notified => {}
                () = token.cancelled() => return Err(NntpError::Cancelled),
            }
        }
    }

    /// Return a healthy connection for reuse, disarming its guard.
    pub fn put(&self, mut client: NntpClient, mut guard: SlotGuard) {
        if self.shutdown.is_cancelled() {
            return; // guard drop frees the slot
        }
        client.touch();
        {
            let mut idle = self.idle.lock();
            if idle.len() >= self.max_connections() {
                return;
            }
            guard.disarm();
            idle.push_back(client);
        }
        self.idle_notify.notify_one();
    }

    /// Drop a broken connection; its guard frees the slot.
    pub fn discard(&self, client: NntpClient, guard: SlotGuard) {
        drop(client);
        drop(guard);
    }

    fn pop_idle(&self) -> Option<NntpClient> {
        self.idle.lock().pop_front()
    }

    /// Drain the idle deque once, closing connections past the keep-alive
    /// window and returning the rest.
    async fn reap_idle(&self) {
        let mut stale = Vec::new();
        {
            let mut idle = self.idle.lock();
            for _ in 0..idle.len() {
                let Some(client) = idle.pop_front() else {
                    break;
                };
                if client.idle_for() > IDLE_TIMEOUT {
                    stale.push(client);
                } else {
                    idle.push_back(client);
                }
            }
        }
        for client in stale {
            trace!(
                provider = self.config.display_name(),
                "reaping idle connection"
            );
            client.quit().await;
            self.slots.add_permits(1);
        }
    }

    fn spawn_reaper(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let token = pool.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let Some(pool) = weak.upgrade() else { break };
                        pool.reap_idle().await;
                    }
                    () = token.cancelled() => break,
                }
            }
            debug!("pool reaper stopped");
        });
    }

    /// Close the pool: stop the reaper, fail waiters, drain idle clients.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.slots.close();
        let drained: Vec<NntpClient> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        for client in drained {
            client.quit().await;
        }
        self.idle_notify.notify_waiters();
        debug!(provider = self.config.display_name(), "pool closed");
    }
}

/// Priority-ordered set of provider pools.
///
/// The segment loader spills across the set: each download attempt first
/// polls every untried pool non-blockingly in priority order, then blocks on
/// the first untried one. Pools that fail to dial are marked tried for the
/// rest of the attempt.
pub struct PoolSet {
    pools: Vec<Arc<ConnectionPool>>,
}

impl PoolSet {
    pub fn new(pools: Vec<Arc<ConnectionPool>>) -> Self {
        Self { pools }
    }

    /// Build pools from provider configurations, preserving order.
    pub fn from_configs(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self::new(configs.into_iter().map(ConnectionPool::new).collect())
    }

    pub fn pools(&self) -> &[Arc<ConnectionPool>] {
        &self.pools
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Aggregate connection budget across providers; drives prefetch sizing.
    pub fn total_connections(&self) -> usize {
        self.pools.iter().map(|p| p.max_connections()).sum()
    }

    /// Spillover acquisition for one download attempt.
    ///
    /// `tried` carries per-pool state across calls within the attempt; pools
    /// that fail dial/auth are marked there and skipped. `Ok(None)` means
    /// every pool has been tried without a connection-level failure; when
    /// dial or authentication failures exhausted the set, the last of them
    /// is returned so callers can attribute the attempt's outcome.
    pub async fn acquire(
        &self,
        tried: &mut [bool],
        token: &CancellationToken,
    ) -> Result<Option<(usize, NntpClient, SlotGuard)>> {
        debug_assert_eq!(tried.len(), self.pools.len());
        let mut last_failure: Option<NntpError> = None;
        loop {
            let mut first_untried = None;
            for (idx, pool) in self.pools.iter().enumerate() {
                if tried[idx] {
                    continue;
                }
                if first_untried.is_none() {
                    first_untried = Some(idx);
                }
                match pool.try_get().await {
                    Ok(Some((client, guard))) => return Ok(Some((idx, client, guard))),
                    Ok(None) => {}
                    Err(NntpError::Cancelled) => return Err(NntpError::Cancelled),
                    Err(e) => {
                        tried[idx] = true;
                        last_failure = Some(e);
                        if first_untried == Some(idx) {
                            first_untried = None;
                        }
                    }
                }
            }

            let Some(idx) = first_untried else {
                return match last_failure {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            };
            match self.pools[idx].get(token).await {
                Ok((client, guard)) => return Ok(Some((idx, client, guard))),
                Err(NntpError::Cancelled) => return Err(NntpError::Cancelled),
                Err(e) => {
                    warn!(pool = idx, error = %e, "pool acquisition failed");
                    tried[idx] = true;
                    last_failure = Some(e);
                }
            }
        }
    }

    /// Close every pool.
    pub async fn close(&self) {
        for pool in &self.pools {
            pool.close().await;
        }
    }
}
