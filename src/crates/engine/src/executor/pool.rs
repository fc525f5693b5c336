//! Endpoint pools
//!
//! Each configured upstream address is handed to at most one in-flight
//! request at a time. Acquiring takes a [`EndpointLease`]; dropping the
//! lease returns the address.

use crate::{EngineError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Take an endpoint out of rotation after repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineConfig {
    /// Consecutive failed leases before the endpoint is benched
    pub failure_threshold: u32,

    /// How long a benched endpoint stays out, in seconds
    pub cooldown_secs: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

/// Snapshot of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub quarantined: usize,
    pub acquired_total: u64,
    pub released_total: u64,
    /// Acquire calls that came back without an endpoint
    pub rejected_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseOutcome {
    Unknown,
    Succeeded,
    Failed,
}

/// Bounded set of interchangeable upstream addresses.
///
/// Cloning is cheap and clones share state. Waiters are served in FIFO order.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<PoolInner>,
    acquire_timeout: Duration,
}

struct PoolInner {
    name: String,
    capacity: usize,
    idle: Mutex<VecDeque<String>>,
    // One permit per address in `idle`.
    permits: Semaphore,
    quarantine: Option<QuarantineConfig>,
    failures: Mutex<HashMap<String, u32>>,
    benched: Mutex<Vec<(String, Instant)>>,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl EndpointPool {
    /// Pool over `addresses`, all initially available.
    pub fn new<I, S>(name: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let idle: VecDeque<String> = addresses.into_iter().map(Into::into).collect();
        let capacity = idle.len();

        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                permits: Semaphore::new(capacity),
                idle: Mutex::new(idle),
                quarantine: None,
                failures: Mutex::new(HashMap::new()),
                benched: Mutex::new(Vec::new()),
                acquired_total: AtomicU64::new(0),
                released_total: AtomicU64::new(0),
                rejected_total: AtomicU64::new(0),
            }),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Wait used by callers that do not pick their own.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Enable quarantine of endpoints whose leases keep failing.
    ///
    /// Must be called before the pool is cloned or used.
    pub fn with_quarantine(self, config: QuarantineConfig) -> Self {
        let acquire_timeout = self.acquire_timeout;
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.quarantine = Some(config);
                Self {
                    inner: Arc::new(inner),
                    acquire_timeout,
                }
            }
            Err(inner) => {
                warn!(
                    pool = %inner.name,
                    "Quarantine must be configured before the pool is shared"
                );
                Self {
                    inner,
                    acquire_timeout,
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of configured addresses.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Addresses ready to be acquired right now.
    pub fn available(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Wait up to `timeout` for a free endpoint.
    ///
    /// A zero timeout succeeds only if an endpoint is free immediately.
    pub async fn acquire(&self, timeout: Duration) -> Result<EndpointLease> {
        self.inner.reclaim_benched();

        match tokio::time::timeout(timeout, self.inner.permits.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => return Err(self.unavailable("pool is closed")),
            Err(_) => {
                debug!(
                    pool = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Endpoint acquire timed out"
                );
                return Err(self.unavailable("all endpoints busy"));
            }
        }

        self.take_idle()
    }

    /// Take a free endpoint without waiting.
    pub fn try_acquire(&self) -> Result<EndpointLease> {
        self.inner.reclaim_benched();

        match self.inner.permits.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Err(self.unavailable("all endpoints busy")),
            Err(TryAcquireError::Closed) => return Err(self.unavailable("pool is closed")),
        }

        self.take_idle()
    }

    /// Return a leased endpoint. Equivalent to dropping the lease.
    pub fn release(&self, lease: EndpointLease) {
        drop(lease);
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available();
        let quarantined = self.inner.benched.lock().len();
        PoolStats {
            name: self.inner.name.clone(),
            capacity: self.inner.capacity,
            available,
            in_use: self.inner.capacity.saturating_sub(available + quarantined),
            quarantined,
            acquired_total: self.inner.acquired_total.load(Ordering::Relaxed),
            released_total: self.inner.released_total.load(Ordering::Relaxed),
            rejected_total: self.inner.rejected_total.load(Ordering::Relaxed),
        }
    }

    fn take_idle(&self) -> Result<EndpointLease> {
        let address = self.inner.idle.lock().pop_front();
        match address {
            Some(address) => {
                self.inner.acquired_total.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.inner.name, endpoint = %address, "Endpoint acquired");
                Ok(EndpointLease {
                    pool: self.inner.clone(),
                    address: Some(address),
                    outcome: LeaseOutcome::Unknown,
                })
            }
            None => Err(self.unavailable("permit granted with no idle endpoint")),
        }
    }

    fn unavailable(&self, reason: &str) -> EngineError {
        self.inner.rejected_total.fetch_add(1, Ordering::Relaxed);
        EngineError::EndpointUnavailable(format!("pool '{}': {}", self.inner.name, reason))
    }
}

impl fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl PoolInner {
    fn put_back(&self, address: String, outcome: LeaseOutcome) {
        self.released_total.fetch_add(1, Ordering::Relaxed);

        if let Some(config) = self.quarantine {
            let mut failures = self.failures.lock();
            match outcome {
                LeaseOutcome::Failed => {
                    let count = failures.entry(address.clone()).or_insert(0);
                    *count += 1;
                    if *count >= config.failure_threshold {
                        failures.remove(&address);
                        drop(failures);
                        warn!(
                            pool = %self.name,
                            endpoint = %address,
                            cooldown_secs = config.cooldown_secs,
                            "Endpoint quarantined after repeated failures"
                        );
                        let until = Instant::now() + Duration::from_secs(config.cooldown_secs);
                        self.benched.lock().push((address, until));
                        return;
                    }
                }
                LeaseOutcome::Succeeded => {
                    failures.remove(&address);
                }
                LeaseOutcome::Unknown => {}
            }
        }

        debug!(pool = %self.name, endpoint = %address, "Endpoint released");
        self.idle.lock().push_back(address);
        self.permits.add_permits(1);
    }

    fn reclaim_benched(&self) {
        if self.quarantine.is_none() {
            return;
        }

        let now = Instant::now();
        let ready: Vec<String> = {
            let mut benched = self.benched.lock();
            let (ready, still): (Vec<_>, Vec<_>) =
                benched.drain(..).partition(|(_, until)| *until <= now);
            *benched = still;
            ready.into_iter().map(|(address, _)| address).collect()
        };

        for address in ready {
            info!(pool = %self.name, endpoint = %address, "Endpoint back from quarantine");
            self.idle.lock().push_back(address);
            self.permits.add_permits(1);
        }
    }
}

/// Exclusive use of one endpoint address.
///
/// The address goes back to its pool when the lease is dropped, on every
/// exit path.
pub struct EndpointLease {
    pool: Arc<PoolInner>,
    address: Option<String>,
    outcome: LeaseOutcome,
}

impl EndpointLease {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or_default()
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Count this use against the endpoint's health.
    pub fn mark_failed(&mut self) {
        self.outcome = LeaseOutcome::Failed;
    }

    /// Reset the endpoint's failure count.
    pub fn mark_succeeded(&mut self) {
        self.outcome = LeaseOutcome::Succeeded;
    }
}

impl fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLease")
            .field("pool", &self.pool.name)
            .field("address", &self.address)
            .finish()
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        if let Some(address) = self.address.take() {
            self.pool.put_back(address, self.outcome);
        }
    }
}

/// Chooses between a short-input and a long-input pool.
#[derive(Debug, Clone)]
pub struct PoolRouter {
    short: EndpointPool,
    long: Option<EndpointPool>,
    long_input_threshold: usize,
}

impl PoolRouter {
    /// Route everything to one pool.
    pub fn single(pool: EndpointPool) -> Self {
        Self {
            short: pool,
            long: None,
            long_input_threshold: usize::MAX,
        }
    }

    /// Inputs longer than `threshold` characters go to `long`.
    pub fn split(short: EndpointPool, long: EndpointPool, threshold: usize) -> Self {
        Self {
            short,
            long: Some(long),
            long_input_threshold: threshold,
        }
    }

    pub fn select(&self, input_len: usize) -> &EndpointPool {
        match &self.long {
            Some(long) if input_len > self.long_input_threshold => long,
            _ => &self.short,
        }
    }

    pub fn pools(&self) -> impl Iterator<Item = &EndpointPool> {
        std::iter::once(&self.short).chain(self.long.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://10.0.0.{}:8080", i)).collect()
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = EndpointPool::new("glm", addresses(2));
        assert_eq!(pool.capacity(), 2);

        let lease = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(lease.address(), "http://10.0.0.0:8080");
        assert_eq!(pool.available(), 1);

        pool.release(lease);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_zero_timeout() {
        let pool = EndpointPool::new("glm", addresses(1));
        let _held = pool.acquire(Duration::ZERO).await.unwrap();

        let err = pool.acquire(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, EngineError::EndpointUnavailable(_)));
        assert!(pool.try_acquire().is_err());
        assert_eq!(pool.stats().rejected_total, 2);
    }

    #[tokio::test]
    async fn test_empty_pool_is_unavailable() {
        let pool = EndpointPool::new("empty", Vec::<String>::new());
        assert!(pool.acquire(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_released_endpoint() {
        let pool = EndpointPool::new("glm", addresses(1));
        let held = pool.acquire(Duration::ZERO).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.address(), "http://10.0.0.0:8080");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquirers_get_distinct_endpoints() {
        let pool = EndpointPool::new("glm", addresses(8));
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
                    let address = lease.address().to_string();
                    // Hold every lease until all have been granted.
                    barrier.wait().await;
                    address
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test]
    async fn test_quarantine_after_failures() {
        let pool = EndpointPool::new("glm", addresses(1)).with_quarantine(QuarantineConfig {
            failure_threshold: 2,
            cooldown_secs: 3600,
        });

        for _ in 0..2 {
            let mut lease = pool.acquire(Duration::ZERO).await.unwrap();
            lease.mark_failed();
        }

        assert_eq!(pool.available(), 0);
        assert_eq!(pool.stats().quarantined, 1);
        assert!(pool.acquire(Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_quarantine_reclaimed_after_cooldown() {
        let pool = EndpointPool::new("glm", addresses(1)).with_quarantine(QuarantineConfig {
            failure_threshold: 1,
            cooldown_secs: 0,
        });

        let mut lease = pool.acquire(Duration::ZERO).await.unwrap();
        lease.mark_failed();
        drop(lease);
        assert_eq!(pool.stats().quarantined, 1);

        let lease = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(lease.address(), "http://10.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let pool = EndpointPool::new("glm", addresses(1)).with_quarantine(QuarantineConfig {
            failure_threshold: 2,
            cooldown_secs: 3600,
        });

        let mut lease = pool.acquire(Duration::ZERO).await.unwrap();
        lease.mark_failed();
        drop(lease);
        let mut lease = pool.acquire(Duration::ZERO).await.unwrap();
        lease.mark_succeeded();
        drop(lease);
        let mut lease = pool.acquire(Duration::ZERO).await.unwrap();
        lease.mark_failed();
        drop(lease);

        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_failures_ignored_without_quarantine() {
        let pool = EndpointPool::new("glm", addresses(1));
        for _ in 0..10 {
            let mut lease = pool.acquire(Duration::ZERO).await.unwrap();
            lease.mark_failed();
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().released_total, 10);
    }

    #[test]
    fn test_router_threshold() {
        let router = PoolRouter::split(
            EndpointPool::new("short", addresses(1)),
            EndpointPool::new("long", addresses(1)),
            100,
        );
        assert_eq!(router.select(100).name(), "short");
        assert_eq!(router.select(101).name(), "long");

        let single = PoolRouter::single(EndpointPool::new("only", addresses(1)));
        assert_eq!(single.select(usize::MAX).name(), "only");
        assert_eq!(single.pools().count(), 1);
    }

    proptest! {
        #[test]
        fn prop_paired_acquire_release_preserves_pool(
            size in 1usize..6,
            ops in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let pool = EndpointPool::new("prop", addresses(size));
            let mut held = Vec::new();

            for acquire in ops {
                if acquire {
                    match pool.try_acquire() {
                        Ok(lease) => held.push(lease),
                        Err(_) => prop_assert_eq!(held.len(), size),
                    }
                } else if let Some(lease) = held.pop() {
                    pool.release(lease);
                }

                let out: BTreeSet<_> = held.iter().map(|l| l.address().to_string()).collect();
                prop_assert_eq!(out.len(), held.len());
                prop_assert_eq!(pool.available() + held.len(), size);
            }

            held.clear();
            let idle: BTreeSet<_> = pool.inner.idle.lock().iter().cloned().collect();
            prop_assert_eq!(idle, addresses(size).into_iter().collect::<BTreeSet<_>>());
        }
    }
}
