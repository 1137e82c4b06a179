//! Runtime selection between the shared backend and the local fallback
//!
//! Every call to the primary carries a latency budget; exceeding it is
//! treated exactly like an unreachable backend: the call is answered by
//! the in-process fallback and the backend is marked degraded. A probe
//! task re-pings the primary on a fixed interval and restores it once
//! it answers again. The transition is logged once per direction,
//! never per request.
//!
//! Fallback mode has no cross-process consistency; each process
//! enforces limits against its own counters until the primary returns.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{CounterBackend, TokenVerdict, WindowSlot};
use crate::error::BackendError;

/// Strategy backend: primary with bounded timeout, local fallback.
pub struct FailoverBackend {
    primary: Option<Arc<dyn CounterBackend>>,
    fallback: Arc<dyn CounterBackend>,
    budget: Duration,
    degraded: AtomicBool,
}

impl FailoverBackend {
    /// `primary = None` runs fallback-only (standalone mode).
    pub fn new(
        primary: Option<Arc<dyn CounterBackend>>,
        fallback: Arc<dyn CounterBackend>,
        budget: Duration,
    ) -> Self {
        FailoverBackend {
            primary,
            fallback,
            budget,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether calls are currently served by the fallback.
    pub fn is_degraded(&self) -> bool {
        self.primary.is_none() || self.degraded.load(Ordering::Relaxed)
    }

    fn active_primary(&self) -> Option<&Arc<dyn CounterBackend>> {
        if self.degraded.load(Ordering::Relaxed) {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn mark_degraded(&self, err: &BackendError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                error = %err,
                "shared counting backend lost, switching to in-memory fallback \
                 (no cross-process consistency until it recovers)"
            );
        }
    }

    /// Spawn the recovery probe. The returned handle is abortable at
    /// shutdown.
    pub fn spawn_probe(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(primary) = this.primary.as_ref() else {
                    continue;
                };
                if !this.degraded.load(Ordering::Relaxed) {
                    continue;
                }
                match timeout(this.budget, primary.ping()).await {
                    Ok(Ok(())) => {
                        this.degraded.store(false, Ordering::Relaxed);
                        tracing::info!("shared counting backend recovered, leaving fallback mode");
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(error = %err, "backend probe failed");
                    }
                    Err(_) => {
                        tracing::debug!(budget = ?this.budget, "backend probe timed out");
                    }
                }
            }
        })
    }
}

// Timeout-then-fallback shape shared by every trait method.
macro_rules! failover_call {
    ($self:ident, $call:ident ( $($arg:expr),* )) => {{
        if let Some(primary) = $self.active_primary() {
            match timeout($self.budget, primary.$call($($arg),*)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => $self.mark_degraded(&err),
                Err(_) => $self.mark_degraded(&BackendError::Timeout($self.budget)),
            }
        }
        $self.fallback.$call($($arg),*).await
    }};
}

#[async_trait]
impl CounterBackend for FailoverBackend {
    async fn increment_window(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<WindowSlot, BackendError> {
        failover_call!(self, increment_window(key, width, now))
    }

    async fn consume_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> Result<TokenVerdict, BackendError> {
        failover_call!(
            self,
            consume_tokens(key, capacity, refill_per_sec, requested, now)
        )
    }

    async fn window_count(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<u64, BackendError> {
        failover_call!(self, window_count(key, width, now))
    }

    async fn set_flag(
        &self,
        key: &str,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<(), BackendError> {
        failover_call!(self, set_flag(key, ttl, now))
    }

    async fn flag_expiry(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<SystemTime>, BackendError> {
        failover_call!(self, flag_expiry(key, now))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        // Administrative resets address both stores so fallback-era
        // counters cannot resurrect a lifted limit
        let mut removed = 0;
        if let Some(primary) = self.active_primary() {
            match timeout(self.budget, primary.remove_prefix(prefix)).await {
                Ok(Ok(count)) => removed += count,
                Ok(Err(err)) => self.mark_degraded(&err),
                Err(_) => self.mark_degraded(&BackendError::Timeout(self.budget)),
            }
        }
        removed += self.fallback.remove_prefix(prefix).await?;
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        if let Some(primary) = self.active_primary() {
            match timeout(self.budget, primary.ping()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => self.mark_degraded(&err),
                Err(_) => self.mark_degraded(&BackendError::Timeout(self.budget)),
            }
        }
        self.fallback.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use floodgate::MemoryStore;
    use std::time::Instant;

    /// A primary that never answers within any budget.
    struct StalledBackend;

    #[async_trait]
    impl CounterBackend for StalledBackend {
        async fn increment_window(
            &self,
            _key: &str,
            _width: Duration,
            _now: SystemTime,
        ) -> Result<WindowSlot, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn consume_tokens(
            &self,
            _key: &str,
            _capacity: f64,
            _refill_per_sec: f64,
            _requested: f64,
            _now: SystemTime,
        ) -> Result<TokenVerdict, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn window_count(
            &self,
            _key: &str,
            _width: Duration,
            _now: SystemTime,
        ) -> Result<u64, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn set_flag(
            &self,
            _key: &str,
            _ttl: Duration,
            _now: SystemTime,
        ) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn flag_expiry(
            &self,
            _key: &str,
            _now: SystemTime,
        ) -> Result<Option<SystemTime>, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn remove_prefix(&self, _prefix: &str) -> Result<usize, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn ping(&self) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    fn fallback() -> Arc<dyn CounterBackend> {
        Arc::new(MemoryBackend::spawn(64, MemoryStore::new()))
    }

    #[tokio::test]
    async fn stalled_primary_falls_back_within_budget() {
        let budget = Duration::from_millis(50);
        let failover = FailoverBackend::new(Some(Arc::new(StalledBackend)), fallback(), budget);

        let started = Instant::now();
        let slot = failover
            .increment_window("fg:u1:op:w60", Duration::from_secs(60), SystemTime::now())
            .await
            .unwrap();

        assert_eq!(slot.count, 1);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(failover.is_degraded());
    }

    #[tokio::test]
    async fn degraded_backend_skips_the_primary() {
        let budget = Duration::from_millis(50);
        let failover = FailoverBackend::new(Some(Arc::new(StalledBackend)), fallback(), budget);
        let now = SystemTime::now();

        // First call pays the budget once
        failover
            .increment_window("fg:u1:op:w60", Duration::from_secs(60), now)
            .await
            .unwrap();

        // Subsequent calls go straight to the fallback
        let started = Instant::now();
        let slot = failover
            .increment_window("fg:u1:op:w60", Duration::from_secs(60), now)
            .await
            .unwrap();
        assert_eq!(slot.count, 2);
        assert!(started.elapsed() < budget);
    }

    #[tokio::test]
    async fn standalone_mode_serves_from_fallback() {
        let failover =
            FailoverBackend::new(None, fallback(), Duration::from_millis(50));
        assert!(failover.is_degraded());

        let verdict = failover
            .consume_tokens("fg:u1:op:tb", 10.0, 0.2, 5.0, SystemTime::now())
            .await
            .unwrap();
        assert!(verdict.allowed);
    }
}
