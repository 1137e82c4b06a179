//! Engine assembly and the admission decision pipeline
//!
//! [`AdmissionEngine::start`] wires every component from an
//! [`EngineConfig`]: the failover counter backend (shared Redis with an
//! in-memory fallback, or in-memory only), the policy resolver, the
//! quota ledger, and the monitor, plus the background maintenance
//! tasks. [`AdmissionEngine::evaluate`] then runs one request through
//! the full decision order:
//!
//! 1. bypass rules (before any backend access)
//! 2. service-protection policies, counted globally
//! 3. an armed block flag from an earlier denial
//! 4. the endpoint's velocity limit
//! 5. the tier's cumulative quota
//!
//! The first stage that denies determines the [`Outcome`]; a request
//! that clears all five is admitted. Usage is only written to the
//! ledger afterwards, via [`AdmissionEngine::confirm_usage`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;

use floodgate::MemoryStore;

use crate::backend::{CounterBackend, FailoverBackend, MemoryBackend, RedisBackend};
use crate::config::EngineConfig;
use crate::limiter::{RateLimiter, fallback_limit};
use crate::monitor::{AlertEvent, AnalyticsSummary, MetricSample, Monitor};
use crate::policy::{LimitPolicy, PolicyResolver};
use crate::quota::{
    MemoryQuotaStore, PgQuotaStore, QuotaCounter, QuotaLedger, QuotaStore, UsageStats,
};
use crate::types::{Evaluation, Outcome, RateDecision};

/// One request to admit or deny.
#[derive(Debug, Clone)]
pub struct EvaluateRequest {
    pub category: String,
    pub operation: String,
    pub subject: String,
    pub role: String,
    pub tier: String,
    pub source_ip: String,
    /// Caller-supplied decision instant; lets replays and tests pin
    /// the clock
    pub timestamp: SystemTime,
}

impl EvaluateRequest {
    pub fn endpoint(&self) -> String {
        format!("{}.{}", self.category, self.operation)
    }
}

pub struct AdmissionEngine {
    resolver: PolicyResolver,
    limiter: RateLimiter,
    ledger: QuotaLedger,
    monitor: Monitor,
    global_policies: Vec<LimitPolicy>,
    /// endpoint key -> ledger counter, from the unscaled policy table
    quota_counters: HashMap<String, QuotaCounter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionEngine {
    /// Build and start the engine. Infallible degradations (Redis or
    /// the database being unreachable) are logged, not returned: the
    /// engine always comes up, on in-memory state if it must.
    pub async fn start(config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let store = MemoryStore::builder()
            .capacity(config.store.capacity)
            .sweep_interval(config.sweep_interval())
            .build();
        let fallback: Arc<dyn CounterBackend> =
            Arc::new(MemoryBackend::spawn(config.actor_buffer, store));

        let primary: Option<Arc<dyn CounterBackend>> = match &config.redis_url {
            Some(url) => match RedisBackend::connect(url).await {
                Ok(backend) => {
                    tracing::info!(url, "connected to shared counter backend");
                    Some(Arc::new(backend))
                }
                Err(err) => {
                    tracing::warn!(url, error = %err, "shared backend unreachable, starting on fallback");
                    None
                }
            },
            None => None,
        };
        let has_primary = primary.is_some();

        let failover = Arc::new(FailoverBackend::new(
            primary,
            fallback,
            config.backend_timeout(),
        ));
        let mut tasks = Vec::new();
        if has_primary {
            tasks.push(failover.spawn_probe(config.probe_interval()));
        }

        let ledger_store: Arc<dyn QuotaStore> = match &config.database_url {
            Some(url) => {
                let pool = sqlx::PgPool::connect_lazy(url)?;
                let store = PgQuotaStore::new(pool);
                if let Err(err) = store.ensure_schema().await {
                    tracing::warn!(error = %err, "quota schema setup failed, ledger will fail open");
                }
                Arc::new(store)
            }
            None => Arc::new(MemoryQuotaStore::new()),
        };

        let quota_counters = config
            .policies
            .iter()
            .filter_map(|p| p.quota.map(|c| (p.key(), c)))
            .collect();
        let prune_interval = config.prune_interval();

        let engine = Arc::new(AdmissionEngine {
            resolver: PolicyResolver::new(
                config.policies,
                config.tier_multipliers,
                config.role_multipliers,
                config.bypass,
            ),
            limiter: RateLimiter::new(failover),
            ledger: QuotaLedger::new(ledger_store, config.tier_quotas),
            monitor: Monitor::new(config.monitor.settings()),
            global_policies: config.global_policies,
            quota_counters,
            tasks: Mutex::new(tasks),
        });

        let maintenance = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(prune_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    engine.monitor.prune(SystemTime::now());
                }
            })
        };
        engine.tasks.lock().push(maintenance);

        Ok(engine)
    }

    /// Run one request through the full decision order.
    pub async fn evaluate(&self, req: &EvaluateRequest) -> Evaluation {
        let started = Instant::now();
        let now = req.timestamp;
        let endpoint = req.endpoint();

        // Stage 1: bypass, decided from static rules alone
        if self
            .resolver
            .should_bypass(&req.subject, &req.role, &req.source_ip, &endpoint)
        {
            return Evaluation {
                outcome: Outcome::Allowed,
                decision: RateDecision::fail_open(u64::MAX, now),
                quota: None,
                message: None,
            };
        }

        // Stage 2: service-wide protection, shared across all callers
        for policy in &self.global_policies {
            let decision = self.limiter.check_global(&policy.operation, policy, now).await;
            if !decision.allowed {
                self.record(req, policy, &decision, false, started, now);
                return Evaluation {
                    outcome: Outcome::ServiceProtection,
                    decision,
                    quota: None,
                    message: policy.message.clone(),
                };
            }
        }

        let Some(policy) = self
            .resolver
            .resolve(&req.category, &req.operation, &req.tier, &req.role)
        else {
            // No policy covers the endpoint (or the tier is unlimited)
            return Evaluation {
                outcome: Outcome::Allowed,
                decision: RateDecision::fail_open(u64::MAX, now),
                quota: None,
                message: None,
            };
        };

        // Stage 3: a block armed by an earlier denial
        if let Some(until) = self.limiter.blocked_until(&req.subject, &endpoint, now).await {
            let decision = RateDecision {
                allowed: false,
                limit: fallback_limit(&policy),
                remaining: 0,
                retry_after: until.duration_since(now).ok(),
                reset_at: until,
            };
            self.record(req, &policy, &decision, false, started, now);
            return Evaluation {
                outcome: Outcome::Blocked,
                decision,
                quota: None,
                message: policy.message.clone(),
            };
        }

        // Stage 4: the endpoint's velocity limit
        let decision = self.limiter.check(&req.subject, &endpoint, &policy, now).await;

        if !decision.allowed {
            self.record(req, &policy, &decision, false, started, now);
            if let Some(duration) = policy.block_duration() {
                self.limiter.arm_block(&req.subject, &endpoint, duration, now).await;
            }
            return Evaluation {
                outcome: Outcome::RateLimited,
                decision,
                quota: None,
                message: policy.message.clone(),
            };
        }

        // Stage 5: the tier's cumulative quota
        let quota = match policy.quota {
            Some(counter) => Some(
                self.ledger
                    .check_quota(&req.subject, counter, 1, &req.tier, now)
                    .await,
            ),
            None => None,
        };
        let quota_denied = quota.as_ref().is_some_and(|q| !q.allowed);

        // The sample reflects the final verdict, so an exhausted quota
        // counts as a denial even though the velocity check passed.
        self.record(req, &policy, &decision, !quota_denied, started, now);

        if quota_denied {
            return Evaluation {
                outcome: Outcome::QuotaExceeded,
                decision,
                quota,
                message: policy.message.clone(),
            };
        }

        Evaluation {
            outcome: Outcome::Allowed,
            decision,
            quota,
            message: None,
        }
    }

    /// Record confirmed consumption against the ledger. Called after
    /// the underlying operation succeeded, with the real amount
    /// (tokens generated, bytes uploaded).
    pub async fn confirm_usage(
        &self,
        subject: &str,
        category: &str,
        operation: &str,
        amount: i64,
        now: SystemTime,
    ) {
        let key = format!("{category}.{operation}");
        if let Some(counter) = self.quota_counters.get(&key) {
            self.ledger.record_usage(subject, *counter, amount, now).await;
        }
    }

    /// Administrative reset of one subject's counters, optionally
    /// scoped to a single endpoint. Returns counters removed.
    pub async fn reset_limit(&self, subject: &str, endpoint: Option<&str>) -> usize {
        self.limiter.reset(subject, endpoint).await
    }

    pub async fn usage_stats(&self, subject: &str, now: SystemTime) -> Option<UsageStats> {
        self.ledger.usage_stats(subject, now).await
    }

    pub fn analytics(&self, range: Duration, now: SystemTime) -> AnalyticsSummary {
        self.monitor.analytics(range, now)
    }

    pub fn recent_alerts(&self) -> Vec<AlertEvent> {
        self.monitor.recent_alerts()
    }

    /// Stop background tasks. Counters and the ledger are left as they
    /// are; a fresh engine picks them up from the shared backend.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn record(
        &self,
        req: &EvaluateRequest,
        policy: &LimitPolicy,
        decision: &RateDecision,
        allowed: bool,
        started: Instant,
        now: SystemTime,
    ) {
        let exempt = self.resolver.bypass_rules().is_exempt_subject(&req.subject);
        self.monitor.record(
            MetricSample {
                endpoint: req.endpoint(),
                subject: req.subject.clone(),
                source_ip: req.source_ip.clone(),
                tier: req.tier.clone(),
                algorithm: policy.algorithm.label(),
                allowed,
                limit: decision.limit,
                remaining: decision.remaining,
                response_time_ms: started.elapsed().as_millis() as u64,
                timestamp: now,
            },
            exempt,
        );
    }
}

impl Drop for AdmissionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Algorithm, WindowLimits};

    fn request(subject: &str) -> EvaluateRequest {
        EvaluateRequest {
            category: "chat".into(),
            operation: "send".into(),
            subject: subject.into(),
            role: "member".into(),
            tier: "free".into(),
            source_ip: "1.2.3.4".into(),
            timestamp: SystemTime::now(),
        }
    }

    fn chat_policy() -> LimitPolicy {
        LimitPolicy {
            category: "chat".into(),
            operation: "send".into(),
            algorithm: Algorithm::FixedWindow,
            windows: WindowLimits {
                per_minute: Some(3),
                per_hour: None,
                per_day: None,
            },
            bucket: None,
            tier_multipliers: HashMap::new(),
            block_duration_secs: None,
            message: Some("slow down".into()),
            quota: None,
        }
    }

    async fn engine_with(config: EngineConfig) -> Arc<AdmissionEngine> {
        AdmissionEngine::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn denies_past_the_policy_limit_with_the_policy_message() {
        let engine = engine_with(EngineConfig {
            policies: vec![chat_policy()],
            ..EngineConfig::default()
        })
        .await;

        let req = request("u1");
        for _ in 0..3 {
            assert!(engine.evaluate(&req).await.allowed());
        }
        let denied = engine.evaluate(&req).await;
        assert_eq!(denied.outcome, Outcome::RateLimited);
        assert_eq!(denied.outcome.status_hint(), 429);
        assert_eq!(denied.message.as_deref(), Some("slow down"));
        assert!(denied.decision.retry_after.is_some());
    }

    #[tokio::test]
    async fn unknown_endpoint_is_admitted_without_headers() {
        let engine = engine_with(EngineConfig::default()).await;
        let evaluation = engine.evaluate(&request("u1")).await;
        assert!(evaluation.allowed());
        assert!(evaluation.headers().is_empty());
    }

    #[tokio::test]
    async fn whitelisted_ip_bypasses_before_any_counting() {
        let mut config = EngineConfig {
            policies: vec![chat_policy()],
            ..EngineConfig::default()
        };
        config.bypass.ip_whitelist.insert("1.2.3.4".into());
        let engine = engine_with(config).await;

        // Far past the limit, every call is admitted and uncounted
        let req = request("u1");
        for _ in 0..20 {
            let evaluation = engine.evaluate(&req).await;
            assert!(evaluation.allowed());
            assert!(evaluation.headers().is_empty());
        }
    }

    #[tokio::test]
    async fn denial_arms_a_block_that_outlasts_the_window() {
        let mut policy = chat_policy();
        policy.block_duration_secs = Some(600);
        let engine = engine_with(EngineConfig {
            policies: vec![policy],
            ..EngineConfig::default()
        })
        .await;

        let req = request("u1");
        for _ in 0..3 {
            assert!(engine.evaluate(&req).await.allowed());
        }
        assert_eq!(engine.evaluate(&req).await.outcome, Outcome::RateLimited);

        // Subsequent calls hit the armed block, not the counter
        let blocked = engine.evaluate(&req).await;
        assert_eq!(blocked.outcome, Outcome::Blocked);
        assert_eq!(blocked.outcome.status_hint(), 423);
        let wait = blocked.decision.retry_after.unwrap();
        assert!(wait > Duration::from_secs(500));
    }

    #[tokio::test]
    async fn global_policy_denies_with_service_protection() {
        let global = LimitPolicy {
            category: "service".into(),
            operation: "all".into(),
            algorithm: Algorithm::FixedWindow,
            windows: WindowLimits {
                per_minute: Some(2),
                per_hour: None,
                per_day: None,
            },
            bucket: None,
            tier_multipliers: HashMap::new(),
            block_duration_secs: None,
            message: Some("service at capacity".into()),
            quota: None,
        };
        let engine = engine_with(EngineConfig {
            global_policies: vec![global],
            ..EngineConfig::default()
        })
        .await;

        // Different subjects share the global budget
        assert!(engine.evaluate(&request("u1")).await.allowed());
        assert!(engine.evaluate(&request("u2")).await.allowed());
        let denied = engine.evaluate(&request("u3")).await;
        assert_eq!(denied.outcome, Outcome::ServiceProtection);
        assert_eq!(denied.outcome.status_hint(), 503);
    }

    #[tokio::test]
    async fn quota_denial_follows_an_admitted_rate_check() {
        let mut policy = chat_policy();
        policy.windows.per_minute = Some(100);
        policy.quota = Some(QuotaCounter::Messages);

        let engine = engine_with(EngineConfig {
            policies: vec![policy],
            tier_quotas: HashMap::from([(
                "free".into(),
                crate::quota::TierQuota {
                    daily_messages: 2,
                    ..Default::default()
                },
            )]),
            ..EngineConfig::default()
        })
        .await;

        let req = request("u1");
        for _ in 0..2 {
            let ok = engine.evaluate(&req).await;
            assert!(ok.allowed());
            engine.confirm_usage("u1", "chat", "send", 1, req.timestamp).await;
        }

        let denied = engine.evaluate(&req).await;
        assert_eq!(denied.outcome, Outcome::QuotaExceeded);
        assert_eq!(denied.outcome.status_hint(), 402);
        let quota = denied.quota.unwrap();
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.tier, "free");

        // The quota denial is visible to the monitor as a denied call
        let summary = engine.analytics(Duration::from_secs(3600), SystemTime::now());
        assert_eq!(summary.total, 3);
        assert_eq!(summary.denied, 1);
    }

    #[tokio::test]
    async fn reset_clears_a_subjects_counters() {
        let engine = engine_with(EngineConfig {
            policies: vec![chat_policy()],
            ..EngineConfig::default()
        })
        .await;

        let req = request("u1");
        for _ in 0..3 {
            assert!(engine.evaluate(&req).await.allowed());
        }
        assert_eq!(engine.evaluate(&req).await.outcome, Outcome::RateLimited);

        assert!(engine.reset_limit("u1", None).await > 0);
        assert!(engine.evaluate(&req).await.allowed());
    }
}
