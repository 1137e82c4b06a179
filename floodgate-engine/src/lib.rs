//! # Floodgate Engine
//!
//! An admission-control engine: tiered rate limiting, cumulative
//! quotas, and traffic monitoring behind a single `evaluate` call.
//!
//! ## Purpose
//!
//! Services that expose expensive operations (chat completions,
//! uploads, searches) need one place that decides whether a request may
//! proceed. This crate is that place. It combines:
//!
//! - **Velocity limits** per endpoint, fixed-window or token-bucket,
//!   scaled by the caller's tier and role
//! - **Service protection** limits counted across all callers
//! - **Temporary blocks** armed after a denial
//! - **Cumulative quotas** per tier, tracked daily and monthly
//! - **Monitoring** with rolling series, alerts, and analytics
//!
//! Counters live in a shared Redis backend when one is configured, with
//! an in-memory fallback that takes over automatically when the shared
//! backend is slow or down; limiting never becomes a point of failure.
//!
//! ## Quick Start
//!
//! ```no_run
//! use floodgate_engine::{AdmissionEngine, EngineConfig, EvaluateRequest};
//! use std::time::SystemTime;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = EngineConfig::load(Some("floodgate.toml"))?;
//! let engine = AdmissionEngine::start(config).await?;
//!
//! let evaluation = engine
//!     .evaluate(&EvaluateRequest {
//!         category: "chat".into(),
//!         operation: "send".into(),
//!         subject: "user-42".into(),
//!         role: "member".into(),
//!         tier: "free".into(),
//!         source_ip: "203.0.113.9".into(),
//!         timestamp: SystemTime::now(),
//!     })
//!     .await;
//!
//! if !evaluation.allowed() {
//!     // Render evaluation.outcome.status_hint() with
//!     // evaluation.headers() and stop here
//! }
//!
//! // ... perform the operation, then confirm what it consumed
//! engine
//!     .confirm_usage("user-42", "chat", "send", 1, SystemTime::now())
//!     .await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig::load`] reads an optional TOML file and applies
//! `FLOODGATE_*` environment overrides (`__` separates sections):
//!
//! ```bash
//! export FLOODGATE_REDIS_URL=redis://127.0.0.1:6379
//! export FLOODGATE_DATABASE_URL=postgres://localhost/floodgate
//! export FLOODGATE_STORE__CAPACITY=500000
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod monitor;
pub mod policy;
pub mod quota;
pub mod types;

pub use backend::{CounterBackend, FailoverBackend, MemoryBackend, RedisBackend};
pub use config::EngineConfig;
pub use engine::{AdmissionEngine, EvaluateRequest};
pub use error::{BackendError, LedgerError};
pub use limiter::RateLimiter;
pub use monitor::{AlertEvent, AlertKind, AnalyticsSummary, MetricSample, Monitor, Severity};
pub use policy::{Algorithm, BypassRules, LimitPolicy, PolicyResolver, WindowLimits};
pub use quota::{QuotaCounter, QuotaLedger, TierQuota, UsageStats};
pub use types::{Evaluation, Outcome, QuotaDecision, RateDecision};
