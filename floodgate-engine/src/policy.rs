//! Limit policies and their resolution
//!
//! A [`LimitPolicy`] describes how one `(category, operation)` pair is
//! limited: the algorithm, its numeric limits, and optional tier/role
//! adjustments. [`PolicyResolver`] owns the startup-loaded policy table
//! and answers two questions on the request path: what is the effective
//! policy for this caller, and should this caller bypass limiting
//! entirely. Bypass is answered before any backend access.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Counting algorithm a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    TokenBucket,
}

impl Algorithm {
    /// Label used for metric bucketing.
    pub fn label(self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "fixed_window" | "fixedwindow" => Ok(Algorithm::FixedWindow),
            "token_bucket" | "tokenbucket" => Ok(Algorithm::TokenBucket),
            _ => Err(anyhow::anyhow!(
                "Invalid algorithm: {}. Valid options are: fixed_window, token_bucket",
                s
            )),
        }
    }
}

/// Per-granularity request limits for fixed-window policies.
///
/// Unset granularities are simply not checked.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WindowLimits {
    pub per_minute: Option<u64>,
    pub per_hour: Option<u64>,
    pub per_day: Option<u64>,
}

impl WindowLimits {
    /// Configured `(width, limit)` pairs, shortest window first.
    pub fn granularities(&self) -> Vec<(Duration, u64)> {
        [
            (Duration::from_secs(60), self.per_minute),
            (Duration::from_secs(3600), self.per_hour),
            (Duration::from_secs(86_400), self.per_day),
        ]
        .into_iter()
        .filter_map(|(width, limit)| limit.map(|l| (width, l)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.per_minute.is_none() && self.per_hour.is_none() && self.per_day.is_none()
    }
}

/// Token-bucket parameters for bucket policies.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BucketSpec {
    /// Maximum tokens the bucket can hold
    pub capacity: u64,
    /// Tokens replenished per second
    pub refill_per_sec: f64,
}

/// One entry of the limit-policy table.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitPolicy {
    pub category: String,
    pub operation: String,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub windows: WindowLimits,
    #[serde(default)]
    pub bucket: Option<BucketSpec>,
    /// Tier multipliers overriding the resolver-wide table
    #[serde(default)]
    pub tier_multipliers: HashMap<String, f64>,
    /// Seconds a subject is blocked after a denial; `None` disables
    /// blocking for this policy
    #[serde(default)]
    pub block_duration_secs: Option<u64>,
    /// Operator-facing denial message
    #[serde(default)]
    pub message: Option<String>,
    /// Ledger counter a successful call draws from; `None` means the
    /// operation does not consume quota
    #[serde(default)]
    pub quota: Option<crate::quota::QuotaCounter>,
}

impl LimitPolicy {
    /// Key of this policy in the table.
    pub fn key(&self) -> String {
        format!("{}.{}", self.category, self.operation)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration_secs.map(Duration::from_secs)
    }

    /// Scale every numeric limit by `factor`, flooring counts so an
    /// effective limit is always a non-negative integer. A factor below
    /// one tightens the policy; factors are never applied twice.
    fn scaled(&self, factor: f64) -> LimitPolicy {
        let scale = |limit: Option<u64>| limit.map(|l| ((l as f64) * factor).floor().max(0.0) as u64);

        let mut out = self.clone();
        out.windows = WindowLimits {
            per_minute: scale(self.windows.per_minute),
            per_hour: scale(self.windows.per_hour),
            per_day: scale(self.windows.per_day),
        };
        out.bucket = self.bucket.map(|b| BucketSpec {
            capacity: ((b.capacity as f64) * factor).floor().max(0.0) as u64,
            refill_per_sec: b.refill_per_sec * factor,
        });
        out
    }
}

/// Static bypass rules, loaded once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BypassRules {
    /// Source IPs that skip limiting entirely
    #[serde(default)]
    pub ip_whitelist: HashSet<String>,
    /// Per-role endpoint keys that skip limiting
    #[serde(default)]
    pub role_endpoints: HashMap<String, HashSet<String>>,
    /// Subjects exempt from limits, quotas, and per-subject alerts
    /// (synthetic/demo identities)
    #[serde(default)]
    pub exempt_subjects: HashSet<String>,
}

impl BypassRules {
    pub fn is_exempt_subject(&self, subject: &str) -> bool {
        self.exempt_subjects.contains(subject)
    }
}

/// Resolves `(category, operation, tier, role)` to an effective policy
/// and evaluates bypass rules.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    policies: HashMap<String, LimitPolicy>,
    tier_multipliers: HashMap<String, f64>,
    role_multipliers: HashMap<String, u32>,
    bypass: BypassRules,
}

impl PolicyResolver {
    pub fn new(
        policies: Vec<LimitPolicy>,
        tier_multipliers: HashMap<String, f64>,
        role_multipliers: HashMap<String, u32>,
        bypass: BypassRules,
    ) -> Self {
        let policies = policies.into_iter().map(|p| (p.key(), p)).collect();
        PolicyResolver {
            policies,
            tier_multipliers,
            role_multipliers,
            bypass,
        }
    }

    pub fn bypass_rules(&self) -> &BypassRules {
        &self.bypass
    }

    /// Look up the effective policy for a caller.
    ///
    /// Returns `None` when no policy covers the pair (callers treat
    /// that as allow-by-default) or when the tier multiplier is the
    /// `-1` unlimited sentinel. A tier without a multiplier entry gets
    /// factor 1; a role multiplier loosens limits only when above 1.
    pub fn resolve(
        &self,
        category: &str,
        operation: &str,
        tier: &str,
        role: &str,
    ) -> Option<LimitPolicy> {
        let base = self.policies.get(&format!("{category}.{operation}"))?;

        let tier_factor = base
            .tier_multipliers
            .get(tier)
            .or_else(|| self.tier_multipliers.get(tier))
            .copied()
            .unwrap_or(1.0);

        if tier_factor < 0.0 {
            // -1 sentinel: this tier is not limited at all
            return None;
        }

        let role_factor = self
            .role_multipliers
            .get(role)
            .copied()
            .filter(|&m| m > 1)
            .unwrap_or(1);

        Some(base.scaled(tier_factor * f64::from(role_factor)))
    }

    /// Whether this caller skips the entire decision path.
    ///
    /// True when the source IP is whitelisted, the role's bypass list
    /// contains this endpoint, or the subject is a configured exempt
    /// identity. Must be checked before any backend access.
    pub fn should_bypass(&self, subject: &str, role: &str, source_ip: &str, endpoint: &str) -> bool {
        if self.bypass.ip_whitelist.contains(source_ip) {
            return true;
        }
        if let Some(endpoints) = self.bypass.role_endpoints.get(role)
            && endpoints.contains(endpoint)
        {
            return true;
        }
        self.bypass.is_exempt_subject(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_policy() -> LimitPolicy {
        LimitPolicy {
            category: "chat".into(),
            operation: "send".into(),
            algorithm: Algorithm::FixedWindow,
            windows: WindowLimits {
                per_minute: Some(10),
                per_hour: Some(100),
                per_day: None,
            },
            bucket: None,
            tier_multipliers: HashMap::from([("free".into(), 0.5), ("enterprise".into(), -1.0)]),
            block_duration_secs: None,
            message: None,
            quota: None,
        }
    }

    fn resolver() -> PolicyResolver {
        PolicyResolver::new(
            vec![chat_policy()],
            HashMap::from([("pro".into(), 2.0)]),
            HashMap::from([("admin".into(), 10), ("viewer".into(), 0)]),
            BypassRules {
                ip_whitelist: HashSet::from(["10.0.0.1".into()]),
                role_endpoints: HashMap::from([(
                    "service".into(),
                    HashSet::from(["chat.send".into()]),
                )]),
                exempt_subjects: HashSet::from(["demo-user".into()]),
            },
        )
    }

    #[test]
    fn unknown_endpoint_resolves_to_none() {
        assert!(resolver().resolve("docs", "upload", "free", "member").is_none());
    }

    #[test]
    fn missing_tier_defaults_to_factor_one() {
        let policy = resolver().resolve("chat", "send", "unknown", "member").unwrap();
        assert_eq!(policy.windows.per_minute, Some(10));
        assert_eq!(policy.windows.per_hour, Some(100));
    }

    #[test]
    fn fractional_tier_multiplier_floors() {
        let policy = resolver().resolve("chat", "send", "free", "member").unwrap();
        assert_eq!(policy.windows.per_minute, Some(5));
        assert_eq!(policy.windows.per_hour, Some(50));
    }

    #[test]
    fn resolver_wide_tier_table_applies_when_policy_has_no_entry() {
        let policy = resolver().resolve("chat", "send", "pro", "member").unwrap();
        assert_eq!(policy.windows.per_minute, Some(20));
    }

    #[test]
    fn unlimited_tier_sentinel_disables_the_policy() {
        assert!(resolver().resolve("chat", "send", "enterprise", "member").is_none());
    }

    #[test]
    fn role_multiplier_applies_only_above_one() {
        let r = resolver();
        let admin = r.resolve("chat", "send", "unknown", "admin").unwrap();
        assert_eq!(admin.windows.per_minute, Some(100));

        // A multiplier of zero would zero the limits; it is ignored
        let viewer = r.resolve("chat", "send", "unknown", "viewer").unwrap();
        assert_eq!(viewer.windows.per_minute, Some(10));
    }

    #[test]
    fn scaling_is_applied_once_per_resolution() {
        let r = resolver();
        let first = r.resolve("chat", "send", "free", "member").unwrap();
        let second = r.resolve("chat", "send", "free", "member").unwrap();
        assert_eq!(first.windows.per_minute, second.windows.per_minute);
    }

    #[test]
    fn bucket_capacity_floors_and_rate_scales() {
        let mut policy = chat_policy();
        policy.algorithm = Algorithm::TokenBucket;
        policy.bucket = Some(BucketSpec {
            capacity: 9,
            refill_per_sec: 1.0,
        });
        let r = PolicyResolver::new(
            vec![policy],
            HashMap::new(),
            HashMap::new(),
            BypassRules::default(),
        );

        let eff = r.resolve("chat", "send", "free", "member").unwrap();
        let bucket = eff.bucket.unwrap();
        assert_eq!(bucket.capacity, 4); // floor(9 * 0.5)
        assert!((bucket.refill_per_sec - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bypass_rules_cover_ip_role_and_subject() {
        let r = resolver();
        assert!(r.should_bypass("u1", "member", "10.0.0.1", "chat.send"));
        assert!(r.should_bypass("u1", "service", "1.2.3.4", "chat.send"));
        assert!(r.should_bypass("demo-user", "member", "1.2.3.4", "chat.send"));
        assert!(!r.should_bypass("u1", "member", "1.2.3.4", "chat.send"));
    }
}
