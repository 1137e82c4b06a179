//! Cumulative quota ledger
//!
//! Orthogonal to velocity limiting: the ledger tracks how much of a
//! tier's daily and monthly allowance (messages, tokens, uploads) a
//! subject has consumed. It sits on a slower, persistent path: usage
//! is recorded after an operation succeeds, never before. It is an
//! accounting mechanism, not a security boundary, so every read or
//! write failure fails open and is logged.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::LedgerError;
use crate::types::QuotaDecision;

/// Counter an operation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaCounter {
    Messages,
    Tokens,
    Uploads,
}

impl QuotaCounter {
    fn column(self) -> &'static str {
        match self {
            QuotaCounter::Messages => "messages",
            QuotaCounter::Tokens => "tokens",
            QuotaCounter::Uploads => "uploads",
        }
    }
}

/// One subject's counters for one period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub messages: i64,
    pub tokens: i64,
    pub uploads: i64,
}

impl UsageCounters {
    pub fn get(&self, counter: QuotaCounter) -> i64 {
        match counter {
            QuotaCounter::Messages => self.messages,
            QuotaCounter::Tokens => self.tokens,
            QuotaCounter::Uploads => self.uploads,
        }
    }

    fn add(&mut self, counter: QuotaCounter, amount: i64) {
        match counter {
            QuotaCounter::Messages => self.messages += amount,
            QuotaCounter::Tokens => self.tokens += amount,
            QuotaCounter::Uploads => self.uploads += amount,
        }
    }
}

/// Tier allowance table. `-1` means unlimited.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TierQuota {
    pub daily_messages: i64,
    pub daily_tokens: i64,
    pub daily_uploads: i64,
    pub monthly_messages: i64,
    pub monthly_tokens: i64,
    pub monthly_uploads: i64,
}

impl Default for TierQuota {
    fn default() -> Self {
        TierQuota {
            daily_messages: -1,
            daily_tokens: -1,
            daily_uploads: -1,
            monthly_messages: -1,
            monthly_tokens: -1,
            monthly_uploads: -1,
        }
    }
}

impl TierQuota {
    fn daily(&self, counter: QuotaCounter) -> i64 {
        match counter {
            QuotaCounter::Messages => self.daily_messages,
            QuotaCounter::Tokens => self.daily_tokens,
            QuotaCounter::Uploads => self.daily_uploads,
        }
    }

    fn monthly(&self, counter: QuotaCounter) -> i64 {
        match counter {
            QuotaCounter::Messages => self.monthly_messages,
            QuotaCounter::Tokens => self.monthly_tokens,
            QuotaCounter::Uploads => self.monthly_uploads,
        }
    }
}

/// Current usage snapshot for the administrative surface.
#[derive(Debug, Clone, Copy)]
pub struct UsageStats {
    pub day: NaiveDate,
    pub daily: UsageCounters,
    pub monthly: UsageCounters,
}

/// Persistence contract for quota rows: one row per (subject, day),
/// monthly figures summed over the month's rows.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn day_usage(&self, subject: &str, day: NaiveDate) -> Result<UsageCounters, LedgerError>;

    /// Sum of counters over `[from, to)`.
    async fn range_usage(
        &self,
        subject: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<UsageCounters, LedgerError>;

    /// Add `amount` to one counter of the day row, creating the row on
    /// first use.
    async fn add_usage(
        &self,
        subject: &str,
        day: NaiveDate,
        counter: QuotaCounter,
        amount: i64,
    ) -> Result<(), LedgerError>;
}

/// Postgres-backed quota store.
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        PgQuotaStore { pool }
    }

    /// Create the usage table when it does not exist yet. Best-effort:
    /// a failure here only means the first queries will fail (open).
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS quota_usage (
                subject_id TEXT NOT NULL,
                day DATE NOT NULL,
                messages BIGINT NOT NULL DEFAULT 0,
                tokens BIGINT NOT NULL DEFAULT 0,
                uploads BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (subject_id, day)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn day_usage(&self, subject: &str, day: NaiveDate) -> Result<UsageCounters, LedgerError> {
        let row = sqlx::query(
            "SELECT messages, tokens, uploads FROM quota_usage
             WHERE subject_id = $1 AND day = $2",
        )
        .bind(subject)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|row| UsageCounters {
                messages: row.get(0),
                tokens: row.get(1),
                uploads: row.get(2),
            })
            .unwrap_or_default())
    }

    async fn range_usage(
        &self,
        subject: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<UsageCounters, LedgerError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(messages), 0)::BIGINT,
                    COALESCE(SUM(tokens), 0)::BIGINT,
                    COALESCE(SUM(uploads), 0)::BIGINT
             FROM quota_usage
             WHERE subject_id = $1 AND day >= $2 AND day < $3",
        )
        .bind(subject)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageCounters {
            messages: row.get(0),
            tokens: row.get(1),
            uploads: row.get(2),
        })
    }

    async fn add_usage(
        &self,
        subject: &str,
        day: NaiveDate,
        counter: QuotaCounter,
        amount: i64,
    ) -> Result<(), LedgerError> {
        // Column names come from a closed enum, never from input
        let column = counter.column();
        let sql = format!(
            "INSERT INTO quota_usage (subject_id, day, {column})
             VALUES ($1, $2, $3)
             ON CONFLICT (subject_id, day)
             DO UPDATE SET {column} = quota_usage.{column} + EXCLUDED.{column}"
        );

        sqlx::query(&sql)
            .bind(subject)
            .bind(day)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-process quota store for tests and database-less deployments.
#[derive(Default)]
pub struct MemoryQuotaStore {
    rows: RwLock<HashMap<(String, NaiveDate), UsageCounters>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn day_usage(&self, subject: &str, day: NaiveDate) -> Result<UsageCounters, LedgerError> {
        Ok(self
            .rows
            .read()
            .get(&(subject.to_string(), day))
            .copied()
            .unwrap_or_default())
    }

    async fn range_usage(
        &self,
        subject: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<UsageCounters, LedgerError> {
        let rows = self.rows.read();
        let mut total = UsageCounters::default();
        for ((row_subject, day), counters) in rows.iter() {
            if row_subject == subject && *day >= from && *day < to {
                total.messages += counters.messages;
                total.tokens += counters.tokens;
                total.uploads += counters.uploads;
            }
        }
        Ok(total)
    }

    async fn add_usage(
        &self,
        subject: &str,
        day: NaiveDate,
        counter: QuotaCounter,
        amount: i64,
    ) -> Result<(), LedgerError> {
        self.rows
            .write()
            .entry((subject.to_string(), day))
            .or_default()
            .add(counter, amount);
        Ok(())
    }
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

fn next_month_start(day: NaiveDate) -> NaiveDate {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(day)
}

fn day_end(day: NaiveDate) -> DateTime<Utc> {
    let next = day.checked_add_days(Days::new(1)).unwrap_or(day);
    next.and_time(NaiveTime::MIN).and_utc()
}

/// Tiered cumulative-allowance bookkeeping.
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    tiers: HashMap<String, TierQuota>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, tiers: HashMap<String, TierQuota>) -> Self {
        QuotaLedger { store, tiers }
    }

    /// Whether `amount` more of `counter` fits within the subject's
    /// tier allowance. Fails open on any store error.
    pub async fn check_quota(
        &self,
        subject: &str,
        counter: QuotaCounter,
        amount: i64,
        tier: &str,
        now: SystemTime,
    ) -> QuotaDecision {
        let today = DateTime::<Utc>::from(now).date_naive();
        let limits = self.tiers.get(tier).copied().unwrap_or_default();

        let daily_limit = limits.daily(counter);
        let monthly_limit = limits.monthly(counter);

        // Unlimited on both horizons: skip the store entirely
        if daily_limit < 0 && monthly_limit < 0 {
            return QuotaDecision {
                allowed: true,
                remaining: -1,
                reset_at: day_end(today).into(),
                tier: tier.to_string(),
            };
        }

        let daily_reset: SystemTime = day_end(today).into();
        let monthly_reset: SystemTime =
            next_month_start(today).and_time(NaiveTime::MIN).and_utc().into();

        let daily_used = if daily_limit >= 0 {
            match self.store.day_usage(subject, today).await {
                Ok(counters) => Some(counters.get(counter)),
                Err(err) => {
                    tracing::warn!(subject, error = %err, "quota read failed, failing open");
                    return QuotaDecision {
                        allowed: true,
                        remaining: -1,
                        reset_at: daily_reset,
                        tier: tier.to_string(),
                    };
                }
            }
        } else {
            None
        };

        let monthly_used = if monthly_limit >= 0 {
            match self
                .store
                .range_usage(subject, month_start(today), next_month_start(today))
                .await
            {
                Ok(counters) => Some(counters.get(counter)),
                Err(err) => {
                    tracing::warn!(subject, error = %err, "quota read failed, failing open");
                    return QuotaDecision {
                        allowed: true,
                        remaining: -1,
                        reset_at: daily_reset,
                        tier: tier.to_string(),
                    };
                }
            }
        } else {
            None
        };

        // Most restrictive horizon wins
        let mut allowed = true;
        let mut remaining = i64::MAX;
        let mut reset_at = daily_reset;

        if let Some(used) = daily_used {
            let left = (daily_limit - used).max(0);
            allowed &= used + amount <= daily_limit;
            if left < remaining {
                remaining = left;
                reset_at = daily_reset;
            }
        }
        if let Some(used) = monthly_used {
            let left = (monthly_limit - used).max(0);
            allowed &= used + amount <= monthly_limit;
            if left < remaining {
                remaining = left;
                reset_at = monthly_reset;
            }
        }
        if remaining == i64::MAX {
            remaining = -1;
        }

        QuotaDecision {
            allowed,
            remaining,
            reset_at,
            tier: tier.to_string(),
        }
    }

    /// Persist confirmed usage. Runs after the operation succeeded, so
    /// a write failure is logged and swallowed: it must never undo or
    /// block work that already happened.
    pub async fn record_usage(
        &self,
        subject: &str,
        counter: QuotaCounter,
        amount: i64,
        now: SystemTime,
    ) {
        let today = DateTime::<Utc>::from(now).date_naive();
        if let Err(err) = self.store.add_usage(subject, today, counter, amount).await {
            tracing::error!(subject, amount, error = %err, "quota usage write failed");
        }
    }

    /// Daily and month-to-date counters for one subject.
    pub async fn usage_stats(&self, subject: &str, now: SystemTime) -> Option<UsageStats> {
        let today = DateTime::<Utc>::from(now).date_naive();
        let daily = self.store.day_usage(subject, today).await;
        let monthly = self
            .store
            .range_usage(subject, month_start(today), next_month_start(today))
            .await;

        match (daily, monthly) {
            (Ok(daily), Ok(monthly)) => Some(UsageStats {
                day: today,
                daily,
                monthly,
            }),
            (daily, monthly) => {
                if let Err(err) = daily.and(monthly) {
                    tracing::warn!(subject, error = %err, "usage stats read failed");
                }
                None
            }
        }
    }
}
