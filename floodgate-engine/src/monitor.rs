//! In-process traffic monitor
//!
//! Every decision the engine makes is recorded here as a
//! [`MetricSample`]. The monitor keeps short rolling time series at
//! several granularities (per endpoint, subject, source IP, algorithm
//! and tier), raises [`AlertEvent`]s with a per-key cooldown, and
//! answers analytics queries over a bounded recent-history buffer.
//! Everything is bounded and in memory; nothing here touches a backend.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use floodgate::bucket_id;

/// One recorded admission decision.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub endpoint: String,
    pub subject: String,
    pub source_ip: String,
    pub tier: String,
    pub algorithm: &'static str,
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time the decision (or the full response, when the caller
    /// measures it) took
    pub response_time_ms: u64,
    pub timestamp: SystemTime,
}

/// Aggregate counters for one time bucket of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesPoint {
    pub total: u64,
    pub denied: u64,
    /// Running sum; divide by `total` for the bucket average
    pub response_time_total_ms: u64,
}

/// Fixed-width rolling series keyed by `(entity, bucket)`.
///
/// Old buckets are dropped lazily on record and by the periodic
/// [`Monitor::prune`] pass, so memory stays proportional to
/// `retention / width * live entities`.
struct BucketSeries {
    width: Duration,
    retention: Duration,
    points: HashMap<(String, u64), SeriesPoint>,
}

impl BucketSeries {
    fn new(width: Duration, retention: Duration) -> Self {
        BucketSeries {
            width,
            retention,
            points: HashMap::new(),
        }
    }

    fn record(&mut self, entity: &str, allowed: bool, response_time_ms: u64, now: SystemTime) {
        let bucket = bucket_id(now, self.width);
        let point = self
            .points
            .entry((entity.to_string(), bucket))
            .or_default();
        point.total += 1;
        if !allowed {
            point.denied += 1;
        }
        point.response_time_total_ms += response_time_ms;
    }

    /// Counters over the last `span` for one entity.
    fn window_totals(&self, entity: &str, span: Duration, now: SystemTime) -> SeriesPoint {
        let horizon = bucket_id(now.checked_sub(span).unwrap_or(SystemTime::UNIX_EPOCH), self.width);
        let mut out = SeriesPoint::default();
        for ((name, bucket), point) in &self.points {
            if name == entity && *bucket >= horizon {
                out.total += point.total;
                out.denied += point.denied;
                out.response_time_total_ms += point.response_time_total_ms;
            }
        }
        out
    }

    fn prune(&mut self, now: SystemTime) {
        let horizon = bucket_id(
            now.checked_sub(self.retention).unwrap_or(SystemTime::UNIX_EPOCH),
            self.width,
        );
        self.points.retain(|(_, bucket), _| *bucket >= horizon);
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    /// An endpoint's denial rate crossed a utilization threshold
    EndpointPressure,
    /// One subject is being denied repeatedly
    SubjectDenied,
    /// Denials across all traffic crossed the global threshold
    GlobalDenialSurge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Critical,
}

/// A raised alert, delivered to the configured sink and kept in the
/// bounded alert history.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub entity: String,
    pub message: String,
    pub raised_at: SystemTime,
}

/// Aggregate view over the recent history buffer.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsSummary {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub denial_rate: f64,
    pub peak_per_minute: u64,
    pub avg_per_minute: f64,
    pub avg_response_time_ms: f64,
    pub tier_distribution: HashMap<String, u64>,
}

/// Monitor tuning knobs.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Seconds between repeated alerts for the same key
    pub alert_cooldown: Duration,
    /// Denials for one subject within an hour before alerting; the
    /// default of 1 raises on the first denial and leans on the
    /// cooldown for dedup
    pub subject_denial_threshold: u64,
    /// Denials across all traffic within five minutes before alerting
    pub global_denial_threshold: u64,
    /// Samples kept in the history buffer
    pub history_capacity: usize,
    /// Alerts kept for the administrative surface
    pub alert_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            alert_cooldown: Duration::from_secs(300),
            subject_denial_threshold: 1,
            global_denial_threshold: 100,
            history_capacity: 10_000,
            alert_capacity: 256,
        }
    }
}

struct MonitorState {
    endpoints: BucketSeries,
    subjects: BucketSeries,
    ips: BucketSeries,
    algorithms: BucketSeries,
    tiers: BucketSeries,
    history: VecDeque<MetricSample>,
    alerts: VecDeque<AlertEvent>,
    last_alert: HashMap<(AlertKind, String), SystemTime>,
}

/// Rolling metrics, alerting, and analytics, behind one mutex.
///
/// Record and query paths are short map operations; contention is not a
/// concern at the rates this engine sees.
pub struct Monitor {
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
}

impl Monitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Monitor {
            settings,
            state: Mutex::new(MonitorState {
                endpoints: BucketSeries::new(Duration::from_secs(60), Duration::from_secs(7200)),
                subjects: BucketSeries::new(Duration::from_secs(3600), Duration::from_secs(86_400)),
                ips: BucketSeries::new(Duration::from_secs(900), Duration::from_secs(3600)),
                algorithms: BucketSeries::new(Duration::from_secs(300), Duration::from_secs(1800)),
                tiers: BucketSeries::new(Duration::from_secs(60), Duration::from_secs(7200)),
                history: VecDeque::new(),
                alerts: VecDeque::new(),
                last_alert: HashMap::new(),
            }),
        }
    }

    /// Record a decision and raise whatever alerts it triggers.
    ///
    /// Exempt subjects still count toward endpoint and global series
    /// but never toward per-subject alerting.
    pub fn record(&self, sample: MetricSample, subject_exempt: bool) -> Vec<AlertEvent> {
        let now = sample.timestamp;
        let mut state = self.state.lock();

        let rt = sample.response_time_ms;
        state.endpoints.record(&sample.endpoint, sample.allowed, rt, now);
        state.ips.record(&sample.source_ip, sample.allowed, rt, now);
        state.algorithms.record(sample.algorithm, sample.allowed, rt, now);
        state.tiers.record(&sample.tier, sample.allowed, rt, now);
        if !subject_exempt {
            state.subjects.record(&sample.subject, sample.allowed, rt, now);
        }

        if state.history.len() >= self.settings.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(sample.clone());

        let mut raised = Vec::new();

        if let Some(alert) = self.endpoint_pressure(&state, &sample, now) {
            raised.push(alert);
        }
        if !subject_exempt
            && !sample.allowed
            && let Some(alert) = self.subject_denied(&state, &sample, now)
        {
            raised.push(alert);
        }
        if !sample.allowed
            && let Some(alert) = self.global_surge(&state, now)
        {
            raised.push(alert);
        }

        for alert in &raised {
            state
                .last_alert
                .insert((alert.kind, alert.entity.clone()), now);
            if state.alerts.len() >= self.settings.alert_capacity {
                state.alerts.pop_front();
            }
            state.alerts.push_back(alert.clone());
            tracing::warn!(
                kind = ?alert.kind,
                severity = ?alert.severity,
                entity = %alert.entity,
                "{}",
                alert.message
            );
        }
        raised
    }

    fn cooled_down(&self, state: &MonitorState, kind: AlertKind, entity: &str, now: SystemTime) -> bool {
        match state.last_alert.get(&(kind, entity.to_string())) {
            Some(last) => now
                .duration_since(*last)
                .map(|d| d >= self.settings.alert_cooldown)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Utilization alert: how close this endpoint's last-minute denial
    /// share is to saturation. 80% warns, 95% is critical.
    fn endpoint_pressure(
        &self,
        state: &MonitorState,
        sample: &MetricSample,
        now: SystemTime,
    ) -> Option<AlertEvent> {
        if sample.limit == 0 || sample.limit == u64::MAX {
            return None;
        }
        let used = sample.limit.saturating_sub(sample.remaining);
        let utilization = used as f64 / sample.limit as f64;
        let severity = if utilization >= 0.95 {
            Severity::Critical
        } else if utilization >= 0.80 {
            Severity::Warning
        } else {
            return None;
        };
        if !self.cooled_down(state, AlertKind::EndpointPressure, &sample.endpoint, now) {
            return None;
        }
        Some(AlertEvent {
            kind: AlertKind::EndpointPressure,
            severity,
            entity: sample.endpoint.clone(),
            message: format!(
                "endpoint {} at {:.0}% of its limit ({} of {})",
                sample.endpoint,
                utilization * 100.0,
                used,
                sample.limit
            ),
            raised_at: now,
        })
    }

    fn subject_denied(
        &self,
        state: &MonitorState,
        sample: &MetricSample,
        now: SystemTime,
    ) -> Option<AlertEvent> {
        let totals = state
            .subjects
            .window_totals(&sample.subject, Duration::from_secs(3600), now);
        if totals.denied < self.settings.subject_denial_threshold {
            return None;
        }
        if !self.cooled_down(state, AlertKind::SubjectDenied, &sample.subject, now) {
            return None;
        }
        Some(AlertEvent {
            kind: AlertKind::SubjectDenied,
            severity: Severity::Warning,
            entity: sample.subject.clone(),
            message: format!(
                "subject {} denied {} times in the last hour",
                sample.subject, totals.denied
            ),
            raised_at: now,
        })
    }

    fn global_surge(&self, state: &MonitorState, now: SystemTime) -> Option<AlertEvent> {
        let horizon = now
            .checked_sub(Duration::from_secs(300))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let denied = state
            .history
            .iter()
            .rev()
            .take_while(|s| s.timestamp >= horizon)
            .filter(|s| !s.allowed)
            .count() as u64;
        if denied < self.settings.global_denial_threshold {
            return None;
        }
        if !self.cooled_down(state, AlertKind::GlobalDenialSurge, "global", now) {
            return None;
        }
        Some(AlertEvent {
            kind: AlertKind::GlobalDenialSurge,
            severity: Severity::Critical,
            entity: "global".to_string(),
            message: format!("{denied} denials across all traffic in the last five minutes"),
            raised_at: now,
        })
    }

    /// Recent alerts, newest last.
    pub fn recent_alerts(&self) -> Vec<AlertEvent> {
        self.state.lock().alerts.iter().cloned().collect()
    }

    /// Last-hour counters for one subject.
    pub fn subject_activity(&self, subject: &str, now: SystemTime) -> SeriesPoint {
        self.state
            .lock()
            .subjects
            .window_totals(subject, Duration::from_secs(3600), now)
    }

    /// Traffic summary over the trailing `range` of the history buffer.
    pub fn analytics(&self, range: Duration, now: SystemTime) -> AnalyticsSummary {
        let horizon = now.checked_sub(range).unwrap_or(SystemTime::UNIX_EPOCH);
        let state = self.state.lock();

        let mut summary = AnalyticsSummary::default();
        let mut per_minute: HashMap<u64, u64> = HashMap::new();
        let mut response_time_total = 0u64;

        for sample in state.history.iter().rev() {
            if sample.timestamp < horizon {
                break;
            }
            summary.total += 1;
            if sample.allowed {
                summary.allowed += 1;
            } else {
                summary.denied += 1;
            }
            response_time_total += sample.response_time_ms;
            *summary
                .tier_distribution
                .entry(sample.tier.clone())
                .or_default() += 1;
            *per_minute
                .entry(bucket_id(sample.timestamp, Duration::from_secs(60)))
                .or_default() += 1;
        }

        if summary.total > 0 {
            summary.denial_rate = summary.denied as f64 / summary.total as f64;
            summary.avg_response_time_ms = response_time_total as f64 / summary.total as f64;
        }
        summary.peak_per_minute = per_minute.values().copied().max().unwrap_or(0);
        let minutes = (range.as_secs() / 60).max(1);
        summary.avg_per_minute = summary.total as f64 / minutes as f64;
        summary
    }

    /// Drop series buckets past retention and stale cooldown entries.
    /// Called from the engine's maintenance task.
    pub fn prune(&self, now: SystemTime) {
        let mut state = self.state.lock();
        state.endpoints.prune(now);
        state.subjects.prune(now);
        state.ips.prune(now);
        state.algorithms.prune(now);
        state.tiers.prune(now);

        let cooldown = self.settings.alert_cooldown;
        state.last_alert.retain(|_, last| {
            now.duration_since(*last).map(|d| d < cooldown).unwrap_or(true)
        });
    }
}
