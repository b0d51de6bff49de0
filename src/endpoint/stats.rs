//! Running statistics and the per-round aggregation step.

use super::{set_field, DisplayStatus, Endpoint, Field, StatField, TestResult};
use crate::probe::ProbeStatus;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolling counters for one probe kind.
///
/// Latencies are whole milliseconds. `max_latency` and `min_latency` only ever
/// take values from successful probes and are cleared by [`reset`](Self::reset)
/// alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeStats {
    succeed_count: u64,
    failed_count: u64,
    total_latency: u64,
    last_latency: Option<u64>,
    max_latency: Option<u64>,
    min_latency: Option<u64>,
    last_succeed_at: Option<DateTime<Utc>>,
    last_failed_at: Option<DateTime<Utc>>,
}

impl ProbeStats {
    pub fn succeed_count(&self) -> u64 {
        self.succeed_count
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }

    /// Number of recorded probes of this kind.
    pub fn total_count(&self) -> u64 {
        self.succeed_count + self.failed_count
    }

    /// Sum of all successful latencies.
    pub fn total_latency(&self) -> u64 {
        self.total_latency
    }

    /// Latency of the latest probe; `None` after a failure.
    pub fn last_latency(&self) -> Option<u64> {
        self.last_latency
    }

    pub fn max_latency(&self) -> Option<u64> {
        self.max_latency
    }

    pub fn min_latency(&self) -> Option<u64> {
        self.min_latency
    }

    /// Truncating mean over successful probes.
    pub fn average_latency(&self) -> Option<u64> {
        if self.succeed_count == 0 {
            return None;
        }
        Some(self.total_latency / self.succeed_count)
    }

    pub fn succeed_ratio(&self) -> Option<f64> {
        self.ratio(self.succeed_count)
    }

    pub fn failed_ratio(&self) -> Option<f64> {
        self.ratio(self.failed_count)
    }

    fn ratio(&self, count: u64) -> Option<f64> {
        match self.total_count() {
            0 => None,
            total => Some(count as f64 / total as f64),
        }
    }

    pub fn last_succeed_at(&self) -> Option<DateTime<Utc>> {
        self.last_succeed_at
    }

    pub fn last_failed_at(&self) -> Option<DateTime<Utc>> {
        self.last_failed_at
    }

    /// Fold one sub-probe outcome into the counters.
    pub fn record(&mut self, status: ProbeStatus, rtt: u64, at: DateTime<Utc>) -> Vec<StatField> {
        let before = self.clone();

        if status.is_success() {
            self.succeed_count += 1;
            self.last_succeed_at = Some(at);
            self.total_latency += rtt;
            self.last_latency = Some(rtt);
            if self.max_latency.map_or(true, |max| max < rtt) {
                self.max_latency = Some(rtt);
            }
            if self.min_latency.map_or(true, |min| min > rtt) {
                self.min_latency = Some(rtt);
            }
        } else {
            self.failed_count += 1;
            self.last_failed_at = Some(at);
            self.last_latency = None;
        }

        self.changes_since(&before)
    }

    pub fn reset(&mut self) -> Vec<StatField> {
        let before = std::mem::take(self);
        self.changes_since(&before)
    }

    /// Observable fields, derived ones included, that differ from `before`.
    fn changes_since(&self, before: &ProbeStats) -> Vec<StatField> {
        let checks = [
            (
                StatField::SucceedCount,
                self.succeed_count != before.succeed_count,
            ),
            (
                StatField::FailedCount,
                self.failed_count != before.failed_count,
            ),
            (
                StatField::SucceedRatio,
                self.succeed_ratio() != before.succeed_ratio(),
            ),
            (
                StatField::FailedRatio,
                self.failed_ratio() != before.failed_ratio(),
            ),
            (
                StatField::LastLatency,
                self.last_latency != before.last_latency,
            ),
            (StatField::MaxLatency, self.max_latency != before.max_latency),
            (StatField::MinLatency, self.min_latency != before.min_latency),
            (
                StatField::AverageLatency,
                self.average_latency() != before.average_latency(),
            ),
            (
                StatField::LastSucceedAt,
                self.last_succeed_at != before.last_succeed_at,
            ),
            (
                StatField::LastFailedAt,
                self.last_failed_at != before.last_failed_at,
            ),
        ];

        checks
            .into_iter()
            .filter_map(|(field, changed)| changed.then_some(field))
            .collect()
    }
}

impl DisplayStatus {
    /// Combine with one sub-probe outcome of the same round. A failure wins
    /// over any sibling success.
    fn merge(self, status: ProbeStatus) -> Self {
        match (self, status.is_success()) {
            (DisplayStatus::Failed, _) | (_, false) => DisplayStatus::Failed,
            (_, true) => DisplayStatus::Succeed,
        }
    }
}

impl Endpoint {
    /// Fold a round's result into the statistics.
    ///
    /// Absent results and results without any sub-probe are ignored entirely.
    /// Otherwise the result is appended to the history, each present sub-result
    /// updates its own counters, and the display status is re-derived from the
    /// sub-results of enabled probe kinds.
    pub fn apply(&mut self, result: Option<TestResult>) -> Vec<Field> {
        let result = match result {
            Some(result) if !result.is_empty() => result,
            _ => return Vec::new(),
        };

        let mut changed = vec![Field::History];
        let mut status = DisplayStatus::Unknown;

        if let Some(icmp) = &result.icmp {
            let fields = self.icmp.record(icmp.status, icmp.rtt, result.time);
            changed.extend(fields.into_iter().map(Field::Icmp));
            if self.allow_icmp {
                status = status.merge(icmp.status);
            }
        }

        if let Some(tcp) = &result.tcp {
            let fields = self.tcp.record(tcp.status, tcp.rtt, result.time);
            changed.extend(fields.into_iter().map(Field::Tcp));
            if self.allow_tcp {
                status = status.merge(tcp.status);
            }
        }

        changed.extend(set_field(
            &mut self.display_status,
            status,
            Field::DisplayStatus,
        ));
        self.history.push(result);

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{IcmpResult, TcpResult};
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn round(icmp: Option<IcmpResult>, tcp: Option<TcpResult>) -> TestResult {
        TestResult {
            time: Utc::now(),
            icmp,
            tcp,
        }
    }

    fn icmp_ok(rtt: u64) -> Option<IcmpResult> {
        Some(IcmpResult::success(rtt, Some(64), 32))
    }

    fn tcp_ok(rtt: u64) -> Option<TcpResult> {
        Some(TcpResult::success(rtt))
    }

    #[test]
    fn test_empty_result_is_noop() {
        let mut endpoint = Endpoint::new(0);
        endpoint.apply(Some(round(icmp_ok(5), tcp_ok(7))));
        let before = endpoint.clone();

        assert!(endpoint.apply(None).is_empty());
        assert!(endpoint.apply(Some(round(None, None))).is_empty());

        assert_eq!(endpoint.icmp(), before.icmp());
        assert_eq!(endpoint.tcp(), before.tcp());
        assert_eq!(endpoint.history().len(), 1);
        assert_eq!(endpoint.display_status(), before.display_status());
    }

    #[test]
    fn test_average_is_truncated_mean() {
        let mut endpoint = Endpoint::new(0);
        assert_eq!(endpoint.icmp().average_latency(), None);

        for rtt in [10, 11, 11] {
            endpoint.apply(Some(round(icmp_ok(rtt), None)));
        }
        // 32 / 3
        assert_eq!(endpoint.icmp().average_latency(), Some(10));
        assert_eq!(endpoint.icmp().total_latency(), 32);
        assert_eq!(endpoint.tcp().average_latency(), None);
    }

    #[test]
    fn test_random_sequences_hold_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let mut endpoint = Endpoint::new(0);
            let mut successes = Vec::new();
            let mut failures = 0u64;

            for _ in 0..rng.gen_range(1..40) {
                let icmp = if rng.gen_bool(0.8) {
                    let rtt = rng.gen_range(0..500);
                    successes.push(rtt);
                    IcmpResult::success(rtt, None, 32)
                } else {
                    failures += 1;
                    IcmpResult::failed(ProbeStatus::TimedOut)
                };
                endpoint.apply(Some(round(Some(icmp), None)));

                let stats = endpoint.icmp();
                if let Some(last) = stats.last_latency() {
                    assert!(stats.max_latency().unwrap() >= last);
                    assert!(stats.min_latency().unwrap() <= last);
                }
            }

            let stats = endpoint.icmp();
            let with_icmp = endpoint.history().iter().filter(|r| r.icmp.is_some()).count();
            assert_eq!(stats.total_count() as usize, with_icmp);
            assert_eq!(stats.failed_count(), failures);
            assert_eq!(stats.succeed_count() as usize, successes.len());

            if successes.is_empty() {
                assert_eq!(stats.average_latency(), None);
                assert_eq!(stats.max_latency(), None);
            } else {
                let sum: u64 = successes.iter().sum();
                assert_eq!(
                    stats.average_latency(),
                    Some(sum / successes.len() as u64)
                );
                assert_eq!(stats.max_latency(), successes.iter().max().copied());
                assert_eq!(stats.min_latency(), successes.iter().min().copied());
            }
        }
    }

    #[test]
    fn test_failure_clears_last_latency_but_keeps_extremes() {
        let mut endpoint = Endpoint::new(0);
        let started = Utc::now();
        endpoint.apply(Some(TestResult {
            time: started,
            icmp: None,
            tcp: tcp_ok(40),
        }));
        let failed_at = started + Duration::seconds(60);
        let changed = endpoint.apply(Some(TestResult {
            time: failed_at,
            icmp: None,
            tcp: Some(TcpResult::failed(ProbeStatus::BadDestination)),
        }));

        let stats = endpoint.tcp();
        assert_eq!(stats.last_latency(), None);
        assert_eq!(stats.max_latency(), Some(40));
        assert_eq!(stats.min_latency(), Some(40));
        assert_eq!(stats.average_latency(), Some(40));
        assert_eq!(stats.last_succeed_at(), Some(started));
        assert_eq!(stats.last_failed_at(), Some(failed_at));
        assert_eq!(stats.succeed_ratio(), Some(0.5));
        assert_eq!(stats.failed_ratio(), Some(0.5));

        assert!(changed.contains(&Field::Tcp(StatField::FailedCount)));
        assert!(changed.contains(&Field::Tcp(StatField::LastLatency)));
        assert!(!changed.contains(&Field::Tcp(StatField::MaxLatency)));
        assert!(!changed.contains(&Field::Tcp(StatField::AverageLatency)));
        assert!(changed.contains(&Field::DisplayStatus));
    }

    #[test]
    fn test_failure_beats_sibling_success() {
        let mut endpoint = Endpoint::new(0);
        endpoint.apply(Some(round(
            icmp_ok(3),
            Some(TcpResult::failed(ProbeStatus::TimedOut)),
        )));
        assert_eq!(endpoint.display_status(), DisplayStatus::Failed);
        assert_eq!(endpoint.icmp().succeed_count(), 1);
        assert_eq!(endpoint.tcp().failed_count(), 1);
    }

    #[test]
    fn test_icmp_only_success() {
        let mut endpoint = Endpoint::new(0);
        endpoint.set_allow_tcp(false);
        let changed = endpoint.apply(Some(round(icmp_ok(9), None)));
        assert_eq!(endpoint.display_status(), DisplayStatus::Succeed);
        assert_eq!(changed[0], Field::History);
        assert!(changed.contains(&Field::Icmp(StatField::MinLatency)));
        assert!(!changed.iter().any(|f| matches!(f, Field::Tcp(_))));
    }

    #[test]
    fn test_disabled_kind_does_not_drive_status() {
        let mut endpoint = Endpoint::new(0);
        endpoint.set_allow_icmp(false);
        endpoint.apply(Some(round(
            Some(IcmpResult::failed(ProbeStatus::Unknown)),
            tcp_ok(12),
        )));
        assert_eq!(endpoint.display_status(), DisplayStatus::Succeed);
        // counted nonetheless
        assert_eq!(endpoint.icmp().failed_count(), 1);
    }

    #[test]
    fn test_status_follows_latest_round() {
        let mut endpoint = Endpoint::new(0);
        endpoint.apply(Some(round(Some(IcmpResult::failed(ProbeStatus::TimedOut)), None)));
        assert_eq!(endpoint.display_status(), DisplayStatus::Failed);
        endpoint.apply(Some(round(icmp_ok(1), None)));
        assert_eq!(endpoint.display_status(), DisplayStatus::Succeed);
    }

    #[test]
    fn test_unchanged_fields_are_not_reported() {
        let mut stats = ProbeStats::default();
        let now = Utc::now();
        stats.record(ProbeStatus::Success, 10, now);
        let changed = stats.record(ProbeStatus::Success, 10, now);

        assert_eq!(changed, vec![StatField::SucceedCount]);
        assert!(stats.reset().contains(&StatField::LastSucceedAt));
        assert!(stats.reset().is_empty());
    }
}
