//! Shared stats counters and the periodic reporter line.
//!
//! Mirrors the original's `RawParserService._stats_loop`: periodic totals
//! plus interval rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Stats {
    pub inbound: AtomicU64,
    pub raw_published: AtomicU64,
    pub parsed_published: AtomicU64,
    pub dropped: AtomicU64,
    pub parse_errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_inbound(&self) {
        self.inbound.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_raw_published(&self) {
        self.raw_published.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_parsed_published(&self) {
        self.parsed_published.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_parse_errors(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> [u64; 5] {
        [
            self.inbound.load(Ordering::Relaxed),
            self.raw_published.load(Ordering::Relaxed),
            self.parsed_published.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
        ]
    }
}

/// Runs until cancelled, logging a totals + per-interval-rate line every
/// `period`. `queue_depth`/`device_count` are read fresh each tick.
pub async fn run_reporter(
    stats: std::sync::Arc<Stats>,
    period: Duration,
    queue_depth: impl Fn() -> usize,
    device_count: impl Fn() -> usize,
) {
    let mut prev = stats.snapshot();
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let now = stats.snapshot();
        let secs = period.as_secs_f64().max(0.001);
        let rate = |i: usize| (now[i] - prev[i]) as f64 / secs;
        tracing::info!(
            in_total = now[0],
            in_rate = rate(0),
            raw_pub_total = now[1],
            raw_pub_rate = rate(1),
            parsed_pub_total = now[2],
            parsed_pub_rate = rate(2),
            drop_total = now[3],
            drop_rate = rate(3),
            parse_err_total = now[4],
            parse_err_rate = rate(4),
            queue_depth = queue_depth(),
            device_count = device_count(),
            "ingest-agent stats"
        );
        prev = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.incr_inbound();
        stats.incr_inbound();
        stats.incr_dropped();
        assert_eq!(stats.snapshot(), [2, 0, 0, 1, 0]);
    }
}
