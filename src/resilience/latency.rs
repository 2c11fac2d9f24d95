use crate::core::types::TransportKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportMetricsSnapshot {
    pub ewma_latency_ms: Option<f64>,
    pub success_rate: f64,
    pub calls: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct TransportMetrics {
    ewma_ms: Option<f64>,
    outcomes: VecDeque<bool>,
    calls: u64,
    failures: u64,
}

/// EWMA latency and rolling success rate for both transports
pub struct LatencyTracker {
    alpha: f64,
    window: usize,
    rest: Mutex<TransportMetrics>,
    stream: Mutex<TransportMetrics>,
}

impl LatencyTracker {
    pub fn new(alpha: f64, window: usize) -> Self {
        Self {
            alpha,
            window: window.max(1),
            rest: Mutex::new(TransportMetrics::default()),
            stream: Mutex::new(TransportMetrics::default()),
        }
    }

    fn metrics(&self, kind: TransportKind) -> &Mutex<TransportMetrics> {
        match kind {
            TransportKind::Rest => &self.rest,
            TransportKind::Stream => &self.stream,
        }
    }

    pub fn record(&self, kind: TransportKind, latency: Duration, success: bool) {
        let mut metrics = self.metrics(kind).lock();
        metrics.calls += 1;
        if success {
            let sample = latency.as_secs_f64() * 1000.0;
            metrics.ewma_ms = Some(match metrics.ewma_ms {
                Some(previous) => self.alpha * sample + (1.0 - self.alpha) * previous,
                None => sample,
            });
        } else {
            metrics.failures += 1;
        }

        metrics.outcomes.push_back(success);
        while metrics.outcomes.len() > self.window {
            metrics.outcomes.pop_front();
        }
    }

    /// Forget the rolling outcomes so the success rate restarts at `1.0`.
    /// EWMA latency and lifetime counters are kept.
    pub fn reseed(&self, kind: TransportKind) {
        self.metrics(kind).lock().outcomes.clear();
    }

    pub fn ewma_ms(&self, kind: TransportKind) -> Option<f64> {
        self.metrics(kind).lock().ewma_ms
    }

    /// Rolling success rate, `1.0` before any samples
    pub fn success_rate(&self, kind: TransportKind) -> f64 {
        let metrics = self.metrics(kind).lock();
        Self::rate(&metrics)
    }

    pub fn snapshot(&self, kind: TransportKind) -> TransportMetricsSnapshot {
        let metrics = self.metrics(kind).lock();
        TransportMetricsSnapshot {
            ewma_latency_ms: metrics.ewma_ms,
            success_rate: Self::rate(&metrics),
            calls: metrics.calls,
            failures: metrics.failures,
        }
    }

    fn rate(metrics: &TransportMetrics) -> f64 {
        if metrics.outcomes.is_empty() {
            return 1.0;
        }
        let successes = metrics.outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / metrics.outcomes.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_smoothing() {
        let tracker = LatencyTracker::new(0.5, 10);
        tracker.record(TransportKind::Rest, Duration::from_millis(100), true);
        tracker.record(TransportKind::Rest, Duration::from_millis(200), true);
        let ewma = tracker.ewma_ms(TransportKind::Rest).unwrap();
        assert!((ewma - 150.0).abs() < 1e-6);
        assert!(tracker.ewma_ms(TransportKind::Stream).is_none());
    }

    #[test]
    fn test_success_rate_window() {
        let tracker = LatencyTracker::new(0.1, 4);
        assert!((tracker.success_rate(TransportKind::Stream) - 1.0).abs() < f64::EPSILON);
        for _ in 0..4 {
            tracker.record(TransportKind::Stream, Duration::ZERO, false);
        }
        for _ in 0..2 {
            tracker.record(TransportKind::Stream, Duration::ZERO, true);
        }
        assert!((tracker.success_rate(TransportKind::Stream) - 0.5).abs() < f64::EPSILON);
        assert_eq!(tracker.snapshot(TransportKind::Stream).failures, 4);
    }

    #[test]
    fn test_reseed_restores_rate_but_keeps_counters() {
        let tracker = LatencyTracker::new(0.1, 10);
        tracker.record(TransportKind::Stream, Duration::from_millis(5), true);
        tracker.record(TransportKind::Stream, Duration::ZERO, false);
        assert!((tracker.success_rate(TransportKind::Stream) - 0.5).abs() < f64::EPSILON);

        tracker.reseed(TransportKind::Stream);
        let snapshot = tracker.snapshot(TransportKind::Stream);
        assert!((snapshot.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.calls, 2);
        assert_eq!(snapshot.failures, 1);
        assert!(snapshot.ewma_latency_ms.is_some());
    }
}
