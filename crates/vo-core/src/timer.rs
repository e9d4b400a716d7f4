//! Named timing accumulators for the per-frame pipeline stages.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    total: Duration,
    count: u64,
}

/// Aggregated timing of one stage, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimingSummary {
    pub total_ms: f64,
    pub count: u64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Timer {
    stages: BTreeMap<&'static str, Accumulator>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: &'static str, elapsed: Duration) {
        let acc = self.stages.entry(stage).or_default();
        acc.total += elapsed;
        acc.count += 1;
    }

    /// Run `f`, charging its wall time to `stage`.
    pub fn time<T>(&mut self, stage: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stage, start.elapsed());
        out
    }

    pub fn summary(&self) -> BTreeMap<String, TimingSummary> {
        self.stages
            .iter()
            .map(|(name, acc)| {
                let total_ms = acc.total.as_secs_f64() * 1e3;
                (
                    (*name).to_string(),
                    TimingSummary {
                        total_ms,
                        count: acc.count,
                        mean_ms: if acc.count > 0 {
                            total_ms / acc.count as f64
                        } else {
                            0.0
                        },
                    },
                )
            })
            .collect()
    }

    /// Log one line per stage.
    pub fn report(&self) {
        for (name, summary) in self.summary() {
            info!(
                stage = name.as_str(),
                total_ms = format!("{:.1}", summary.total_ms).as_str(),
                mean_ms = format!("{:.2}", summary.mean_ms).as_str(),
                count = summary.count,
                "stage timing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_stage() {
        let mut timer = Timer::new();
        timer.record("tracking", Duration::from_millis(10));
        timer.record("tracking", Duration::from_millis(30));
        timer.record("kp_sel", Duration::from_millis(5));
        let summary = timer.summary();
        assert_eq!(summary["tracking"].count, 2);
        assert!((summary["tracking"].total_ms - 40.0).abs() < 1e-9);
        assert!((summary["tracking"].mean_ms - 20.0).abs() < 1e-9);
        assert_eq!(summary["kp_sel"].count, 1);
    }

    #[test]
    fn time_returns_the_closure_value() {
        let mut timer = Timer::new();
        let v = timer.time("stage", || 7);
        assert_eq!(v, 7);
        assert_eq!(timer.summary()["stage"].count, 1);
    }
}
