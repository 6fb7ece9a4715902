use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::main_thread::MainThreadTickReport;
use crate::sync::{read_or_recover, write_or_recover};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopMetricsSnapshot {
    pub tps: f32,
    /// Mean wall time of one world step, computers and privileged commands
    /// included.
    pub tick_time_ms: f32,
    pub commands_executed: u32,
    pub commands_deferred: u32,
    pub slow_commands: u32,
}

/// Latest published loop metrics, readable from any thread.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    snapshot: Arc<RwLock<LoopMetricsSnapshot>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(LoopMetricsSnapshot::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> LoopMetricsSnapshot {
        *read_or_recover(&self.snapshot, "loop_metrics")
    }

    pub(crate) fn publish(&self, snapshot: LoopMetricsSnapshot) {
        *write_or_recover(&self.snapshot, "loop_metrics") = snapshot;
    }
}

#[derive(Debug)]
pub(crate) struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    ticks: u32,
    tick_time_sum: Duration,
    executed: u32,
    deferred: u32,
    slow: u32,
}

impl MetricsAccumulator {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval_start: now,
            interval,
            ticks: 0,
            tick_time_sum: Duration::ZERO,
            executed: 0,
            deferred: 0,
            slow: 0,
        }
    }

    pub(crate) fn record_tick(&mut self, tick_time: Duration, report: &MainThreadTickReport) {
        self.ticks = self.ticks.saturating_add(1);
        self.tick_time_sum = self.tick_time_sum.saturating_add(tick_time);
        self.executed = self.executed.saturating_add(saturate(report.executed));
        self.deferred = self.deferred.saturating_add(saturate(report.deferred));
        self.slow = self.slow.saturating_add(saturate(report.slow));
    }

    pub(crate) fn maybe_snapshot(&mut self, now: Instant) -> Option<LoopMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let tick_time_ms = if self.ticks == 0 {
            0.0
        } else {
            (self.tick_time_sum.as_secs_f32() / self.ticks as f32) * 1000.0
        };

        let snapshot = LoopMetricsSnapshot {
            tps: self.ticks as f32 / elapsed_seconds,
            tick_time_ms,
            commands_executed: self.executed,
            commands_deferred: self.deferred,
            slow_commands: self.slow,
        };

        self.interval_start = now;
        self.ticks = 0;
        self.tick_time_sum = Duration::ZERO;
        self.executed = 0;
        self.deferred = 0;
        self.slow = 0;

        Some(snapshot)
    }
}

fn saturate(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::thread;

    use super::*;

    fn poison_lock(lock: &RwLock<LoopMetricsSnapshot>) {
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = lock.write().expect("write guard");
                    panic!("poison metrics lock");
                })
                .join();
        });
    }

    fn report(executed: usize, deferred: usize, slow: usize) -> MainThreadTickReport {
        MainThreadTickReport {
            executed,
            deferred,
            slow,
            ..MainThreadTickReport::default()
        }
    }

    #[test]
    fn snapshot_computes_expected_values() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1), base);

        accumulator.record_tick(Duration::from_millis(4), &report(2, 1, 0));
        accumulator.record_tick(Duration::from_millis(6), &report(3, 0, 1));
        accumulator.record_tick(Duration::from_millis(2), &report(0, 0, 0));
        accumulator.record_tick(Duration::from_millis(4), &report(1, 2, 0));

        let snapshot = accumulator
            .maybe_snapshot(base + Duration::from_secs(1))
            .expect("snapshot should be emitted");

        assert!((snapshot.tps - 4.0).abs() < 0.05);
        assert!((snapshot.tick_time_ms - 4.0).abs() < 0.001);
        assert_eq!(snapshot.commands_executed, 6);
        assert_eq!(snapshot.commands_deferred, 3);
        assert_eq!(snapshot.slow_commands, 1);
    }

    #[test]
    fn snapshot_not_emitted_before_interval() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1), base);
        accumulator.record_tick(Duration::from_millis(16), &report(0, 0, 0));

        assert!(accumulator
            .maybe_snapshot(base + Duration::from_millis(500))
            .is_none());
    }

    #[test]
    fn counters_reset_after_snapshot() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1), base);
        accumulator.record_tick(Duration::from_millis(3), &report(5, 0, 0));
        accumulator
            .maybe_snapshot(base + Duration::from_secs(1))
            .expect("first snapshot");

        let second = accumulator
            .maybe_snapshot(base + Duration::from_secs(2))
            .expect("second snapshot");
        assert_eq!(second.tps, 0.0);
        assert_eq!(second.tick_time_ms, 0.0);
        assert_eq!(second.commands_executed, 0);
    }

    #[test]
    fn snapshot_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        assert_eq!(handle.snapshot(), LoopMetricsSnapshot::default());
    }

    #[test]
    fn publish_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        let expected = LoopMetricsSnapshot {
            tps: 20.0,
            tick_time_ms: 1.5,
            commands_executed: 40,
            commands_deferred: 2,
            slow_commands: 0,
        };
        handle.publish(expected);

        assert_eq!(handle.snapshot(), expected);
    }
}
