mod metrics;

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::context::{ComputerContext, TickSummary};

pub use metrics::{LoopMetricsSnapshot, MetricsHandle};
use metrics::MetricsAccumulator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldLoopConfig {
    pub target_tps: u32,
    pub max_frame_delta: Duration,
    pub max_ticks_per_frame: u32,
    pub metrics_log_interval: Duration,
    /// Stop after this many world ticks. `None` runs until a hook stops it.
    pub max_ticks: Option<u64>,
}

impl Default for WorldLoopConfig {
    fn default() -> Self {
        Self {
            target_tps: 20,
            max_frame_delta: Duration::from_millis(250),
            max_ticks_per_frame: 5,
            metrics_log_interval: Duration::from_secs(1),
            max_ticks: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Game-side callbacks around each world step. Runs on the world thread.
pub trait WorldHooks<W> {
    fn before_tick(&mut self, _context: &mut ComputerContext<W>, _world: &mut W) -> LoopControl {
        LoopControl::Continue
    }

    fn after_tick(
        &mut self,
        _summary: &TickSummary,
        _context: &mut ComputerContext<W>,
        _world: &mut W,
    ) -> LoopControl {
        LoopControl::Continue
    }

    /// Once per frame after the frame's ticks; the place to render.
    fn on_frame(&mut self, _context: &ComputerContext<W>, _world: &W) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TickLimit,
    Hook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub ticks: u64,
    pub reason: StopReason,
}

/// Drives `context` at a fixed rate until a hook stops it or the tick limit
/// is reached.
pub fn run_world_loop<W: 'static>(
    config: &WorldLoopConfig,
    context: &mut ComputerContext<W>,
    world: &mut W,
    hooks: &mut dyn WorldHooks<W>,
    metrics_handle: &MetricsHandle,
) -> LoopOutcome {
    let target_tps = config.target_tps.max(1);
    let mut clock = TickClock::new(target_tps, config.max_frame_delta, config.max_ticks_per_frame);
    let metrics_log_interval =
        or_default_if_zero(config.metrics_log_interval, Duration::from_secs(1));

    info!(
        target_tps,
        max_frame_delta_ms = clock.max_frame_delta.as_millis() as u64,
        max_ticks_per_frame = clock.max_ticks_per_frame,
        metrics_log_interval_ms = metrics_log_interval.as_millis() as u64,
        max_ticks = ?config.max_ticks,
        "loop_config"
    );

    let mut ticks = 0u64;
    let mut last_frame_instant = Instant::now();
    let mut metrics_accumulator =
        MetricsAccumulator::new(metrics_log_interval, last_frame_instant);

    let reason = 'frames: loop {
        let now = Instant::now();
        let raw_frame_dt = now.saturating_duration_since(last_frame_instant);
        last_frame_instant = now;
        let frame = clock.advance(raw_frame_dt);
        for _ in 0..frame.ticks {
            if config.max_ticks.is_some_and(|limit| ticks >= limit) {
                break 'frames StopReason::TickLimit;
            }
            if hooks.before_tick(context, world) == LoopControl::Stop {
                break 'frames StopReason::Hook;
            }
            let tick_start = Instant::now();
            let summary = context.tick(world);
            metrics_accumulator.record_tick(tick_start.elapsed(), &summary.main_thread);
            ticks = ticks.saturating_add(1);
            if hooks.after_tick(&summary, context, world) == LoopControl::Stop {
                hooks.on_frame(context, world);
                break 'frames StopReason::Hook;
            }
        }
        if !frame.skipped.is_zero() {
            warn!(
                skipped_ms = frame.skipped.as_millis() as u64,
                max_ticks_per_frame = clock.max_ticks_per_frame,
                "world_ticks_skipped"
            );
        }

        hooks.on_frame(context, world);

        if let Some(snapshot) = metrics_accumulator.maybe_snapshot(Instant::now()) {
            metrics_handle.publish(snapshot);
            info!(
                tps = snapshot.tps,
                tick_time_ms = snapshot.tick_time_ms,
                commands_executed = snapshot.commands_executed,
                commands_deferred = snapshot.commands_deferred,
                slow_commands = snapshot.slow_commands,
                computers = context.computer_ids().len(),
                "loop_metrics"
            );
        }

        if config.max_ticks.is_some_and(|limit| ticks >= limit) {
            break StopReason::TickLimit;
        }

        let wait = clock.until_next_tick();
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    };

    info!(ticks, reason = ?reason, "world_loop_stopped");
    LoopOutcome { ticks, reason }
}

/// Ticks owed for one frame, plus wall time given up because the frame hit
/// its tick cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameTicks {
    ticks: u32,
    skipped: Duration,
}

/// Fixed-step clock for the world thread.
#[derive(Debug, Clone)]
struct TickClock {
    tick: Duration,
    max_frame_delta: Duration,
    max_ticks_per_frame: u32,
    owed: Duration,
}

impl TickClock {
    fn new(target_tps: u32, max_frame_delta: Duration, max_ticks_per_frame: u32) -> Self {
        let tick = Duration::from_secs_f64(1.0 / f64::from(target_tps.max(1)));
        Self {
            tick,
            max_frame_delta: or_default_if_zero(max_frame_delta, Duration::from_millis(250)),
            max_ticks_per_frame: max_ticks_per_frame.max(1),
            // The first frame owes one tick so the world starts immediately.
            owed: tick,
        }
    }

    /// Credits `elapsed` wall time (capped at `max_frame_delta`) and takes as
    /// many whole ticks as the per-frame cap allows. Anything still owed past
    /// the cap is forgotten.
    fn advance(&mut self, elapsed: Duration) -> FrameTicks {
        self.owed = self.owed.saturating_add(elapsed.min(self.max_frame_delta));
        let whole = self.owed.as_nanos() / self.tick.as_nanos().max(1);
        let ticks = u32::try_from(whole)
            .unwrap_or(u32::MAX)
            .min(self.max_ticks_per_frame);
        self.owed = self.owed.saturating_sub(self.tick.saturating_mul(ticks));

        if self.owed >= self.tick {
            FrameTicks {
                ticks,
                skipped: std::mem::take(&mut self.owed),
            }
        } else {
            FrameTicks {
                ticks,
                skipped: Duration::ZERO,
            }
        }
    }

    fn until_next_tick(&self) -> Duration {
        self.tick.saturating_sub(self.owed)
    }
}

fn or_default_if_zero(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;

    fn clock_at_20_tps(max_ticks_per_frame: u32) -> TickClock {
        let mut clock = TickClock::new(20, Duration::from_millis(250), max_ticks_per_frame);
        assert_eq!(clock.advance(Duration::ZERO).ticks, 1);
        clock
    }

    #[test]
    fn first_frame_owes_exactly_one_tick() {
        let mut clock = TickClock::new(20, Duration::from_millis(250), 5);
        assert_eq!(
            clock.advance(Duration::from_millis(10)),
            FrameTicks {
                ticks: 1,
                skipped: Duration::ZERO
            }
        );
        assert_eq!(clock.until_next_tick(), Duration::from_millis(40));
    }

    #[test]
    fn leftover_time_carries_into_the_next_frame() {
        let mut clock = clock_at_20_tps(5);
        assert_eq!(clock.advance(Duration::from_millis(120)).ticks, 2);
        assert_eq!(clock.until_next_tick(), Duration::from_millis(30));
        assert_eq!(clock.advance(Duration::from_millis(30)).ticks, 1);
    }

    #[test]
    fn a_stalled_frame_is_capped_before_ticks_are_counted() {
        let mut clock = clock_at_20_tps(10);
        // Four seconds of stall only buys the 250ms frame cap.
        let frame = clock.advance(Duration::from_secs(4));
        assert_eq!(frame.ticks, 5);
        assert_eq!(frame.skipped, Duration::ZERO);
    }

    #[test]
    fn time_past_the_per_frame_tick_cap_is_skipped() {
        let mut clock = clock_at_20_tps(2);
        let frame = clock.advance(Duration::from_millis(180));
        assert_eq!(frame.ticks, 2);
        assert_eq!(frame.skipped, Duration::from_millis(80));
        assert_eq!(clock.until_next_tick(), Duration::from_millis(50));
    }

    #[test]
    fn zero_settings_are_replaced_with_workable_ones() {
        let clock = TickClock::new(0, Duration::ZERO, 0);
        assert_eq!(clock.tick, Duration::from_secs(1));
        assert_eq!(clock.max_frame_delta, Duration::from_millis(250));
        assert_eq!(clock.max_ticks_per_frame, 1);
    }

    #[derive(Default)]
    struct CountingHooks {
        before: u64,
        after: u64,
        frames: u64,
        stop_after: Option<u64>,
    }

    impl WorldHooks<u64> for CountingHooks {
        fn before_tick(
            &mut self,
            _context: &mut ComputerContext<u64>,
            _world: &mut u64,
        ) -> LoopControl {
            self.before += 1;
            LoopControl::Continue
        }

        fn after_tick(
            &mut self,
            summary: &TickSummary,
            _context: &mut ComputerContext<u64>,
            world: &mut u64,
        ) -> LoopControl {
            self.after += 1;
            *world = summary.tick;
            if self.stop_after == Some(self.after) {
                LoopControl::Stop
            } else {
                LoopControl::Continue
            }
        }

        fn on_frame(&mut self, _context: &ComputerContext<u64>, _world: &u64) {
            self.frames += 1;
        }
    }

    fn fast_config(max_ticks: Option<u64>) -> WorldLoopConfig {
        WorldLoopConfig {
            target_tps: 1000,
            max_ticks,
            ..WorldLoopConfig::default()
        }
    }

    fn small_context() -> ComputerContext<u64> {
        ComputerContext::new(ContextConfig {
            worker_threads: 1,
            ..ContextConfig::default()
        })
        .expect("context")
    }

    #[test]
    fn loop_stops_at_tick_limit() {
        let mut context = small_context();
        let mut world = 0u64;
        let mut hooks = CountingHooks::default();

        let outcome = run_world_loop(
            &fast_config(Some(5)),
            &mut context,
            &mut world,
            &mut hooks,
            &MetricsHandle::default(),
        );

        assert_eq!(outcome, LoopOutcome { ticks: 5, reason: StopReason::TickLimit });
        assert_eq!(context.current_tick(), 5);
        assert_eq!(world, 5);
        assert_eq!(hooks.before, 5);
        assert_eq!(hooks.after, 5);
        assert!(hooks.frames >= 1);
    }

    #[test]
    fn hook_can_stop_the_loop() {
        let mut context = small_context();
        let mut world = 0u64;
        let mut hooks = CountingHooks {
            stop_after: Some(2),
            ..CountingHooks::default()
        };

        let outcome = run_world_loop(
            &fast_config(Some(100)),
            &mut context,
            &mut world,
            &mut hooks,
            &MetricsHandle::default(),
        );

        assert_eq!(outcome, LoopOutcome { ticks: 2, reason: StopReason::Hook });
        assert_eq!(world, 2);
    }
}
