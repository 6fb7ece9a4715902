mod config;
pub(crate) mod pool;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::computer::{Computer, ComputerId, EngineFactory};
use crate::dirty::{DirtyScheduler, DirtyToken};
use crate::main_thread::{
    Clock, MainThreadHandle, MainThreadScheduler, MainThreadTickReport, MonotonicClock,
};
use crate::terminal::DisplayBuffer;

pub use config::{
    ContextConfig, EVENT_QUEUE_CAPACITY_ENV_VAR, MAX_MAIN_COMPUTER_MS_ENV_VAR,
    MAX_MAIN_GLOBAL_MS_ENV_VAR, WORKER_THREADS_ENV_VAR,
};
use pool::WorkerPool;

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to start computer worker threads: {0}")]
    SpawnWorkers(#[source] io::Error),
    #[error("computer context is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("{alive} computer worker thread(s) still running after {timeout:?}")]
    WorkersStillRunning { alive: usize, timeout: Duration },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub tick: u64,
    pub main_thread: MainThreadTickReport,
    pub dirty_tokens: Vec<DirtyToken>,
    /// Computers whose display changed since the previous tick.
    pub dirty_computers: Vec<ComputerId>,
}

/// Owns every computer in one world along with the threads and schedulers
/// they share. Dropping it closes everything with the configured timeout.
pub struct ComputerContext<W> {
    config: ContextConfig,
    pool: WorkerPool,
    main_thread: MainThreadScheduler<W>,
    dirty: DirtyScheduler,
    computers: BTreeMap<ComputerId, Computer<W>>,
    tokens: HashMap<DirtyToken, ComputerId>,
    next_id: u32,
    tick: u64,
    closed: bool,
}

impl<W> std::fmt::Debug for ComputerContext<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputerContext")
            .field("computers", &self.computers.len())
            .field("tick", &self.tick)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<W: 'static> ComputerContext<W> {
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Must be called on the world thread.
    pub fn with_clock(
        config: ContextConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ContextError> {
        let pool = WorkerPool::new(config.worker_threads).map_err(ContextError::SpawnWorkers)?;
        let main_thread = MainThreadScheduler::with_clock(config.main_thread, clock);
        info!(
            worker_threads = pool.thread_count(),
            event_queue_capacity = config.event_queue_capacity,
            max_computer_ms = config.main_thread.max_computer_time.as_millis() as u64,
            max_global_ms = config.main_thread.max_global_time.as_millis() as u64,
            "computer_context_started"
        );
        Ok(Self {
            config,
            pool,
            main_thread,
            dirty: DirtyScheduler::new(),
            computers: BTreeMap::new(),
            tokens: HashMap::new(),
            next_id: 0,
            tick: 0,
            closed: false,
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn dirty(&self) -> &DirtyScheduler {
        &self.dirty
    }

    pub fn main_thread(&self) -> MainThreadHandle<W> {
        self.main_thread.handle()
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Creates an `Off` computer running scripts made by `engine_factory`.
    pub fn create_computer(
        &mut self,
        engine_factory: EngineFactory<W>,
    ) -> Result<&mut Computer<W>, ContextError> {
        if self.closed {
            return Err(ContextError::Closed);
        }
        let id = ComputerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let token = self.dirty.allocate_token();
        let display = Arc::new(DisplayBuffer::with_listener(
            self.config.terminal_width,
            self.config.terminal_height,
            self.dirty.listener(token),
        ));
        let computer = Computer::new(
            id,
            display,
            token,
            self.config.event_queue_capacity,
            engine_factory,
            self.main_thread.handle(),
            self.pool.handle(),
        );
        self.tokens.insert(token, id);
        info!(computer = %id, "computer_created");
        Ok(self.computers.entry(id).or_insert(computer))
    }

    /// Shuts the computer down and drops it. Its worker finishes unwinding
    /// in the background.
    pub fn remove_computer(&mut self, id: ComputerId) -> bool {
        let Some(mut computer) = self.computers.remove(&id) else {
            return false;
        };
        computer.shutdown();
        self.tokens.remove(&computer.dirty_token());
        self.main_thread.forget(id);
        info!(computer = %id, "computer_removed");
        true
    }

    pub fn computer(&self, id: ComputerId) -> Option<&Computer<W>> {
        self.computers.get(&id)
    }

    pub fn computer_mut(&mut self, id: ComputerId) -> Option<&mut Computer<W>> {
        self.computers.get_mut(&id)
    }

    pub fn computers(&self) -> impl Iterator<Item = &Computer<W>> {
        self.computers.values()
    }

    pub fn computer_ids(&self) -> Vec<ComputerId> {
        self.computers.keys().copied().collect()
    }

    /// One world step: every computer, then queued privileged commands, then
    /// the dirty set.
    pub fn tick(&mut self, world: &mut W) -> TickSummary {
        self.tick = self.tick.wrapping_add(1);
        for computer in self.computers.values_mut() {
            if let Err(error) = computer.tick() {
                error!(computer = %computer.id(), error = %error, "computer_tick_failed");
            }
        }

        let main_thread = self.main_thread.tick(world);
        let dirty_tokens = self.dirty.drain();
        let dirty_computers = dirty_tokens
            .iter()
            .filter_map(|token| self.tokens.get(token).copied())
            .collect();

        TickSummary {
            tick: self.tick,
            main_thread,
            dirty_tokens,
            dirty_computers,
        }
    }

    pub fn live_worker_threads(&self) -> usize {
        self.pool.live_threads()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shuts every computer down and waits up to `timeout` for all worker
    /// threads to finish. A thread still running afterwards is reported as an
    /// error; it is left detached.
    pub fn ensure_closed(&mut self, timeout: Duration) -> Result<(), CloseError> {
        let deadline = Instant::now() + timeout;
        if !self.closed {
            self.closed = true;
            info!(computers = self.computers.len(), "computer_context_closing");
        }

        loop {
            let mut all_off = true;
            for computer in self.computers.values_mut() {
                all_off &= computer.settle_for_close();
            }
            if all_off || Instant::now() >= deadline {
                break;
            }
            thread::sleep(CLOSE_POLL_INTERVAL);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let alive = self.pool.shutdown_and_wait(remaining);
        if alive > 0 {
            error!(
                alive,
                timeout_ms = timeout.as_millis() as u64,
                "computer_context_close_timed_out"
            );
            return Err(CloseError::WorkersStillRunning { alive, timeout });
        }
        let still_on = self
            .computers
            .values()
            .filter(|computer| computer.has_session())
            .count();
        if still_on > 0 {
            warn!(still_on, "computer_sessions_unreported_at_close");
        }
        info!("computer_context_closed");
        Ok(())
    }
}

impl<W> Drop for ComputerContext<W> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Each computer signals its worker to stop when dropped.
        self.computers.clear();
        let alive = self.pool.shutdown_and_wait(self.config.close_timeout);
        if alive > 0 {
            error!(alive, "computer_context_dropped_with_live_workers");
        }
    }
}
