mod clock;
mod command;

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::computer::ComputerId;
use crate::sync::lock_or_recover;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use command::{
    CommandContext, CommandError, CommandResult, PendingCommand, PrivilegedCommand,
};
use command::{resolution_channel, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainThreadConfig {
    /// Soft limit for one task. Exceeding it only flags the task as slow.
    pub max_task_time: Duration,
    pub max_computer_time: Duration,
    pub max_global_time: Duration,
}

impl Default for MainThreadConfig {
    fn default() -> Self {
        Self {
            max_task_time: Duration::from_millis(2),
            max_computer_time: Duration::from_millis(5),
            max_global_time: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("privileged commands cannot be submitted from the world thread")]
    WorldThread,
    #[error("computer {0} is not running")]
    ComputerStopped(ComputerId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MainThreadTickReport {
    pub tick: u64,
    pub executed: usize,
    pub deferred: usize,
    pub cancelled: usize,
    pub slow: usize,
    pub time_used: Duration,
}

struct QueuedTask<W> {
    id: u64,
    computer: ComputerId,
    submitted_tick: u64,
    command: Box<dyn PrivilegedCommand<W>>,
    sender: Sender<Resolution>,
}

struct QueueState<W> {
    pending: VecDeque<QueuedTask<W>>,
    closed: HashSet<ComputerId>,
    world_thread: Option<ThreadId>,
    next_task_id: u64,
    current_tick: u64,
    cancelled_since_tick: usize,
}

struct Shared<W> {
    queue: Mutex<QueueState<W>>,
}

/// Submission side of the scheduler, cloned into every worker.
pub struct MainThreadHandle<W> {
    shared: Arc<Shared<W>>,
}

impl<W> Clone for MainThreadHandle<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W> fmt::Debug for MainThreadHandle<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadHandle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl<W> MainThreadHandle<W> {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    closed: HashSet::new(),
                    world_thread: None,
                    next_task_id: 0,
                    current_tick: 0,
                    cancelled_since_tick: 0,
                }),
            }),
        }
    }

    /// Queues `command` for the world thread. Must be called from a worker;
    /// calling it from the world thread would block that thread on itself.
    pub fn submit(
        &self,
        computer: ComputerId,
        command: Box<dyn PrivilegedCommand<W>>,
    ) -> Result<PendingCommand, SubmitError> {
        let mut queue = self.lock();
        if queue.world_thread == Some(thread::current().id()) {
            error!(%computer, "main_thread_submit_from_world_thread");
            return Err(SubmitError::WorldThread);
        }
        if queue.closed.contains(&computer) {
            return Err(SubmitError::ComputerStopped(computer));
        }

        let id = queue.next_task_id;
        queue.next_task_id = queue.next_task_id.wrapping_add(1);
        let submitted_tick = queue.current_tick;
        let (sender, receiver) = resolution_channel();
        queue.pending.push_back(QueuedTask {
            id,
            computer,
            submitted_tick,
            command,
            sender,
        });
        Ok(PendingCommand::new(computer, id, receiver))
    }

    pub fn submit_fn<F>(
        &self,
        computer: ComputerId,
        command: F,
    ) -> Result<PendingCommand, SubmitError>
    where
        F: FnOnce(&mut CommandContext<'_, W>) -> CommandResult + Send + 'static,
    {
        self.submit(computer, Box::new(command))
    }

    /// Refuses further submissions for `computer` and resolves every queued
    /// task it owns as cancelled. Returns how many were cancelled.
    pub fn cancel_computer(&self, computer: ComputerId) -> usize {
        let cancelled = {
            let mut queue = self.lock();
            queue.closed.insert(computer);
            let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut queue.pending)
                .into_iter()
                .partition(|task| task.computer == computer);
            queue.pending = kept;
            queue.cancelled_since_tick += cancelled.len();
            cancelled
        };

        for task in &cancelled {
            let _ = task.sender.send(Resolution::Cancelled);
        }
        if !cancelled.is_empty() {
            debug!(%computer, cancelled = cancelled.len(), "main_thread_tasks_cancelled");
        }
        cancelled.len()
    }

    /// Accepts submissions for `computer` again after a cancel.
    pub fn reopen(&self, computer: ComputerId) {
        self.lock().closed.remove(&computer);
    }

    pub fn is_closed(&self, computer: ComputerId) -> bool {
        self.lock().closed.contains(&computer)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_for(&self, computer: ComputerId) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|task| task.computer == computer)
            .count()
    }

    fn bind_world_thread(&self) {
        self.lock().world_thread = Some(thread::current().id());
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<W>> {
        lock_or_recover(&self.shared.queue, "main_thread_queue")
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ComputerBudget {
    debt: Duration,
    spent: Duration,
    last_cost: Duration,
    ran_this_tick: bool,
}

impl ComputerBudget {
    fn used(&self) -> Duration {
        self.debt.saturating_add(self.spent)
    }
}

/// World-side half: runs queued commands inside budgets.
///
/// Budgets are checked before a task starts, using the computer's previous
/// task cost as the estimate. The first task a computer runs in a tick only
/// needs budget left over. Time spent past a budget is carried into later
/// ticks as debt, so the per-tick average stays within budget even though a
/// running task is never interrupted.
pub struct MainThreadScheduler<W> {
    handle: MainThreadHandle<W>,
    config: MainThreadConfig,
    clock: Arc<dyn Clock>,
    budgets: HashMap<ComputerId, ComputerBudget>,
    global_debt: Duration,
    tick: u64,
    slow_tasks: u64,
}

impl<W> fmt::Debug for MainThreadScheduler<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadScheduler")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("global_debt", &self.global_debt)
            .field("slow_tasks", &self.slow_tasks)
            .finish_non_exhaustive()
    }
}

impl<W> MainThreadScheduler<W> {
    pub fn new(config: MainThreadConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// The calling thread becomes the world thread.
    pub fn with_clock(config: MainThreadConfig, clock: Arc<dyn Clock>) -> Self {
        let handle = MainThreadHandle::new();
        handle.bind_world_thread();
        Self {
            handle,
            config,
            clock,
            budgets: HashMap::new(),
            global_debt: Duration::ZERO,
            tick: 0,
            slow_tasks: 0,
        }
    }

    pub fn handle(&self) -> MainThreadHandle<W> {
        self.handle.clone()
    }

    pub fn config(&self) -> MainThreadConfig {
        self.config
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn slow_task_count(&self) -> u64 {
        self.slow_tasks
    }

    pub fn computer_debt(&self, computer: ComputerId) -> Duration {
        self.budgets
            .get(&computer)
            .map(|budget| budget.debt)
            .unwrap_or_default()
    }

    /// Drops budget bookkeeping for a removed computer. Submissions for it
    /// stay refused.
    pub fn forget(&mut self, computer: ComputerId) {
        self.budgets.remove(&computer);
        self.handle.cancel_computer(computer);
    }

    /// Runs tasks submitted before this call, oldest first, until the
    /// budgets say stop. Tasks submitted while this runs wait for the next
    /// tick.
    pub fn tick(&mut self, world: &mut W) -> MainThreadTickReport {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        let (cutoff, cancelled) = {
            let mut queue = self.handle.lock();
            queue.world_thread = Some(thread::current().id());
            queue.current_tick = tick;
            (
                queue.next_task_id,
                std::mem::take(&mut queue.cancelled_since_tick),
            )
        };

        for budget in self.budgets.values_mut() {
            budget.spent = Duration::ZERO;
            budget.ran_this_tick = false;
        }
        let mut global_spent = Duration::ZERO;
        let mut report = MainThreadTickReport {
            tick,
            cancelled,
            ..MainThreadTickReport::default()
        };

        while let Some(task) = self.take_next_task(cutoff, global_spent, report.executed > 0) {
            let elapsed = self.execute(task, tick, world, &mut report);
            global_spent = global_spent.saturating_add(elapsed);
        }

        report.time_used = global_spent;
        report.deferred = self
            .handle
            .lock()
            .pending
            .iter()
            .filter(|task| task.id < cutoff)
            .count();
        self.settle_debts(global_spent);
        report
    }

    fn take_next_task(
        &mut self,
        cutoff: u64,
        global_spent: Duration,
        global_ran: bool,
    ) -> Option<QueuedTask<W>> {
        let global_used = self.global_debt.saturating_add(global_spent);
        if global_used >= self.config.max_global_time {
            return None;
        }

        let mut queue = self.handle.lock();
        let index = queue.pending.iter().position(|task| {
            if task.id >= cutoff {
                return false;
            }
            let budget = self.budgets.get(&task.computer).copied().unwrap_or_default();
            let used = budget.used();
            if used >= self.config.max_computer_time {
                return false;
            }
            let estimate = budget.last_cost;
            let fits_computer = !budget.ran_this_tick
                || used.saturating_add(estimate) <= self.config.max_computer_time;
            let fits_global =
                !global_ran || global_used.saturating_add(estimate) <= self.config.max_global_time;
            fits_computer && fits_global
        })?;
        queue.pending.remove(index)
    }

    fn execute(
        &mut self,
        task: QueuedTask<W>,
        tick: u64,
        world: &mut W,
        report: &mut MainThreadTickReport,
    ) -> Duration {
        let QueuedTask {
            id,
            computer,
            submitted_tick,
            command,
            sender,
        } = task;

        let started = self.clock.now();
        let mut ctx = CommandContext::new(computer, tick, world);
        let result = panic::catch_unwind(AssertUnwindSafe(|| command.execute(&mut ctx)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(
                    %computer,
                    task_id = id,
                    message = message.as_str(),
                    "main_thread_task_panicked"
                );
                CommandResult::Failure(message)
            });
        let elapsed = self.clock.now().saturating_sub(started);

        let budget = self.budgets.entry(computer).or_default();
        budget.spent = budget.spent.saturating_add(elapsed);
        budget.last_cost = elapsed;
        budget.ran_this_tick = true;
        report.executed += 1;

        if elapsed > self.config.max_task_time {
            report.slow += 1;
            self.slow_tasks = self.slow_tasks.saturating_add(1);
            warn!(
                %computer,
                task_id = id,
                elapsed_us = elapsed.as_micros() as u64,
                limit_us = self.config.max_task_time.as_micros() as u64,
                "main_thread_task_slow"
            );
        }

        if sender.send(Resolution::Completed(result)).is_err() {
            debug!(
                %computer,
                task_id = id,
                submitted_tick,
                "main_thread_result_unclaimed"
            );
        }
        elapsed
    }

    fn settle_debts(&mut self, global_spent: Duration) {
        let max_computer_time = self.config.max_computer_time;
        for budget in self.budgets.values_mut() {
            budget.debt = budget.used().saturating_sub(max_computer_time);
            budget.spent = Duration::ZERO;
        }
        self.global_debt = self
            .global_debt
            .saturating_add(global_spent)
            .saturating_sub(self.config.max_global_time);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "command panicked".to_string()
    }
}
