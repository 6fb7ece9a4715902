use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::sync::lock_or_recover;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum PoolMessage {
    Run(Job),
    Exit,
}

impl std::fmt::Debug for PoolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMessage::Run(_) => f.write_str("Run"),
            PoolMessage::Exit => f.write_str("Exit"),
        }
    }
}

#[derive(Debug, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

#[derive(Debug)]
struct PoolShared {
    sender: Sender<PoolMessage>,
    receiver: Receiver<PoolMessage>,
    exit_sender: Sender<usize>,
    closed: AtomicBool,
    /// Threads waiting for a job that no submission has claimed yet.
    idle: AtomicUsize,
    live: AtomicUsize,
    next_index: AtomicUsize,
    threads: Mutex<HashMap<usize, JoinHandle<()>>>,
}

impl PoolShared {
    fn spawn_thread(self: &Arc<Self>) -> io::Result<()> {
        let mut threads = lock_or_recover(&self.threads, "worker_pool_threads");
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(self);
        self.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("computer-worker-{index}"))
            .spawn(move || {
                worker_loop(&shared);
                shared.live.fetch_sub(1, Ordering::AcqRel);
                let _ = shared.exit_sender.send(index);
            });
        match spawned {
            Ok(handle) => {
                threads.insert(index, handle);
                Ok(())
            }
            Err(error) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(error)
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = lock_or_recover(&self.threads, "worker_pool_threads");
        for _ in 0..threads.len() {
            let _ = self.sender.send(PoolMessage::Exit);
        }
    }
}

/// Cheap submission handle held by every computer.
#[derive(Debug, Clone)]
pub(crate) struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    /// Queues `job` for an idle thread, starting a new thread when every
    /// existing one is busy. A session never waits for another to end.
    pub(crate) fn submit(&self, job: Job) -> Result<(), PoolClosed> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(PoolClosed);
        }
        let claimed_idle = shared
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| idle.checked_sub(1))
            .is_ok();
        if !claimed_idle {
            match shared.spawn_thread() {
                Ok(()) => debug!(
                    live = shared.live.load(Ordering::Acquire),
                    "worker_pool_grown"
                ),
                Err(error) => {
                    error!(error = %error, "computer_worker_spawn_failed");
                }
            }
        }
        shared
            .sender
            .send(PoolMessage::Run(job))
            .map_err(|_| PoolClosed)
    }
}

/// Named threads that run worker sessions. `warm_threads` start up front;
/// more are started whenever a job arrives with no idle thread, so every
/// live session owns a thread until it ends.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    handle: PoolHandle,
    exits: Receiver<usize>,
}

impl WorkerPool {
    pub(crate) fn new(warm_threads: usize) -> io::Result<Self> {
        let warm_threads = warm_threads.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<PoolMessage>();
        let (exit_sender, exits) = crossbeam_channel::unbounded();
        let shared = Arc::new(PoolShared {
            sender,
            receiver,
            exit_sender,
            closed: AtomicBool::new(false),
            idle: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            threads: Mutex::new(HashMap::new()),
        });

        for _ in 0..warm_threads {
            if let Err(error) = shared.spawn_thread() {
                shared.close();
                return Err(error);
            }
            shared.idle.fetch_add(1, Ordering::AcqRel);
        }

        info!(threads = warm_threads, "worker_pool_started");
        Ok(Self {
            handle: PoolHandle { shared },
            exits,
        })
    }

    pub(crate) fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub(crate) fn thread_count(&self) -> usize {
        lock_or_recover(&self.handle.shared.threads, "worker_pool_threads").len()
    }

    pub(crate) fn live_threads(&self) -> usize {
        self.handle.shared.live.load(Ordering::Acquire)
    }

    /// Stops accepting jobs, asks every thread to exit once the queue ahead
    /// of it drains, and waits up to `timeout`. Returns the number of threads
    /// still running when time ran out.
    pub(crate) fn shutdown_and_wait(&mut self, timeout: Duration) -> usize {
        let shared = &self.handle.shared;
        shared.close();

        let deadline = Instant::now() + timeout;
        while self.thread_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exits.recv_timeout(remaining) {
                Ok(index) => {
                    let handle =
                        lock_or_recover(&shared.threads, "worker_pool_threads").remove(&index);
                    if let Some(handle) = handle {
                        if handle.join().is_err() {
                            warn!(thread = index, "computer_worker_join_failed");
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let alive = self.thread_count();
        if alive == 0 {
            debug!("worker_pool_stopped");
        }
        alive
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.handle.shared.close();
    }
}

fn worker_loop(shared: &PoolShared) {
    while let Ok(message) = shared.receiver.recv() {
        match message {
            PoolMessage::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("computer_worker_job_panicked");
                }
                shared.idle.fetch_add(1, Ordering::AcqRel);
            }
            PoolMessage::Exit => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn jobs_run_on_named_threads() {
        let mut pool = WorkerPool::new(2).expect("pool");
        let (sender, receiver) = crossbeam_channel::unbounded();
        for _ in 0..4 {
            let sender = sender.clone();
            pool.handle()
                .submit(Box::new(move || {
                    let name = thread::current().name().map(str::to_string);
                    let _ = sender.send(name);
                }))
                .expect("submit");
        }

        for _ in 0..4 {
            let name = receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("job ran")
                .expect("named thread");
            assert!(name.starts_with("computer-worker-"), "{name}");
        }
        assert_eq!(pool.shutdown_and_wait(Duration::from_secs(5)), 0);
        assert_eq!(pool.live_threads(), 0);
    }

    #[test]
    fn busy_threads_do_not_starve_later_jobs() {
        let mut pool = WorkerPool::new(1).expect("pool");
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        let (done, finished) = crossbeam_channel::unbounded();

        pool.handle()
            .submit(Box::new(move || {
                let _ = gate.recv();
            }))
            .expect("submit");
        pool.handle()
            .submit(Box::new(move || {
                let _ = done.send(thread::current().name().map(str::to_string));
            }))
            .expect("submit");

        let name = finished
            .recv_timeout(Duration::from_secs(5))
            .expect("second job ran while the first is still blocked")
            .expect("named thread");
        assert!(name.starts_with("computer-worker-"), "{name}");
        assert_eq!(pool.thread_count(), 2);

        release.send(()).expect("release");
        assert_eq!(pool.shutdown_and_wait(Duration::from_secs(5)), 0);
        assert_eq!(pool.live_threads(), 0);
    }

    #[test]
    fn idle_threads_are_reused() {
        let mut pool = WorkerPool::new(2).expect("pool");
        let (sender, receiver) = crossbeam_channel::unbounded();
        for round in 0..6 {
            let sender = sender.clone();
            pool.handle()
                .submit(Box::new(move || {
                    let _ = sender.send(round);
                }))
                .expect("submit");
            receiver.recv_timeout(Duration::from_secs(5)).expect("job ran");
            thread::sleep(Duration::from_millis(5));
        }

        assert!(pool.thread_count() <= 3, "{}", pool.thread_count());
        assert_eq!(pool.shutdown_and_wait(Duration::from_secs(5)), 0);
    }

    #[test]
    fn panicking_job_does_not_kill_thread() {
        let mut pool = WorkerPool::new(1).expect("pool");
        let (sender, receiver) = crossbeam_channel::unbounded();
        pool.handle()
            .submit(Box::new(|| panic!("job failure")))
            .expect("submit");
        pool.handle()
            .submit(Box::new(move || {
                let _ = sender.send(7);
            }))
            .expect("submit");

        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(7));
        assert_eq!(pool.shutdown_and_wait(Duration::from_secs(5)), 0);
    }

    #[test]
    fn stuck_thread_is_reported_and_submission_closes() {
        let mut pool = WorkerPool::new(1).expect("pool");
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        pool.handle()
            .submit(Box::new(move || {
                let _ = gate.recv();
            }))
            .expect("submit");

        assert_eq!(pool.shutdown_and_wait(Duration::from_millis(20)), 1);
        assert!(pool.handle().submit(Box::new(|| {})).is_err());

        drop(release);
        assert_eq!(pool.shutdown_and_wait(Duration::from_secs(5)), 0);
    }
}
