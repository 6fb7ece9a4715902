mod capability;
mod event;
mod worker;


use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::context::pool::PoolHandle;
use crate::dirty::DirtyToken;
use crate::main_thread::MainThreadHandle;
use crate::terminal::DisplayBuffer;
use crate::upload::{write_uploads, FileUpload, UploadError};
use crate::vfs::FileSystem;

pub use capability::{Capability, CapabilityError, CapabilityTable};
pub use event::{arg_bool, arg_int, arg_number, arg_string, opt_int, Event, EventQueue, Value};
pub use worker::{EngineFactory, ScriptEngine, ScriptError, ScriptStatus, WorkerContext};
use worker::{WorkerSession, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputerId(pub u32);

impl fmt::Display for ComputerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    Starting,
    On,
    Stopping,
}

#[derive(Debug, Error)]
pub enum ComputerError {
    #[error("worker pool is shut down")]
    PoolClosed,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

struct SessionLink {
    events: Option<Sender<Event>>,
    status: Receiver<WorkerStatus>,
    stop: Arc<AtomicBool>,
}

impl SessionLink {
    fn signal_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.events = None;
    }
}

/// One virtual computer. Owned and driven by the world thread; its script
/// runs on a pool thread between `turn_on` and the matching shutdown.
pub struct Computer<W> {
    id: ComputerId,
    state: PowerState,
    events: EventQueue,
    display: Arc<DisplayBuffer>,
    dirty_token: DirtyToken,
    capabilities: Arc<CapabilityTable<W>>,
    engine_factory: EngineFactory<W>,
    main_thread: MainThreadHandle<W>,
    pool: PoolHandle,
    session: Option<SessionLink>,
    reboot_pending: bool,
    has_booted: bool,
    last_error: Option<String>,
}

impl<W> fmt::Debug for Computer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("queued_events", &self.events.len())
            .field("capabilities", &self.capabilities)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl<W: 'static> Computer<W> {
    pub(crate) fn new(
        id: ComputerId,
        display: Arc<DisplayBuffer>,
        dirty_token: DirtyToken,
        event_queue_capacity: usize,
        engine_factory: EngineFactory<W>,
        main_thread: MainThreadHandle<W>,
        pool: PoolHandle,
    ) -> Self {
        Self {
            id,
            state: PowerState::Off,
            events: EventQueue::new(event_queue_capacity),
            display,
            dirty_token,
            capabilities: Arc::new(CapabilityTable::default()),
            engine_factory,
            main_thread,
            pool,
            session: None,
            reboot_pending: false,
            has_booted: false,
            last_error: None,
        }
    }

    pub fn id(&self) -> ComputerId {
        self.id
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state == PowerState::On
    }

    pub fn display(&self) -> &Arc<DisplayBuffer> {
        &self.display
    }

    pub fn dirty_token(&self) -> DirtyToken {
        self.dirty_token
    }

    /// Failure message from the most recent session, cleared on boot.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn queued_events(&self) -> usize {
        self.events.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn add_capability(
        &mut self,
        capability: Arc<dyn Capability<W>>,
    ) -> Result<(), ComputerError> {
        if self.has_booted {
            return Err(CapabilityError::Frozen.into());
        }
        let table = Arc::get_mut(&mut self.capabilities).ok_or(CapabilityError::Frozen)?;
        table.insert(capability)?;
        Ok(())
    }

    pub fn turn_on(&mut self) -> Result<(), ComputerError> {
        match self.state {
            PowerState::Off => self.boot(),
            PowerState::Starting | PowerState::On => Ok(()),
            PowerState::Stopping => {
                self.reboot_pending = true;
                Ok(())
            }
        }
    }

    /// Asks the worker to unwind. Never blocks; the computer reaches `Off`
    /// on a later tick once the worker has exited.
    pub fn shutdown(&mut self) {
        self.reboot_pending = false;
        match self.state {
            PowerState::Off | PowerState::Stopping => {}
            PowerState::Starting | PowerState::On => {
                if let Some(session) = self.session.as_mut() {
                    session.signal_stop();
                }
                let cancelled = self.main_thread.cancel_computer(self.id);
                self.set_state(PowerState::Stopping);
                if cancelled > 0 {
                    info!(computer = %self.id, cancelled, "computer_commands_cancelled");
                }
            }
        }
    }

    pub fn reboot(&mut self) -> Result<(), ComputerError> {
        match self.state {
            PowerState::Off => self.boot(),
            _ => {
                self.shutdown();
                self.reboot_pending = true;
                Ok(())
            }
        }
    }

    /// Buffers an event; it reaches the script once the computer is on.
    pub fn queue_event(&mut self, name: impl Into<String>, args: Vec<Value>) {
        if let Some(evicted) = self.events.push(Event::new(name, args)) {
            warn!(
                computer = %self.id,
                evicted = evicted.name.as_str(),
                dropped_total = self.events.dropped(),
                capacity = self.events.capacity(),
                "event_queue_overflow"
            );
        }
    }

    /// Called once per world step in every state.
    pub fn tick(&mut self) -> Result<(), ComputerError> {
        self.apply_worker_reports(false)?;
        self.display.apply_pending_resize();
        if self.state == PowerState::On {
            self.flush_events();
        }
        if self.state == PowerState::Off && self.reboot_pending {
            self.reboot_pending = false;
            self.boot()?;
        }
        Ok(())
    }

    pub fn key_down(&mut self, key: i32, repeat: bool) {
        self.queue_event("key", vec![Value::from(key), Value::from(repeat)]);
    }

    pub fn key_up(&mut self, key: i32) {
        self.queue_event("key_up", vec![Value::from(key)]);
    }

    pub fn char_typed(&mut self, ch: char) {
        self.queue_event("char", vec![Value::from(ch.to_string())]);
    }

    pub fn paste(&mut self, text: &str) {
        self.queue_event("paste", vec![Value::from(text)]);
    }

    /// Cell coordinates are zero-based here and one-based in the event.
    pub fn mouse_click(&mut self, button: i32, x: usize, y: usize) {
        self.queue_mouse("mouse_click", button, x, y);
    }

    pub fn mouse_up(&mut self, button: i32, x: usize, y: usize) {
        self.queue_mouse("mouse_up", button, x, y);
    }

    pub fn mouse_drag(&mut self, button: i32, x: usize, y: usize) {
        self.queue_mouse("mouse_drag", button, x, y);
    }

    pub fn mouse_scroll(&mut self, direction: i32, x: usize, y: usize) {
        self.queue_mouse("mouse_scroll", direction, x, y);
    }

    pub fn terminate(&mut self) {
        self.queue_event("terminate", vec![]);
    }

    /// Writes verified uploads into `fs` and tells the script about them.
    /// Nothing is written if any target already exists.
    pub fn upload_files(
        &mut self,
        fs: &dyn FileSystem,
        uploads: &[FileUpload],
    ) -> Result<(), ComputerError> {
        let written = write_uploads(fs, uploads)?;
        info!(computer = %self.id, files = written.len(), "computer_files_uploaded");
        self.queue_event(
            "file_transfer",
            written.into_iter().map(Value::from).collect(),
        );
        Ok(())
    }

    fn queue_mouse(&mut self, name: &str, button: i32, x: usize, y: usize) {
        self.queue_event(
            name,
            vec![
                Value::from(button),
                Value::from(x.saturating_add(1) as f64),
                Value::from(y.saturating_add(1) as f64),
            ],
        );
    }

    fn boot(&mut self) -> Result<(), ComputerError> {
        let (event_sender, event_receiver) =
            crossbeam_channel::bounded(self.events.capacity());
        let (status_sender, status_receiver) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext::new(
            self.id,
            Arc::clone(&self.display),
            Arc::clone(&self.capabilities),
            self.main_thread.clone(),
            status_sender,
            Arc::clone(&stop),
        );
        let session = WorkerSession::new(ctx, Arc::clone(&self.engine_factory), event_receiver);

        self.main_thread.reopen(self.id);
        if self.pool.submit(Box::new(move || session.run())).is_err() {
            self.main_thread.cancel_computer(self.id);
            error!(computer = %self.id, "computer_boot_failed_pool_closed");
            return Err(ComputerError::PoolClosed);
        }

        self.session = Some(SessionLink {
            events: Some(event_sender),
            status: status_receiver,
            stop,
        });
        self.has_booted = true;
        self.last_error = None;
        self.set_state(PowerState::Starting);
        Ok(())
    }

    /// Shuts down and collects the worker's exit while the owning context
    /// closes. Returns `true` once the computer is off.
    pub(crate) fn settle_for_close(&mut self) -> bool {
        self.shutdown();
        // Closing mode never boots, so this cannot fail.
        let _ = self.apply_worker_reports(true);
        self.reboot_pending = false;
        self.state == PowerState::Off
    }

    fn apply_worker_reports(&mut self, closing: bool) -> Result<(), ComputerError> {
        loop {
            let Some(session) = self.session.as_ref() else {
                return Ok(());
            };
            let status = match session.status.try_recv() {
                Ok(status) => status,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => WorkerStatus::Exited {
                    error: Some("worker exited without reporting".to_string()),
                },
            };

            if closing && !matches!(status, WorkerStatus::Exited { .. }) {
                continue;
            }
            match status {
                WorkerStatus::Started => {
                    if self.state == PowerState::Starting {
                        self.set_state(PowerState::On);
                    }
                }
                WorkerStatus::Exited { error } => self.finish_session(error),
                WorkerStatus::ShutdownRequested => self.shutdown(),
                WorkerStatus::RebootRequested => self.reboot()?,
                WorkerStatus::QueueEvent(event) => self.queue_event(event.name, event.args),
            }
        }
    }

    fn finish_session(&mut self, error: Option<String>) {
        self.session = None;
        self.main_thread.cancel_computer(self.id);
        if let Some(message) = error {
            error!(
                computer = %self.id,
                state = ?self.state,
                error = message.as_str(),
                "computer_session_failed"
            );
            self.last_error = Some(message);
        }
        if matches!(self.state, PowerState::Starting | PowerState::On) {
            self.set_state(PowerState::Stopping);
        }
        self.set_state(PowerState::Off);
    }

    fn flush_events(&mut self) {
        let Some(sender) = self.session.as_ref().and_then(|link| link.events.as_ref()) else {
            return;
        };
        while let Some(event) = self.events.pop() {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.events.push_front(event);
                    break;
                }
                Err(TrySendError::Disconnected(event)) => {
                    self.events.push_front(event);
                    break;
                }
            }
        }
    }

    fn set_state(&mut self, next: PowerState) {
        if self.state != next {
            info!(computer = %self.id, from = ?self.state, to = ?next, "computer_state_changed");
            self.state = next;
        }
    }
}

impl<W> Drop for Computer<W> {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.signal_stop();
            self.main_thread.cancel_computer(self.id);
        }
    }
}
