use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::main_thread::{
    CommandContext, CommandError, CommandResult, MainThreadHandle, PrivilegedCommand, SubmitError,
};
use crate::terminal::DisplayBuffer;

use super::{CapabilityTable, ComputerId, Event, Value};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Runtime(String),
    #[error("no capability named '{0}'")]
    UnknownCapability(String),
    #[error("{capability} has no method '{method}'")]
    UnknownMethod { capability: String, method: String },
    #[error("bad argument #{index} ({message})")]
    BadArgument { index: usize, message: String },
    #[error("capabilities are not available until startup finishes")]
    NotReady,
    #[error("privileged command cancelled: computer is shutting down")]
    Cancelled,
    #[error("terminated")]
    Terminated,
}

impl ScriptError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    /// Waiting for the next event.
    Yielded,
    /// The program ended; the computer turns off.
    Finished,
}

/// The script sandbox. One engine is created per boot and lives on the
/// worker thread until the session ends.
pub trait ScriptEngine<W>: Send {
    fn start(&mut self, ctx: &mut WorkerContext<W>) -> Result<(), ScriptError>;

    fn resume(
        &mut self,
        ctx: &mut WorkerContext<W>,
        event: Event,
    ) -> Result<ScriptStatus, ScriptError>;

    fn terminate(&mut self, _ctx: &mut WorkerContext<W>) {}
}

pub type EngineFactory<W> = Arc<dyn Fn(ComputerId) -> Box<dyn ScriptEngine<W>> + Send + Sync>;

/// Reports a worker sends back to its computer, applied on the next tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerStatus {
    Started,
    Exited { error: Option<String> },
    ShutdownRequested,
    RebootRequested,
    QueueEvent(Event),
}

/// Everything a script can reach from its worker thread.
pub struct WorkerContext<W> {
    computer: ComputerId,
    display: Arc<DisplayBuffer>,
    capabilities: Arc<CapabilityTable<W>>,
    main_thread: MainThreadHandle<W>,
    status: Sender<WorkerStatus>,
    stop: Arc<AtomicBool>,
    ready: bool,
}

impl<W> WorkerContext<W> {
    pub(crate) fn new(
        computer: ComputerId,
        display: Arc<DisplayBuffer>,
        capabilities: Arc<CapabilityTable<W>>,
        main_thread: MainThreadHandle<W>,
        status: Sender<WorkerStatus>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            computer,
            display,
            capabilities,
            main_thread,
            status,
            stop,
            ready: false,
        }
    }

    pub fn computer_id(&self) -> ComputerId {
        self.computer
    }

    pub fn display(&self) -> &DisplayBuffer {
        &self.display
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn capability_names(&self) -> Vec<&'static str> {
        self.capabilities.names().collect()
    }

    pub fn call(
        &mut self,
        capability: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ScriptError> {
        if !self.ready {
            return Err(ScriptError::NotReady);
        }
        let target = self
            .capabilities
            .get(capability)
            .cloned()
            .ok_or_else(|| ScriptError::UnknownCapability(capability.to_string()))?;
        target.call(self, method, args)
    }

    /// Runs `command` on the world thread and blocks until it has run or been
    /// cancelled.
    pub fn execute_command(
        &mut self,
        command: Box<dyn PrivilegedCommand<W>>,
    ) -> Result<CommandResult, ScriptError> {
        if self.is_stopping() {
            return Err(ScriptError::Cancelled);
        }
        let pending = self
            .main_thread
            .submit(self.computer, command)
            .map_err(|error| match error {
                SubmitError::ComputerStopped(_) => ScriptError::Cancelled,
                SubmitError::WorldThread => ScriptError::runtime(error.to_string()),
            })?;
        match pending.wait() {
            Ok(result) => Ok(result),
            Err(CommandError::Cancelled { .. }) => Err(ScriptError::Cancelled),
            Err(error) => Err(ScriptError::runtime(error.to_string())),
        }
    }

    pub fn execute_fn<F>(&mut self, command: F) -> Result<CommandResult, ScriptError>
    where
        F: FnOnce(&mut CommandContext<'_, W>) -> CommandResult + Send + 'static,
    {
        self.execute_command(Box::new(command))
    }

    /// Queues an event to this computer. It arrives after events already
    /// waiting.
    pub fn queue_event(&self, name: impl Into<String>, args: Vec<Value>) {
        self.report(WorkerStatus::QueueEvent(Event::new(name, args)));
    }

    pub fn request_shutdown(&self) {
        self.report(WorkerStatus::ShutdownRequested);
    }

    pub fn request_reboot(&self) {
        self.report(WorkerStatus::RebootRequested);
    }

    fn report(&self, status: WorkerStatus) {
        if self.status.send(status).is_err() {
            debug!(computer = %self.computer, "worker_status_unclaimed");
        }
    }
}

/// One boot of one computer, run to completion on a pool thread.
pub(crate) struct WorkerSession<W> {
    ctx: WorkerContext<W>,
    factory: EngineFactory<W>,
    events: Receiver<Event>,
}

impl<W> WorkerSession<W> {
    pub(crate) fn new(
        ctx: WorkerContext<W>,
        factory: EngineFactory<W>,
        events: Receiver<Event>,
    ) -> Self {
        Self {
            ctx,
            factory,
            events,
        }
    }

    pub(crate) fn run(mut self) {
        let computer = self.ctx.computer;
        let error = match panic::catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(error) => error,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|message| (*message).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                warn!(%computer, message = message.as_str(), "computer_worker_panicked");
                Some(message)
            }
        };
        self.ctx.report(WorkerStatus::Exited { error });
    }

    fn drive(&mut self) -> Option<String> {
        if self.ctx.is_stopping() {
            return None;
        }

        let mut engine = (self.factory)(self.ctx.computer);
        if let Err(error) = engine.start(&mut self.ctx) {
            engine.terminate(&mut self.ctx);
            return Some(error.to_string());
        }
        self.ctx.ready = true;
        self.ctx.report(WorkerStatus::Started);

        let mut failure = None;
        while let Ok(event) = self.events.recv() {
            if self.ctx.is_stopping() {
                break;
            }
            match engine.resume(&mut self.ctx, event) {
                Ok(ScriptStatus::Yielded) => {}
                Ok(ScriptStatus::Finished) => break,
                Err(ScriptError::Cancelled | ScriptError::Terminated) => break,
                Err(error) => {
                    failure = Some(error.to_string());
                    break;
                }
            }
        }

        engine.terminate(&mut self.ctx);
        failure
    }
}
