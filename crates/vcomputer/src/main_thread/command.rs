use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;

use crate::computer::{ComputerId, Value};

/// Outcome of a privileged command, handed back to the script that asked.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(Option<Value>),
    Failure(String),
}

impl CommandResult {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with(value: impl Into<Value>) -> Self {
        Self::Success(Some(value.into()))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// What a command sees while it runs on the world thread.
pub struct CommandContext<'a, W> {
    computer: ComputerId,
    tick: u64,
    world: &'a mut W,
}

impl<'a, W> CommandContext<'a, W> {
    pub fn new(computer: ComputerId, tick: u64, world: &'a mut W) -> Self {
        Self {
            computer,
            tick,
            world,
        }
    }

    pub fn computer(&self) -> ComputerId {
        self.computer
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn world(&self) -> &W {
        self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        self.world
    }
}

/// Single-shot action that must run on the world thread.
///
/// `execute` consumes the command, so a command can never run twice.
pub trait PrivilegedCommand<W>: Send {
    fn execute(self: Box<Self>, ctx: &mut CommandContext<'_, W>) -> CommandResult;
}

impl<W, F> PrivilegedCommand<W> for F
where
    F: FnOnce(&mut CommandContext<'_, W>) -> CommandResult + Send,
{
    fn execute(self: Box<Self>, ctx: &mut CommandContext<'_, W>) -> CommandResult {
        (*self)(ctx)
    }
}

#[derive(Debug)]
pub(crate) enum Resolution {
    Completed(CommandResult),
    Cancelled,
}

pub(crate) fn resolution_channel() -> (Sender<Resolution>, Receiver<Resolution>) {
    crossbeam_channel::bounded(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command for computer {computer} was cancelled by shutdown")]
    Cancelled { computer: ComputerId },
    #[error("timed out waiting for command result")]
    TimedOut,
    #[error("main thread scheduler dropped the command")]
    SchedulerGone,
}

/// Submitter's side of one outstanding command.
#[derive(Debug)]
pub struct PendingCommand {
    computer: ComputerId,
    task_id: u64,
    receiver: Receiver<Resolution>,
    resolved: AtomicBool,
}

impl PendingCommand {
    pub(crate) fn new(computer: ComputerId, task_id: u64, receiver: Receiver<Resolution>) -> Self {
        Self {
            computer,
            task_id,
            receiver,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn computer(&self) -> ComputerId {
        self.computer
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Blocks until the world thread has run or cancelled the command.
    pub fn wait(self) -> Result<CommandResult, CommandError> {
        match self.receiver.recv() {
            Ok(resolution) => self.resolve(resolution),
            Err(_) => Err(CommandError::SchedulerGone),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<CommandResult, CommandError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(resolution) => self.resolve(resolution),
            Err(RecvTimeoutError::Timeout) => Err(CommandError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(CommandError::SchedulerGone),
        }
    }

    /// Non-blocking poll; `None` while the command is still queued and on
    /// every poll after the one that returned its resolution.
    pub fn try_result(&self) -> Option<Result<CommandResult, CommandError>> {
        if self.resolved.load(Ordering::Acquire) {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(resolution) => Some(self.resolve(resolution)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(CommandError::SchedulerGone)),
        }
    }

    fn resolve(&self, resolution: Resolution) -> Result<CommandResult, CommandError> {
        self.resolved.store(true, Ordering::Release);
        match resolution {
            Resolution::Completed(result) => Ok(result),
            Resolution::Cancelled => Err(CommandError::Cancelled {
                computer: self.computer,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: u32,
    }

    struct AddCommand(u32);

    impl PrivilegedCommand<Counter> for AddCommand {
        fn execute(self: Box<Self>, ctx: &mut CommandContext<'_, Counter>) -> CommandResult {
            ctx.world_mut().value += self.0;
            CommandResult::success_with(f64::from(ctx.world().value))
        }
    }

    #[test]
    fn struct_and_closure_commands_share_one_contract() {
        let mut counter = Counter { value: 1 };
        let mut ctx = CommandContext::new(ComputerId(3), 7, &mut counter);

        let boxed: Box<dyn PrivilegedCommand<Counter>> = Box::new(AddCommand(4));
        assert_eq!(
            boxed.execute(&mut ctx),
            CommandResult::Success(Some(Value::Number(5.0)))
        );

        let closure: Box<dyn PrivilegedCommand<Counter>> =
            Box::new(|ctx: &mut CommandContext<'_, Counter>| {
                if ctx.tick() == 7 && ctx.computer() == ComputerId(3) {
                    CommandResult::failure("nope")
                } else {
                    CommandResult::success()
                }
            });
        assert_eq!(closure.execute(&mut ctx), CommandResult::failure("nope"));
    }

    #[test]
    fn pending_command_reports_each_resolution_kind() {
        let (sender, receiver) = resolution_channel();
        let pending = PendingCommand::new(ComputerId(1), 0, receiver);
        assert!(pending.try_result().is_none());
        assert_eq!(
            pending.wait_timeout(Duration::from_millis(1)),
            Err(CommandError::TimedOut)
        );

        sender
            .send(Resolution::Completed(CommandResult::success()))
            .expect("send");
        assert_eq!(pending.wait(), Ok(CommandResult::success()));

        let (sender, receiver) = resolution_channel();
        let pending = PendingCommand::new(ComputerId(2), 1, receiver);
        sender.send(Resolution::Cancelled).expect("send");
        assert_eq!(
            pending.wait(),
            Err(CommandError::Cancelled {
                computer: ComputerId(2)
            })
        );

        let (sender, receiver) = resolution_channel();
        drop(sender);
        let pending = PendingCommand::new(ComputerId(2), 2, receiver);
        assert_eq!(pending.wait(), Err(CommandError::SchedulerGone));
    }

    #[test]
    fn polling_after_resolution_stays_quiet_once_the_sender_is_gone() {
        let (sender, receiver) = resolution_channel();
        let pending = PendingCommand::new(ComputerId(4), 3, receiver);
        sender
            .send(Resolution::Completed(CommandResult::failure("blocked")))
            .expect("send");
        drop(sender);

        assert_eq!(
            pending.try_result(),
            Some(Ok(CommandResult::failure("blocked")))
        );
        assert_eq!(pending.try_result(), None);
        assert_eq!(pending.try_result(), None);
    }
}
