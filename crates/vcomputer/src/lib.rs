pub mod computer;
pub mod context;
pub mod dirty;
pub mod main_thread;
mod sync;
pub mod terminal;
pub mod upload;
pub mod vfs;
pub mod world_loop;

pub use computer::{
    Capability, CapabilityError, Computer, ComputerError, ComputerId, EngineFactory, Event,
    PowerState, ScriptEngine, ScriptError, ScriptStatus, Value, WorkerContext,
};
pub use context::{CloseError, ComputerContext, ContextConfig, ContextError, TickSummary};
pub use dirty::{DirtyScheduler, DirtyToken};
pub use main_thread::{
    CommandContext, CommandError, CommandResult, MainThreadConfig, MainThreadHandle,
    MainThreadScheduler, PendingCommand, PrivilegedCommand, SubmitError,
};
pub use terminal::{DisplayBuffer, Terminal, TerminalSnapshot};
pub use upload::{FileUpload, UploadError, UploadPacket, UploadReassembler};
pub use vfs::{FileSystem, FsError, MemoryFileSystem};
pub use world_loop::{
    run_world_loop, LoopControl, LoopMetricsSnapshot, LoopOutcome, MetricsHandle, StopReason,
    WorldHooks, WorldLoopConfig,
};
