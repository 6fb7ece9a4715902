pub(crate) mod bootstrap;
mod capabilities;
pub(crate) mod loop_runner;
mod program;
mod renderer;
mod scenario;
mod snapshot;
mod world;
