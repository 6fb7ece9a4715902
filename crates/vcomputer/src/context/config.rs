use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::main_thread::MainThreadConfig;

pub const WORKER_THREADS_ENV_VAR: &str = "VCOMP_WORKER_THREADS";
pub const MAX_MAIN_COMPUTER_MS_ENV_VAR: &str = "VCOMP_MAX_MAIN_COMPUTER_MS";
pub const MAX_MAIN_GLOBAL_MS_ENV_VAR: &str = "VCOMP_MAX_MAIN_GLOBAL_MS";
pub const EVENT_QUEUE_CAPACITY_ENV_VAR: &str = "VCOMP_EVENT_QUEUE_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Threads started up front. The pool grows past this when more
    /// computers are running than there are threads.
    pub worker_threads: usize,
    pub event_queue_capacity: usize,
    pub main_thread: MainThreadConfig,
    pub terminal_width: usize,
    pub terminal_height: usize,
    pub close_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            event_queue_capacity: 256,
            main_thread: MainThreadConfig::default(),
            terminal_width: 51,
            terminal_height: 19,
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl ContextConfig {
    /// Defaults with any `VCOMP_*` overrides applied. Bad values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| env::var(key))
    }

    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Self {
        self.worker_threads = resolve(&lookup, WORKER_THREADS_ENV_VAR, self.worker_threads)
            .max(1);
        self.event_queue_capacity =
            resolve(&lookup, EVENT_QUEUE_CAPACITY_ENV_VAR, self.event_queue_capacity).max(1);
        self.main_thread.max_computer_time = Duration::from_millis(resolve(
            &lookup,
            MAX_MAIN_COMPUTER_MS_ENV_VAR,
            self.main_thread.max_computer_time.as_millis() as u64,
        ));
        self.main_thread.max_global_time = Duration::from_millis(resolve(
            &lookup,
            MAX_MAIN_GLOBAL_MS_ENV_VAR,
            self.main_thread.max_global_time.as_millis() as u64,
        ));
        self
    }
}

fn resolve<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    env_var: &'static str,
    fallback: T,
) -> T
where
    T: FromStr + Copy,
{
    match lookup(env_var) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var,
                    value = value.as_str(),
                    "invalid env var value; falling back to config"
                );
                fallback
            }
        },
        Err(env::VarError::NotPresent) => fallback,
        Err(err) => {
            warn!(
                env_var,
                error = %err,
                "unable to read env var; falling back to config"
            );
            fallback
        }
    }
}
