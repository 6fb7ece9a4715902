use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vcomputer::{
    CloseError, ComputerError, ContextConfig, ContextError, UploadError, WorldLoopConfig,
};

use super::scenario::{ConfigError, Scenario};

const DEFAULT_TICKS: u64 = 100;

pub(crate) const USAGE: &str = "\
usage: world_sim [--scenario PATH] [--ticks N] [--tps N] [--snapshot-out PATH] [--quiet]

  --scenario PATH       load the world from a JSON scenario (default: built-in demo)
  --ticks N             stop after N world ticks (overrides the scenario)
  --tps N               world ticks per second (default 20)
  --snapshot-out PATH   write the final world state as JSON
  --quiet               do not print terminals and map at exit";

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("{0}\n\n{USAGE}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start computers: {0}")]
    Context(#[from] ContextError),
    #[error(transparent)]
    Computer(#[from] ComputerError),
    #[error("prepare startup for '{name}': {source}")]
    Upload {
        name: String,
        #[source]
        source: UploadError,
    },
    #[error("write snapshot '{path}': {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Close(#[from] CloseError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CliArgs {
    pub(crate) scenario: Option<PathBuf>,
    pub(crate) ticks: Option<u64>,
    pub(crate) tps: Option<u32>,
    pub(crate) snapshot_out: Option<PathBuf>,
    pub(crate) quiet: bool,
    pub(crate) help: bool,
}

pub(crate) fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, AppError> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value_for = |flag: &str| {
            args.next()
                .ok_or_else(|| AppError::Usage(format!("{flag} needs a value")))
        };
        match arg.as_str() {
            "--scenario" => parsed.scenario = Some(PathBuf::from(value_for("--scenario")?)),
            "--snapshot-out" => {
                parsed.snapshot_out = Some(PathBuf::from(value_for("--snapshot-out")?))
            }
            "--ticks" => parsed.ticks = Some(parse_number("--ticks", &value_for("--ticks")?)?),
            "--tps" => {
                let tps: u32 = parse_number("--tps", &value_for("--tps")?)?;
                if tps == 0 {
                    return Err(AppError::Usage("--tps must be at least 1".to_string()));
                }
                parsed.tps = Some(tps);
            }
            "--quiet" => parsed.quiet = true,
            "-h" | "--help" => parsed.help = true,
            other => return Err(AppError::Usage(format!("unknown argument '{other}'"))),
        }
    }
    Ok(parsed)
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Usage(format!("{flag} expects a number, got '{raw}'")))
}

pub(crate) struct AppWiring {
    pub(crate) loop_config: WorldLoopConfig,
    pub(crate) context_config: ContextConfig,
    pub(crate) scenario: Scenario,
    pub(crate) snapshot_out: Option<PathBuf>,
    pub(crate) print_screens: bool,
}

pub(crate) fn wire(args: CliArgs, context_config: ContextConfig) -> Result<AppWiring, AppError> {
    let scenario = match &args.scenario {
        Some(path) => Scenario::load(path)?,
        None => Scenario::builtin(),
    };
    let defaults = WorldLoopConfig::default();
    let loop_config = WorldLoopConfig {
        target_tps: args.tps.unwrap_or(defaults.target_tps),
        max_ticks: Some(args.ticks.or(scenario.ticks).unwrap_or(DEFAULT_TICKS)),
        ..defaults
    };

    Ok(AppWiring {
        loop_config,
        context_config,
        scenario,
        snapshot_out: args.snapshot_out,
        print_screens: !args.quiet,
    })
}

pub(crate) fn build_app(args: CliArgs) -> Result<AppWiring, AppError> {
    init_tracing();
    info!("=== world_sim startup ===");

    let context_config = ContextConfig::from_env();
    let app = wire(args, context_config)?;
    info!(
        computers = app.scenario.computers.len(),
        actions = app.scenario.actions.len(),
        grid_width = app.scenario.grid.width,
        grid_height = app.scenario.grid.height,
        worker_threads = app.context_config.worker_threads,
        "scenario_loaded"
    );
    Ok(app)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<CliArgs, AppError> {
        parse_args(raw.iter().map(ToString::to_string))
    }

    #[test]
    fn flags_are_parsed() {
        let parsed = args(&[
            "--ticks",
            "40",
            "--tps",
            "50",
            "--snapshot-out",
            "out/world.json",
            "--quiet",
        ])
        .expect("args");

        assert_eq!(
            parsed,
            CliArgs {
                ticks: Some(40),
                tps: Some(50),
                snapshot_out: Some(PathBuf::from("out/world.json")),
                quiet: true,
                ..CliArgs::default()
            }
        );
    }

    #[test]
    fn bad_arguments_are_usage_errors() {
        assert!(matches!(args(&["--ticks"]), Err(AppError::Usage(_))));
        assert!(matches!(args(&["--ticks", "many"]), Err(AppError::Usage(_))));
        assert!(matches!(args(&["--tps", "0"]), Err(AppError::Usage(_))));
        assert!(matches!(args(&["--fast"]), Err(AppError::Usage(_))));
    }

    #[test]
    fn tick_flag_overrides_scenario() {
        let wired = wire(
            CliArgs {
                ticks: Some(7),
                ..CliArgs::default()
            },
            ContextConfig::default(),
        )
        .expect("wire");
        assert_eq!(wired.loop_config.max_ticks, Some(7));

        let builtin = wire(CliArgs::default(), ContextConfig::default()).expect("wire");
        assert_eq!(builtin.loop_config.max_ticks, Scenario::builtin().ticks);
        assert!(builtin.print_screens);
    }

    #[test]
    fn missing_scenario_file_is_a_config_error() {
        let result = wire(
            CliArgs {
                scenario: Some(PathBuf::from("/definitely/not/here.json")),
                ..CliArgs::default()
            },
            ContextConfig::default(),
        );
        assert!(matches!(result, Err(AppError::Config(ConfigError::Read { .. }))));
    }
}
