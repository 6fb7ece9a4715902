use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use vcomputer::upload::send_uploads;
use vcomputer::{
    run_world_loop, ComputerContext, ComputerId, EngineFactory, FileSystem, FileUpload,
    LoopControl, LoopOutcome, MemoryFileSystem, MetricsHandle, PowerState, ScriptEngine,
    TickSummary, UploadError, UploadReassembler, WorldHooks,
};

use super::bootstrap::{AppError, AppWiring};
use super::capabilities::{FsCapability, OsCapability, RobotCapability, TermCapability};
use super::program::{ProgramEngine, STARTUP_PATH};
use super::renderer::{render_map, TextRenderer};
use super::scenario::{script_value, Action, ComputerSpec, ScheduledAction};
use super::snapshot::WorldSnapshot;
use super::world::{Robot, RobotWorld};

pub(crate) fn run(app: AppWiring) -> ExitCode {
    match run_simulation(&app) {
        Ok(report) => {
            info!(
                ticks = report.outcome.ticks,
                reason = ?report.outcome.reason,
                computers = report.snapshot.computers.len(),
                "simulation_finished"
            );
            if app.print_screens {
                print!("{}", report.screens);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "simulation_failed");
            ExitCode::FAILURE
        }
    }
}

pub(crate) struct SimulationReport {
    pub(crate) outcome: LoopOutcome,
    pub(crate) snapshot: WorldSnapshot,
    /// Every terminal followed by the map, ready to print.
    pub(crate) screens: String,
}

pub(crate) fn run_simulation(app: &AppWiring) -> Result<SimulationReport, AppError> {
    let scenario = &app.scenario;
    let mut context = ComputerContext::<RobotWorld>::new(app.context_config.clone())?;
    let mut world = RobotWorld::new(
        scenario.grid.width,
        scenario.grid.height,
        scenario.grid.walls.iter().copied(),
    );

    let mut names = HashMap::with_capacity(scenario.computers.len());
    for entry in &scenario.computers {
        let id = spawn_computer(&mut context, &mut world, entry)?;
        names.insert(entry.name.clone(), id);
    }

    let mut actions = scenario.actions.clone();
    actions.sort_by_key(|scheduled| scheduled.tick);
    let mut hooks = SimHooks {
        names,
        actions,
        next_action: 0,
        renderer: TextRenderer::default(),
    };

    let metrics = MetricsHandle::default();
    let outcome = run_world_loop(
        &app.loop_config,
        &mut context,
        &mut world,
        &mut hooks,
        &metrics,
    );
    hooks.renderer.present(&context);

    let snapshot = WorldSnapshot::capture(&context, &world, &hooks.renderer, metrics.snapshot());
    let mut screens = String::new();
    for computer in &snapshot.computers {
        if let Some(screen) = hooks
            .renderer
            .render_screen(ComputerId(computer.id), &computer.name)
        {
            screens.push_str(&screen);
        }
    }
    screens.push_str(&render_map(&world));

    let close_timeout = context.config().close_timeout;
    context.ensure_closed(close_timeout)?;

    if let Some(path) = &app.snapshot_out {
        snapshot
            .write_json(path)
            .map_err(|source| AppError::Snapshot {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "snapshot_written");
    }

    Ok(SimulationReport {
        outcome,
        snapshot,
        screens,
    })
}

/// Builds one computer with its own filesystem, places its robot and
/// delivers the startup program through the upload path.
fn spawn_computer(
    context: &mut ComputerContext<RobotWorld>,
    world: &mut RobotWorld,
    entry: &ComputerSpec,
) -> Result<ComputerId, AppError> {
    let fs = Arc::new(MemoryFileSystem::new());
    let engine_fs: Arc<dyn FileSystem> = fs.clone();
    let factory: EngineFactory<RobotWorld> = Arc::new(move |_| {
        Box::new(ProgramEngine::new(Arc::clone(&engine_fs))) as Box<dyn ScriptEngine<RobotWorld>>
    });

    let computer = context.create_computer(factory)?;
    let id = computer.id();
    computer.add_capability(Arc::new(RobotCapability))?;
    computer.add_capability(Arc::new(TermCapability))?;
    computer.add_capability(Arc::new(OsCapability))?;
    computer.add_capability(Arc::new(FsCapability::new(fs.clone())))?;

    let startup = FileUpload::new(STARTUP_PATH, entry.startup.join("\n").into_bytes());
    let files = transfer(&[startup]).map_err(|source| AppError::Upload {
        name: entry.name.clone(),
        source,
    })?;
    computer.upload_files(fs.as_ref(), &files)?;

    world.add_robot(
        id,
        Robot {
            name: entry.name.clone(),
            position: entry.position,
            facing: entry.facing,
            moves: 0,
        },
    );
    if entry.power_on {
        computer.turn_on()?;
    }
    info!(
        computer = %id,
        name = entry.name.as_str(),
        power_on = entry.power_on,
        "robot_spawned"
    );
    Ok(id)
}

/// Packs `files` and feeds them back through a reassembler, as a client
/// upload would arrive.
fn transfer(files: &[FileUpload]) -> Result<Vec<FileUpload>, UploadError> {
    let mut reassembler = UploadReassembler::new();
    for packet in send_uploads(files)? {
        if let Some(received) = reassembler.accept(packet)? {
            return Ok(received);
        }
    }
    Err(UploadError::MissingFirst)
}

struct SimHooks {
    names: HashMap<String, ComputerId>,
    /// Sorted by tick.
    actions: Vec<ScheduledAction>,
    next_action: usize,
    renderer: TextRenderer,
}

impl SimHooks {
    fn apply(&self, scheduled: &ScheduledAction, context: &mut ComputerContext<RobotWorld>) {
        let Some(computer) = self
            .names
            .get(&scheduled.computer)
            .and_then(|id| context.computer_mut(*id))
        else {
            warn!(computer = scheduled.computer.as_str(), "scheduled_action_target_missing");
            return;
        };
        info!(
            tick = scheduled.tick,
            computer = %computer.id(),
            action = ?scheduled.action,
            "scheduled_action"
        );

        let result = match &scheduled.action {
            Action::TurnOn => computer.turn_on(),
            Action::Shutdown => {
                computer.shutdown();
                Ok(())
            }
            Action::Reboot => computer.reboot(),
            Action::Terminate => {
                computer.terminate();
                Ok(())
            }
            Action::Event { name, args } => {
                computer.queue_event(name.as_str(), args.iter().map(script_value).collect());
                Ok(())
            }
            Action::Key { code } => {
                computer.key_down(*code, false);
                computer.key_up(*code);
                Ok(())
            }
            Action::Char { ch } => {
                computer.char_typed(*ch);
                Ok(())
            }
            Action::Paste { text } => {
                computer.paste(text);
                Ok(())
            }
            Action::Click { button, x, y } => {
                computer.mouse_click(*button, *x, *y);
                computer.mouse_up(*button, *x, *y);
                Ok(())
            }
            Action::Resize { width, height } => {
                computer.display().request_resize(*width, *height);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(computer = %computer.id(), error = %err, "scheduled_action_failed");
        }
    }
}

impl WorldHooks<RobotWorld> for SimHooks {
    fn before_tick(
        &mut self,
        context: &mut ComputerContext<RobotWorld>,
        _world: &mut RobotWorld,
    ) -> LoopControl {
        let tick = context.current_tick();
        while let Some(scheduled) = self
            .actions
            .get(self.next_action)
            .filter(|scheduled| scheduled.tick <= tick)
        {
            self.apply(scheduled, context);
            self.next_action += 1;
        }
        LoopControl::Continue
    }

    fn after_tick(
        &mut self,
        _summary: &TickSummary,
        context: &mut ComputerContext<RobotWorld>,
        _world: &mut RobotWorld,
    ) -> LoopControl {
        let idle = context
            .computers()
            .all(|computer| computer.state() == PowerState::Off);
        if idle && self.next_action >= self.actions.len() {
            info!(tick = context.current_tick(), "all_computers_off");
            return LoopControl::Stop;
        }
        LoopControl::Continue
    }

    fn on_frame(&mut self, context: &ComputerContext<RobotWorld>, _world: &RobotWorld) {
        self.renderer.present(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::bootstrap::{wire, CliArgs};
    use crate::app::scenario::{GridSpec, Scenario};
    use crate::app::snapshot::ComputerSnapshot;
    use crate::app::world::{Facing, GridPos};
    use vcomputer::{ContextConfig, StopReason};

    fn headless(scenario: Scenario, ticks: u64) -> AppWiring {
        let mut app = wire(
            CliArgs {
                ticks: Some(ticks),
                tps: Some(1000),
                quiet: true,
                ..CliArgs::default()
            },
            ContextConfig::default(),
        )
        .expect("wire");
        app.scenario = scenario;
        app
    }

    fn computer<'a>(report: &'a SimulationReport, name: &str) -> &'a ComputerSnapshot {
        report
            .snapshot
            .computers
            .iter()
            .find(|computer| computer.name == name)
            .expect("computer in snapshot")
    }

    fn screen_text(report: &SimulationReport, name: &str) -> String {
        computer(report, name)
            .terminal
            .as_ref()
            .map(|terminal| terminal.lines.join("\n"))
            .unwrap_or_default()
    }

    #[test]
    fn builtin_scenario_runs_headless() {
        let report = run_simulation(&headless(Scenario::builtin(), 100)).expect("simulation");

        let walker = computer(&report, "walker");
        assert_eq!(walker.last_error, None);
        assert_eq!(walker.position, Some(GridPos::new(4, 2)));
        assert_eq!(walker.moves, 3);
        let walker_screen = screen_text(&report, "walker");
        assert!(walker_screen.contains("robot.forward: blocked"), "{walker_screen}");
        assert!(walker_screen.contains("done walking"), "{walker_screen}");

        let sentry = computer(&report, "sentry");
        assert_eq!(sentry.state, PowerState::Off);
        assert_eq!(sentry.facing, Some(Facing::South));
        assert!(screen_text(&report, "sentry").contains("turned"));
        assert!(report.screens.contains('#'));
    }

    #[test]
    fn loop_stops_once_every_computer_is_off() {
        let scenario = Scenario {
            grid: GridSpec {
                width: 3,
                height: 3,
                walls: Vec::new(),
            },
            ticks: None,
            computers: vec![ComputerSpec {
                name: "brief".to_string(),
                position: GridPos::new(1, 1),
                facing: Facing::North,
                startup: vec!["term.print \"bye\"".to_string()],
                power_on: true,
            }],
            actions: Vec::new(),
        };

        let report = run_simulation(&headless(scenario, 500)).expect("simulation");

        assert_eq!(report.outcome.reason, StopReason::Hook);
        assert!(report.outcome.ticks < 500);
        assert!(screen_text(&report, "brief").contains("bye"));
    }

    #[test]
    fn bad_startup_program_surfaces_as_last_error() {
        let scenario = Scenario {
            grid: GridSpec {
                width: 2,
                height: 1,
                walls: Vec::new(),
            },
            ticks: None,
            computers: vec![ComputerSpec {
                name: "broken".to_string(),
                position: GridPos::new(0, 0),
                facing: Facing::East,
                startup: vec!["repeat 2".to_string()],
                power_on: true,
            }],
            actions: Vec::new(),
        };

        let report = run_simulation(&headless(scenario, 200)).expect("simulation");

        let broken = computer(&report, "broken");
        assert_eq!(broken.state, PowerState::Off);
        assert!(broken.last_error.as_deref().is_some_and(|err| err.contains("startup")));
    }

    #[test]
    fn snapshot_is_written_when_requested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("world.json");
        let mut app = headless(Scenario::builtin(), 30);
        app.snapshot_out = Some(path.clone());

        run_simulation(&app).expect("simulation");

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(json["computers"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["grid"]["width"], 10);
    }
}
