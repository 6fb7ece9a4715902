use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use vcomputer::{ComputerContext, LoopMetricsSnapshot, PowerState, TerminalSnapshot};

use super::renderer::TextRenderer;
use super::world::{Facing, GridPos, RobotWorld};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WorldSnapshot {
    pub(crate) tick: u64,
    pub(crate) grid: GridSnapshot,
    pub(crate) computers: Vec<ComputerSnapshot>,
    pub(crate) metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct GridSnapshot {
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) map: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ComputerSnapshot {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) state: PowerState,
    pub(crate) position: Option<GridPos>,
    pub(crate) facing: Option<Facing>,
    pub(crate) moves: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) dropped_events: u64,
    pub(crate) terminal: Option<TerminalSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub(crate) struct MetricsSnapshot {
    pub(crate) tps: f32,
    pub(crate) tick_time_ms: f32,
    pub(crate) terminal_redraws: u64,
    pub(crate) terminal_resizes: u64,
}

impl WorldSnapshot {
    pub(crate) fn capture(
        context: &ComputerContext<RobotWorld>,
        world: &RobotWorld,
        renderer: &TextRenderer,
        metrics: LoopMetricsSnapshot,
    ) -> Self {
        let (width, height) = world.size();
        let computers = context
            .computers()
            .map(|computer| {
                let robot = world.robot(computer.id());
                ComputerSnapshot {
                    id: computer.id().0,
                    name: robot
                        .map(|robot| robot.name.clone())
                        .unwrap_or_else(|| computer.id().to_string()),
                    state: computer.state(),
                    position: robot.map(|robot| robot.position),
                    facing: robot.map(|robot| robot.facing),
                    moves: robot.map(|robot| robot.moves).unwrap_or_default(),
                    last_error: computer.last_error().map(ToString::to_string),
                    dropped_events: computer.dropped_events(),
                    terminal: renderer.screen(computer.id()).cloned(),
                }
            })
            .collect();

        Self {
            tick: context.current_tick(),
            grid: GridSnapshot {
                width,
                height,
                map: super::renderer::render_map(world)
                    .lines()
                    .map(ToString::to_string)
                    .collect(),
            },
            computers,
            metrics: MetricsSnapshot {
                tps: metrics.tps,
                tick_time_ms: metrics.tick_time_ms,
                terminal_redraws: renderer.redraws(),
                terminal_resizes: renderer.resizes(),
            },
        }
    }

    pub(crate) fn write_json(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        write_bytes_atomic(path, &json)
    }
}

pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, bytes)?;
    replace_file(&tmp_path, path)
}

fn replace_file(tmp_path: &Path, final_path: &Path) -> io::Result<()> {
    match fs::remove_file(final_path) {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            let _ = fs::remove_file(tmp_path);
            return Err(error);
        }
    }

    if let Err(error) = fs::rename(tmp_path, final_path) {
        let _ = fs::remove_file(tmp_path);
        return Err(error);
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("snapshot.json");
    let tmp_name = format!("{file_name}.tmp");
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out").join("world.json");

        write_bytes_atomic(&path, b"first").expect("first write");
        write_bytes_atomic(&path, b"second").expect("second write");

        assert_eq!(fs::read(&path).expect("read"), b"second");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn temp_file_sits_beside_target() {
        let path = Path::new("snapshots/world.json");
        assert_eq!(temp_path_for(path), Path::new("snapshots/world.json.tmp"));
    }
}
