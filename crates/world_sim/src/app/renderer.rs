use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use tracing::debug;
use vcomputer::{ComputerContext, ComputerId, TerminalSnapshot};

use super::world::{GridPos, RobotWorld};

/// Headless stand-in for a screen renderer. It only ever reads displays,
/// redrawing a computer's copy when its display reports a change.
#[derive(Debug, Default)]
pub(crate) struct TextRenderer {
    screens: BTreeMap<ComputerId, TerminalSnapshot>,
    redraws: u64,
    resizes: u64,
}

impl TextRenderer {
    pub(crate) fn present(&mut self, context: &ComputerContext<RobotWorld>) {
        for computer in context.computers() {
            let display = computer.display();
            let resized = display.poll_resized();
            let changed = display.poll_changed();
            if !(resized || changed || !self.screens.contains_key(&computer.id())) {
                continue;
            }
            if resized {
                self.resizes += 1;
            }
            self.redraws += 1;
            let snapshot = display.snapshot();
            debug!(
                computer = %computer.id(),
                resized,
                width = snapshot.width,
                height = snapshot.height,
                "terminal_redrawn"
            );
            self.screens.insert(computer.id(), snapshot);
        }
        self.screens.retain(|id, _| context.computer(*id).is_some());
    }

    pub(crate) fn redraws(&self) -> u64 {
        self.redraws
    }

    pub(crate) fn resizes(&self) -> u64 {
        self.resizes
    }

    pub(crate) fn screen(&self, id: ComputerId) -> Option<&TerminalSnapshot> {
        self.screens.get(&id)
    }

    /// The last presented frame of `id`, boxed, trailing blanks trimmed.
    pub(crate) fn render_screen(&self, id: ComputerId, title: &str) -> Option<String> {
        let screen = self.screens.get(&id)?;
        let mut out = String::new();
        let rule = "-".repeat(screen.width);
        let _ = writeln!(out, "+{rule}+ {title}");
        for line in &screen.lines {
            let _ = writeln!(out, "|{line}|");
        }
        let _ = writeln!(out, "+{rule}+");
        Some(out)
    }
}

/// Top-down view of the grid: `#` walls, robots by the first letter of
/// their name, `.` open floor.
pub(crate) fn render_map(world: &RobotWorld) -> String {
    let (width, height) = world.size();
    let robots: HashMap<GridPos, char> = world
        .robots()
        .map(|(_, robot)| {
            let glyph = robot.name.chars().next().unwrap_or('?');
            (robot.position, glyph)
        })
        .collect();

    let mut out = String::new();
    for y in 0..height {
        for x in 0..width {
            let pos = GridPos::new(x, y);
            let glyph = if world.is_wall(pos) {
                '#'
            } else {
                robots.get(&pos).copied().unwrap_or('.')
            };
            out.push(glyph);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::world::{Facing, Robot};

    #[test]
    fn map_marks_walls_and_robots() {
        let mut world = RobotWorld::new(4, 2, [GridPos::new(1, 0)]);
        world.add_robot(
            ComputerId(0),
            Robot {
                name: "walker".to_string(),
                position: GridPos::new(3, 1),
                facing: Facing::East,
                moves: 0,
            },
        );

        assert_eq!(render_map(&world), ".#..\n...w\n");
    }
}
