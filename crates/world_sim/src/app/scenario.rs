use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use vcomputer::Value;

use super::world::{Facing, GridPos};

const MAX_GRID_SIDE: i32 = 256;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("read scenario '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse scenario json: {0}")]
    Parse(String),
    #[error("validation failed at {path}: {message}")]
    Invalid { path: String, message: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Scenario {
    pub(crate) grid: GridSpec,
    #[serde(default)]
    pub(crate) ticks: Option<u64>,
    pub(crate) computers: Vec<ComputerSpec>,
    #[serde(default)]
    pub(crate) actions: Vec<ScheduledAction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GridSpec {
    pub(crate) width: i32,
    pub(crate) height: i32,
    #[serde(default)]
    pub(crate) walls: Vec<GridPos>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ComputerSpec {
    pub(crate) name: String,
    pub(crate) position: GridPos,
    #[serde(default = "default_facing")]
    pub(crate) facing: Facing,
    /// Lines of the startup program, uploaded before first boot.
    pub(crate) startup: Vec<String>,
    #[serde(default = "default_true")]
    pub(crate) power_on: bool,
}

fn default_facing() -> Facing {
    Facing::North
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScheduledAction {
    pub(crate) tick: u64,
    pub(crate) computer: String,
    #[serde(flatten)]
    pub(crate) action: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub(crate) enum Action {
    TurnOn,
    Shutdown,
    Reboot,
    Terminate,
    Event {
        name: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    Key {
        code: i32,
    },
    Char {
        ch: char,
    },
    Paste {
        text: String,
    },
    Click {
        button: i32,
        x: usize,
        y: usize,
    },
    Resize {
        width: usize,
        height: usize,
    },
}

/// Scenario-file JSON values as script values. Arrays and objects have no
/// script counterpart and become their JSON text.
pub(crate) fn script_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(flag) => Value::Bool(*flag),
        serde_json::Value::Number(number) => number
            .as_f64()
            .map(Value::Number)
            .unwrap_or(Value::Nil),
        serde_json::Value::String(text) => Value::String(text.clone()),
        other => Value::String(other.to_string()),
    }
}

impl Scenario {
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let scenario = Self::parse(&raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        match serde_path_to_error::deserialize::<_, Scenario>(&mut deserializer) {
            Ok(scenario) => Ok(scenario),
            Err(error) => {
                let path = error.path().to_string();
                let source = error.into_inner();
                if path.is_empty() || path == "." {
                    Err(ConfigError::Parse(source.to_string()))
                } else {
                    Err(ConfigError::Parse(format!("at {path}: {source}")))
                }
            }
        }
    }

    /// Two robots sharing a walled room. One walks into the wall and reports
    /// the failure; the other waits for a key press.
    pub(crate) fn builtin() -> Self {
        let startup = |lines: &[&str]| lines.iter().map(ToString::to_string).collect();
        Self {
            grid: GridSpec {
                width: 10,
                height: 6,
                walls: (0..6).map(|y| GridPos::new(5, y)).collect(),
            },
            ticks: Some(100),
            computers: vec![
                ComputerSpec {
                    name: "walker".to_string(),
                    position: GridPos::new(1, 2),
                    facing: Facing::East,
                    startup: startup(&[
                        "term.print \"walker online\"",
                        "repeat 4",
                        "  robot.forward",
                        "end",
                        "robot.position",
                        "term.print \"done walking\"",
                        "wait",
                    ]),
                    power_on: true,
                },
                ComputerSpec {
                    name: "sentry".to_string(),
                    position: GridPos::new(8, 4),
                    facing: Facing::West,
                    startup: startup(&[
                        "term.print \"press a key\"",
                        "wait key",
                        "robot.turn_left",
                        "term.print \"turned\"",
                        "os.shutdown",
                        "wait",
                    ]),
                    power_on: true,
                },
            ],
            actions: vec![ScheduledAction {
                tick: 20,
                computer: "sentry".to_string(),
                action: Action::Key { code: 28 },
            }],
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let (width, height) = (self.grid.width, self.grid.height);
        for (path, side) in [("grid.width", width), ("grid.height", height)] {
            if !(1..=MAX_GRID_SIDE).contains(&side) {
                return Err(expected_actual(
                    path,
                    format!("1..={MAX_GRID_SIDE}"),
                    side,
                ));
            }
        }
        let in_bounds =
            |pos: GridPos| (0..width).contains(&pos.x) && (0..height).contains(&pos.y);

        let walls: HashSet<GridPos> = self.grid.walls.iter().copied().collect();
        for (index, wall) in self.grid.walls.iter().enumerate() {
            if !in_bounds(*wall) {
                return Err(invalid(
                    &format!("grid.walls[{index}]"),
                    format!("({}, {}) is outside the grid", wall.x, wall.y),
                ));
            }
        }

        let mut names = HashMap::with_capacity(self.computers.len());
        let mut occupied = HashMap::with_capacity(self.computers.len());
        for (index, computer) in self.computers.iter().enumerate() {
            if computer.name.trim().is_empty() {
                return Err(invalid(&format!("computers[{index}].name"), "must not be empty"));
            }
            if let Some(first) = names.insert(computer.name.as_str(), index) {
                return Err(invalid(
                    &format!("computers[{index}].name"),
                    format!(
                        "duplicate name '{}' (first seen at computers[{first}].name)",
                        computer.name
                    ),
                ));
            }
            let position_path = format!("computers[{index}].position");
            if !in_bounds(computer.position) || walls.contains(&computer.position) {
                return Err(invalid(&position_path, "must be an open cell inside the grid"));
            }
            if let Some(first) = occupied.insert(computer.position, index) {
                return Err(invalid(
                    &position_path,
                    format!("cell already taken by computers[{first}]"),
                ));
            }
        }

        for (index, scheduled) in self.actions.iter().enumerate() {
            if !names.contains_key(scheduled.computer.as_str()) {
                return Err(invalid(
                    &format!("actions[{index}].computer"),
                    format!("unknown computer '{}'", scheduled.computer),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(path: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_string(),
        message: message.into(),
    }
}

fn expected_actual(path: &str, expected: impl Display, actual: impl Display) -> ConfigError {
    invalid(path, format!("expected {expected}, got {actual}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "grid": { "width": 4, "height": 3, "walls": [{ "x": 2, "y": 0 }] },
        "ticks": 30,
        "computers": [
            { "name": "a", "position": { "x": 0, "y": 0 }, "startup": ["robot.forward"] }
        ],
        "actions": [
            { "tick": 5, "computer": "a", "action": "event", "name": "ping", "args": [1, "x"] },
            { "tick": 6, "computer": "a", "action": "click", "button": 1, "x": 0, "y": 2 }
        ]
    }"#;

    #[test]
    fn parses_minimal_scenario() {
        let scenario = Scenario::parse(MINIMAL).expect("parse");
        scenario.validate().expect("valid");

        assert_eq!(scenario.ticks, Some(30));
        assert_eq!(scenario.computers[0].facing, Facing::North);
        assert!(scenario.computers[0].power_on);
        assert_eq!(
            scenario.actions[0].action,
            Action::Event {
                name: "ping".to_string(),
                args: vec![serde_json::json!(1), serde_json::json!("x")],
            }
        );
        assert_eq!(
            scenario.actions[1].action,
            Action::Click {
                button: 1,
                x: 0,
                y: 2
            }
        );
    }

    #[test]
    fn parse_error_names_the_field_path() {
        let raw = MINIMAL.replace("\"width\": 4", "\"width\": \"wide\"");
        let error = Scenario::parse(&raw).expect_err("bad width");
        assert!(error.to_string().contains("grid.width"), "{error}");
    }

    #[test]
    fn validation_rejects_robot_on_wall() {
        let raw = MINIMAL.replace(
            "\"x\": 0, \"y\": 0 }, \"startup\"",
            "\"x\": 2, \"y\": 0 }, \"startup\"",
        );
        let error = Scenario::parse(&raw)
            .expect("parse")
            .validate()
            .expect_err("robot on wall");
        assert!(error.to_string().contains("computers[0].position"), "{error}");
    }

    #[test]
    fn validation_rejects_unknown_action_target() {
        let raw = MINIMAL.replace(
            "\"computer\": \"a\", \"action\": \"click\"",
            "\"computer\": \"b\", \"action\": \"click\"",
        );
        let error = Scenario::parse(&raw)
            .expect("parse")
            .validate()
            .expect_err("unknown computer");
        assert!(error.to_string().contains("actions[1].computer"), "{error}");
    }

    #[test]
    fn builtin_scenario_is_valid() {
        Scenario::builtin().validate().expect("builtin");
    }

    #[test]
    fn json_values_map_to_script_values() {
        assert_eq!(script_value(&serde_json::json!(null)), Value::Nil);
        assert_eq!(script_value(&serde_json::json!(2.5)), Value::Number(2.5));
        assert_eq!(script_value(&serde_json::json!("hi")), Value::from("hi"));
        assert_eq!(script_value(&serde_json::json!([1])), Value::from("[1]"));
    }
}
