use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use vcomputer::ComputerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct GridPos {
    pub(crate) x: i32,
    pub(crate) y: i32,
}

impl GridPos {
    pub(crate) fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    fn step(self, facing: Facing, distance: i32) -> Self {
        let (dx, dy) = facing.delta();
        Self {
            x: self.x + dx * distance,
            y: self.y + dy * distance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Facing {
    North,
    East,
    South,
    West,
}

impl Facing {
    fn delta(self) -> (i32, i32) {
        match self {
            Facing::North => (0, -1),
            Facing::East => (1, 0),
            Facing::South => (0, 1),
            Facing::West => (-1, 0),
        }
    }

    fn left(self) -> Self {
        match self {
            Facing::North => Facing::West,
            Facing::West => Facing::South,
            Facing::South => Facing::East,
            Facing::East => Facing::North,
        }
    }

    fn right(self) -> Self {
        self.left().left().left()
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Facing::North => "north",
            Facing::East => "east",
            Facing::South => "south",
            Facing::West => "west",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Robot {
    pub(crate) name: String,
    pub(crate) position: GridPos,
    pub(crate) facing: Facing,
    pub(crate) moves: u32,
}

/// What a robot found in front of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sensed {
    Empty,
    Wall,
    Robot,
    Edge,
}

impl Sensed {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Sensed::Empty => "empty",
            Sensed::Wall => "wall",
            Sensed::Robot => "robot",
            Sensed::Edge => "edge",
        }
    }
}

/// The authoritative world state. Only the world thread touches it; scripts
/// reach it through privileged commands.
#[derive(Debug, Clone, Default)]
pub(crate) struct RobotWorld {
    width: i32,
    height: i32,
    walls: HashSet<GridPos>,
    robots: BTreeMap<ComputerId, Robot>,
}

impl RobotWorld {
    pub(crate) fn new(width: i32, height: i32, walls: impl IntoIterator<Item = GridPos>) -> Self {
        Self {
            width,
            height,
            walls: walls.into_iter().collect(),
            robots: BTreeMap::new(),
        }
    }

    pub(crate) fn add_robot(&mut self, computer: ComputerId, robot: Robot) {
        self.robots.insert(computer, robot);
    }

    pub(crate) fn robot(&self, computer: ComputerId) -> Option<&Robot> {
        self.robots.get(&computer)
    }

    pub(crate) fn robots(&self) -> impl Iterator<Item = (ComputerId, &Robot)> {
        self.robots.iter().map(|(id, robot)| (*id, robot))
    }

    pub(crate) fn size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    pub(crate) fn is_wall(&self, pos: GridPos) -> bool {
        self.walls.contains(&pos)
    }

    fn in_bounds(&self, pos: GridPos) -> bool {
        (0..self.width).contains(&pos.x) && (0..self.height).contains(&pos.y)
    }

    pub(crate) fn sense_at(&self, pos: GridPos) -> Sensed {
        if !self.in_bounds(pos) {
            Sensed::Edge
        } else if self.walls.contains(&pos) {
            Sensed::Wall
        } else if self.robots.values().any(|robot| robot.position == pos) {
            Sensed::Robot
        } else {
            Sensed::Empty
        }
    }

    pub(crate) fn inspect(&self, computer: ComputerId) -> Option<Sensed> {
        let robot = self.robots.get(&computer)?;
        Some(self.sense_at(robot.position.step(robot.facing, 1)))
    }

    pub(crate) fn forward(&mut self, computer: ComputerId) -> Result<GridPos, &'static str> {
        self.step(computer, 1)
    }

    pub(crate) fn back(&mut self, computer: ComputerId) -> Result<GridPos, &'static str> {
        self.step(computer, -1)
    }

    pub(crate) fn turn_left(&mut self, computer: ComputerId) -> Result<Facing, &'static str> {
        let robot = self.robots.get_mut(&computer).ok_or("no robot")?;
        robot.facing = robot.facing.left();
        Ok(robot.facing)
    }

    pub(crate) fn turn_right(&mut self, computer: ComputerId) -> Result<Facing, &'static str> {
        let robot = self.robots.get_mut(&computer).ok_or("no robot")?;
        robot.facing = robot.facing.right();
        Ok(robot.facing)
    }

    fn step(&mut self, computer: ComputerId, distance: i32) -> Result<GridPos, &'static str> {
        let robot = self.robots.get(&computer).ok_or("no robot")?;
        let target = robot.position.step(robot.facing, distance);
        match self.sense_at(target) {
            Sensed::Empty => {}
            Sensed::Edge => return Err("out of bounds"),
            Sensed::Wall | Sensed::Robot => return Err("blocked"),
        }
        let robot = self.robots.get_mut(&computer).ok_or("no robot")?;
        robot.position = target;
        robot.moves = robot.moves.saturating_add(1);
        Ok(target)
    }
}
