use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ScriptError;

/// Script-visible value carried by events, capability calls and command
/// results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) | Value::Bytes(_) => "string",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                write!(f, "{}", *value as i64)
            }
            Value::Number(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value}"),
            Value::Bytes(value) => write!(f, "{}", String::from_utf8_lossy(value)),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Nil)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Bounded FIFO of events waiting for the worker. Overflow drops the oldest.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Returns the event evicted to make room, if any.
    pub fn push(&mut self, event: Event) -> Option<Event> {
        let evicted = if self.events.len() >= self.capacity {
            self.dropped = self.dropped.saturating_add(1);
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn push_front(&mut self, event: Event) {
        self.events.push_front(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Reads `args[index]` as a string. Errors name the argument 1-based.
pub fn arg_string(args: &[Value], index: usize) -> Result<&str, ScriptError> {
    match args.get(index) {
        Some(Value::String(value)) => Ok(value),
        other => Err(bad_argument(index, "string", other)),
    }
}

pub fn arg_number(args: &[Value], index: usize) -> Result<f64, ScriptError> {
    match args.get(index) {
        Some(Value::Number(value)) if value.is_finite() => Ok(*value),
        other => Err(bad_argument(index, "number", other)),
    }
}

pub fn arg_int(args: &[Value], index: usize) -> Result<i64, ScriptError> {
    let value = arg_number(args, index)?;
    if value.fract() != 0.0 {
        return Err(ScriptError::BadArgument {
            index: index + 1,
            message: format!("number has no integer representation ({value})"),
        });
    }
    Ok(value as i64)
}

pub fn arg_bool(args: &[Value], index: usize) -> Result<bool, ScriptError> {
    match args.get(index) {
        Some(Value::Bool(value)) => Ok(*value),
        other => Err(bad_argument(index, "boolean", other)),
    }
}

pub fn opt_int(args: &[Value], index: usize) -> Result<Option<i64>, ScriptError> {
    match args.get(index) {
        None | Some(Value::Nil) => Ok(None),
        Some(_) => arg_int(args, index).map(Some),
    }
}

fn bad_argument(index: usize, expected: &str, got: Option<&Value>) -> ScriptError {
    let got = got.map(Value::type_name).unwrap_or("no value");
    ScriptError::BadArgument {
        index: index + 1,
        message: format!("expected {expected}, got {got}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_oldest_and_counts() {
        let mut queue = EventQueue::new(2);
        assert!(queue.push(Event::new("a", vec![])).is_none());
        assert!(queue.push(Event::new("b", vec![])).is_none());

        let evicted = queue.push(Event::new("c", vec![]));
        assert_eq!(evicted.map(|event| event.name).as_deref(), Some("a"));
        assert_eq!(queue.dropped(), 1);

        let names: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|event| event.name)
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn argument_helpers_report_one_based_positions() {
        let args = vec![Value::from("left"), Value::from(2.5), Value::Nil];

        assert_eq!(arg_string(&args, 0), Ok("left"));
        assert_eq!(
            arg_string(&args, 1),
            Err(ScriptError::BadArgument {
                index: 2,
                message: "expected string, got number".to_string(),
            })
        );
        assert!(matches!(
            arg_int(&args, 1),
            Err(ScriptError::BadArgument { index: 2, .. })
        ));
        assert_eq!(opt_int(&args, 2), Ok(None));
        assert_eq!(opt_int(&args, 5), Ok(None));
        assert!(matches!(
            arg_bool(&args, 3),
            Err(ScriptError::BadArgument { index: 4, .. })
        ));
    }

    #[test]
    fn value_serializes_with_type_tag() {
        let event = Event::new("key", vec![Value::from(28), Value::from(false)]);
        let json = serde_json::to_string(&event).expect("serialize");
        assert_eq!(
            json,
            r#"{"name":"key","args":[{"type":"number","value":28.0},{"type":"bool","value":false}]}"#
        );
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn whole_numbers_display_without_fraction() {
        assert_eq!(Value::from(3).to_string(), "3");
        assert_eq!(Value::from(0.5).to_string(), "0.5");
        assert_eq!(Value::Nil.to_string(), "nil");
    }
}
