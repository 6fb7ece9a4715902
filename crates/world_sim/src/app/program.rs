use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use vcomputer::{Event, FileSystem, ScriptEngine, ScriptError, ScriptStatus, Value, WorkerContext};

use super::capabilities::print_line;
use super::world::RobotWorld;

pub(crate) const STARTUP_PATH: &str = "startup";
pub(crate) const BOOT_EVENT: &str = "boot";
const MAX_STEPS_PER_RESUME: usize = 10_000;
const MAX_PROGRAM_LEN: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum ParseError {
    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },
    #[error("line {line}: expected `capability.method`, got `{token}`")]
    BadStatement { line: usize, token: String },
    #[error("line {line}: `repeat` needs a non-negative count")]
    BadRepeat { line: usize },
    #[error("line {line}: `end` without `repeat`")]
    UnmatchedEnd { line: usize },
    #[error("`repeat` on line {line} is never closed")]
    UnclosedRepeat { line: usize },
    #[error("program expands past the instruction limit")]
    TooLong,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Instruction {
    /// `show` prints the results to the terminal. Failures are always printed.
    Call {
        capability: String,
        method: String,
        args: Vec<Value>,
        show: bool,
    },
    /// Yield until an event arrives; `None` accepts any event.
    Wait(Option<String>),
}

fn tokenize(line: &str, line_no: usize) -> Result<Vec<(String, bool)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '#' {
            break;
        }
        if ch == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => text.push('\n'),
                        Some(other) => text.push(other),
                        None => return Err(ParseError::UnterminatedString { line: line_no }),
                    },
                    Some(other) => text.push(other),
                    None => return Err(ParseError::UnterminatedString { line: line_no }),
                }
            }
            tokens.push((text, true));
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push((word, false));
        }
    }
    Ok(tokens)
}

fn literal((token, quoted): (String, bool)) -> Value {
    if quoted {
        return Value::String(token);
    }
    match token.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "nil" => Value::Nil,
        _ => token
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or(Value::String(token)),
    }
}

struct Block {
    line: usize,
    count: usize,
    body: Vec<Instruction>,
}

fn parse_call(
    call: &str,
    args: impl Iterator<Item = (String, bool)>,
    show: bool,
    line_no: usize,
) -> Result<Instruction, ParseError> {
    let Some((capability, method)) = call
        .split_once('.')
        .filter(|(capability, method)| !capability.is_empty() && !method.is_empty())
    else {
        return Err(ParseError::BadStatement {
            line: line_no,
            token: call.to_string(),
        });
    };
    Ok(Instruction::Call {
        capability: capability.to_string(),
        method: method.to_string(),
        args: args.map(literal).collect(),
        show,
    })
}

/// Parses the line-based startup language: one `capability.method args...`
/// call (optionally prefixed with `show`) or `wait [event]` per line, with
/// `repeat N` ... `end` blocks.
pub(crate) fn parse_program(source: &str) -> Result<Vec<Instruction>, ParseError> {
    let mut stack = vec![Block {
        line: 0,
        count: 1,
        body: Vec::new(),
    }];

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        let mut tokens = tokenize(line, line_no)?.into_iter();
        let Some((head, quoted)) = tokens.next() else {
            continue;
        };
        if quoted {
            return Err(ParseError::BadStatement {
                line: line_no,
                token: head,
            });
        }

        let instruction = match head.as_str() {
            "repeat" => {
                let count = tokens
                    .next()
                    .and_then(|(count, _)| count.parse::<usize>().ok())
                    .ok_or(ParseError::BadRepeat { line: line_no })?;
                stack.push(Block {
                    line: line_no,
                    count,
                    body: Vec::new(),
                });
                continue;
            }
            "end" => {
                let Some(block) = stack.pop().filter(|_| !stack.is_empty()) else {
                    return Err(ParseError::UnmatchedEnd { line: line_no });
                };
                let Some(parent) = stack.last_mut() else {
                    return Err(ParseError::UnmatchedEnd { line: line_no });
                };
                if block.body.len().saturating_mul(block.count) + parent.body.len()
                    > MAX_PROGRAM_LEN
                {
                    return Err(ParseError::TooLong);
                }
                for _ in 0..block.count {
                    parent.body.extend(block.body.iter().cloned());
                }
                continue;
            }
            "wait" => Instruction::Wait(tokens.next().map(|(name, _)| name)),
            "show" => {
                let (call, _) = tokens.next().ok_or_else(|| ParseError::BadStatement {
                    line: line_no,
                    token: head.clone(),
                })?;
                parse_call(&call, tokens, true, line_no)?
            }
            call => parse_call(call, tokens, false, line_no)?,
        };

        let Some(block) = stack.last_mut() else {
            return Err(ParseError::UnmatchedEnd { line: line_no });
        };
        if block.body.len() >= MAX_PROGRAM_LEN {
            return Err(ParseError::TooLong);
        }
        block.body.push(instruction);
    }

    if stack.len() > 1 {
        let line = stack.last().map(|block| block.line).unwrap_or_default();
        return Err(ParseError::UnclosedRepeat { line });
    }
    Ok(stack.pop().map(|block| block.body).unwrap_or_default())
}

/// Runs the computer's `startup` file. Each boot reads the file afresh.
pub(crate) struct ProgramEngine {
    fs: Arc<dyn FileSystem>,
    program: Vec<Instruction>,
    pc: usize,
    waiting_for: Option<String>,
}

impl ProgramEngine {
    pub(crate) fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            program: Vec::new(),
            pc: 0,
            waiting_for: Some(BOOT_EVENT.to_string()),
        }
    }

    fn run_until_yield(
        &mut self,
        ctx: &mut WorkerContext<RobotWorld>,
    ) -> Result<ScriptStatus, ScriptError> {
        let mut steps = 0usize;
        while let Some(instruction) = self.program.get(self.pc) {
            steps += 1;
            if steps > MAX_STEPS_PER_RESUME {
                return Err(ScriptError::runtime("too long without yielding"));
            }
            if ctx.is_stopping() {
                return Err(ScriptError::Terminated);
            }
            self.pc += 1;
            match instruction {
                Instruction::Call {
                    capability,
                    method,
                    args,
                    show,
                } => {
                    let results = ctx.call(capability, method, args)?;
                    if let [Value::Bool(false), reason, ..] = results.as_slice() {
                        print_line(ctx.display(), &format!("{capability}.{method}: {reason}"));
                    } else if *show {
                        let text = results
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(" ");
                        print_line(ctx.display(), &text);
                    }
                    debug!(
                        computer = %ctx.computer_id(),
                        capability = capability.as_str(),
                        method = method.as_str(),
                        results = results.len(),
                        "program_call"
                    );
                }
                Instruction::Wait(event) => {
                    self.waiting_for = event.clone();
                    return Ok(ScriptStatus::Yielded);
                }
            }
        }
        Ok(ScriptStatus::Finished)
    }
}

impl ScriptEngine<RobotWorld> for ProgramEngine {
    fn start(&mut self, ctx: &mut WorkerContext<RobotWorld>) -> Result<(), ScriptError> {
        let source = self
            .fs
            .read(STARTUP_PATH)
            .map_err(|error| ScriptError::runtime(format!("no startup program: {error}")))?;
        let source = String::from_utf8(source)
            .map_err(|_| ScriptError::runtime("startup is not valid UTF-8"))?;
        self.program = parse_program(&source)
            .map_err(|error| ScriptError::runtime(format!("{STARTUP_PATH}: {error}")))?;
        self.pc = 0;
        self.waiting_for = Some(BOOT_EVENT.to_string());
        ctx.queue_event(BOOT_EVENT, Vec::new());
        Ok(())
    }

    fn resume(
        &mut self,
        ctx: &mut WorkerContext<RobotWorld>,
        event: Event,
    ) -> Result<ScriptStatus, ScriptError> {
        if event.name == "terminate" {
            return Err(ScriptError::Terminated);
        }
        if self
            .waiting_for
            .as_deref()
            .is_some_and(|expected| expected != event.name)
        {
            return Ok(ScriptStatus::Yielded);
        }
        self.run_until_yield(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(capability: &str, method: &str, args: Vec<Value>) -> Instruction {
        Instruction::Call {
            capability: capability.to_string(),
            method: method.to_string(),
            args,
            show: false,
        }
    }

    #[test]
    fn show_prefix_marks_the_call() {
        let program = parse_program("show robot.position").expect("parse");
        assert_eq!(
            program,
            vec![Instruction::Call {
                capability: "robot".to_string(),
                method: "position".to_string(),
                args: vec![],
                show: true,
            }]
        );
        assert_eq!(
            parse_program("show"),
            Err(ParseError::BadStatement {
                line: 1,
                token: "show".to_string()
            })
        );
    }

    #[test]
    fn parses_calls_with_literal_arguments() {
        let program = parse_program(
            "# demo\n\
             term.print \"hello world\" 3 true nil\n\
             \n\
             wait key\n\
             wait\n",
        )
        .expect("parse");

        assert_eq!(
            program,
            vec![
                call(
                    "term",
                    "print",
                    vec![
                        Value::from("hello world"),
                        Value::Number(3.0),
                        Value::Bool(true),
                        Value::Nil,
                    ]
                ),
                Instruction::Wait(Some("key".to_string())),
                Instruction::Wait(None),
            ]
        );
    }

    #[test]
    fn repeat_blocks_expand_and_nest() {
        let program = parse_program(
            "repeat 2\n  robot.forward\n  repeat 2\n    robot.turn_left\n  end\nend\n",
        )
        .expect("parse");

        let forward = call("robot", "forward", vec![]);
        let left = call("robot", "turn_left", vec![]);
        assert_eq!(
            program,
            vec![
                forward.clone(),
                left.clone(),
                left.clone(),
                forward,
                left.clone(),
                left
            ]
        );
    }

    #[test]
    fn quoted_numbers_stay_strings() {
        let program = parse_program("fs.write \"notes\" \"42\"").expect("parse");
        assert_eq!(
            program,
            vec![call(
                "fs",
                "write",
                vec![Value::from("notes"), Value::from("42")]
            )]
        );
    }

    #[test]
    fn malformed_programs_report_the_line() {
        assert_eq!(
            parse_program("term.print \"oops"),
            Err(ParseError::UnterminatedString { line: 1 })
        );
        assert_eq!(
            parse_program("wait\nforward"),
            Err(ParseError::BadStatement {
                line: 2,
                token: "forward".to_string()
            })
        );
        assert_eq!(parse_program("end"), Err(ParseError::UnmatchedEnd { line: 1 }));
        assert_eq!(
            parse_program("\nrepeat 3\nrobot.forward"),
            Err(ParseError::UnclosedRepeat { line: 2 })
        );
        assert_eq!(parse_program("repeat x\nend"), Err(ParseError::BadRepeat { line: 1 }));
    }

    #[test]
    fn runaway_repeat_is_rejected() {
        assert_eq!(
            parse_program("repeat 100000\nrobot.forward\nend"),
            Err(ParseError::TooLong)
        );
    }
}
