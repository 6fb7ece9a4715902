use std::sync::Arc;

use tracing::info;
use vcomputer::computer::{arg_bool, arg_int, arg_string, opt_int};
use vcomputer::terminal::Terminal;
use vcomputer::DisplayBuffer;
use vcomputer::{
    Capability, CommandContext, CommandResult, FileSystem, ScriptError, Value, WorkerContext,
};

use super::world::RobotWorld;

fn unknown_method(capability: &str, method: &str) -> ScriptError {
    ScriptError::UnknownMethod {
        capability: capability.to_string(),
        method: method.to_string(),
    }
}

/// `true` plus any value on success, `false` plus the reason on failure.
fn command_values(result: CommandResult) -> Vec<Value> {
    match result {
        CommandResult::Success(None) => vec![Value::Bool(true)],
        CommandResult::Success(Some(value)) => vec![Value::Bool(true), value],
        CommandResult::Failure(reason) => vec![Value::Bool(false), Value::String(reason)],
    }
}

fn colour_arg(args: &[Value], index: usize) -> Result<u8, ScriptError> {
    let colour = arg_int(args, index)?;
    u8::try_from(colour)
        .ok()
        .filter(|colour| *colour < vcomputer::terminal::PALETTE_SIZE)
        .ok_or_else(|| ScriptError::BadArgument {
            index: index + 1,
            message: format!("colour out of range ({colour})"),
        })
}

/// Movement and sensing for the robot attached to the computer. Every method
/// runs on the world thread.
#[derive(Debug, Default)]
pub(crate) struct RobotCapability;

impl RobotCapability {
    fn run(
        ctx: &mut WorkerContext<RobotWorld>,
        action: fn(&mut CommandContext<'_, RobotWorld>) -> CommandResult,
    ) -> Result<Vec<Value>, ScriptError> {
        ctx.execute_fn(action).map(command_values)
    }
}

impl Capability<RobotWorld> for RobotCapability {
    fn names(&self) -> &[&'static str] {
        &["robot"]
    }

    fn call(
        &self,
        ctx: &mut WorkerContext<RobotWorld>,
        method: &str,
        _args: &[Value],
    ) -> Result<Vec<Value>, ScriptError> {
        match method {
            "forward" => Self::run(ctx, |command| {
                let id = command.computer();
                match command.world_mut().forward(id) {
                    Ok(_) => CommandResult::success(),
                    Err(reason) => CommandResult::failure(reason),
                }
            }),
            "back" => Self::run(ctx, |command| {
                let id = command.computer();
                match command.world_mut().back(id) {
                    Ok(_) => CommandResult::success(),
                    Err(reason) => CommandResult::failure(reason),
                }
            }),
            "turn_left" => Self::run(ctx, |command| {
                let id = command.computer();
                match command.world_mut().turn_left(id) {
                    Ok(facing) => CommandResult::success_with(facing.as_str()),
                    Err(reason) => CommandResult::failure(reason),
                }
            }),
            "turn_right" => Self::run(ctx, |command| {
                let id = command.computer();
                match command.world_mut().turn_right(id) {
                    Ok(facing) => CommandResult::success_with(facing.as_str()),
                    Err(reason) => CommandResult::failure(reason),
                }
            }),
            "inspect" => Self::run(ctx, |command| {
                match command.world().inspect(command.computer()) {
                    Some(sensed) => CommandResult::success_with(sensed.as_str()),
                    None => CommandResult::failure("no robot"),
                }
            }),
            "position" => Self::run(ctx, |command| {
                match command.world().robot(command.computer()) {
                    Some(robot) => CommandResult::success_with(format!(
                        "{},{},{}",
                        robot.position.x,
                        robot.position.y,
                        robot.facing.as_str()
                    )),
                    None => CommandResult::failure("no robot"),
                }
            }),
            other => Err(unknown_method("robot", other)),
        }
    }
}

/// The computer's own screen. Writes go straight to the display buffer from
/// the worker thread.
#[derive(Debug, Default)]
pub(crate) struct TermCapability;

/// Writes `text` at the cursor and moves to the start of the next line,
/// scrolling when already on the last one.
pub(crate) fn print_line(display: &DisplayBuffer, text: &str) {
    display.update(|terminal| {
        terminal.write(text);
        newline(terminal);
    });
}

/// Scripts see 1-based cells; script numbers may be anywhere in `i64`.
fn set_cursor_one_based(display: &DisplayBuffer, x: i64, y: i64) {
    display.set_cursor(x.saturating_sub(1), y.saturating_sub(1));
}

fn cursor_one_based(display: &DisplayBuffer) -> (i64, i64) {
    let (x, y) = display.read(|terminal| terminal.cursor());
    (x.saturating_add(1), y.saturating_add(1))
}

fn newline(terminal: &mut Terminal) {
    let (_, y) = terminal.cursor();
    let last_row = terminal.height() as i64 - 1;
    if y >= last_row {
        terminal.scroll(1);
        terminal.set_cursor(0, last_row);
    } else {
        terminal.set_cursor(0, y + 1);
    }
}

impl Capability<RobotWorld> for TermCapability {
    fn names(&self) -> &[&'static str] {
        &["term"]
    }

    fn call(
        &self,
        ctx: &mut WorkerContext<RobotWorld>,
        method: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ScriptError> {
        let display = ctx.display();
        match method {
            "write" => {
                let text = args.first().map(ToString::to_string).unwrap_or_default();
                display.write(&text);
            }
            "print" => {
                let text = args
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                print_line(display, &text);
            }
            "clear" => display.clear(),
            "clear_line" => display.clear_line(),
            "scroll" => display.scroll(scroll_amount(args)?),
            "set_cursor" => {
                set_cursor_one_based(display, arg_int(args, 0)?, arg_int(args, 1)?);
            }
            "get_cursor" => {
                let (x, y) = cursor_one_based(display);
                return Ok(vec![Value::from(x), Value::from(y)]);
            }
            "get_size" => {
                let (width, height) = display.size();
                return Ok(vec![
                    Value::from(width as f64),
                    Value::from(height as f64),
                ]);
            }
            "set_cursor_blink" => {
                let blink = arg_bool(args, 0)?;
                display.update(|terminal| terminal.set_cursor_blink(blink));
            }
            "set_text_colour" => display.set_text_colour(colour_arg(args, 0)?),
            "set_background_colour" => display.set_background_colour(colour_arg(args, 0)?),
            "blit" => {
                let text = arg_string(args, 0)?;
                let text_colours = arg_string(args, 1)?;
                let backgrounds = arg_string(args, 2)?;
                display
                    .blit(text, text_colours, backgrounds)
                    .map_err(|error| ScriptError::runtime(error.to_string()))?;
            }
            other => return Err(unknown_method("term", other)),
        }
        Ok(Vec::new())
    }
}

/// Power control, events and the world clock.
#[derive(Debug, Default)]
pub(crate) struct OsCapability;

impl Capability<RobotWorld> for OsCapability {
    fn names(&self) -> &[&'static str] {
        &["os"]
    }

    fn call(
        &self,
        ctx: &mut WorkerContext<RobotWorld>,
        method: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ScriptError> {
        match method {
            "computer_id" => Ok(vec![Value::from(ctx.computer_id().0)]),
            "queue_event" => {
                let name = arg_string(args, 0)?.to_string();
                ctx.queue_event(name, args[1..].to_vec());
                Ok(Vec::new())
            }
            "shutdown" => {
                ctx.request_shutdown();
                Ok(Vec::new())
            }
            "reboot" => {
                ctx.request_reboot();
                Ok(Vec::new())
            }
            "log" => {
                let message = args
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(computer = %ctx.computer_id(), message = message.as_str(), "script_log");
                Ok(Vec::new())
            }
            "tick" => {
                let result = ctx.execute_fn(|command| {
                    CommandResult::success_with(command.tick() as f64)
                })?;
                Ok(command_values(result))
            }
            "capabilities" => Ok(ctx
                .capability_names()
                .into_iter()
                .map(Value::from)
                .collect()),
            other => Err(unknown_method("os", other)),
        }
    }
}

/// The computer's files. Paths are resolved against the root.
pub(crate) struct FsCapability {
    fs: Arc<dyn FileSystem>,
}

impl FsCapability {
    pub(crate) fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

fn fs_result<T>(result: Result<T, vcomputer::FsError>) -> Result<T, ScriptError> {
    result.map_err(|error| ScriptError::runtime(error.to_string()))
}

impl Capability<RobotWorld> for FsCapability {
    fn names(&self) -> &[&'static str] {
        &["fs"]
    }

    fn call(
        &self,
        _ctx: &mut WorkerContext<RobotWorld>,
        method: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ScriptError> {
        match method {
            "exists" => Ok(vec![Value::from(self.fs.exists(arg_string(args, 0)?))]),
            "is_dir" => Ok(vec![Value::from(self.fs.is_dir(arg_string(args, 0)?))]),
            "list" => {
                let entries = fs_result(self.fs.list(arg_string(args, 0)?))?;
                Ok(entries.into_iter().map(Value::from).collect())
            }
            "read" => {
                let bytes = fs_result(self.fs.read(arg_string(args, 0)?))?;
                Ok(vec![Value::from(String::from_utf8_lossy(&bytes).into_owned())])
            }
            "write" => {
                let path = arg_string(args, 0)?;
                let text = args.get(1).map(ToString::to_string).unwrap_or_default();
                fs_result(self.fs.write(path, text.as_bytes()))?;
                Ok(Vec::new())
            }
            "make_dir" => {
                fs_result(self.fs.make_dir(arg_string(args, 0)?))?;
                Ok(Vec::new())
            }
            "delete" => {
                fs_result(self.fs.delete(arg_string(args, 0)?))?;
                Ok(Vec::new())
            }
            "copy" => {
                fs_result(self.fs.copy(arg_string(args, 0)?, arg_string(args, 1)?))?;
                Ok(Vec::new())
            }
            "move" => {
                fs_result(self.fs.move_to(arg_string(args, 0)?, arg_string(args, 1)?))?;
                Ok(Vec::new())
            }
            "combine" => {
                let combined = self.fs.combine(arg_string(args, 0)?, arg_string(args, 1)?);
                Ok(vec![Value::from(combined)])
            }
            "size" => {
                let bytes = fs_result(self.fs.read(arg_string(args, 0)?))?;
                Ok(vec![Value::from(bytes.len() as f64)])
            }
            other => Err(unknown_method("fs", other)),
        }
    }
}

fn scroll_amount(args: &[Value]) -> Result<i64, ScriptError> {
    Ok(opt_int(args, 0)?.unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_results_become_status_pairs() {
        assert_eq!(command_values(CommandResult::success()), vec![Value::Bool(true)]);
        assert_eq!(
            command_values(CommandResult::failure("blocked")),
            vec![Value::Bool(false), Value::from("blocked")]
        );
        assert_eq!(
            command_values(CommandResult::success_with("east")),
            vec![Value::Bool(true), Value::from("east")]
        );
    }

    #[test]
    fn colours_must_be_in_palette() {
        assert_eq!(colour_arg(&[Value::from(15)], 0), Ok(15));
        assert!(matches!(
            colour_arg(&[Value::from(16)], 0),
            Err(ScriptError::BadArgument { index: 1, .. })
        ));
        assert!(colour_arg(&[Value::from(-1)], 0).is_err());
    }

    #[test]
    fn cursor_arguments_at_the_i64_limits_do_not_overflow() {
        let display = DisplayBuffer::new(5, 3);
        let far = arg_int(&[Value::Number(-1e19)], 0).expect("number");
        assert_eq!(far, i64::MIN);

        set_cursor_one_based(&display, far, 1);
        assert_eq!(display.read(|terminal| terminal.cursor()), (i64::MIN, 0));
        assert_eq!(cursor_one_based(&display), (i64::MIN + 1, 1));
        display.write("clipped");

        set_cursor_one_based(&display, i64::MAX, i64::MAX);
        assert_eq!(cursor_one_based(&display), (i64::MAX, i64::MAX));

        set_cursor_one_based(&display, 2, 3);
        display.write("ok");
        assert_eq!(display.line(2).as_deref(), Some(" ok  "));
        assert_eq!(display.line(0).as_deref(), Some("     "));
    }

    #[test]
    fn print_scrolls_at_the_bottom_row() {
        let mut terminal = Terminal::new(5, 2);
        terminal.write("a");
        newline(&mut terminal);
        terminal.write("b");
        newline(&mut terminal);

        assert_eq!(terminal.line(0).as_deref(), Some("b    "));
        assert_eq!(terminal.cursor(), (0, 1));
    }
}
