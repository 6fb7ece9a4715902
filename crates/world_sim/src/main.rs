mod app;

use std::process::ExitCode;

fn main() -> ExitCode {
    let args = match app::bootstrap::parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    if args.help {
        println!("{}", app::bootstrap::USAGE);
        return ExitCode::SUCCESS;
    }

    match app::bootstrap::build_app(args) {
        Ok(app) => app::loop_runner::run(app),
        Err(err) => {
            tracing::error!(error = %err, "startup_failed");
            ExitCode::FAILURE
        }
    }
}
