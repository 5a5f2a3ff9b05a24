//! Command-line front end: argument parsing, output formatting, dispatch.

mod args;
mod connect;
mod logging;
mod output;
mod receive;
mod send;
mod server;

use std::ffi::OsString;

/// Exit code for runtime failures.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for usage errors.
pub const EXIT_USAGE: i32 = 2;

/// Parses `argv` and runs the selected subcommand; returns the exit code.
pub fn run<I, S>(argv: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let matches = match args::command().try_get_matches_from(argv) {
        Ok(matches) => matches,
        Err(err) => {
            // Clap renders --help/--version as "errors" with exit code 0.
            let code = if err.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = err.print();
            return code;
        }
    };

    logging::init(
        matches.get_count("verbose"),
        matches.get_flag("quiet"),
    );

    match matches.subcommand() {
        Some(("server", sub)) => server::run(sub),
        Some(("send", sub)) => send::run(sub),
        Some(("receive", sub)) => receive::run(sub),
        _ => {
            // Clap enforces subcommand_required, so this is unreachable in
            // practice; fail closed anyway.
            eprintln!("no subcommand given");
            EXIT_USAGE
        }
    }
}
