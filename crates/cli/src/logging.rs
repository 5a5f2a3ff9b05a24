//! Tracing subscriber setup driven by the CLI verbosity flags.

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the derived filter, `RUST_LOG`-style.
const LOG_ENV: &str = "UDROP_LOG";

/// Installs the global subscriber.
///
/// `-q` keeps errors only, the default shows warnings, `-v` raises the
/// udrop crates to debug, `-vv` to trace. `UDROP_LOG` overrides the whole
/// filter when set. Logs go to stderr so `--json` event streams on stdout
/// stay machine-readable.
pub fn init(verbosity: u8, quiet: bool) {
    let directives = if quiet {
        "error".to_owned()
    } else {
        match verbosity {
            0 => "warn".to_owned(),
            1 => "warn,wire=debug,transport=debug,coord=debug,transfer=debug,peer=debug,cli=debug"
                .to_owned(),
            _ => "info,wire=trace,transport=trace,coord=trace,transfer=trace,peer=trace,cli=trace"
                .to_owned(),
        }
    };

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(directives));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
