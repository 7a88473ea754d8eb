//! Logger setup for binaries built on this crate
//!
//! The library itself only uses the `log` macros. Every line is prefixed
//! with the emitting pid, since parent and worker children usually share a
//! terminal.

use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

fn level_tag(level: Level) -> String {
    match level {
        Level::Error => style("ERROR").red().bold().to_string(),
        Level::Warn => style("WARN ").yellow().bold().to_string(),
        Level::Info => style("INFO ").green().to_string(),
        Level::Debug => style("DEBUG").cyan().to_string(),
        Level::Trace => style("TRACE").dim().to_string(),
    }
}

/// Initialize logger based on verbose flag. `RUST_LOG` takes precedence.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logger(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let env = Env::default().filter_or("RUST_LOG", default);

    let _ = Builder::new()
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .parse_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                level_tag(record.level()),
                std::process::id(),
                record.args()
            )
        })
        .try_init();
}
