//! Timestamped leveled logging.
//!
//! Built on `log`/`env_logger`, with a custom format producing
//! `YYYY-MM-DD HH:MM:SS LEVEL message` lines. Must only ever be called
//! from the supervisor's main loop, never from a signal handler (see
//! [`crate::supervisor`]).

use std::io::Write;

/// Initializes the global logger. `verbose` selects `debug` as the
/// default level; `RUST_LOG`, if set, always wins (matches `env_logger`'s
/// usual precedence).
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            writeln!(buf, "{now} {:<5} {}", record.level(), record.args())
        })
        .target(env_logger::Target::Stdout)
        .init();
}
