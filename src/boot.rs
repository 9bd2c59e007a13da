use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

/// Initialise diagnostic logging to stderr. `RUST_LOG` overrides the default `info` level.
///
/// Setting `MBT_LOG_FILE` sends diagnostics to that file instead, which keeps
/// the operator console free of them.
pub fn init_logger() {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env();

    if let Ok(path) = std::env::var("MBT_LOG_FILE") {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("Failed to open diagnostic log '{path}': {err}"),
        }
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already initialised");
    }
}
