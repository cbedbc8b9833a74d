//! Logging setup
//!
//! Lines are written as `[millis][LEVEL] target - message`. `RUST_LOG`, when
//! set, overrides the level passed to [`init_logger`].

use log::{LevelFilter, Record};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Render one log line
pub fn format_line(timestamp: u128, record: &Record) -> String {
    format!(
        "[{}][{}] {} - {}",
        timestamp,
        record.level(),
        record.target(),
        record.args()
    )
}

/// Map a `-v` count onto a level filter
pub fn level_from_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the global logger
pub fn init_logger(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| writeln!(buf, "{}", format_line(timestamp_millis(), record)))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_format_line() {
        let line = format_line(
            42,
            &Record::builder()
                .args(format_args!("Port {} MAC: {}", 0, "52:54:00:10:00:00"))
                .level(Level::Info)
                .target("vmdq_fwd::poll")
                .build(),
        );
        assert_eq!(
            line,
            "[42][INFO] vmdq_fwd::poll - Port 0 MAC: 52:54:00:10:00:00"
        );
    }

    #[test]
    fn test_level_from_verbosity() {
        assert_eq!(level_from_verbosity(0), LevelFilter::Info);
        assert_eq!(level_from_verbosity(1), LevelFilter::Debug);
        assert_eq!(level_from_verbosity(5), LevelFilter::Trace);
    }
}
