//! Log initialisation: env_logger text output or JSON lines
//!
//! The JSON format emits one object per line for jq-style analysis:
//! `{"timestamp": "...", "level": "INFO", "component": "weft::peer", ...}`.

use std::io::Write;

use log::LevelFilter;
use serde::Serialize;

/// Structured log line for the JSON format.
#[derive(Debug, Serialize)]
struct JsonRecord<'a> {
    timestamp: String,
    level: &'a str,
    component: &'a str,
    message: String,
}

fn level_filter(level: &str) -> LevelFilter {
    match level {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Initialise the global logger. `verbosity` from repeated `-v` flags
/// overrides the configured level; RUST_LOG overrides both.
pub fn init(level: &str, format: &str, verbosity: u8) {
    let filter = match verbosity {
        0 => level_filter(level),
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter.to_string()),
    );

    if format == "json" {
        builder.format(|buf, record| {
            let line = JsonRecord {
                timestamp: humantime::format_rfc3339_millis(std::time::SystemTime::now())
                    .to_string(),
                level: record.level().as_str(),
                component: record.target(),
                message: record.args().to_string(),
            };
            match serde_json::to_string(&line) {
                Ok(json) => writeln!(buf, "{}", json),
                Err(_) => writeln!(buf, "{}", record.args()),
            }
        });
    }

    // Repeated init in tests is fine; keep the first logger.
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter("error"), LevelFilter::Error);
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("bogus"), LevelFilter::Info);
    }

    #[test]
    fn test_json_record_shape() {
        let record = JsonRecord {
            timestamp: "2024-01-01T00:00:00Z".into(),
            level: "INFO",
            component: "weft::peer",
            message: "hello".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"level\":\"INFO\""));
        assert!(json.contains("\"component\":\"weft::peer\""));
    }
}
