//! Logging setup
//!
//! Redis-style log levels (debug, verbose, notice, warning, nothing) on top
//! of the `log` facade. Records go to a file when one is configured,
//! otherwise to stderr. Passwords in AUTH commands are never written out.

use crate::config::HaSettings;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

/// Redis-style log levels mapped to Rust log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisLogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
    Nothing,
}

impl RedisLogLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" => Self::Debug,
            "verbose" => Self::Verbose,
            "notice" => Self::Notice,
            "warning" => Self::Warning,
            "nothing" => Self::Nothing,
            _ => Self::Notice,
        }
    }

    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::Debug,
            Self::Verbose => LevelFilter::Info,
            Self::Notice => LevelFilter::Info,
            Self::Warning => LevelFilter::Warn,
            Self::Nothing => LevelFilter::Off,
        }
    }
}

pub struct HaLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl HaLogger {
    pub fn new(loglevel: &str, logfile: &str) -> Self {
        let level = RedisLogLevel::parse(loglevel).to_level_filter();

        let file = if !logfile.is_empty() {
            match OpenOptions::new().create(true).append(true).open(logfile) {
                Ok(f) => Some(Mutex::new(f)),
                Err(e) => {
                    eprintln!("Warning: Failed to open log file '{}': {}", logfile, e);
                    None
                }
            }
        } else {
            None
        };

        Self { level, file }
    }

    /// `pid:level-char timestamp [target] message`
    fn format_record(&self, record: &Record) -> String {
        let level_char = match record.level() {
            log::Level::Error => '!',
            log::Level::Warn => '#',
            log::Level::Info => '*',
            log::Level::Debug => '-',
            log::Level::Trace => '.',
        };
        let msg = redact_auth(&record.args().to_string());
        format!(
            "{}:{} {} [{}] {}\n",
            std::process::id(),
            level_char,
            unix_now(),
            record.target(),
            msg
        )
    }
}

impl Log for HaLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let formatted = self.format_record(record);
        if let Some(ref file) = self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.write_all(formatted.as_bytes());
            }
        } else {
            eprint!("{}", formatted);
        }
    }

    fn flush(&self) {
        if let Some(ref file) = self.file
            && let Ok(mut f) = file.lock()
        {
            let _ = f.flush();
        }
    }
}

/// Replace the argument(s) following an AUTH keyword
fn redact_auth(input: &str) -> String {
    let upper = input.to_ascii_uppercase();
    let Some(idx) = upper.find("AUTH ") else {
        return input.to_string();
    };
    let before = &input[..idx];
    let rest = &input[idx + 5..];
    // AUTH <password> or AUTH <username> <password>: drop up to the end of
    // the command word list, keep what follows a separator
    let end = rest.find(['\n', ',', ';', ')']).unwrap_or(rest.len());
    format!("{}AUTH [REDACTED]{}", before, &rest[end..])
}

fn unix_now() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the process-wide logger for `settings`
pub fn init_logging(settings: &HaSettings) -> Result<(), log::SetLoggerError> {
    let logger = Box::new(HaLogger::new(&settings.loglevel, &settings.logfile));
    let level = RedisLogLevel::parse(&settings.loglevel).to_level_filter();

    log::set_boxed_logger(logger)?;
    log::set_max_level(level);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(
            RedisLogLevel::parse("debug").to_level_filter(),
            LevelFilter::Debug
        );
        assert_eq!(
            RedisLogLevel::parse("verbose").to_level_filter(),
            LevelFilter::Info
        );
        assert_eq!(
            RedisLogLevel::parse("WARNING").to_level_filter(),
            LevelFilter::Warn
        );
        assert_eq!(
            RedisLogLevel::parse("nothing").to_level_filter(),
            LevelFilter::Off
        );
        // Unknown defaults to notice
        assert_eq!(
            RedisLogLevel::parse("loud").to_level_filter(),
            LevelFilter::Info
        );
    }

    #[test]
    fn test_redact_auth() {
        let redacted = redact_auth("sent AUTH default s3cret, waiting");
        assert_eq!(redacted, "sent AUTH [REDACTED], waiting");
        assert!(!redact_auth("auth hunter2").contains("hunter2"));
        assert_eq!(redact_auth("PING"), "PING");
    }

    #[test]
    fn test_file_logger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ha.log");
        let logger = HaLogger::new("warning", path.to_str().unwrap());

        logger.log(
            &Record::builder()
                .args(format_args!("master down"))
                .level(log::Level::Warn)
                .target("sockudo_ha::ha::manager")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("filtered out"))
                .level(log::Level::Info)
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains(":# "));
        assert!(written.contains("[sockudo_ha::ha::manager] master down"));
        assert!(!written.contains("filtered out"));
    }
}
