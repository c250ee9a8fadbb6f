use crate::config::HaSettings;
use crate::ha::endpoint::Endpoint;
use clap::Parser;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ha-watch")]
#[command(author = "Sockudo Team")]
#[command(version = "0.1.0")]
#[command(about = "Discover a sentinel-managed deployment and follow its failovers", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(value_name = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Seed endpoint (host:port); repeat for several
    #[arg(short, long = "endpoint", value_name = "HOST:PORT")]
    pub endpoints: Vec<String>,

    /// Master name monitored by the sentinels
    #[arg(short, long)]
    pub master_name: Option<String>,

    /// Password sent with AUTH
    #[arg(long)]
    pub password: Option<String>,

    /// ACL username
    #[arg(long)]
    pub username: Option<String>,

    /// Database index for --exec (default: 0)
    #[arg(long)]
    pub db: Option<usize>,

    /// Connect timeout in milliseconds (default: 5000)
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Heartbeat interval in seconds (default: 5)
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Disable the heartbeat
    #[arg(long)]
    pub no_heartbeat: bool,

    /// Log level (debug, verbose, notice, warning, nothing)
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log file path
    #[arg(long)]
    pub logfile: Option<String>,

    /// Keep running and print the topology after every sentinel event
    #[arg(short, long)]
    pub watch: bool,

    /// Route --exec to a slave
    #[arg(long)]
    pub read_only: bool,

    /// Run one command and print the reply
    #[arg(long, num_args = 1.., value_name = "ARG", allow_hyphen_values = true)]
    pub exec: Option<Vec<String>>,
}

impl Cli {
    /// Settings from the config file (if any) overridden by flags
    pub fn load_settings(&self) -> Result<HaSettings, String> {
        let mut settings = HaSettings::default();

        if let Some(path) = &self.config_file {
            parse_config_file(path, &mut settings)?;
        }

        for endpoint in &self.endpoints {
            settings.endpoints.push(parse_endpoint(endpoint)?);
        }
        if let Some(name) = &self.master_name {
            settings = settings.with_master_name(name.clone());
        }
        if let Some(password) = &self.password {
            settings.password = Some(password.clone());
        }
        if let Some(username) = &self.username {
            settings.username = Some(username.clone());
        }
        if let Some(db) = self.db {
            settings.default_db = db;
        }
        if let Some(ms) = self.connect_timeout {
            settings.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.heartbeat_interval {
            settings.heartbeat_interval_secs = secs;
        }
        if self.no_heartbeat {
            settings.heartbeat_enabled = false;
        }
        if let Some(level) = &self.loglevel {
            settings.loglevel = level.clone();
        }
        if let Some(file) = &self.logfile {
            settings.logfile = file.clone();
        }

        if settings.seed_endpoints().is_empty() {
            return Err("No endpoint given (use --endpoint or an 'endpoint' directive)".to_string());
        }
        Ok(settings)
    }
}

fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    s.parse::<Endpoint>().map_err(|e| e.to_string())
}

fn parse_config_file(path: &Path, settings: &mut HaSettings) -> Result<(), String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts = split_args(line)?;
        if parts.is_empty() {
            continue;
        }

        let directive = parts[0].to_lowercase();
        let args = &parts[1..];

        match directive.as_str() {
            "endpoint" | "sentinel" if !args.is_empty() => {
                for arg in args {
                    settings.endpoints.push(parse_endpoint(arg)?);
                }
            }
            "master-name" if !args.is_empty() => {
                settings.master_name = Some(args[0].clone()).filter(|n| !n.is_empty())
            }
            "requirepass" | "password" if !args.is_empty() => {
                settings.password = Some(args[0].clone())
            }
            "username" if !args.is_empty() => settings.username = Some(args[0].clone()),
            "default-db" if !args.is_empty() => {
                settings.default_db = parse_usize(&args[0], "default-db")?
            }
            "pool-size" if !args.is_empty() => {
                settings.pool_size = parse_usize(&args[0], "pool-size")?.max(1)
            }
            "connect-timeout" if !args.is_empty() => {
                settings.connect_timeout =
                    Duration::from_millis(parse_u64(&args[0], "connect-timeout")?)
            }
            "command-timeout" if !args.is_empty() => {
                settings.command_timeout =
                    Duration::from_millis(parse_u64(&args[0], "command-timeout")?)
            }
            "heartbeat" if !args.is_empty() => settings.heartbeat_enabled = parse_bool(&args[0])?,
            "heartbeat-interval" if !args.is_empty() => {
                settings.heartbeat_interval_secs = parse_u64(&args[0], "heartbeat-interval")?
            }
            "loglevel" if !args.is_empty() => settings.loglevel = args[0].clone(),
            "logfile" if !args.is_empty() => settings.logfile = args[0].clone(),
            _ => {
                log::debug!("Ignoring unknown directive '{}'", directive);
            }
        }
    }
    Ok(())
}

fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut quote_char = '\0';
    let mut escape = false;
    let mut token_started = false;

    for c in line.chars() {
        if escape {
            current.push(c);
            escape = false;
            token_started = true;
            continue;
        }

        if c == '\\' {
            escape = true;
            token_started = true;
            continue;
        }

        if in_quote {
            if c == quote_char {
                in_quote = false;
                token_started = true;
            } else {
                current.push(c);
            }
        } else if c == '"' || c == '\'' {
            in_quote = true;
            quote_char = c;
            token_started = true;
        } else if c.is_whitespace() {
            if token_started {
                args.push(std::mem::take(&mut current));
                token_started = false;
            }
        } else {
            current.push(c);
            token_started = true;
        }
    }

    if in_quote {
        return Err("Unclosed quote".to_string());
    }

    if token_started {
        args.push(current);
    }

    Ok(args)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(format!("Invalid boolean: {}", s)),
    }
}

fn parse_u64(s: &str, field: &str) -> Result<u64, String> {
    s.parse::<u64>()
        .map_err(|_| format!("Invalid {}: {}", field, s))
}

fn parse_usize(s: &str, field: &str) -> Result<usize, String> {
    s.parse::<usize>()
        .map_err(|_| format!("Invalid {}: {}", field, s))
}
