//! HA manager configuration

use std::time::Duration;

use crate::ha::endpoint::Endpoint;

/// Immutable settings supplied at manager construction
#[derive(Debug, Clone)]
pub struct HaSettings {
    // --- Topology ---
    /// Seed endpoints: any mix of masters, slaves and sentinels
    pub endpoints: Vec<Endpoint>,
    /// Master name the sentinels monitor (required when they monitor more than one)
    pub master_name: Option<String>,

    // --- Connections ---
    /// Connect timeout for every socket the manager opens (default: 5s)
    pub connect_timeout: Duration,
    /// Reply timeout for request/response commands (default: 5s)
    pub command_timeout: Duration,
    /// Password sent with AUTH after connecting
    pub password: Option<String>,
    /// ACL username (Redis 6+)
    pub username: Option<String>,
    /// Database selected when callers don't pass one (default: 0)
    pub default_db: usize,
    /// Idle connections kept per endpoint (default: 8)
    pub pool_size: usize,

    // --- Heartbeat ---
    /// Pulse every node periodically (default: yes)
    pub heartbeat_enabled: bool,
    /// Seconds between pulses of one node (default: 5)
    pub heartbeat_interval_secs: u64,

    // --- Logging ---
    /// Log level (default: "notice")
    pub loglevel: String,
    /// Log file path (default: "" - stdout)
    pub logfile: String,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            master_name: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            password: None,
            username: None,
            default_db: 0,
            pool_size: 8,
            heartbeat_enabled: true,
            heartbeat_interval_secs: 5,
            loglevel: "notice".to_string(),
            logfile: String::new(),
        }
    }
}

impl HaSettings {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_master_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.master_name = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_default_db(mut self, db: usize) -> Self {
        self.default_db = db;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_heartbeat(mut self, enabled: bool, interval_secs: u64) -> Self {
        self.heartbeat_enabled = enabled;
        self.heartbeat_interval_secs = interval_secs;
        self
    }

    pub fn with_loglevel(mut self, level: impl Into<String>) -> Self {
        self.loglevel = level.into();
        self
    }

    /// Endpoints with duplicates and empty entries removed, order kept
    pub fn seed_endpoints(&self) -> Vec<Endpoint> {
        let mut seen = std::collections::HashSet::new();
        self.endpoints
            .iter()
            .filter(|ep| !ep.is_empty() && seen.insert((*ep).clone()))
            .cloned()
            .collect()
    }
}

/// Heartbeat scheduler configuration
#[derive(Debug, Clone, Copy)]
pub struct CardioSettings {
    /// Scheduler tick period (default: 1s)
    pub tick: Duration,
    /// Lower clamp for per-probe intervals in seconds (default: 1)
    pub min_interval_secs: u64,
    /// Upper clamp for per-probe intervals in seconds (default: 60)
    pub max_interval_secs: u64,
}

impl Default for CardioSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            min_interval_secs: 1,
            max_interval_secs: 60,
        }
    }
}

impl CardioSettings {
    /// Clamp a requested probe interval into the configured band
    pub fn clamp_interval(&self, secs: u64) -> Duration {
        let min = self.min_interval_secs.max(1);
        let max = self.max_interval_secs.max(min);
        Duration::from_secs(secs.clamp(min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = HaSettings::default();
        assert!(settings.endpoints.is_empty());
        assert_eq!(settings.master_name, None);
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert!(settings.heartbeat_enabled);
        assert_eq!(settings.loglevel, "notice");
    }

    #[test]
    fn test_builder() {
        let settings = HaSettings::new(vec![Endpoint::new("127.0.0.1", 26379)])
            .with_master_name("mymaster")
            .with_pool_size(0)
            .with_heartbeat(false, 10);
        assert_eq!(settings.master_name.as_deref(), Some("mymaster"));
        assert_eq!(settings.pool_size, 1);
        assert!(!settings.heartbeat_enabled);

        let settings = settings.with_master_name("");
        assert_eq!(settings.master_name, None);
    }

    #[test]
    fn test_seed_endpoints_dedup() {
        let a = Endpoint::new("10.0.0.1", 6379);
        let b = Endpoint::new("10.0.0.2", 6379);
        let settings = HaSettings::new(vec![a.clone(), Endpoint::EMPTY, b.clone(), a.clone()]);
        assert_eq!(settings.seed_endpoints(), vec![a, b]);
    }

    #[test]
    fn test_clamp_interval() {
        let cardio = CardioSettings {
            tick: Duration::from_secs(1),
            min_interval_secs: 2,
            max_interval_secs: 30,
        };
        assert_eq!(cardio.clamp_interval(0), Duration::from_secs(2));
        assert_eq!(cardio.clamp_interval(10), Duration::from_secs(10));
        assert_eq!(cardio.clamp_interval(300), Duration::from_secs(30));
    }
}
