//! Sentinel notification channels and message parsing
//!
//! Payload formats, as published by sentinels:
//! - `+switch-master`: `<master-name> <old-ip> <old-port> <new-ip> <new-port>`
//! - `+sdown` / `-sdown` / `+odown` / `-odown`:
//!   `<instance-type> <name> <ip> <port> [@ <master-name> <master-ip> <master-port>]`
//!   (`+odown` for a master carries a trailing `#quorum N`)

use super::endpoint::Endpoint;

pub const SWITCH_MASTER: &str = "+switch-master";
pub const SDOWN_ENTER: &str = "+sdown";
pub const SDOWN_EXIT: &str = "-sdown";
pub const ODOWN_ENTER: &str = "+odown";
pub const ODOWN_EXIT: &str = "-odown";

/// Every channel the sentinel group subscribes to
pub const TOPICS: [&str; 5] = [SDOWN_ENTER, SDOWN_EXIT, ODOWN_ENTER, ODOWN_EXIT, SWITCH_MASTER];

/// Which of the four down-state channels fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownEvent {
    SDownEnter,
    SDownExit,
    ODownEnter,
    ODownExit,
}

impl DownEvent {
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            SDOWN_ENTER => Some(Self::SDownEnter),
            SDOWN_EXIT => Some(Self::SDownExit),
            ODOWN_ENTER => Some(Self::ODownEnter),
            ODOWN_EXIT => Some(Self::ODownExit),
            _ => None,
        }
    }

    pub fn channel_name(&self) -> &'static str {
        match self {
            Self::SDownEnter => SDOWN_ENTER,
            Self::SDownExit => SDOWN_EXIT,
            Self::ODownEnter => ODOWN_ENTER,
            Self::ODownExit => ODOWN_EXIT,
        }
    }

    /// `true` for the `+` (entering down state) channels
    pub fn is_down(&self) -> bool {
        matches!(self, Self::SDownEnter | Self::ODownEnter)
    }

    /// `true` for the objective (odown) channels
    pub fn is_objective(&self) -> bool {
        matches!(self, Self::ODownEnter | Self::ODownExit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    Master,
    Slave,
    Sentinel,
}

impl InstanceType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "master" => Some(Self::Master),
            "slave" | "replica" => Some(Self::Slave),
            "sentinel" => Some(Self::Sentinel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelEvent {
    MasterSwitched {
        master_name: String,
        old: Endpoint,
        new: Endpoint,
    },
    InstanceStateChanged {
        event: DownEvent,
        instance_type: InstanceType,
        /// Name of the master this instance belongs to
        master_name: String,
        endpoint: Endpoint,
    },
}

impl SentinelEvent {
    pub fn master_name(&self) -> &str {
        match self {
            Self::MasterSwitched { master_name, .. } => master_name,
            Self::InstanceStateChanged { master_name, .. } => master_name,
        }
    }
}

/// Decode a message received on one of `TOPICS`. Malformed payloads and
/// unknown channels yield `None`.
pub fn parse_notification(channel: &str, data: &str) -> Option<SentinelEvent> {
    let tokens: Vec<&str> = data.split_whitespace().collect();

    if channel == SWITCH_MASTER {
        if tokens.len() < 5 {
            return None;
        }
        return Some(SentinelEvent::MasterSwitched {
            master_name: tokens[0].to_string(),
            old: Endpoint::from_parts(tokens[1], tokens[2])?,
            new: Endpoint::from_parts(tokens[3], tokens[4])?,
        });
    }

    let event = DownEvent::from_channel(channel)?;
    if tokens.len() < 4 {
        return None;
    }
    let instance_type = InstanceType::parse(tokens[0])?;
    let endpoint = Endpoint::from_parts(tokens[2], tokens[3])?;
    let master_name = match instance_type {
        InstanceType::Master => tokens[1],
        // `... @ <master-name> <master-ip> <master-port>`
        _ => match tokens.get(4..6) {
            Some(["@", name]) => *name,
            _ => "",
        },
    };

    Some(SentinelEvent::InstanceStateChanged {
        event,
        instance_type,
        master_name: master_name.to_string(),
        endpoint,
    })
}
