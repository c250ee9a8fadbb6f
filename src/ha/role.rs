//! Role discovery: ask a server what it is and who its peers are

use bytes::Bytes;

use super::endpoint::{Endpoint, Role};
use crate::client::Connection;
use crate::error::{Error, Result};
use crate::protocol::RespValue;

/// A master as reported by a sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredMaster {
    pub name: String,
    /// `Endpoint::EMPTY` until the address is known
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleInfo {
    Master {
        replicas: Vec<Endpoint>,
    },
    Slave {
        master: Option<Endpoint>,
    },
    Sentinel {
        masters: Vec<MonitoredMaster>,
        sentinels: Vec<Endpoint>,
    },
    Undefined,
}

impl RoleInfo {
    pub fn role(&self) -> Role {
        match self {
            RoleInfo::Master { .. } => Role::Master,
            RoleInfo::Slave { .. } => Role::Slave,
            RoleInfo::Sentinel { .. } => Role::Sentinel,
            RoleInfo::Undefined => Role::Undefined,
        }
    }

    /// Endpoints to visit next during discovery
    pub fn siblings(&self) -> Vec<Endpoint> {
        match self {
            RoleInfo::Master { replicas } => replicas.clone(),
            RoleInfo::Slave { master } => master.iter().cloned().collect(),
            RoleInfo::Sentinel { masters, sentinels } => masters
                .iter()
                .map(|m| m.endpoint.clone())
                .filter(|ep| !ep.is_empty())
                .chain(sentinels.iter().cloned())
                .collect(),
            RoleInfo::Undefined => Vec::new(),
        }
    }
}

/// Query `conn` for its role and peers. `ROLE` is tried first, `INFO` is
/// the fallback. For sentinels the monitored masters are filtered by
/// `master_name` when one is configured.
pub async fn discover_role(
    conn: &mut dyn Connection,
    master_name: Option<&str>,
) -> Result<RoleInfo> {
    let role_reply = conn.execute(&[Bytes::from_static(b"ROLE")]).await?;
    let info = match parse_role_reply(&role_reply) {
        Some(info) => info,
        None => {
            log::debug!(
                "ROLE not usable on {}, falling back to INFO",
                conn.endpoint()
            );
            let reply = conn.execute(&[Bytes::from_static(b"INFO")]).await?;
            let text = match &reply {
                RespValue::BulkString(b) | RespValue::SimpleString(b) => {
                    String::from_utf8_lossy(b).into_owned()
                }
                RespValue::Error(e) => {
                    return Err(Error::Server(String::from_utf8_lossy(e).into_owned()));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected INFO reply type {}",
                        other.type_name()
                    )));
                }
            };
            parse_info_reply(&text)
        }
    };

    match info {
        RoleInfo::Sentinel { masters, .. } => resolve_sentinel(conn, masters, master_name).await,
        other => Ok(other),
    }
}

async fn resolve_sentinel(
    conn: &mut dyn Connection,
    known: Vec<MonitoredMaster>,
    master_name: Option<&str>,
) -> Result<RoleInfo> {
    let masters_reply = conn
        .execute(&[Bytes::from_static(b"SENTINEL"), Bytes::from_static(b"MASTERS")])
        .await?;
    let mut masters = match parse_sentinel_masters(&masters_reply) {
        Some(masters) => masters,
        None => known,
    };

    match master_name {
        Some(name) => masters.retain(|m| m.name == name),
        None if masters.len() > 1 => log::warn!(
            "Sentinel {} monitors {} masters and no master name is configured; using all of them",
            conn.endpoint(),
            masters.len()
        ),
        None => {}
    }

    let mut sentinels = Vec::new();
    for master in &masters {
        let reply = conn
            .execute(&[
                Bytes::from_static(b"SENTINEL"),
                Bytes::from_static(b"SENTINELS"),
                Bytes::copy_from_slice(master.name.as_bytes()),
            ])
            .await?;
        for ep in parse_instance_list(&reply) {
            if !sentinels.contains(&ep) {
                sentinels.push(ep);
            }
        }
    }

    masters.retain(|m| !m.endpoint.is_empty());
    Ok(RoleInfo::Sentinel { masters, sentinels })
}

fn bulk_str(value: &RespValue) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

/// Parse a `ROLE` reply; `None` if it is an error or malformed
pub fn parse_role_reply(reply: &RespValue) -> Option<RoleInfo> {
    let items = reply.as_array()?;
    let role = items.first()?.as_str()?;
    match Role::parse(role) {
        Role::Master => {
            // master <offset> [[ip, port, offset], ...]
            let replicas = items
                .get(2)
                .and_then(|r| r.as_array())
                .unwrap_or_default()
                .iter()
                .filter_map(|r| {
                    let r = r.as_array()?;
                    Endpoint::from_parts(r.first()?.as_str()?, &port_text(r.get(1)?)?)
                })
                .collect();
            Some(RoleInfo::Master { replicas })
        }
        Role::Slave => {
            // slave <master-ip> <master-port> <state> <offset>
            let master = match (items.get(1), items.get(2)) {
                (Some(ip), Some(port)) => {
                    Endpoint::from_parts(ip.as_str()?, &port_text(port)?)
                }
                _ => None,
            };
            Some(RoleInfo::Slave { master })
        }
        Role::Sentinel => {
            // sentinel [master-name, ...]
            let masters = items
                .get(1)
                .and_then(|m| m.as_array())
                .unwrap_or_default()
                .iter()
                .filter_map(bulk_str)
                .map(|name| MonitoredMaster {
                    name,
                    endpoint: Endpoint::EMPTY,
                })
                .collect();
            Some(RoleInfo::Sentinel {
                masters,
                sentinels: Vec::new(),
            })
        }
        _ => None,
    }
}

/// Ports come back as bulk strings from real servers, integers from some
/// proxies
fn port_text(value: &RespValue) -> Option<String> {
    match value {
        RespValue::Integer(n) => Some(n.to_string()),
        other => bulk_str(other),
    }
}

/// Parse a field from INFO output
fn parse_info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        line.strip_prefix(field)
            .and_then(|value| value.strip_prefix(':'))
            .map(str::trim)
    })
}

/// Parse `slaveN:ip=..,port=..,state=..` lines
fn parse_slave_info(slave_info: &str) -> Option<Endpoint> {
    let mut ip = None;
    let mut port = None;

    for part in slave_info.split(',') {
        if let Some(value) = part.strip_prefix("ip=") {
            ip = Some(value);
        } else if let Some(value) = part.strip_prefix("port=") {
            port = Some(value);
        }
    }

    Endpoint::from_parts(ip?, port?)
}

/// Parse `masterN:name=..,status=..,address=ip:port,...` lines
fn parse_sentinel_master_info(master_info: &str) -> Option<MonitoredMaster> {
    let mut name = None;
    let mut endpoint = Endpoint::EMPTY;

    for part in master_info.split(',') {
        if let Some(value) = part.strip_prefix("name=") {
            name = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("address=") {
            endpoint = value.parse().unwrap_or(Endpoint::EMPTY);
        }
    }

    Some(MonitoredMaster {
        name: name?,
        endpoint,
    })
}

/// Classify a server from its `INFO` text
pub fn parse_info_reply(info: &str) -> RoleInfo {
    if parse_info_field(info, "redis_mode") == Some("sentinel") {
        let masters = info
            .lines()
            .filter(|line| line.starts_with("master") && !line.starts_with("master_"))
            .filter_map(|line| line.split_once(':'))
            .filter(|(key, _)| key[6..].chars().all(|c| c.is_ascii_digit()))
            .filter_map(|(_, value)| parse_sentinel_master_info(value.trim()))
            .collect();
        return RoleInfo::Sentinel {
            masters,
            sentinels: Vec::new(),
        };
    }

    match parse_info_field(info, "role").map(Role::parse) {
        Some(Role::Master) => {
            let replicas = info
                .lines()
                .filter_map(|line| line.split_once(':'))
                .filter(|(key, _)| {
                    key.strip_prefix("slave")
                        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                })
                .filter_map(|(_, value)| parse_slave_info(value.trim()))
                .collect();
            RoleInfo::Master { replicas }
        }
        Some(Role::Slave) => {
            let master = match (
                parse_info_field(info, "master_host"),
                parse_info_field(info, "master_port"),
            ) {
                (Some(host), Some(port)) => Endpoint::from_parts(host, port),
                _ => None,
            };
            RoleInfo::Slave { master }
        }
        _ => RoleInfo::Undefined,
    }
}

/// Flat `[key, value, key, value, ...]` array into a lookup function
fn field<'a>(flat: &'a [RespValue], key: &str) -> Option<&'a str> {
    flat.chunks_exact(2)
        .find(|pair| pair[0].as_str() == Some(key))
        .and_then(|pair| pair[1].as_str())
}

/// Parse `SENTINEL MASTERS`; `None` on an error reply
fn parse_sentinel_masters(reply: &RespValue) -> Option<Vec<MonitoredMaster>> {
    let entries = reply.as_array()?;
    Some(
        entries
            .iter()
            .filter_map(|entry| {
                let flat = entry.as_array()?;
                let name = field(flat, "name")?;
                let endpoint = Endpoint::from_parts(field(flat, "ip")?, field(flat, "port")?)
                    .unwrap_or(Endpoint::EMPTY);
                Some(MonitoredMaster {
                    name: name.to_string(),
                    endpoint,
                })
            })
            .collect(),
    )
}

/// Parse `SENTINEL SENTINELS <name>` / `SENTINEL REPLICAS <name>`
fn parse_instance_list(reply: &RespValue) -> Vec<Endpoint> {
    reply
        .as_array()
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| {
            let flat = entry.as_array()?;
            Endpoint::from_parts(field(flat, "ip")?, field(flat, "port")?)
        })
        .collect()
}
