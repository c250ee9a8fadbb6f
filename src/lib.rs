#![allow(clippy::type_complexity)] // handler aliases over Arc<dyn Fn ..>

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod ha;
pub mod logging;
pub mod protocol;

pub use client::{Db, Pipeline, Transaction};
pub use config::HaSettings;
pub use error::{Error, Result};
pub use ha::{Endpoint, NodeInfo, Role, SentinelEvent, SentinelManager, TopologySnapshot};
