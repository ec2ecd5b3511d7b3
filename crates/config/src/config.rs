use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::default::{
    get_default_log, get_default_log_file, get_default_log_level, get_default_method,
    get_default_server_port, get_default_strategy_dir, get_default_timeout, get_default_traffic,
    get_default_traffic_window,
};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub version: u32,

    // strategy id, empty = no strategy
    #[serde(default)]
    pub strategy: String,

    #[serde(default = "get_default_strategy_dir")]
    pub strategy_dir: String,

    #[serde(default)]
    pub servers: Vec<Server>,

    #[serde(default = "get_default_traffic")]
    pub traffic: Traffic,

    #[serde(default = "get_default_log")]
    pub log: Log,
}

/// One upstream proxy endpoint.
///
/// Two servers are the same upstream when their [`Server::identifier`] matches;
/// the remaining fields are carried for the relay layer.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct Server {
    pub server: String,

    #[serde(default = "get_default_server_port")]
    pub server_port: u16,

    #[serde(default)]
    pub password: String,

    #[serde(default = "get_default_method")]
    pub method: String,

    #[serde(default)]
    pub remarks: String,

    #[serde(default)]
    pub plugin: String,

    #[serde(default)]
    pub plugin_opts: String,

    #[serde(default = "get_default_timeout")]
    pub timeout: u32, // seconds
}

impl Server {
    pub fn new(server: impl Into<String>, server_port: u16) -> Self {
        Self {
            server: server.into(),
            server_port,
            method: get_default_method(),
            timeout: get_default_timeout(),
            ..Default::default()
        }
    }

    /// Stable key used by every per-server side table.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.server, self.server_port)
    }

    pub fn friendly_name(&self) -> String {
        let address = if self.server.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.server, self.server_port)
        } else {
            format!("{}:{}", self.server, self.server_port)
        };

        if self.remarks.trim().is_empty() {
            address
        } else {
            format!("{} ({})", self.remarks, address)
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Traffic {
    #[serde(default = "get_default_traffic_window")]
    pub window: usize, // samples kept, one per second
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Log {
    #[serde(default = "get_default_log_level")]
    pub level: String, // "trace, debug, info, warn, error, off"

    #[serde(default)]
    pub enabled: bool, // write to `file` instead of stderr

    #[serde(default = "get_default_log_file")]
    pub file: String,
}
