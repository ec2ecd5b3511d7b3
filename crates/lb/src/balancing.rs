// Load balancing strategy: spread connections, pin datagram sources
use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::Arc,
};

use log::{debug, error, info};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    CallerType, Feedback, Lifecycle, SelectError, Selection, ServerSource, SharedServer, Strategy,
    hash64, managed::ManagedStrategy,
};

pub const BALANCING_ID: &str = "com.shadowsocks.strategy.balancing";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancingConfig {
    // read by the relay layer, not by selection
    #[serde(rename = "sameServer", default)]
    pub same_server: bool,
}

pub struct BalancingStrategy {
    base: ManagedStrategy<BalancingConfig, (), ()>,
}

impl BalancingStrategy {
    pub fn new(dir: &Path, source: Arc<dyn ServerSource>) -> Self {
        Self {
            base: ManagedStrategy::new(BALANCING_ID, dir, source),
        }
    }

    pub fn base(&self) -> &ManagedStrategy<BalancingConfig, (), ()> {
        &self.base
    }

    pub fn same_server(&self) -> bool {
        self.base.config().acquire().same_server
    }

    /// Flips `same_server`, saves the config and returns the new value.
    pub fn toggle_same_server(&self) -> bool {
        let value = self.base.update_config(|config| {
            config.same_server = !config.same_server;
            config.same_server
        });
        info!("Same server for same site: {}", value);
        value
    }
}

impl Selection for BalancingStrategy {
    fn get_a_server(
        &self,
        caller: CallerType,
        local: SocketAddr,
        _dest: Option<&str>,
    ) -> Result<SharedServer, SelectError> {
        let servers = self.base.servers();
        if servers.is_empty() {
            error!("No server available");
            return Err(SelectError::NoServerAvailable);
        }

        let index = match caller {
            CallerType::Tcp => rand::thread_rng().gen_range(0..servers.len()),
            CallerType::Udp => (hash64(&endpoint_key(local)) % servers.len() as u64) as usize,
        };

        let server = servers[index].clone();
        debug!("Selected server: {}", server.friendly_name());
        Ok(server)
    }
}

impl Feedback for BalancingStrategy {}

impl Lifecycle for BalancingStrategy {
    fn reload_servers(&self) {
        self.base.reload_servers();
    }

    fn deactivate(&self) {
        self.base.deactivate();
    }
}

impl Strategy for BalancingStrategy {
    fn id(&self) -> &'static str {
        BALANCING_ID
    }

    fn name(&self) -> &'static str {
        "Load Balance"
    }
}

fn endpoint_key(endpoint: SocketAddr) -> Vec<u8> {
    let mut key = match endpoint.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    key.extend_from_slice(&endpoint.port().to_be_bytes());
    key
}
