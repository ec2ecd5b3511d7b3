//! Upstream server selection.
//!
//! Every strategy is a [`Strategy`]: it picks a server per connection or
//! datagram ([`Selection`]), absorbs health reports from the relay layer
//! ([`Feedback`]) and follows the activation lifecycle driven by the
//! [`StrategyManager`] ([`Lifecycle`]).

use std::{
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use waypoint_config::Server;

pub mod balancing;
pub mod high_availability;
pub mod managed;
pub mod manager;
pub mod statistics;

pub use balancing::{BALANCING_ID, BalancingConfig, BalancingStrategy};
pub use high_availability::{
    ActiveServer, HIGH_AVAILABILITY_ID, HighAvailabilityStrategy, ServerStatus,
};
pub use managed::{ManagedStrategy, RosterChange};
pub use manager::StrategyManager;
pub use statistics::{STATISTICS_ID, ServerStatistics, StatisticsConfig, StatisticsStrategy};

/// A server shared between the roster snapshot and strategy side tables.
pub type SharedServer = Arc<Server>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerType {
    /// A new connection is about to be opened.
    Tcp,
    /// A datagram is about to be relayed for the given local endpoint.
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    NoServerAvailable,
    NoActiveStrategy,
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::NoServerAvailable => write!(f, "no server available"),
            SelectError::NoActiveStrategy => write!(f, "no strategy is active"),
        }
    }
}

impl std::error::Error for SelectError {}

pub trait Selection {
    fn get_a_server(
        &self,
        caller: CallerType,
        local: SocketAddr,
        dest: Option<&str>,
    ) -> Result<SharedServer, SelectError>;
}

/// Reports from the relay layer. Fire-and-forget: reports about servers a
/// strategy does not track are dropped.
pub trait Feedback {
    fn update_latency(&self, _server: &Server, _latency: Duration) {}

    fn update_last_read(&self, _server: &Server) {}

    fn update_last_write(&self, _server: &Server) {}

    fn set_failure(&self, _server: &Server) {}
}

pub trait Lifecycle {
    /// Re-reads the server list from the configuration and reconciles state.
    fn reload_servers(&self);

    fn activate(&self) {}

    /// Called once when the strategy stops being the current one.
    fn deactivate(&self);

    fn dispose(&self) {}
}

pub trait Strategy: Selection + Feedback + Lifecycle + Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;
}

/// The configuration collaborator: where the live server list comes from.
pub trait ServerSource: Send + Sync {
    fn current_servers(&self) -> Vec<Server>;
}

/// A replaceable in-memory server list.
#[derive(Debug, Default)]
pub struct ServerList {
    servers: RwLock<Vec<Server>>,
}

impl ServerList {
    pub fn new(servers: Vec<Server>) -> Self {
        Self {
            servers: RwLock::new(servers),
        }
    }

    pub fn replace(&self, servers: Vec<Server>) {
        *self.servers.write().unwrap_or_else(PoisonError::into_inner) = servers;
    }
}

impl ServerSource for ServerList {
    fn current_servers(&self) -> Vec<Server> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) fn hash64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
