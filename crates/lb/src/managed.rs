//! Shared plumbing for strategies that keep per-server state.
//!
//! A [`ManagedStrategy`] owns three independently locked pieces of state:
//!
//! * the strategy config, saved to `<id>.config.json`,
//! * the persistence store (global + per-server values), saved to
//!   `<id>.persist.json`,
//! * the memory store, never written to disk.
//!
//! Code that needs both stores must take the persistence section before the
//! memory section. Nothing in this crate takes them in the other order.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use log::{debug, error, info};
use serde::{Serialize, de::DeserializeOwned};
use waypoint_store::{PersistentKeyedStore, PersistentValue};

use crate::{ServerSource, SharedServer};

/// Identifiers that entered and left the roster in one reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RosterChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct ManagedStrategy<C, P, M, GP = (), GM = ()> {
    id: &'static str,
    source: Arc<dyn ServerSource>,
    config: PersistentValue<C>,
    persistence: PersistentKeyedStore<GP, P>,
    memory: PersistentKeyedStore<GM, M>,
    servers: ArcSwap<Vec<SharedServer>>,
    config_path: PathBuf,
    persist_path: PathBuf,
}

impl<C, P, M, GP, GM> ManagedStrategy<C, P, M, GP, GM>
where
    C: Serialize + DeserializeOwned + Default,
    P: Serialize + DeserializeOwned + Default,
    M: Default,
    GP: Serialize + DeserializeOwned + Default,
    GM: Default,
{
    /// Loads config and persisted state for `id` from `dir`. The roster starts
    /// empty until the first [`ManagedStrategy::reload_servers`].
    pub fn new(id: &'static str, dir: &Path, source: Arc<dyn ServerSource>) -> Self {
        let config_path = dir.join(format!("{id}.config.json"));
        let persist_path = dir.join(format!("{id}.persist.json"));

        Self {
            id,
            source,
            config: PersistentValue::open(&config_path),
            persistence: PersistentKeyedStore::open(&persist_path),
            memory: PersistentKeyedStore::new(),
            servers: ArcSwap::from_pointee(Vec::new()),
            config_path,
            persist_path,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    /// The current roster snapshot. Never mutated in place.
    pub fn servers(&self) -> Arc<Vec<SharedServer>> {
        self.servers.load_full()
    }

    /// Looks a server up in the current roster by identifier.
    pub fn find_server(&self, id: &str) -> Option<SharedServer> {
        self.servers
            .load()
            .iter()
            .find(|server| server.identifier() == id)
            .cloned()
    }

    pub fn config(&self) -> &PersistentValue<C> {
        &self.config
    }

    pub fn persistence(&self) -> &PersistentKeyedStore<GP, P> {
        &self.persistence
    }

    pub fn memory(&self) -> &PersistentKeyedStore<GM, M> {
        &self.memory
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn persist_path(&self) -> &Path {
        &self.persist_path
    }

    /// Reconciles both stores with the live server list and publishes the new
    /// roster.
    ///
    /// Entries of servers that stay keep their state; new servers get default
    /// entries; every other entry is dropped, including stale ones loaded from
    /// disk. The whole reload runs inside the persistence section so
    /// concurrent reloads apply in order.
    pub fn reload_servers(&self) -> RosterChange {
        let mut persistence = self.persistence.acquire();

        let servers: Vec<SharedServer> = self
            .source
            .current_servers()
            .into_iter()
            .map(Arc::new)
            .collect();

        let wanted: HashSet<String> = servers.iter().map(|server| server.identifier()).collect();
        let previous: HashSet<String> = self
            .servers
            .load()
            .iter()
            .map(|server| server.identifier())
            .collect();

        let mut change = RosterChange {
            added: wanted.difference(&previous).cloned().collect(),
            removed: previous.difference(&wanted).cloned().collect(),
        };
        change.added.sort();
        change.removed.sort();

        {
            let mut memory = self.memory.acquire();

            persistence.retain(|id, _| wanted.contains(id));
            memory.retain(|id, _| wanted.contains(id));

            for id in &wanted {
                persistence.ensure(id);
                memory.ensure(id);
            }
        }

        if let Err(err) = persistence.save(&self.persist_path) {
            error!("[{}] Failed to save persisted state: {}", self.id, err);
        }

        self.servers.store(Arc::new(servers));
        drop(persistence);

        if change.is_empty() {
            debug!("[{}] Server list unchanged ({} servers)", self.id, wanted.len());
        } else {
            info!(
                "[{}] Server list reloaded: {} added, {} removed, {} total",
                self.id,
                change.added.len(),
                change.removed.len(),
                wanted.len()
            );
        }

        change
    }

    /// Flushes persisted state and config.
    pub fn deactivate(&self) {
        self.save_persistence();
        self.save_config();
    }

    pub fn save_persistence(&self) {
        if let Err(err) = self.persistence.save(&self.persist_path) {
            error!("[{}] Failed to save persisted state: {}", self.id, err);
        }
    }

    pub fn save_config(&self) {
        if let Err(err) = self.config.save(&self.config_path) {
            error!("[{}] Failed to save config: {}", self.id, err);
        }
    }

    /// Mutates the config inside its section and writes it out before leaving.
    pub fn update_config<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let mut config = self.config.acquire();
        let result = f(&mut config);
        if let Err(err) = config.save(&self.config_path) {
            error!("[{}] Failed to save config: {}", self.id, err);
        }
        result
    }
}
