//! Registry of every strategy and the one currently in use.
//!
//! Lifecycle: [`StrategyManager::new`] builds one instance of each strategy
//! (balancing, high availability, statistics), [`StrategyManager::shutdown`]
//! deactivates the current one, disposes all of them and empties the registry.
//! Nothing is global; the host owns the manager.

use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use log::{debug, info};

use crate::{
    BalancingStrategy, CallerType, HighAvailabilityStrategy, SelectError, ServerSource,
    SharedServer, StatisticsStrategy, Strategy,
};

struct Registry {
    balancing: Arc<BalancingStrategy>,
    high_availability: Arc<HighAvailabilityStrategy>,
    statistics: Arc<StatisticsStrategy>,
    all: Vec<Arc<dyn Strategy>>,
}

pub struct StrategyManager {
    registry: RwLock<Option<Registry>>,
    current: RwLock<Option<Arc<dyn Strategy>>>,
    switching: Mutex<()>,
}

impl StrategyManager {
    /// Builds every strategy, loading their files from `dir`.
    pub fn new(source: Arc<dyn ServerSource>, dir: &Path) -> Self {
        let balancing = Arc::new(BalancingStrategy::new(dir, source.clone()));
        let high_availability = Arc::new(HighAvailabilityStrategy::new(dir, source.clone()));
        let statistics = Arc::new(StatisticsStrategy::new(dir, source));

        let all: Vec<Arc<dyn Strategy>> = vec![
            balancing.clone(),
            high_availability.clone(),
            statistics.clone(),
        ];

        info!("Strategy manager initialized with {} strategies", all.len());

        Self {
            registry: RwLock::new(Some(Registry {
                balancing,
                high_availability,
                statistics,
                all,
            })),
            current: RwLock::new(None),
            switching: Mutex::new(()),
        }
    }

    pub fn strategies(&self) -> Vec<Arc<dyn Strategy>> {
        self.registry()
            .as_ref()
            .map(|registry| registry.all.clone())
            .unwrap_or_default()
    }

    pub fn get_strategy(&self, id: &str) -> Option<Arc<dyn Strategy>> {
        self.registry()
            .as_ref()?
            .all
            .iter()
            .find(|strategy| strategy.id() == id)
            .cloned()
    }

    pub fn balancing(&self) -> Option<Arc<BalancingStrategy>> {
        self.registry().as_ref().map(|registry| registry.balancing.clone())
    }

    pub fn high_availability(&self) -> Option<Arc<HighAvailabilityStrategy>> {
        self.registry()
            .as_ref()
            .map(|registry| registry.high_availability.clone())
    }

    pub fn statistics(&self) -> Option<Arc<StatisticsStrategy>> {
        self.registry().as_ref().map(|registry| registry.statistics.clone())
    }

    pub fn current(&self) -> Option<Arc<dyn Strategy>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes `id` the current strategy. An unknown id (or `None`) leaves no
    /// strategy active. The old strategy is fully deactivated before the new
    /// one is activated.
    ///
    /// Switches are serialized by their own lock. `current` is only written
    /// once both flushes are done, so selection keeps using the old strategy
    /// meanwhile instead of waiting on file I/O.
    pub fn set_current_strategy(&self, id: Option<&str>) {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);

        let next = id.and_then(|id| self.get_strategy(id));
        let previous = self.current();

        let unchanged = match (previous.as_ref(), next.as_ref()) {
            (Some(old), Some(new)) => old.id() == new.id(),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(old) = &previous {
            debug!("Deactivating strategy {}", old.id());
            old.deactivate();
        }
        if let Some(new) = &next {
            debug!("Activating strategy {}", new.id());
            new.activate();
        }

        match &next {
            Some(strategy) => info!("Current strategy: {}", strategy.name()),
            None => info!("No strategy active"),
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Reconciles every registered strategy with the live server list.
    pub fn reload_servers(&self) {
        for strategy in self.strategies() {
            strategy.reload_servers();
        }
    }

    /// Routes a selection through the current strategy.
    pub fn get_a_server(
        &self,
        caller: CallerType,
        local: SocketAddr,
        dest: Option<&str>,
    ) -> Result<SharedServer, SelectError> {
        let strategy = self.current().ok_or(SelectError::NoActiveStrategy)?;
        strategy.get_a_server(caller, local, dest)
    }

    pub fn shutdown(&self) {
        self.set_current_strategy(None);

        let registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(registry) = registry {
            for strategy in &registry.all {
                strategy.dispose();
            }
            info!("Strategy manager shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry().is_none()
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Option<Registry>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use waypoint_config::Server;

    use super::*;
    use crate::{BALANCING_ID, HIGH_AVAILABILITY_ID, STATISTICS_ID, ServerList};

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1080))
    }

    fn manager(dir: &Path) -> StrategyManager {
        let list = Arc::new(ServerList::new(vec![
            Server::new("10.0.0.1", 8388),
            Server::new("10.0.0.2", 8388),
        ]));
        let manager = StrategyManager::new(list, dir);
        manager.reload_servers();
        manager
    }

    #[test]
    fn registers_every_strategy_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let ids: Vec<&str> = manager.strategies().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![BALANCING_ID, HIGH_AVAILABILITY_ID, STATISTICS_ID]);
        assert!(manager.get_strategy("com.example.unknown").is_none());
    }

    #[test]
    fn no_current_strategy_until_selected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        assert!(manager.current().is_none());
        assert_eq!(
            manager.get_a_server(CallerType::Tcp, local(), None).unwrap_err(),
            SelectError::NoActiveStrategy
        );

        manager.set_current_strategy(Some(BALANCING_ID));
        assert_eq!(manager.current().unwrap().id(), BALANCING_ID);
        assert!(manager.get_a_server(CallerType::Tcp, local(), None).is_ok());
    }

    #[test]
    fn unknown_id_only_deactivates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let config = dir.path().join(format!("{HIGH_AVAILABILITY_ID}.config.json"));

        manager.set_current_strategy(Some(HIGH_AVAILABILITY_ID));
        assert!(!config.exists());

        manager.set_current_strategy(Some("com.example.unknown"));
        assert!(manager.current().is_none());
        assert!(config.exists());
    }

    #[test]
    fn reselecting_current_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let config = dir.path().join(format!("{BALANCING_ID}.config.json"));

        manager.set_current_strategy(Some(BALANCING_ID));
        assert!(!config.exists());

        manager.set_current_strategy(Some(BALANCING_ID));
        assert!(!config.exists());

        manager.set_current_strategy(None);
        assert!(config.exists());
    }

    #[test]
    fn switch_flushes_without_blocking_readers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let config = dir.path().join(format!("{BALANCING_ID}.config.json"));
        manager.set_current_strategy(Some(BALANCING_ID));

        std::thread::scope(|scope| {
            let reader = manager.current.read().unwrap();
            let switch = scope.spawn(|| manager.set_current_strategy(Some(HIGH_AVAILABILITY_ID)));

            let deadline = Instant::now() + Duration::from_secs(5);
            while !config.exists() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            assert!(config.exists());
            assert_eq!(reader.as_ref().unwrap().id(), BALANCING_ID);

            drop(reader);
            switch.join().unwrap();
        });

        assert_eq!(manager.current().unwrap().id(), HIGH_AVAILABILITY_ID);
    }

    #[test]
    fn shutdown_empties_registry_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.set_current_strategy(Some(STATISTICS_ID));

        manager.shutdown();
        assert!(manager.is_shut_down());
        assert!(manager.current().is_none());
        assert!(manager.strategies().is_empty());
        assert!(manager.balancing().is_none());

        manager.shutdown();
        manager.set_current_strategy(Some(BALANCING_ID));
        assert!(manager.current().is_none());
    }

    #[test]
    fn typed_handles_share_registered_instances() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let balancing = manager.balancing().unwrap();
        balancing.toggle_same_server();
        assert!(manager.balancing().unwrap().same_server());
        assert!(manager.high_availability().is_some());
        assert!(manager.statistics().is_some());
    }
}
