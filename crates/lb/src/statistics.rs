//! Choose by statistics: pick the server with the best long-term record.
//!
//! Latency and failure counts are kept in the persistence store, so they
//! survive restarts. A choice is kept for `choice_kept_secs` before TCP
//! callers trigger a re-evaluation.

use std::{
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use waypoint_config::Server;
use waypoint_store::StoreGuard;

use crate::{
    CallerType, Feedback, Lifecycle, SelectError, Selection, ServerSource, SharedServer, Strategy,
    managed::ManagedStrategy,
};

pub const STATISTICS_ID: &str = "com.shadowsocks.strategy.scbs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatisticsConfig {
    pub choice_kept_secs: u64,
    /// Cost multiplier per unit of failure ratio.
    pub failure_weight: f64,
    /// Decay applied when a latency sample is below the running average.
    pub ewma_alpha: f64,
    /// Latency assumed for servers never measured.
    pub unknown_latency_ms: f64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            choice_kept_secs: 600,
            failure_weight: 10.0,
            ewma_alpha: 0.5,
            unknown_latency_ms: 200.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerStatistics {
    pub latency_ms: Option<f64>,
    pub attempts: u64,
    pub failures: u64,
}

impl ServerStatistics {
    /// Peak EWMA: a sample above the average replaces it, a lower one pulls
    /// the average down gradually.
    pub fn observe_latency(&mut self, sample_ms: f64, alpha: f64) {
        self.latency_ms = Some(match self.latency_ms {
            Some(current) if sample_ms <= current => {
                sample_ms * (1.0 - alpha) + current * alpha
            }
            _ => sample_ms,
        });
    }

    pub fn failure_ratio(&self) -> f64 {
        (self.failures as f64 / self.attempts.max(1) as f64).min(1.0)
    }

    /// Lower is better.
    pub fn cost(&self, config: &StatisticsConfig) -> f64 {
        self.latency_ms.unwrap_or(config.unknown_latency_ms)
            * (1.0 + config.failure_weight * self.failure_ratio())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Choice {
    pub server: Option<SharedServer>,
    pub chosen_at: Option<Instant>,
}

pub struct StatisticsStrategy {
    base: ManagedStrategy<StatisticsConfig, ServerStatistics, (), (), Choice>,
}

impl StatisticsStrategy {
    pub fn new(dir: &Path, source: Arc<dyn ServerSource>) -> Self {
        Self {
            base: ManagedStrategy::new(STATISTICS_ID, dir, source),
        }
    }

    pub fn base(&self) -> &ManagedStrategy<StatisticsConfig, ServerStatistics, (), (), Choice> {
        &self.base
    }

    pub fn update_config(&self, f: impl FnOnce(&mut StatisticsConfig)) {
        self.base.update_config(f);
    }

    pub fn statistics(&self, server: &Server) -> Option<ServerStatistics> {
        self.base
            .persistence()
            .acquire()
            .get(&server.identifier())
            .cloned()
    }

    pub fn current(&self) -> Option<SharedServer> {
        self.base.memory().acquire().global().server.clone()
    }

    fn cheapest(
        servers: &[SharedServer],
        persistence: &StoreGuard<'_, (), ServerStatistics>,
        config: &StatisticsConfig,
    ) -> Option<SharedServer> {
        let mut best: Option<(&SharedServer, f64)> = None;
        for server in servers {
            let Some(stats) = persistence.get(&server.identifier()) else {
                continue;
            };
            let cost = stats.cost(config);
            debug!("server: {} cost: {}", server.friendly_name(), cost);

            match best {
                Some((_, min)) if cost >= min => {}
                _ => best = Some((server, cost)),
            }
        }
        best.map(|(server, _)| server.clone())
    }
}

impl Selection for StatisticsStrategy {
    fn get_a_server(
        &self,
        caller: CallerType,
        _local: SocketAddr,
        _dest: Option<&str>,
    ) -> Result<SharedServer, SelectError> {
        let config = self.base.config().get();
        let servers = self.base.servers();
        let now = Instant::now();

        let mut persistence = self.base.persistence().acquire();
        let mut memory = self.base.memory().acquire();
        let choice = memory.global_mut();

        let expired = match (&choice.server, choice.chosen_at) {
            (Some(current), Some(at)) => {
                !servers
                    .iter()
                    .any(|server| server.identifier() == current.identifier())
                    || (caller == CallerType::Tcp
                        && now.duration_since(at) >= Duration::from_secs(config.choice_kept_secs))
            }
            _ => true,
        };

        if expired {
            let next = Self::cheapest(&servers, &persistence, &config);
            let changed = match (&choice.server, &next) {
                (Some(old), Some(new)) => old.identifier() != new.identifier(),
                (None, None) => false,
                _ => true,
            };
            if changed {
                if let Some(server) = &next {
                    info!("Statistics strategy switching to server: {}", server.friendly_name());
                }
            }
            choice.server = next;
            choice.chosen_at = Some(now);
        }

        let server = choice.server.clone().ok_or(SelectError::NoServerAvailable)?;

        if caller == CallerType::Tcp {
            if let Some(stats) = persistence.get_mut(&server.identifier()) {
                stats.attempts += 1;
            }
        }

        Ok(server)
    }
}

impl Feedback for StatisticsStrategy {
    fn update_latency(&self, server: &Server, latency: Duration) {
        let alpha = self.base.config().acquire().ewma_alpha;
        let mut persistence = self.base.persistence().acquire();
        if let Some(stats) = persistence.get_mut(&server.identifier()) {
            stats.observe_latency(latency.as_micros() as f64 / 1000.0, alpha);
        }
    }

    fn set_failure(&self, server: &Server) {
        let mut persistence = self.base.persistence().acquire();
        if let Some(stats) = persistence.get_mut(&server.identifier()) {
            stats.failures += 1;
        }
    }
}

impl Lifecycle for StatisticsStrategy {
    fn reload_servers(&self) {
        self.base.reload_servers();

        let mut memory = self.base.memory().acquire();
        let choice = memory.global_mut();
        if let Some(current) = choice.server.take() {
            choice.server = self.base.find_server(&current.identifier());
        }
    }

    fn deactivate(&self) {
        self.base.deactivate();
    }

    fn dispose(&self) {
        self.base.save_persistence();
    }
}

impl Strategy for StatisticsStrategy {
    fn id(&self) -> &'static str {
        STATISTICS_ID
    }

    fn name(&self) -> &'static str {
        "Choose by statistics"
    }
}
