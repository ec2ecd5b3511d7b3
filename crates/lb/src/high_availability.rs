//! High availability: stick to one server and move away when it degrades.
//!
//! Each tracked server carries a [`ServerStatus`] fed by the relay layer. Before
//! every new TCP connection all servers are rescored and the best one becomes
//! active, but only when it beats the active server's score by more than
//! [`SWITCH_MARGIN`]. Datagrams reuse the last decision.

use std::{
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use waypoint_config::Server;

use crate::{
    CallerType, Feedback, Lifecycle, SelectError, Selection, ServerSource, SharedServer, Strategy,
    managed::ManagedStrategy,
};

pub const HIGH_AVAILABILITY_ID: &str = "com.shadowsocks.strategy.ha";

/// Minimum score gain before the active server is replaced.
pub const SWITCH_MARGIN: f64 = 200.0;

const FAILURE_WEIGHT: f64 = 100.0 * 1000.0;
const FAILURE_CAP_SECS: f64 = 300.0;
const LATENCY_WEIGHT: f64 = 10.0;
const LATENCY_CAP_MS: f64 = 2000.0;
const LATENCY_DECAY_SECS: f64 = 300.0;
const IDLE_WEIGHT: f64 = -0.5 * 200.0;
const IDLE_CAP_SECS: f64 = 5.0;

const DEFAULT_LATENCY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HighAvailabilityConfig {}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    /// Time between SYN and SYN+ACK.
    pub latency: Duration,
    pub last_time_detect_latency: Instant,
    /// Last time anything was received.
    pub last_read: Instant,
    /// Last time anything was sent.
    pub last_write: Instant,
    /// Connection refused or closed before anything was received. `None` = never.
    pub last_failure: Option<Instant>,
    /// Result of the last rescoring.
    pub score: f64,
}

impl Default for ServerStatus {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            latency: DEFAULT_LATENCY,
            last_time_detect_latency: now,
            last_read: now,
            last_write: now,
            last_failure: None,
            score: 0.0,
        }
    }
}

impl ServerStatus {
    /// Higher is better. A failure costs the most right after it happens and
    /// its weight fades over five minutes; latency and read/write gaps only
    /// nudge the result.
    pub fn score_at(&self, now: Instant) -> f64 {
        let since_failure = match self.last_failure {
            Some(at) => secs_since(now, at),
            None => f64::INFINITY,
        };
        let failure = FAILURE_WEIGHT * since_failure.min(FAILURE_CAP_SECS);

        let latency_ms = self.latency.as_secs_f64() * 1000.0;
        let latency_decay = latency_ms.min(LATENCY_CAP_MS)
            / (1.0 + secs_since(now, self.last_time_detect_latency) / LATENCY_DECAY_SECS);
        let latency = LATENCY_WEIGHT * latency_decay;

        let idle = IDLE_WEIGHT * secs_between(self.last_read, self.last_write).min(IDLE_CAP_SECS);

        failure - latency + idle
    }
}

/// The active server and its score when it was picked.
#[derive(Debug, Clone, Default)]
pub struct ActiveServer {
    pub server: Option<SharedServer>,
    pub score: f64,
}

pub struct HighAvailabilityStrategy {
    base: ManagedStrategy<HighAvailabilityConfig, (), ServerStatus, (), ActiveServer>,
}

impl HighAvailabilityStrategy {
    pub fn new(dir: &Path, source: Arc<dyn ServerSource>) -> Self {
        Self {
            base: ManagedStrategy::new(HIGH_AVAILABILITY_ID, dir, source),
        }
    }

    pub fn base(
        &self,
    ) -> &ManagedStrategy<HighAvailabilityConfig, (), ServerStatus, (), ActiveServer> {
        &self.base
    }

    pub fn current(&self) -> Option<SharedServer> {
        self.base.memory().acquire().global().server.clone()
    }

    pub fn choose_new_server(&self) {
        self.choose_new_server_at(Instant::now());
    }

    fn choose_new_server_at(&self, now: Instant) {
        let servers = self.base.servers();
        let mut memory = self.base.memory().acquire();

        let mut scored = Vec::with_capacity(servers.len());
        for server in servers.iter() {
            // the roster may briefly list a server whose entry a reload just dropped
            let Some(status) = memory.get_mut(&server.identifier()) else {
                continue;
            };
            status.score = status.score_at(now);
            debug!(
                "server: {} latency: {:?} score: {}",
                server.friendly_name(),
                status.latency,
                status.score
            );
            scored.push((server, status.score));
        }

        let Some(index) = best_index(scored.iter().map(|(_, score)| *score)) else {
            return;
        };
        let (server, score) = scored[index];

        let active = memory.global_mut();
        if !should_switch(active, score) {
            return;
        }

        let changed = active
            .server
            .as_ref()
            .is_none_or(|current| current.identifier() != server.identifier());
        active.server = Some(server.clone());
        active.score = score;

        if changed {
            info!("HA switching to server: {}", server.friendly_name());
        } else {
            debug!("HA rescored server: {} score: {}", server.friendly_name(), score);
        }
    }

    fn with_status(&self, server: &Server, update: impl FnOnce(&mut ServerStatus)) {
        let mut memory = self.base.memory().acquire();
        if let Some(status) = memory.get_mut(&server.identifier()) {
            update(status);
        }
    }
}

impl Selection for HighAvailabilityStrategy {
    /// Fails with `NoServerAvailable` whenever no server is active. That covers
    /// an empty roster that never had a pick, and also one emptied by a reload,
    /// which drops the previous pick.
    fn get_a_server(
        &self,
        caller: CallerType,
        _local: SocketAddr,
        _dest: Option<&str>,
    ) -> Result<SharedServer, SelectError> {
        if caller == CallerType::Tcp {
            self.choose_new_server();
        }

        self.current().ok_or(SelectError::NoServerAvailable)
    }
}

impl Feedback for HighAvailabilityStrategy {
    fn update_latency(&self, server: &Server, latency: Duration) {
        debug!("latency: {} {:?}", server.friendly_name(), latency);
        self.with_status(server, |status| {
            status.latency = latency;
            status.last_time_detect_latency = Instant::now();
        });
    }

    fn update_last_read(&self, server: &Server) {
        debug!("last read: {}", server.friendly_name());
        self.with_status(server, |status| status.last_read = Instant::now());
    }

    fn update_last_write(&self, server: &Server) {
        debug!("last write: {}", server.friendly_name());
        self.with_status(server, |status| status.last_write = Instant::now());
    }

    fn set_failure(&self, server: &Server) {
        debug!("failure: {}", server.friendly_name());
        self.with_status(server, |status| status.last_failure = Some(Instant::now()));
    }
}

impl Lifecycle for HighAvailabilityStrategy {
    fn reload_servers(&self) {
        self.base.reload_servers();

        {
            let mut memory = self.base.memory().acquire();
            let active = memory.global_mut();
            if let Some(current) = active.server.take() {
                match self.base.find_server(&current.identifier()) {
                    // keep the entry but pick up edited fields
                    Some(fresh) => active.server = Some(fresh),
                    None => {
                        info!("HA server removed: {}", current.friendly_name());
                        active.score = 0.0;
                    }
                }
            }
        }

        self.choose_new_server();
    }

    fn deactivate(&self) {
        self.base.deactivate();
    }
}

impl Strategy for HighAvailabilityStrategy {
    fn id(&self) -> &'static str {
        HIGH_AVAILABILITY_ID
    }

    fn name(&self) -> &'static str {
        "High Availability"
    }
}

fn secs_since(now: Instant, then: Instant) -> f64 {
    now.saturating_duration_since(then).as_secs_f64()
}

/// Signed `a - b` in seconds.
fn secs_between(a: Instant, b: Instant) -> f64 {
    if a >= b {
        (a - b).as_secs_f64()
    } else {
        -(b - a).as_secs_f64()
    }
}

/// Index of the maximum; among equal scores the last one wins.
fn best_index(scores: impl Iterator<Item = f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, score) in scores.enumerate() {
        match best {
            Some((_, max)) if score < max => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

fn should_switch(active: &ActiveServer, candidate: f64) -> bool {
    active.server.is_none() || candidate - active.score > SWITCH_MARGIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerList;

    const EPSILON: f64 = 1e-6;

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1080))
    }

    fn status_at(base: Instant) -> ServerStatus {
        ServerStatus {
            latency: DEFAULT_LATENCY,
            last_time_detect_latency: base,
            last_read: base,
            last_write: base,
            last_failure: None,
            score: 0.0,
        }
    }

    fn strategy(dir: &Path, hosts: &[&str]) -> (HighAvailabilityStrategy, Arc<ServerList>) {
        let list = Arc::new(ServerList::new(
            hosts.iter().map(|host| Server::new(*host, 8388)).collect(),
        ));
        let strategy = HighAvailabilityStrategy::new(dir, list.clone());
        strategy.reload_servers();
        (strategy, list)
    }

    #[test]
    fn default_status() {
        let status = ServerStatus::default();
        assert_eq!(status.latency, Duration::from_millis(10));
        assert!(status.last_failure.is_none());
        assert_eq!(status.last_read, status.last_write);
    }

    #[test]
    fn never_failed_server_gets_full_failure_credit() {
        let base = Instant::now();
        let status = status_at(base);
        // 100 * 1000 * 300 - 10 * 10
        assert!((status.score_at(base) - 29_999_900.0).abs() < EPSILON);
    }

    #[test]
    fn recent_failure_scores_lower() {
        let base = Instant::now();
        let now = base + Duration::from_secs(600);

        let mut just_failed = status_at(now);
        just_failed.last_failure = Some(now);

        let mut failed_long_ago = status_at(now);
        failed_long_ago.last_failure = Some(base);

        assert!(just_failed.score_at(now) < failed_long_ago.score_at(now));
        assert!((failed_long_ago.score_at(now) - just_failed.score_at(now) - 30_000_000.0).abs() < EPSILON);
    }

    #[test]
    fn failure_credit_recovers_linearly_up_to_five_minutes() {
        let base = Instant::now();
        let mut status = status_at(base);
        status.last_failure = Some(base);
        status.latency = Duration::ZERO;

        assert!((status.score_at(base + Duration::from_secs(60)) - 6_000_000.0).abs() < EPSILON);
        assert!((status.score_at(base + Duration::from_secs(300)) - 30_000_000.0).abs() < EPSILON);
        assert!((status.score_at(base + Duration::from_secs(900)) - 30_000_000.0).abs() < EPSILON);
    }

    #[test]
    fn latency_term_is_capped_and_decays() {
        let base = Instant::now();
        let mut status = status_at(base);
        status.last_failure = Some(base);

        status.latency = Duration::from_millis(1000);
        assert!((status.score_at(base) + 10_000.0).abs() < EPSILON);

        status.latency = Duration::from_millis(5000);
        assert!((status.score_at(base) + 20_000.0).abs() < EPSILON);

        // 300 s later the latency term is halved, the failure term is capped
        status.latency = Duration::from_millis(1000);
        let later = base + Duration::from_secs(300);
        assert!((status.score_at(later) - (30_000_000.0 - 5_000.0)).abs() < EPSILON);
    }

    #[test]
    fn idle_term_uses_signed_read_write_gap() {
        let base = Instant::now();
        let mut status = status_at(base);
        status.latency = Duration::ZERO;
        let full = 30_000_000.0;

        status.last_read = base + Duration::from_secs(3);
        assert!((status.score_at(base) - (full - 300.0)).abs() < EPSILON);

        status.last_read = base + Duration::from_secs(60);
        assert!((status.score_at(base) - (full - 500.0)).abs() < EPSILON);

        status.last_read = base;
        status.last_write = base + Duration::from_secs(2);
        assert!((status.score_at(base) - (full + 200.0)).abs() < EPSILON);
    }

    #[test]
    fn ties_go_to_the_last_maximum() {
        assert_eq!(best_index([1.0, 3.0, 2.0, 3.0].into_iter()), Some(3));
        assert_eq!(best_index([5.0].into_iter()), Some(0));
        assert_eq!(best_index(std::iter::empty()), None);
    }

    #[test]
    fn hysteresis_margin() {
        let active = ActiveServer {
            server: Some(Arc::new(Server::new("10.0.0.1", 8388))),
            score: 1000.0,
        };
        assert!(!should_switch(&active, 1150.0));
        assert!(!should_switch(&active, 1200.0));
        assert!(should_switch(&active, 1201.0));

        assert!(should_switch(&ActiveServer::default(), f64::MIN));
    }

    #[test]
    fn reload_picks_an_initial_server() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, _) = strategy(dir.path(), &["a", "b"]);

        let udp = strategy.get_a_server(CallerType::Udp, local(), None).unwrap();
        assert!(["a:8388", "b:8388"].contains(&udp.identifier().as_str()));
    }

    #[test]
    fn empty_roster_has_no_server() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, _) = strategy(dir.path(), &[]);

        for caller in [CallerType::Tcp, CallerType::Udp] {
            assert_eq!(
                strategy.get_a_server(caller, local(), None).unwrap_err(),
                SelectError::NoServerAvailable
            );
        }
    }

    #[test]
    fn switch_requires_margin_over_stored_score() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, _) = strategy(dir.path(), &["a", "b"]);
        let now = Instant::now();

        let set_latency = |id: &str, ms: u64| {
            let mut memory = strategy.base().memory().acquire();
            let mut status = status_at(now);
            status.latency = Duration::from_millis(ms);
            memory.insert(id, status);
        };

        set_latency("a:8388", 100);
        set_latency("b:8388", 100);
        {
            let mut memory = strategy.base().memory().acquire();
            let score = memory.get("a:8388").unwrap().score_at(now);
            *memory.global_mut() = ActiveServer {
                server: strategy.base().find_server("a:8388"),
                score,
            };
        }

        // 150 better
        set_latency("b:8388", 85);
        strategy.choose_new_server_at(now);
        assert_eq!(strategy.current().unwrap().identifier(), "a:8388");

        // 250 better
        set_latency("b:8388", 75);
        strategy.choose_new_server_at(now);
        assert_eq!(strategy.current().unwrap().identifier(), "b:8388");
    }

    #[test]
    fn only_tcp_reevaluates() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, _) = strategy(dir.path(), &["a", "b"]);

        let first = strategy.get_a_server(CallerType::Tcp, local(), None).unwrap();
        let other = if first.identifier() == "a:8388" { "b:8388" } else { "a:8388" };

        // a failure alone never beats the stored score by the margin
        strategy.set_failure(&first);
        let tcp = strategy.get_a_server(CallerType::Tcp, local(), None).unwrap();
        assert_eq!(tcp.identifier(), first.identifier());

        // +100 from zero latency, +200 from writing after the last read
        let now = Instant::now();
        let mut better = status_at(now);
        better.latency = Duration::ZERO;
        better.last_write = now + Duration::from_secs(2);
        strategy.base().memory().acquire().insert(other, better);

        let udp = strategy.get_a_server(CallerType::Udp, local(), None).unwrap();
        assert_eq!(udp.identifier(), first.identifier());

        let tcp = strategy.get_a_server(CallerType::Tcp, local(), None).unwrap();
        assert_eq!(tcp.identifier(), other);
    }

    #[test]
    fn feedback_updates_only_tracked_servers() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, _) = strategy(dir.path(), &["a"]);
        let tracked = Server::new("a", 8388);
        let untracked = Server::new("zzz", 1);

        strategy.update_latency(&tracked, Duration::from_millis(321));
        strategy.set_failure(&tracked);
        strategy.update_latency(&untracked, Duration::from_millis(5));
        strategy.set_failure(&untracked);
        strategy.update_last_read(&untracked);
        strategy.update_last_write(&untracked);

        let memory = strategy.base().memory().acquire();
        let status = memory.get("a:8388").unwrap();
        assert_eq!(status.latency, Duration::from_millis(321));
        assert!(status.last_failure.is_some());
        assert!(!memory.contains("zzz:1"));
    }

    #[test]
    fn removed_active_server_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, list) = strategy(dir.path(), &["a", "b"]);

        let active = strategy.current().unwrap();
        let other = if active.identifier() == "a:8388" { "b" } else { "a" };

        list.replace(vec![Server::new(other, 8388)]);
        strategy.reload_servers();

        assert_eq!(strategy.current().unwrap().identifier(), format!("{other}:8388"));

        list.replace(Vec::new());
        strategy.reload_servers();
        assert!(strategy.current().is_none());
        for caller in [CallerType::Udp, CallerType::Tcp] {
            assert_eq!(
                strategy.get_a_server(caller, local(), None).unwrap_err(),
                SelectError::NoServerAvailable
            );
        }
    }

    #[test]
    fn reload_refreshes_active_server_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (strategy, list) = strategy(dir.path(), &["a"]);

        let mut edited = Server::new("a", 8388);
        edited.remarks = "renamed".to_string();
        list.replace(vec![edited]);
        strategy.reload_servers();

        assert_eq!(strategy.current().unwrap().remarks, "renamed");
    }
}
