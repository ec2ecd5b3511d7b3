//! Waypoint - upstream selection for a forwarding proxy client.
//!
//! The binary drives the strategy manager outside a relay: list strategies,
//! run selections, flip persisted flags and watch the traffic sampler.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use waypoint_config::{Config, validator::validate as validate_config};
use waypoint_lb::{CallerType, ServerList, StrategyManager};
use waypoint_stats::TrafficSampler;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    // Sets a custom config file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered strategies, marking the active one
    List,

    /// Run selection through the active strategy
    Pick {
        #[arg(long, value_enum, default_value_t = Caller::Tcp)]
        caller: Caller,

        #[arg(long, default_value = "127.0.0.1:1080")]
        local: SocketAddr,

        #[arg(long)]
        dest: Option<String>,

        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Overrides the strategy from the config file
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Flip the load balancing "same server" flag
    ToggleSameServer,

    /// Start the traffic sampler and log each window
    Monitor {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Caller {
    Tcp,
    Udp,
}

impl From<Caller> for CallerType {
    fn from(caller: Caller) -> Self {
        match caller {
            Caller::Tcp => CallerType::Tcp,
            Caller::Udp => CallerType::Udp,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| "./config/config.yaml".to_string());

    let config_yaml = match waypoint_config::loader::read_config(&config_path) {
        Ok(cfg) => cfg,
        Err(err_msg) => {
            eprintln!("Error loading config: {}", err_msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = waypoint_utils::logger::init_logger(
        &config_yaml.log.level,
        config_yaml.log.enabled,
        &config_yaml.log.file,
    ) {
        eprintln!("Error initializing logger: {}", err);
        std::process::exit(1);
    }

    if !validate_config(&config_yaml) {
        error!("Configuration validation failed. Exiting...");
        std::process::exit(1);
    }

    info!("Waypoint is starting");

    if let Command::Monitor { seconds } = cli.command {
        monitor(config_yaml.traffic.window, seconds).await;
        return;
    }

    let manager = start_manager(&config_yaml);

    match cli.command {
        Command::List => list(&manager),
        Command::Pick {
            caller,
            local,
            dest,
            count,
            strategy,
        } => {
            if let Some(id) = strategy {
                manager.set_current_strategy(Some(&id));
            }
            pick(&manager, caller.into(), local, dest.as_deref(), count);
        }
        Command::ToggleSameServer => match manager.balancing() {
            Some(balancing) => {
                let value = balancing.toggle_same_server();
                println!("same server: {}", value);
            }
            None => error!("Load balancing strategy is not registered"),
        },
        Command::Monitor { .. } => {}
    }

    manager.shutdown();
}

fn start_manager(config: &Config) -> StrategyManager {
    let servers = Arc::new(ServerList::new(config.servers.clone()));
    let manager = StrategyManager::new(servers, Path::new(&config.strategy_dir));
    manager.reload_servers();

    if config.strategy.is_empty() {
        warn!("No strategy configured");
    } else {
        manager.set_current_strategy(Some(&config.strategy));
    }
    manager
}

fn list(manager: &StrategyManager) {
    let current = manager.current().map(|strategy| strategy.id());
    for strategy in manager.strategies() {
        let marker = if current == Some(strategy.id()) { "*" } else { " " };
        println!("{} {:<36} {}", marker, strategy.id(), strategy.name());
    }
}

fn pick(
    manager: &StrategyManager,
    caller: CallerType,
    local: SocketAddr,
    dest: Option<&str>,
    count: usize,
) {
    for _ in 0..count {
        match manager.get_a_server(caller, local, dest) {
            Ok(server) => println!("{}", server.friendly_name()),
            Err(err) => {
                error!("Selection failed: {}", err);
                break;
            }
        }
    }
}

async fn monitor(window: usize, seconds: u64) {
    let sampler = Arc::new(TrafficSampler::new(window));
    let mut rx = sampler.subscribe();

    if let Err(err) = sampler.start() {
        error!("Failed to start traffic sampler: {}", err);
        return;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            received = rx.recv() => match received {
                Ok(window) => {
                    if let Some(sample) = window.latest() {
                        info!(
                            "in {} B/s, out {} B/s ({} samples)",
                            sample.inbound_delta,
                            sample.outbound_delta,
                            window.len()
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Monitor fell behind, skipped {} windows", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    sampler.stop();
}
