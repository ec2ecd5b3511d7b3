use std::collections::HashSet;

use crate::config::Config;
use log::{error, info, warn};

pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

pub const VALID_STRATEGY_IDS: &[&str] = &[
    "com.shadowsocks.strategy.balancing",
    "com.shadowsocks.strategy.ha",
    "com.shadowsocks.strategy.scbs",
];

pub fn validate(config: &Config) -> bool {
    info!("Starting configuration validation...");

    // --- Validate log level ---
    if !VALID_LOG_LEVELS
        .iter()
        .any(|lvl| lvl.eq_ignore_ascii_case(&config.log.level))
    {
        error!("Invalid log level: {}", config.log.level);
        return false;
    }

    if config.log.enabled && config.log.file.trim().is_empty() {
        error!("File logging is enabled but no log file is set");
        return false;
    }

    // --- Validate strategy ---
    if !config.strategy.is_empty() && !VALID_STRATEGY_IDS.contains(&config.strategy.as_str()) {
        error!("Unknown strategy: {}", config.strategy);
        return false;
    }

    if config.strategy_dir.trim().is_empty() {
        error!("Strategy directory is empty");
        return false;
    }

    // --- Validate traffic window ---
    if config.traffic.window == 0 {
        error!("Traffic window must hold at least one sample");
        return false;
    }

    // --- Validate servers ---
    if config.servers.is_empty() {
        warn!("No servers configured, every selection will fail");
    }

    let mut seen = HashSet::new();
    for server in &config.servers {
        if server.server.trim().is_empty() {
            error!("Server address is missing");
            return false;
        }

        if server.server_port == 0 {
            error!(
                "Server port is invalid (0) for server '{}'",
                server.friendly_name()
            );
            return false;
        }

        if server.method.trim().is_empty() {
            error!("Cipher method is missing for server '{}'", server.friendly_name());
            return false;
        }

        if server.timeout == 0 {
            error!("Timeout is invalid (0) for server '{}'", server.friendly_name());
            return false;
        }

        if !seen.insert(server.identifier()) {
            warn!(
                "Server '{}' is configured more than once, strategies track it once",
                server.identifier()
            );
        }
    }

    info!("Configuration validation passed successfully");

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Server;
    use crate::loader::parse_config;

    fn valid_config() -> Config {
        let mut config = parse_config("{}").unwrap();
        config.servers = vec![Server::new("10.0.0.1", 8388), Server::new("10.0.0.2", 8388)];
        config
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate(&valid_config()));
    }

    #[test]
    fn accepts_empty_roster() {
        let mut config = valid_config();
        config.servers.clear();
        assert!(validate(&config));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let mut config = valid_config();
        config.strategy = "com.example.nope".to_string();
        assert!(!validate(&config));

        config.strategy = "com.shadowsocks.strategy.balancing".to_string();
        assert!(validate(&config));
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut config = valid_config();
        config.log.level = "loud".to_string();
        assert!(!validate(&config));

        config.log.level = "WARN".to_string();
        assert!(validate(&config));
    }

    #[test]
    fn rejects_zero_port_and_zero_window() {
        let mut config = valid_config();
        config.servers[0].server_port = 0;
        assert!(!validate(&config));

        let mut config = valid_config();
        config.traffic.window = 0;
        assert!(!validate(&config));
    }

    #[test]
    fn duplicate_servers_only_warn() {
        let mut config = valid_config();
        config.servers.push(Server::new("10.0.0.1", 8388));
        assert!(validate(&config));
    }
}
