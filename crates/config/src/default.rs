use crate::config::{Log, Traffic};

// default values
pub fn get_default_strategy_dir() -> String {
    String::from("./strategy")
}

pub fn get_default_server_port() -> u16 {
    8388
}

pub fn get_default_method() -> String {
    String::from("aes-256-gcm")
}

pub fn get_default_timeout() -> u32 {
    5
}

pub fn get_default_traffic_window() -> usize {
    60
}

pub fn get_default_log_level() -> String {
    String::from("info")
}

pub fn get_default_log_file() -> String {
    String::from("./logs/waypoint.log")
}

pub fn get_default_traffic() -> Traffic {
    Traffic {
        window: get_default_traffic_window(),
    }
}

pub fn get_default_log() -> Log {
    Log {
        level: get_default_log_level(),
        enabled: false,
        file: get_default_log_file(),
    }
}
