//! Traffic accounting for the relay layer.

pub mod service;
pub mod traffic;

pub use service::{StatisticsService, StatisticsServices};
pub use traffic::{TrafficSample, TrafficSampler, TrafficWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerError {
    /// `start` was called outside a tokio runtime.
    NoRuntime,
}

impl std::fmt::Display for SamplerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplerError::NoRuntime => write!(f, "traffic sampler needs a running tokio runtime"),
        }
    }
}

impl std::error::Error for SamplerError {}
