use std::{sync::Arc, time::Duration};

use waypoint_config::Server;

use crate::TrafficSampler;

/// A sink for per-server measurements reported by the relay layer.
pub trait StatisticsService: Send + Sync {
    fn id(&self) -> &str;

    fn update_latency(&self, server: &Server, latency: Duration);

    fn update_inbound_counter(&self, server: &Server, n: u64);

    fn update_outbound_counter(&self, server: &Server, n: u64);
}

impl StatisticsService for TrafficSampler {
    fn id(&self) -> &str {
        "traffic"
    }

    fn update_latency(&self, _server: &Server, _latency: Duration) {}

    fn update_inbound_counter(&self, _server: &Server, n: u64) {
        self.add_inbound(n);
    }

    fn update_outbound_counter(&self, _server: &Server, n: u64) {
        self.add_outbound(n);
    }
}

/// Forwards every report to each registered service in order.
#[derive(Default, Clone)]
pub struct StatisticsServices {
    services: Vec<Arc<dyn StatisticsService>>,
}

impl StatisticsServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn StatisticsService>) {
        log::debug!("Registered statistics service {}", service.id());
        self.services.push(service);
    }

    pub fn ids(&self) -> Vec<&str> {
        self.services.iter().map(|service| service.id()).collect()
    }

    pub fn update_latency(&self, server: &Server, latency: Duration) {
        for service in &self.services {
            service.update_latency(server, latency);
        }
    }

    pub fn update_inbound_counter(&self, server: &Server, n: u64) {
        for service in &self.services {
            service.update_inbound_counter(server, n);
        }
    }

    pub fn update_outbound_counter(&self, server: &Server, n: u64) {
        for service in &self.services {
            service.update_outbound_counter(server, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        latencies: Mutex<Vec<(String, Duration)>>,
    }

    impl StatisticsService for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        fn update_latency(&self, server: &Server, latency: Duration) {
            self.latencies
                .lock()
                .unwrap()
                .push((server.identifier(), latency));
        }

        fn update_inbound_counter(&self, _server: &Server, _n: u64) {}

        fn update_outbound_counter(&self, _server: &Server, _n: u64) {}
    }

    #[test]
    fn reports_reach_every_service() {
        let sampler = Arc::new(TrafficSampler::new(60));
        let recorder = Arc::new(Recorder::default());

        let mut services = StatisticsServices::new();
        services.register(sampler.clone());
        services.register(recorder.clone());
        assert_eq!(services.ids(), vec!["traffic", "recorder"]);

        let server = Server::new("10.0.0.1", 8388);
        services.update_inbound_counter(&server, 512);
        services.update_outbound_counter(&server, 64);
        services.update_latency(&server, Duration::from_millis(30));

        assert_eq!(sampler.inbound_total(), 512);
        assert_eq!(sampler.outbound_total(), 64);
        assert_eq!(
            *recorder.latencies.lock().unwrap(),
            vec![("10.0.0.1:8388".to_string(), Duration::from_millis(30))]
        );
    }
}
