//! Byte counters and a once-per-second rolling window over them.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{info, trace};
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    time::{self, MissedTickBehavior},
};

use crate::SamplerError;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const SUBSCRIBER_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub inbound_total: u64,
    pub outbound_total: u64,
    pub inbound_delta: u64,
    pub outbound_delta: u64,
}

/// Bounded FIFO of samples, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficWindow {
    samples: VecDeque<TrafficSample>,
    capacity: usize,
}

impl TrafficWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: TrafficSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&TrafficSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrafficSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Process-wide traffic counters.
///
/// The relay layer feeds [`TrafficSampler::add_inbound`] and
/// [`TrafficSampler::add_outbound`] from any thread. Once
/// [`TrafficSampler::start`]ed, a background task takes a sample every second
/// and broadcasts the whole window to subscribers.
pub struct TrafficSampler {
    inbound: AtomicU64,
    outbound: AtomicU64,
    window: Mutex<TrafficWindow>,
    window_tx: broadcast::Sender<Arc<TrafficWindow>>,
    stop_tx: Mutex<Option<watch::Sender<()>>>,
}

impl TrafficSampler {
    pub fn new(capacity: usize) -> Self {
        let (window_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            window: Mutex::new(TrafficWindow::new(capacity)),
            window_tx,
            stop_tx: Mutex::new(None),
        }
    }

    pub fn add_inbound(&self, n: u64) {
        self.inbound.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_outbound(&self, n: u64) {
        self.outbound.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inbound_total(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound_total(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }

    /// Spawns the sampling task on the current tokio runtime.
    ///
    /// Returns `Ok(false)` when the task is already running. The task holds
    /// only a weak reference and exits once the sampler is dropped or
    /// [`TrafficSampler::stop`] is called. A task that died with its runtime
    /// counts as stopped, so a later `start` spawns a fresh one.
    pub fn start(self: &Arc<Self>) -> Result<bool, SamplerError> {
        let mut stop_tx = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if stop_tx.as_ref().is_some_and(task_alive) {
            return Ok(false);
        }

        let handle = Handle::try_current().map_err(|_| SamplerError::NoRuntime)?;
        let (tx, rx) = watch::channel(());
        handle.spawn(run(Arc::downgrade(self), rx));
        *stop_tx = Some(tx);

        info!(
            "Traffic sampler started with {}ms interval, window of {}",
            SAMPLE_INTERVAL.as_millis(),
            self.window().capacity()
        );
        Ok(true)
    }

    pub fn stop(&self) {
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if stop_tx.is_some() {
            info!("Traffic sampler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(task_alive)
    }

    /// Takes one sample: snapshot both totals, diff against the newest
    /// sample, append, broadcast.
    pub fn tick(&self) -> TrafficSample {
        let inbound_total = self.inbound_total();
        let outbound_total = self.outbound_total();

        let snapshot = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = window.latest().copied().unwrap_or_default();
            let sample = TrafficSample {
                inbound_total,
                outbound_total,
                inbound_delta: inbound_total.saturating_sub(previous.inbound_total),
                outbound_delta: outbound_total.saturating_sub(previous.outbound_total),
            };
            window.push(sample);
            Arc::new(window.clone())
        };

        let sample = snapshot.latest().copied().unwrap_or_default();
        trace!(
            "Traffic sample: in={} (+{}), out={} (+{})",
            sample.inbound_total, sample.inbound_delta, sample.outbound_total, sample.outbound_delta
        );

        if self.window_tx.send(snapshot).is_err() {
            trace!("No traffic subscribers");
        }
        sample
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TrafficWindow>> {
        self.window_tx.subscribe()
    }

    pub fn latest(&self) -> Option<TrafficSample> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .copied()
    }

    pub fn window(&self) -> TrafficWindow {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// the task owns the only receiver; it is gone once the task is dropped
fn task_alive(stop_tx: &watch::Sender<()>) -> bool {
    !stop_tx.is_closed()
}

async fn run(sampler: Weak<TrafficSampler>, mut stopped: watch::Receiver<()>) {
    let mut ticker = time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            _ = ticker.tick() => {
                let Some(sampler) = sampler.upgrade() else {
                    break;
                };
                sampler.tick();
            }
        }
    }
}
