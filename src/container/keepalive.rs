//! Container keepalive
//!
//! A background task pings the guest on a jittered interval. Each attempt
//! feeds a success or failure into a moving average; that average is the
//! container's quality-of-service score.
//!
//! ```text
//!             score <= threshold (fires BecameUnhealthy once)
//!   Healthy ─────────────────────────────────────────────▶ Unhealthy
//!      ▲                                                       │
//!      └─────────── score > threshold (fires Recovered once) ──┘
//! ```

use crate::config::KeepaliveConfig;
use crate::remoting::RemoteExecutorClient;
use rand::{thread_rng, Rng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fixed-size average over the most recent samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl MovingAverage {
    /// Starts full of `initial` so a fresh container reads as healthy.
    pub fn new(capacity: usize, initial: f64) -> Self {
        let capacity = capacity.max(1);
        Self { samples: std::iter::repeat(initial).take(capacity).collect(), capacity, sum: initial * capacity as f64 }
    }

    pub fn add(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.sum / self.samples.len() as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthEvent {
    BecameUnhealthy { score: f64 },
    Recovered { score: f64 },
}

/// Edge-triggered health state over a stream of scores.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    average: MovingAverage,
    threshold: f64,
    state: HealthState,
}

impl HealthTracker {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self { average: MovingAverage::new(window, 1.0), threshold, state: HealthState::Healthy }
    }

    /// Record one ping outcome.
    pub fn record(&mut self, success: bool) -> Option<HealthEvent> {
        self.average.add(if success { 1.0 } else { 0.0 });
        self.observe(self.average.average())
    }

    /// Apply a score; returns an event only on a state change.
    pub fn observe(&mut self, score: f64) -> Option<HealthEvent> {
        match self.state {
            HealthState::Healthy if score <= self.threshold => {
                self.state = HealthState::Unhealthy;
                Some(HealthEvent::BecameUnhealthy { score })
            }
            HealthState::Unhealthy if score > self.threshold => {
                self.state = HealthState::Healthy;
                Some(HealthEvent::Recovered { score })
            }
            _ => None,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn quality_of_service(&self) -> f64 {
        self.average.average()
    }
}

/// `period` scaled by a random factor in [0.9, 1.1].
fn jittered(period: Duration) -> Duration {
    period.mul_f64(thread_rng().gen_range(0.9..=1.1))
}

/// Owns the ping task for one container.
#[derive(Debug)]
pub struct KeepaliveManager {
    tracker: Arc<Mutex<HealthTracker>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KeepaliveManager {
    pub fn start(
        client: Arc<RemoteExecutorClient>,
        config: &KeepaliveConfig,
        events: broadcast::Sender<HealthEvent>,
        name: String,
    ) -> Self {
        let tracker = Arc::new(Mutex::new(HealthTracker::new(config.window, config.failure_threshold)));
        let stop = CancellationToken::new();
        let interval = config.interval();
        let timeout = config.timeout();

        let task = {
            let tracker = Arc::clone(&tracker);
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(jittered(interval)) => {}
                    }
                    let outcome = tokio::select! {
                        _ = stop.cancelled() => break,
                        outcome = client.ping(timeout) => outcome,
                    };
                    if let Err(e) = &outcome {
                        tracing::debug!("[KeepaliveManager] {} ping failed: {}", name, e);
                    }

                    let event = {
                        let mut tracker = tracker.lock().unwrap_or_else(|p| p.into_inner());
                        tracker.record(outcome.is_ok())
                    };
                    match event {
                        Some(event @ HealthEvent::BecameUnhealthy { score }) => {
                            tracing::warn!("[KeepaliveManager] {} became unhealthy (score {:.2})", name, score);
                            let _ = events.send(event);
                        }
                        Some(event @ HealthEvent::Recovered { score }) => {
                            tracing::info!("[KeepaliveManager] {} recovered (score {:.2})", name, score);
                            let _ = events.send(event);
                        }
                        None => {}
                    }
                }
                tracing::debug!("[KeepaliveManager] {} stopped", name);
            })
        };

        Self { tracker, stop, task: Some(task) }
    }

    pub fn quality_of_service(&self) -> f64 {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner()).quality_of_service()
    }

    pub fn state(&self) -> HealthState {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner()).state()
    }

    /// Stop pinging and wait for the task to exit.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepaliveManager {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
