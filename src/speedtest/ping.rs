use super::transport::Transport;
use crate::settings::Settings;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyResult {
    pub min_round_trip_ms: f64,
    pub jitter_ms: f64,
}

pub struct PingTest {
    samples: Vec<f64>,
    ping_count: usize,
    interval: Duration,
    settle: Duration,
    ceiling: Duration,
}

impl PingTest {
    pub fn new(settings: &Settings) -> Self {
        Self {
            samples: Vec::with_capacity(settings.ping_count),
            ping_count: settings.ping_count,
            interval: settings.ping_interval,
            settle: settings.ping_settle,
            ceiling: settings.ping_ceiling,
        }
    }

    /// Never fails: lost or slow probes only shrink the sample set.
    pub async fn run<T: Transport>(&mut self, transport: &T) -> LatencyResult {
        self.samples.clear();

        // Warm-up opens the connection and primes DNS/TLS; its timing is discarded.
        match tokio::time::timeout(self.ceiling, transport.probe()).await {
            Ok(Err(e)) => debug!("Warm-up probe failed: {}", e),
            Err(_) => debug!("Warm-up probe timed out"),
            Ok(Ok(())) => {}
        }
        tokio::time::sleep(self.settle).await;

        for i in 0..self.ping_count {
            match self.probe_once(transport).await {
                Some(ms) => {
                    debug!("Probe #{}: {:.1}ms", i + 1, ms);
                    self.samples.push(ms);
                }
                None => debug!("Probe #{}: lost", i + 1),
            }

            if i + 1 < self.ping_count {
                tokio::time::sleep(self.interval).await;
            }
        }

        let result = self.calculate_result();
        if self.samples.is_empty() {
            warn!("No latency probe succeeded out of {}", self.ping_count);
        } else {
            info!(
                "Latency: min {:.1}ms, jitter {:.1}ms ({}/{} probes)",
                result.min_round_trip_ms,
                result.jitter_ms,
                self.samples.len(),
                self.ping_count
            );
        }
        result
    }

    async fn probe_once<T: Transport>(&self, transport: &T) -> Option<f64> {
        let start = Instant::now();
        match tokio::time::timeout(self.ceiling, transport.probe()).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed();
                (elapsed < self.ceiling).then(|| elapsed.as_secs_f64() * 1000.0)
            }
            Ok(Err(e)) => {
                debug!("Probe failed: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    fn calculate_result(&self) -> LatencyResult {
        let min_round_trip_ms = self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0);

        let jitter_ms = if self.samples.len() >= 2 {
            let total: f64 = self.samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
            total / (self.samples.len() - 1) as f64
        } else {
            0.0
        };

        LatencyResult { min_round_trip_ms, jitter_ms }
    }
}

pub async fn measure_latency<T: Transport>(transport: &T, settings: &Settings) -> LatencyResult {
    PingTest::new(settings).run(transport).await
}
