//! Multi-stream throughput measurement shared by the download and upload phases.
//!
//! A phase fans out to N worker tasks that keep one transfer each in flight
//! until the phase deadline, adding to a shared [`PhaseCounter`]. The calling
//! task samples the counter every `sample_interval`, smooths the instantaneous
//! rate and publishes it as [`ThroughputSample`]s. The value returned at the
//! end is the plain average over the post-grace window, never the smoothed one.

use super::error::SpeedTestError;
use super::transport::Transport;
use super::{bytes_to_mbps, download, upload, Direction};
use crate::settings::Settings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EMA_ALPHA: f64 = 0.7;
/// Applied to the smoothed speed when an interval saw no new bytes.
const IDLE_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub speed_mbps: f64,
    pub progress: f64,
}

/// Byte accounting for one phase.
///
/// `transferred` sees every byte and drives the live display. `counted` only
/// sees bytes admitted after the grace deadline and drives the final average.
#[derive(Debug)]
pub(crate) struct PhaseCounter {
    grace_deadline: Instant,
    deadline: Instant,
    transferred: AtomicU64,
    counted: AtomicU64,
    effective_start: OnceLock<Instant>,
}

impl PhaseCounter {
    pub(crate) fn new(start: Instant, grace: Duration, duration: Duration) -> Self {
        Self {
            grace_deadline: start + grace,
            deadline: start + duration,
            transferred: AtomicU64::new(0),
            counted: AtomicU64::new(0),
            effective_start: OnceLock::new(),
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Whether a transfer observed at `now` counts towards the average.
    ///
    /// The first caller at or past the grace deadline fixes the effective start
    /// of the measurement window; later callers keep that value.
    pub(crate) fn admit(&self, now: Instant) -> bool {
        if now < self.grace_deadline {
            return false;
        }
        self.effective_start.get_or_init(|| now);
        true
    }

    pub(crate) fn record(&self, bytes: u64, counted: bool) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        if counted {
            self.counted.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub(crate) fn counted(&self) -> u64 {
        self.counted.load(Ordering::Relaxed)
    }

    pub(crate) fn effective_start(&self) -> Option<Instant> {
        self.effective_start.get().copied()
    }
}

/// Exponential moving average over instantaneous rates.
#[derive(Debug, Default)]
pub(crate) struct SpeedSmoother {
    ema: f64,
}

impl SpeedSmoother {
    pub(crate) fn update(&mut self, bytes: u64, secs: f64) -> f64 {
        if bytes == 0 {
            self.ema *= IDLE_DECAY;
        } else {
            let raw = bytes_to_mbps(bytes, secs);
            self.ema = raw * EMA_ALPHA + self.ema * (1.0 - EMA_ALPHA);
        }
        self.ema
    }
}

/// Everything a worker task needs. One per spawned task.
pub(crate) struct Worker<T> {
    pub(crate) id: usize,
    pub(crate) transport: Arc<T>,
    pub(crate) counter: Arc<PhaseCounter>,
    pub(crate) cancel: CancellationToken,
    pub(crate) retry_backoff: Duration,
}

impl<T> Worker<T> {
    pub(crate) fn should_continue(&self) -> bool {
        !self.cancel.is_cancelled() && !self.counter.is_expired(Instant::now())
    }

    /// Pause before retrying so a refusing server does not turn the loop into a spin.
    pub(crate) async fn back_off(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.retry_backoff) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PhaseOutcome {
    pub(crate) speed_mbps: f64,
    pub(crate) counted_bytes: u64,
    pub(crate) window: Option<Duration>,
}

pub struct ThroughputTest<T> {
    transport: Arc<T>,
    direction: Direction,
    workers: usize,
    duration: Duration,
    grace: Duration,
    sample_interval: Duration,
    retry_backoff: Duration,
    upload_payload_bytes: usize,
    cancel: CancellationToken,
}

impl<T: Transport> ThroughputTest<T> {
    /// Builds a phase from validated settings.
    pub fn new(
        transport: Arc<T>,
        direction: Direction,
        settings: &Settings,
    ) -> Result<Self, SpeedTestError> {
        settings.validate()?;
        Ok(Self {
            transport,
            direction,
            workers: settings.workers(direction),
            duration: settings.test_duration,
            grace: settings.grace_period,
            sample_interval: settings.sample_interval,
            retry_backoff: settings.retry_backoff,
            upload_payload_bytes: settings.upload_payload_bytes,
            cancel: CancellationToken::new(),
        })
    }

    /// Ties the phase to an outer token; cancelling it ends the phase early.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the phase and returns the average speed in Mbps over the post-grace window.
    pub async fn run(&self, progress_tx: mpsc::Sender<ThroughputSample>) -> f64 {
        self.measure(progress_tx).await.speed_mbps
    }

    pub(crate) async fn measure(
        &self,
        progress_tx: mpsc::Sender<ThroughputSample>,
    ) -> PhaseOutcome {
        let start = Instant::now();
        let counter = Arc::new(PhaseCounter::new(start, self.grace, self.duration));
        // Child token: stopping this phase's workers must not cancel the caller.
        let cancel = self.cancel.child_token();
        let _stop_workers = cancel.clone().drop_guard();

        let mut workers = JoinSet::new();
        let payload = match self.direction {
            Direction::Upload => Some(upload::random_payload(self.upload_payload_bytes)),
            Direction::Download => None,
        };
        for id in 0..self.workers {
            let worker = Worker {
                id,
                transport: Arc::clone(&self.transport),
                counter: Arc::clone(&counter),
                cancel: cancel.clone(),
                retry_backoff: self.retry_backoff,
            };
            match &payload {
                Some(payload) => workers.spawn(upload::run_worker(worker, payload.clone())),
                None => workers.spawn(download::run_worker(worker)),
            };
        }
        debug!("{:?}: started {} workers", self.direction, self.workers);

        let mut ticker =
            tokio::time::interval_at(start + self.sample_interval, self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep_until(counter.deadline());
        tokio::pin!(deadline);

        let mut smoother = SpeedSmoother::default();
        let mut last_bytes = 0u64;
        let mut last_time = start;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut deadline => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let transferred = counter.transferred();
            let speed_mbps = smoother.update(
                transferred - last_bytes,
                now.duration_since(last_time).as_secs_f64(),
            );
            let elapsed = now.duration_since(start).as_secs_f64();
            let progress = (elapsed / self.duration.as_secs_f64()).clamp(0.0, 1.0);
            last_bytes = transferred;
            last_time = now;

            // A stalled consumer must not hold the phase past its deadline or a cancel.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut deadline => break,
                _ = progress_tx.send(ThroughputSample { speed_mbps, progress }) => {}
            }
        }

        let end = Instant::now();
        cancel.cancel();
        workers.abort_all();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(bytes) => debug!("{:?}: worker finished with {} bytes", self.direction, bytes),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("{:?}: worker task failed: {}", self.direction, e),
            }
        }

        let counted_bytes = counter.counted();
        let window = counter.effective_start().map(|s| end.saturating_duration_since(s));
        let speed_mbps = match window {
            Some(w) if !w.is_zero() => bytes_to_mbps(counted_bytes, w.as_secs_f64()),
            _ => 0.0,
        };

        if speed_mbps == 0.0 {
            warn!("{:?}: no throughput measured", self.direction);
        } else {
            info!(
                "{:?}: {:.2} Mbps ({} bytes over {:.2}s)",
                self.direction,
                speed_mbps,
                counted_bytes,
                window.unwrap_or_default().as_secs_f64()
            );
        }

        PhaseOutcome { speed_mbps, counted_bytes, window }
    }
}
