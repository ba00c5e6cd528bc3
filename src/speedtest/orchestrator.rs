//! Runs PING -> DOWNLOAD -> UPLOAD -> FINISHED and streams the progress.

use super::error::SpeedTestError;
use super::ping::{measure_latency, LatencyResult};
use super::throughput::{ThroughputSample, ThroughputTest};
use super::transport::{HttpTransport, Transport};
use super::{Direction, NetworkResult, SpeedTestUpdate, TestStage};
use crate::settings::Settings;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const UPDATE_BUFFER: usize = 16;
const SAMPLE_BUFFER: usize = 4;

/// Entry point of the engine. Allows one run at a time.
pub struct SpeedTester<T> {
    transport: Arc<T>,
    settings: Settings,
    running: Arc<AtomicBool>,
}

impl SpeedTester<HttpTransport> {
    pub fn from_settings(settings: Settings) -> Result<Self, SpeedTestError> {
        settings.validate()?;
        let transport = HttpTransport::new(&settings)?;
        Self::new(Arc::new(transport), settings)
    }
}

impl<T: Transport> SpeedTester<T> {
    pub fn new(transport: Arc<T>, settings: Settings) -> Result<Self, SpeedTestError> {
        settings.validate()?;
        Ok(Self {
            transport,
            settings,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns a run on the current tokio runtime.
    ///
    /// Returns `None` without side effects while another run is still active.
    pub fn start_test(&self) -> Option<SpeedTestRun> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Speed test already in progress, ignoring start");
            return None;
        }
        let running = RunningFlag(Arc::clone(&self.running));

        let (update_tx, update_rx) = mpsc::channel(UPDATE_BUFFER);
        let cancel = CancellationToken::new();
        let run = TestRun {
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            updates: update_tx,
            cancel: cancel.clone(),
        };

        let handle = tokio::spawn(async move {
            let _running = running;
            let result = run.execute().await;
            if let Err(e) = &result {
                info!("Speed test ended without result: {}", e);
            }
            result
        });

        Some(SpeedTestRun {
            updates: update_rx,
            handle,
            cancel,
        })
    }
}

/// Clears the in-progress flag however the run task ends.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Consumer side of one run. Dropping it cancels the run.
pub struct SpeedTestRun {
    updates: mpsc::Receiver<SpeedTestUpdate>,
    handle: JoinHandle<Result<NetworkResult, SpeedTestError>>,
    cancel: CancellationToken,
}

impl SpeedTestRun {
    /// Next progress update, or `None` once the run has ended.
    pub async fn recv(&mut self) -> Option<SpeedTestUpdate> {
        self.updates.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Discards any remaining updates and waits for the outcome.
    ///
    /// A run that measured nothing is `Ok` with zeros; a cancelled or crashed
    /// run is an `Err`.
    pub async fn finish(mut self) -> Result<NetworkResult, SpeedTestError> {
        while self.updates.recv().await.is_some() {}
        (&mut self.handle).await?
    }
}

impl Drop for SpeedTestRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TestRun<T> {
    transport: Arc<T>,
    settings: Settings,
    updates: mpsc::Sender<SpeedTestUpdate>,
    cancel: CancellationToken,
}

impl<T: Transport> TestRun<T> {
    async fn execute(self) -> Result<NetworkResult, SpeedTestError> {
        info!("Starting speed test against {}", self.settings.server);

        self.emit(SpeedTestUpdate::new(TestStage::Ping)).await?;
        let latency = self
            .guard(measure_latency(self.transport.as_ref(), &self.settings))
            .await?;
        self.emit(SpeedTestUpdate {
            ping: latency.min_round_trip_ms,
            jitter: latency.jitter_ms,
            progress: 1.0,
            ..SpeedTestUpdate::new(TestStage::Ping)
        })
        .await?;
        self.pause(self.settings.stage_pause_after_ping).await?;

        let download_mbps = self
            .throughput_phase(Direction::Download, TestStage::Download, latency, None)
            .await?;
        self.emit(SpeedTestUpdate {
            ping: latency.min_round_trip_ms,
            jitter: latency.jitter_ms,
            progress: 1.0,
            current_speed_mbps: download_mbps,
            ..SpeedTestUpdate::new(TestStage::Download)
        })
        .await?;
        self.pause(self.settings.stage_pause_after_download).await?;

        let partial = NetworkResult {
            ping_ms: latency.min_round_trip_ms,
            jitter_ms: latency.jitter_ms,
            download_mbps,
            upload_mbps: 0.0,
        };
        let upload_mbps = self
            .throughput_phase(Direction::Upload, TestStage::Upload, latency, Some(partial))
            .await?;

        let result = NetworkResult { upload_mbps, ..partial };
        self.emit(SpeedTestUpdate {
            ping: result.ping_ms,
            jitter: result.jitter_ms,
            progress: 1.0,
            final_result: Some(result),
            ..SpeedTestUpdate::new(TestStage::Finished)
        })
        .await?;

        info!(
            "Speed test complete: ping={:.1}ms jitter={:.1}ms down={:.2} Mbps up={:.2} Mbps",
            result.ping_ms, result.jitter_ms, result.download_mbps, result.upload_mbps
        );
        Ok(result)
    }

    async fn throughput_phase(
        &self,
        direction: Direction,
        stage: TestStage,
        latency: LatencyResult,
        partial: Option<NetworkResult>,
    ) -> Result<f64, SpeedTestError> {
        info!("{:?} phase started", direction);
        let test = ThroughputTest::new(Arc::clone(&self.transport), direction, &self.settings)?
            .with_cancel(self.cancel.clone());
        let (sample_tx, mut sample_rx) = mpsc::channel::<ThroughputSample>(SAMPLE_BUFFER);

        let forward = async move {
            while let Some(sample) = sample_rx.recv().await {
                self.emit(SpeedTestUpdate {
                    stage,
                    ping: latency.min_round_trip_ms,
                    jitter: latency.jitter_ms,
                    progress: sample.progress,
                    current_speed_mbps: sample.speed_mbps,
                    final_result: partial,
                })
                .await?;
            }
            Ok::<_, SpeedTestError>(())
        };

        let (speed_mbps, forwarded) = tokio::join!(test.run(sample_tx), forward);
        forwarded?;
        if self.cancel.is_cancelled() {
            return Err(SpeedTestError::Cancelled);
        }
        Ok(speed_mbps)
    }

    /// Sends one update. A dropped consumer cancels the run.
    async fn emit(&self, update: SpeedTestUpdate) -> Result<(), SpeedTestError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SpeedTestError::Cancelled),
            sent = self.updates.send(update) => sent.map_err(|_| {
                debug!("Progress consumer went away, cancelling run");
                self.cancel.cancel();
                SpeedTestError::Cancelled
            }),
        }
    }

    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, SpeedTestError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SpeedTestError::Cancelled),
            output = fut => Ok(output),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), SpeedTestError> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::testing::{ConstantRate, FailingTransport, StalledTransport};
    use tokio::time::Instant;

    fn quick_settings() -> Settings {
        Settings {
            ping_count: 3,
            test_duration: Duration::from_secs(2),
            grace_period: Duration::from_millis(400),
            download_workers: 3,
            upload_workers: 2,
            upload_payload_bytes: 10_000,
            ..Settings::default()
        }
    }

    async fn collect(run: &mut SpeedTestRun) -> Vec<SpeedTestUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = run.recv().await {
            updates.push(update);
        }
        updates
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_arrive_in_order() {
        let transport = Arc::new(ConstantRate::new(50_000, Duration::from_millis(100)));
        let tester = SpeedTester::new(transport, quick_settings()).unwrap();
        let mut run = tester.start_test().unwrap();

        let updates = collect(&mut run).await;
        let result = run.finish().await.unwrap();

        assert!(updates.windows(2).all(|w| w[0].stage <= w[1].stage));
        assert_eq!(updates.iter().filter(|u| u.stage == TestStage::Finished).count(), 1);

        let last = updates.last().unwrap();
        assert_eq!(last.stage, TestStage::Finished);
        assert_eq!(last.final_result, Some(result));
        assert!(result.download_mbps > 0.0);
        assert!(result.upload_mbps > 0.0);
        assert!((result.ping_ms - 100.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_download_updates() {
        let transport = Arc::new(ConstantRate::new(50_000, Duration::from_millis(100)));
        let tester = SpeedTester::new(transport, quick_settings()).unwrap();
        let mut run = tester.start_test().unwrap();
        let updates = collect(&mut run).await;

        let pings: Vec<_> = updates.iter().filter(|u| u.stage == TestStage::Ping).collect();
        assert_eq!(pings.len(), 2);
        assert_eq!(pings[0].ping, 0.0);
        assert_eq!(pings[0].progress, 0.0);
        assert_eq!(pings[1].progress, 1.0);
        assert!(pings[1].ping > 0.0);

        let downloads: Vec<_> = updates.iter().filter(|u| u.stage == TestStage::Download).collect();
        assert!(downloads.len() > 2);
        assert!(downloads.iter().all(|u| u.ping == pings[1].ping && u.final_result.is_none()));
        assert_eq!(downloads.last().unwrap().progress, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_updates_carry_partial_result() {
        let transport = Arc::new(ConstantRate::new(50_000, Duration::from_millis(100)));
        let tester = SpeedTester::new(transport, quick_settings()).unwrap();
        let mut run = tester.start_test().unwrap();
        let updates = collect(&mut run).await;

        let final_download = updates
            .iter()
            .filter(|u| u.stage == TestStage::Download)
            .last()
            .unwrap()
            .current_speed_mbps;
        let uploads: Vec<_> = updates.iter().filter(|u| u.stage == TestStage::Upload).collect();
        assert!(!uploads.is_empty());
        for update in uploads {
            let partial = update.final_result.unwrap();
            assert_eq!(partial.upload_mbps, 0.0);
            assert_eq!(partial.download_mbps, final_download);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_completes_with_zeros() {
        let tester = SpeedTester::new(Arc::new(FailingTransport), quick_settings()).unwrap();
        let mut run = tester.start_test().unwrap();
        let updates = collect(&mut run).await;

        assert_eq!(updates.last().unwrap().stage, TestStage::Finished);
        assert_eq!(run.finish().await.unwrap(), NetworkResult::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_ignored_while_running() {
        let transport = Arc::new(ConstantRate::new(50_000, Duration::from_millis(100)));
        let tester = SpeedTester::new(transport, quick_settings()).unwrap();

        let run = tester.start_test().unwrap();
        assert!(tester.is_running());
        assert!(tester.start_test().is_none());

        run.finish().await.unwrap();
        assert!(!tester.is_running());
        assert!(tester.start_test().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_the_run() {
        let tester = SpeedTester::new(Arc::new(StalledTransport), quick_settings()).unwrap();
        let mut run = tester.start_test().unwrap();

        assert_eq!(run.recv().await.unwrap().stage, TestStage::Ping);
        run.cancel();

        assert!(matches!(run.finish().await, Err(SpeedTestError::Cancelled)));
        assert!(!tester.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_download_stops_workers() {
        let transport = Arc::new(ConstantRate::new(50_000, Duration::from_millis(100)));
        let settings = Settings {
            test_duration: Duration::from_secs(60),
            ..quick_settings()
        };
        let tester = SpeedTester::new(transport, settings).unwrap();
        let mut run = tester.start_test().unwrap();

        while let Some(update) = run.recv().await {
            if update.stage == TestStage::Download {
                break;
            }
        }
        let start = Instant::now();
        run.cancel();

        assert!(matches!(run.finish().await, Err(SpeedTestError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_run_releases_the_tester() {
        let tester = SpeedTester::new(Arc::new(StalledTransport), quick_settings()).unwrap();
        drop(tester.start_test().unwrap());

        for _ in 0..100 {
            if !tester.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!tester.is_running());
    }

    #[test]
    fn test_from_settings_rejects_invalid() {
        let settings = Settings { download_workers: 0, ..Settings::default() };
        assert!(matches!(
            SpeedTester::from_settings(settings),
            Err(SpeedTestError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_zero_sample_interval_is_rejected() {
        let settings = Settings {
            sample_interval: Duration::ZERO,
            ..quick_settings()
        };
        assert!(matches!(
            SpeedTester::new(Arc::new(FailingTransport), settings),
            Err(SpeedTestError::InvalidSettings(_))
        ));
    }
}
