pub mod download;
pub mod error;
pub mod orchestrator;
pub mod ping;
pub mod throughput;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{SpeedTestError, TransportError};
pub use orchestrator::{SpeedTestRun, SpeedTester};
pub use ping::{measure_latency, LatencyResult};
pub use throughput::{ThroughputSample, ThroughputTest};
pub use transport::{HttpTransport, Transport};

/// Empirical framing/header overhead applied on top of counted payload bytes.
pub const OVERHEAD_FACTOR: f64 = 1.06;

/// Converts a byte count over `secs` seconds to megabits per second, overhead included.
pub fn bytes_to_mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0 * OVERHEAD_FACTOR) / secs / 1_000_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestStage {
    Ping,
    Download,
    Upload,
    Finished,
}

/// Terminal summary of one completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkResult {
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

/// One item of the live progress stream.
///
/// `final_result` is partial (upload 0) during the upload stage and complete on
/// [`TestStage::Finished`]; it is `None` before that.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedTestUpdate {
    pub stage: TestStage,
    pub ping: f64,
    pub jitter: f64,
    pub progress: f64,
    pub current_speed_mbps: f64,
    pub final_result: Option<NetworkResult>,
}

impl SpeedTestUpdate {
    pub fn new(stage: TestStage) -> Self {
        Self {
            stage,
            ping: 0.0,
            jitter: 0.0,
            progress: 0.0,
            current_speed_mbps: 0.0,
            final_result: None,
        }
    }
}
