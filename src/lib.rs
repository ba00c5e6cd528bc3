//! Network speed test engine: latency and jitter probing followed by
//! multi-stream HTTP download and upload measurement, with a live progress
//! stream and a final [`NetworkResult`](speedtest::NetworkResult).

pub mod app;
pub mod settings;
pub mod speedtest;

pub use settings::Settings;
pub use speedtest::{
    NetworkResult, SpeedTestError, SpeedTestRun, SpeedTestUpdate, SpeedTester, TestStage,
};
