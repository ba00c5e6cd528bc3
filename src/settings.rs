use crate::speedtest::{Direction, SpeedTestError};
use reqwest::Url;
use std::time::Duration;

/// LibreSpeed backend used when no server is configured.
pub const DEFAULT_SERVER: &str = "https://librespeed.a573.net/backend/";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of a LibreSpeed-style backend (`empty.php`, `garbage.php`).
    pub server: String,
    pub connect_timeout: Duration,
    /// Longest silence on a connection before its request fails. Applies per read,
    /// so a body that keeps flowing is never cut, but a hung one cannot stall a worker.
    pub request_timeout: Duration,

    pub ping_count: usize,
    pub ping_interval: Duration,
    pub ping_settle: Duration,
    /// Probes at or above this round trip are treated as failures.
    pub ping_ceiling: Duration,

    pub test_duration: Duration,
    pub grace_period: Duration,
    pub sample_interval: Duration,
    pub retry_backoff: Duration,

    pub download_workers: usize,
    /// `ckSize` query parameter of `garbage.php`, in MiB chunks.
    pub download_chunk_count: u32,
    pub upload_workers: usize,
    pub upload_payload_bytes: usize,

    pub stage_pause_after_ping: Duration,
    pub stage_pause_after_download: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(15),
            ping_count: 10,
            ping_interval: Duration::from_millis(50),
            ping_settle: Duration::from_millis(200),
            ping_ceiling: Duration::from_millis(2000),
            test_duration: Duration::from_secs(15),
            grace_period: Duration::from_millis(1500),
            sample_interval: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(50),
            download_workers: 6,
            download_chunk_count: 100,
            upload_workers: 4,
            upload_payload_bytes: 512 * 1024,
            stage_pause_after_ping: Duration::from_millis(500),
            stage_pause_after_download: Duration::from_millis(1000),
        }
    }
}

impl Settings {
    /// Defaults overlaid with `PWIFI_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(server) = lookup("PWIFI_SERVER") {
            settings.server = server.trim().to_string();
        }
        if let Some(count) = lookup("PWIFI_PING_COUNT").and_then(|v| v.trim().parse().ok()) {
            settings.ping_count = count;
        }
        if let Some(secs) = lookup("PWIFI_DURATION_SECS").and_then(|v| v.trim().parse().ok()) {
            settings.test_duration = Duration::from_secs(secs);
        }
        if let Some(n) = lookup("PWIFI_DOWNLOAD_WORKERS").and_then(|v| v.trim().parse().ok()) {
            settings.download_workers = n;
        }
        if let Some(n) = lookup("PWIFI_UPLOAD_WORKERS").and_then(|v| v.trim().parse().ok()) {
            settings.upload_workers = n;
        }

        settings
    }

    pub fn validate(&self) -> Result<(), SpeedTestError> {
        self.server_url()?;
        if self.download_workers == 0 || self.upload_workers == 0 {
            return Err(SpeedTestError::InvalidSettings(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.test_duration.is_zero() {
            return Err(SpeedTestError::InvalidSettings(
                "test duration must be non-zero".to_string(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(SpeedTestError::InvalidSettings(
                "sample interval must be non-zero".to_string(),
            ));
        }
        if self.upload_payload_bytes == 0 {
            return Err(SpeedTestError::InvalidSettings(
                "upload payload must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Server base URL, normalized to end with `/` so endpoint joins stay under it.
    pub fn server_url(&self) -> Result<Url, SpeedTestError> {
        let mut base = self.server.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base).map_err(|e| SpeedTestError::InvalidSettings(format!("server url: {e}")))
    }

    pub fn workers(&self, direction: Direction) -> usize {
        match direction {
            Direction::Download => self.download_workers,
            Direction::Upload => self.upload_workers,
        }
    }
}
