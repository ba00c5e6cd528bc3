use crate::speedtest::{NetworkResult, SpeedTestUpdate, TestStage};

/// Samples kept per chart.
const MAX_SAMPLES: usize = 200;

/// Last displayed values of a run, folded from the update stream.
#[derive(Debug, Clone, Default)]
pub struct App {
    pub stage: Option<TestStage>,
    pub in_progress: bool,
    pub ping_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub current_speed_mbps: f64,
    pub progress: f64,
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub result: Option<NetworkResult>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_for_new_test(&mut self) {
        *self = Self {
            in_progress: true,
            ..Self::default()
        };
    }

    pub fn apply(&mut self, update: &SpeedTestUpdate) {
        self.stage = Some(update.stage);
        self.progress = update.progress;
        self.current_speed_mbps = update.current_speed_mbps;

        match update.stage {
            TestStage::Ping => {
                // The opening update is a placeholder with nothing measured yet.
                if update.progress >= 1.0 {
                    self.ping_ms = Some(update.ping);
                    self.jitter_ms = Some(update.jitter);
                }
            }
            TestStage::Download => {
                self.download_mbps = update.current_speed_mbps;
                push_sample(&mut self.download_samples, update.current_speed_mbps);
            }
            TestStage::Upload => {
                self.upload_mbps = update.current_speed_mbps;
                push_sample(&mut self.upload_samples, update.current_speed_mbps);
                if let Some(partial) = update.final_result {
                    self.download_mbps = partial.download_mbps;
                }
            }
            TestStage::Finished => {
                if let Some(result) = update.final_result {
                    self.ping_ms = Some(result.ping_ms);
                    self.jitter_ms = Some(result.jitter_ms);
                    self.download_mbps = result.download_mbps;
                    self.upload_mbps = result.upload_mbps;
                    self.result = Some(result);
                }
                self.current_speed_mbps = 0.0;
                self.in_progress = false;
            }
        }
    }

    pub fn ping_text(&self) -> String {
        rounded_or_dash(self.ping_ms)
    }

    pub fn jitter_text(&self) -> String {
        rounded_or_dash(self.jitter_ms)
    }

    pub fn status(&self) -> &'static str {
        match (self.stage, self.in_progress) {
            (None, false) => "Ready",
            (None, true) | (Some(TestStage::Ping), _) => "Measuring latency...",
            (Some(TestStage::Download), _) => "Testing download...",
            (Some(TestStage::Upload), _) => "Testing upload...",
            (Some(TestStage::Finished), _) => "Complete",
        }
    }
}

fn push_sample(samples: &mut Vec<f64>, value: f64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

fn rounded_or_dash(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{}", v.round() as i64))
}

/// Format speed for display (e.g., "125.5 Mbps" or "1.2 Gbps")
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 100.0 {
        format!("{:.0} Mbps", mbps)
    } else if mbps >= 10.0 {
        format!("{:.1} Mbps", mbps)
    } else {
        format!("{:.2} Mbps", mbps)
    }
}
