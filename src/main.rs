use anyhow::{anyhow, Result};
use clap::Parser;
use pwifi_speed::app::{format_speed, App};
use pwifi_speed::{Settings, SpeedTester, TestStage};
use std::io::Write;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pwifi-speed")]
#[command(about = "Measure latency, jitter, download and upload speed")]
struct Args {
    /// Base URL of a LibreSpeed-style backend
    #[arg(short, long)]
    server: Option<String>,

    /// Number of latency probes
    #[arg(short, long)]
    pings: Option<usize>,

    /// Duration of each throughput phase, in seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Parallel download streams
    #[arg(long)]
    download_workers: Option<usize>,

    /// Parallel upload streams
    #[arg(long)]
    upload_workers: Option<usize>,
}

impl Args {
    fn into_settings(self) -> Settings {
        let mut settings = Settings::from_env();
        if let Some(server) = self.server {
            settings.server = server;
        }
        if let Some(pings) = self.pings {
            settings.ping_count = pings;
        }
        if let Some(secs) = self.duration {
            settings.test_duration = Duration::from_secs(secs);
        }
        if let Some(n) = self.download_workers {
            settings.download_workers = n;
        }
        if let Some(n) = self.upload_workers {
            settings.upload_workers = n;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pwifi_speed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = Args::parse().into_settings();
    let tester = SpeedTester::from_settings(settings)?;
    info!("Using server {}", tester.settings().server);

    let mut run = tester
        .start_test()
        .ok_or_else(|| anyhow!("a speed test is already running"))?;
    let mut app = App::new();
    app.reset_for_new_test();

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            update = run.recv() => {
                let Some(update) = update else { break };
                let stage_changed = app.stage != Some(update.stage);
                app.apply(&update);
                if stage_changed && update.stage != TestStage::Ping {
                    writeln!(stdout)?;
                }
                write!(stdout, "\r{}", progress_line(&app))?;
                stdout.flush()?;
            }
            _ = tokio::signal::ctrl_c() => {
                run.cancel();
            }
        }
    }
    writeln!(stdout)?;

    let result = run.finish().await?;
    println!("Ping:     {} ms", app.ping_text());
    println!("Jitter:   {} ms", app.jitter_text());
    println!("Download: {}", format_speed(result.download_mbps));
    println!("Upload:   {}", format_speed(result.upload_mbps));

    Ok(())
}

fn progress_line(app: &App) -> String {
    let percent = (app.progress * 100.0).round() as u32;
    match app.stage {
        Some(TestStage::Download) | Some(TestStage::Upload) => format!(
            "{:<22} {:>3}%  {:>12}",
            app.status(),
            percent,
            format_speed(app.current_speed_mbps)
        ),
        _ => format!(
            "{:<22} ping {} ms  jitter {} ms",
            app.status(),
            app.ping_text(),
            app.jitter_text()
        ),
    }
}
