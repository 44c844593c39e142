use argh::FromArgs;
use multicam::compositor::{CompositeFrame, CompositeSink, Compositor};
use multicam::config::Config;
use multicam::health::{format_uptime, HealthReport, HealthReporter, DEFAULT_FPS_WINDOW};
use multicam::supervisor::StreamSupervisor;
use std::time::Duration;
use tokio::time::Instant;

#[derive(FromArgs)]
/// Multi-camera RTSP capture with reconnection and a synchronized composite
struct Args {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "String::from(\"config.yaml\")")]
    config: String,

    /// seconds between health summaries, 0 to disable
    #[argh(option, default = "10")]
    stats_interval: u64,
}

/// Logs a one-line summary of the composite every few seconds
struct LogSink {
    every: Duration,
    last: Option<Instant>,
}

impl CompositeSink for LogSink {
    fn present(&mut self, composite: &CompositeFrame) {
        if self
            .last
            .is_some_and(|last| composite.composed_at.duration_since(last) < self.every)
        {
            return;
        }
        self.last = Some(composite.composed_at);
        log::info!(
            "Composite #{}: {}/{} live, {}x{}, skew {:?}",
            composite.cycle,
            composite.live_count(),
            composite.slots.len(),
            composite.image.width,
            composite.image.height,
            composite.skew.max_skew
        );
    }
}

fn log_report(report: &HealthReport) {
    log::info!(
        "Health [{}]: {}/{} connected",
        format_uptime(report.uptime),
        report.connected(),
        report.total()
    );
    for stream in &report.streams {
        let age = stream
            .last_frame_age
            .map(|age| format!("{:.1}s ago", age.as_secs_f64()))
            .unwrap_or_else(|| "never".to_string());
        log::info!(
            "  [{}] {} {:.1} fps, {} frames, {} dropped, {} reconnects, last frame {}",
            stream.name,
            stream.state,
            stream.fps,
            stream.frames_captured,
            stream.frames_dropped,
            stream.reconnect_count,
            age
        );
        let failing = stream.consecutive_failures > 0 || stream.state.is_terminal();
        if let Some(error) = stream.last_error.as_ref().filter(|_| failing) {
            log::info!("      last error: {}", error);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Failed to load config from '{}': {}", args.config, e);
            std::process::exit(1);
        }
    };

    log::info!("Loaded configuration with {} cameras", config.streams.len());

    let shutdown_tx = tokio::sync::watch::Sender::new(());

    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    let reporter = HealthReporter::new(DEFAULT_FPS_WINDOW);
    let mut supervisor = StreamSupervisor::from_config(&config);
    supervisor.start_all()?;

    let compositor = Compositor::new(config.compositor.clone(), supervisor.slots());
    let sink = LogSink {
        every: Duration::from_secs(5),
        last: None,
    };
    let compositor_task = tokio::spawn(compositor.run(sink, shutdown_tx.subscribe()));

    let mut shutdown_rx = shutdown_tx.subscribe();
    if args.stats_interval == 0 {
        let _ = shutdown_rx.changed().await;
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => log_report(&reporter.report(&supervisor.health())),
            }
        }
    }

    let report = reporter.report(&supervisor.health());
    supervisor.stop_all().await;

    if let Err(e) = compositor_task.await {
        log::error!("Compositor task error: {}", e);
    }

    log_report(&report);
    log::info!(
        "Session ended after {}: {}/{} streams connected ({:.0}%)",
        format_uptime(report.uptime),
        report.connected(),
        report.total(),
        report.connection_rate() * 100.0
    );

    Ok(())
}
