// src/main.rs
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use neurostream::dsp::{PlotStyle, SimulatedSource, SnapshotSink};
use neurostream::{spawn_session, DisplaySink, PipelineConfig, SessionCommand, SessionEvent, TickFrame};

// 模拟板卡参数 (Cyton + Daisy)
const SIM_SAMPLE_RATE_HZ: f64 = 250.0;
const SIM_CHANNELS: usize = 16;

/// Prints band power once per frame.
struct LogSink;

impl DisplaySink for LogSink {
    fn present(&mut self, frame: &TickFrame) {
        match &frame.band_power {
            Some(power) => {
                let bands: Vec<String> = power
                    .iter()
                    .map(|(band, value)| format!("{}={value:.3}", band.name()))
                    .collect();
                log::info!("[{} samples] {}", frame.buffered_samples, bands.join(" "));
            }
            None => log::debug!("frame with {} samples", frame.buffered_samples),
        }
    }
}

/// Log line, plus PNG snapshots when a directory is given.
struct RunnerSink {
    log: LogSink,
    snapshots: Option<SnapshotSink>,
}

impl DisplaySink for RunnerSink {
    fn present(&mut self, frame: &TickFrame) {
        self.log.present(frame);
        if let Some(snapshots) = &mut self.snapshots {
            snapshots.present(frame);
        }
    }
}

// 用法: neurostream [config.json] [seconds] [snapshot_dir]
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => PipelineConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config {path}"))?,
        _ => PipelineConfig::default(),
    };
    let run_for = match args.next() {
        Some(text) => Duration::from_secs(
            text.parse()
                .with_context(|| format!("run time must be whole seconds, got {text:?}"))?,
        ),
        None => Duration::from_secs(10),
    };
    let snapshots = args
        .next()
        .map(|dir| SnapshotSink::new(PlotStyle::default()).writing_to(dir));

    let record = !config.trial_name.trim().is_empty();
    let source = SimulatedSource::new(SIM_SAMPLE_RATE_HZ, SIM_CHANNELS, 42);
    let session = spawn_session(
        source,
        config,
        RunnerSink {
            log: LogSink,
            snapshots,
        },
    )
    .context("failed to start session")?;

    session.send(SessionCommand::Connect)?;
    if record {
        session.send(SessionCommand::StartRecording(None))?;
    }

    let deadline = Instant::now() + run_for;
    while Instant::now() < deadline {
        for event in session.try_events() {
            report(&event);
        }
        thread::sleep(Duration::from_millis(200));
    }

    if record {
        session.send(SessionCommand::StopRecording)?;
    }
    for event in session.shutdown() {
        report(&event);
    }
    Ok(())
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::Status(text) => log::info!("{text}"),
        SessionEvent::Streaming(on) => log::info!("streaming: {on}"),
        SessionEvent::Recording(on) => log::info!("recording: {on}"),
        SessionEvent::IntervalChanged(interval) => log::debug!("tick interval now {interval:?}"),
        SessionEvent::Frame(_) => {}
    }
}
