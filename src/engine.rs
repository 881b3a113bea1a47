// src/engine.rs
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::dsp::{AcquisitionSource, DisplaySink, Pipeline, PipelineError};
use crate::types::{SessionCommand, SessionEvent};

// 未推流时的命令轮询间隔
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Controller side of a running session.
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    events: Receiver<SessionEvent>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> Result<(), PipelineError> {
        self.commands
            .send(command)
            .map_err(|_| PipelineError::Acquisition("session thread has exited".into()))
    }

    /// Events emitted since the last call, without blocking.
    pub fn try_events(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }

    /// Stops the session, joins the worker and returns the events it left behind.
    pub fn shutdown(mut self) -> Vec<SessionEvent> {
        self.commands.send(SessionCommand::Shutdown).ok();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("session thread panicked");
            }
        }
        self.events.try_iter().collect()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.commands.send(SessionCommand::Shutdown).ok();
            worker.join().ok();
        }
    }
}

/// Starts the single pipeline thread. The config is validated up front so a
/// bad config never reaches the worker.
pub fn spawn_session<S, D>(
    source: S,
    config: PipelineConfig,
    sink: D,
) -> Result<SessionHandle, PipelineError>
where
    S: AcquisitionSource + Send + 'static,
    D: DisplaySink + Send + 'static,
{
    config.validate()?;
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("neurostream-session".into())
        .spawn(move || run_session(source, config, sink, cmd_rx, event_tx))
        .map_err(|e| PipelineError::Acquisition(format!("failed to spawn session thread: {e}")))?;
    Ok(SessionHandle {
        commands: cmd_tx,
        events: event_rx,
        worker: Some(worker),
    })
}

fn run_session<S: AcquisitionSource, D: DisplaySink>(
    source: S,
    config: PipelineConfig,
    mut sink: D,
    rx_cmd: Receiver<SessionCommand>,
    tx: Sender<SessionEvent>,
) {
    let mut pipeline = match Pipeline::new(source, config) {
        Ok(p) => p,
        Err(err) => {
            tx.send(SessionEvent::Status(err.to_string())).ok();
            return;
        }
    };
    tx.send(SessionEvent::Status("session ready".into())).ok();

    loop {
        // 1. 处理所有待处理命令
        let mut exit = false;
        loop {
            match rx_cmd.try_recv() {
                Ok(SessionCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    exit = true;
                    break;
                }
                Ok(cmd) => handle_command(&mut pipeline, cmd, &tx),
                Err(TryRecvError::Empty) => break,
            }
        }
        if exit {
            let was_recording = pipeline.is_recording();
            if let Err(err) = pipeline.disconnect() {
                log::warn!("shutdown: {err}");
                tx.send(SessionEvent::Status(err.to_string())).ok();
            }
            if was_recording {
                tx.send(SessionEvent::Recording(false)).ok();
            }
            tx.send(SessionEvent::Streaming(false)).ok();
            tx.send(SessionEvent::Status("session closed".into())).ok();
            log::info!("session thread exiting");
            return;
        }

        // 2. 推流时跑一次 tick
        match pipeline.tick(&mut sink) {
            Ok(Some(report)) => {
                if let Some(interval) = report.rescheduled {
                    tx.send(SessionEvent::IntervalChanged(interval)).ok();
                }
                if !report.issues.is_empty() {
                    for issue in &report.issues {
                        log::warn!("tick issue: {issue}");
                        tx.send(SessionEvent::Status(issue.to_string())).ok();
                    }
                    if !pipeline.is_recording() {
                        tx.send(SessionEvent::Recording(false)).ok();
                    }
                }
                if let Some(frame) = &report.frame {
                    tx.send(SessionEvent::Frame(frame.summary())).ok();
                }
            }
            Ok(None) => {}
            Err(err) => {
                // The tick is skipped; buffered data and the next tick are unaffected.
                log::warn!("tick skipped ({:?}): {err}", err.kind());
                tx.send(SessionEvent::Status(err.to_string())).ok();
            }
        }

        // 3. 按调度器间隔休眠
        let wait = if pipeline.state().streaming {
            pipeline.state().scheduler.interval()
        } else {
            IDLE_POLL
        };
        thread::sleep(wait);
    }
}

fn handle_command<S: AcquisitionSource>(
    pipeline: &mut Pipeline<S>,
    cmd: SessionCommand,
    tx: &Sender<SessionEvent>,
) {
    let status = |text: String| {
        tx.send(SessionEvent::Status(text)).ok();
    };
    match cmd {
        SessionCommand::Connect => match pipeline.connect() {
            Ok(()) => {
                status("board connected".into());
                tx.send(SessionEvent::Streaming(true)).ok();
            }
            Err(err) => {
                log::warn!("connect failed: {err}");
                status(format!("connect failed: {err}"));
            }
        },
        SessionCommand::StartStream => match pipeline.set_streaming(true) {
            Ok(()) => {
                tx.send(SessionEvent::Streaming(true)).ok();
            }
            Err(err) => status(format!("cannot start stream: {err}")),
        },
        SessionCommand::StopStream => {
            if pipeline.set_streaming(false).is_ok() {
                tx.send(SessionEvent::Streaming(false)).ok();
            }
        }
        SessionCommand::Reset => {
            let was_recording = pipeline.is_recording();
            if let Err(err) = pipeline.reset() {
                status(format!("reset: {err}"));
            }
            if was_recording {
                tx.send(SessionEvent::Recording(false)).ok();
            }
            tx.send(SessionEvent::Streaming(false)).ok();
            tx.send(SessionEvent::IntervalChanged(pipeline.state().scheduler.interval()))
                .ok();
        }
        SessionCommand::UpdateConfig(config) => {
            if let Err(err) = pipeline.update_config(config) {
                status(format!("config rejected: {err}"));
            }
        }
        SessionCommand::StartRecording(trial) => {
            match pipeline.start_recording(trial.as_deref()) {
                Ok(()) => {
                    tx.send(SessionEvent::Recording(true)).ok();
                }
                Err(err) => status(format!("cannot start recording: {err}")),
            }
        }
        SessionCommand::StopRecording => {
            if let Err(err) = pipeline.stop_recording() {
                status(format!("recording not saved cleanly: {err}"));
            }
            tx.send(SessionEvent::Recording(false)).ok();
        }
        // Consumed by the loop.
        SessionCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::{Chunk, ManualSource, NullSink, SimulatedSource};
    use ndarray::Array2;
    use std::time::Instant;

    fn wait_for(
        handle: &SessionHandle,
        seen: &mut Vec<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            seen.extend(handle.try_events());
            if seen.iter().any(&pred) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn chunk(n: usize) -> Chunk {
        Chunk::new(Array2::from_shape_fn((8, n), |(r, i)| {
            (i as f64 * 0.25 + r as f64).sin() * 10.0
        }))
    }

    #[test]
    fn streams_frames_after_connect() {
        let source = ManualSource::new(250.0, 8, vec![chunk(500), chunk(250)]);
        let handle = spawn_session(source, PipelineConfig::default(), NullSink).unwrap();
        handle.send(SessionCommand::Connect).unwrap();

        let mut seen = Vec::new();
        assert!(wait_for(&handle, &mut seen, |e| matches!(e, SessionEvent::Frame(_))));
        assert!(seen.contains(&SessionEvent::Streaming(true)));
        let frame = seen
            .iter()
            .find_map(|e| match e {
                SessionEvent::Frame(summary) => Some(summary.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(frame.channels, 8);
        assert!(frame.band_power.is_some());
        // Eight channels and heavy analysis slow the default 100 ms cadence.
        assert!(seen.contains(&SessionEvent::IntervalChanged(Duration::from_millis(150))));

        handle.send(SessionCommand::StopStream).unwrap();
        let rest = handle.shutdown();
        assert!(rest.contains(&SessionEvent::Status("session closed".into())));
    }

    #[test]
    fn failed_connect_is_reported_and_retryable() {
        let source = SimulatedSource::new(250.0, 8, 1).failing();
        let handle = spawn_session(source, PipelineConfig::default(), NullSink).unwrap();
        handle.send(SessionCommand::Connect).unwrap();
        handle.send(SessionCommand::Connect).unwrap();

        // Commands are drained in order before the shutdown is seen.
        let mut seen = handle.try_events();
        seen.extend(handle.shutdown());
        let failures = seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::Status(text) if text.starts_with("connect failed")))
            .count();
        assert_eq!(failures, 2);
        assert!(!seen.contains(&SessionEvent::Streaming(true)));
    }

    #[test]
    fn invalid_config_is_rejected_before_spawn() {
        let config = PipelineConfig {
            fps: 0,
            ..PipelineConfig::default()
        };
        let source = ManualSource::new(250.0, 8, Vec::new());
        assert!(spawn_session(source, config, NullSink).is_err());
    }
}
