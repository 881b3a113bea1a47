use std::path::PathBuf;
use std::time::Duration;

use ndarray::Array2;

use crate::config::PipelineConfig;
use crate::dsp::filter::{FilterBank, FilteredWindow};
use crate::dsp::source::{AcquisitionSource, DEFAULT_RING_CAPACITY};
use crate::dsp::spectrum::{compute_band_power, BandPower, PsdResult, SpectralAnalyzer};
use crate::dsp::{ChannelSet, PipelineError, SampleBuffer, UpdateScheduler};
use crate::recorder::DataRecorder;

/// Selections above this count make a tick "many channels".
pub const MANY_CHANNELS: usize = 4;

/// Everything one tick produced, handed read-only to display sinks.
#[derive(Clone, Debug)]
pub struct TickFrame {
    pub sample_rate_hz: f64,
    pub channel_labels: Vec<String>,
    /// Seconds from the start of the window.
    pub time_axis: Vec<f64>,
    /// Filtered (or raw, when filtering is off) window; `None` when the
    /// time-domain view is disabled.
    pub time_domain: Option<Array2<f64>>,
    pub psd: Option<PsdResult>,
    pub band_power: Option<BandPower>,
    pub buffered_samples: usize,
    pub filtered: bool,
    pub skipped_channels: Vec<usize>,
}

impl TickFrame {
    pub fn summary(&self) -> TickSummary {
        TickSummary {
            buffered_samples: self.buffered_samples,
            channels: self.channel_labels.len(),
            filtered: self.filtered,
            skipped_channels: self.skipped_channels.clone(),
            band_power: self.band_power,
        }
    }
}

/// Lightweight per-tick digest for status displays and logs.
#[derive(Clone, Debug, PartialEq)]
pub struct TickSummary {
    pub buffered_samples: usize,
    pub channels: usize,
    pub filtered: bool,
    pub skipped_channels: Vec<usize>,
    pub band_power: Option<BandPower>,
}

/// Display collaborator. Sinks only read frames.
pub trait DisplaySink {
    fn present(&mut self, frame: &TickFrame);
}

impl<D: DisplaySink + ?Sized> DisplaySink for Box<D> {
    fn present(&mut self, frame: &TickFrame) {
        (**self).present(frame)
    }
}

/// Sink that discards frames.
#[derive(Debug, Default)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn present(&mut self, _frame: &TickFrame) {}
}

/// Outcome of a tick that ran.
#[derive(Debug)]
pub struct TickReport {
    pub frame: Option<TickFrame>,
    /// New timer interval, only when it changed.
    pub rescheduled: Option<Duration>,
    /// Non-fatal problems (e.g. a recording that had to be closed).
    pub issues: Vec<PipelineError>,
}

/// Session state that survives between ticks.
pub struct PipelineState {
    pub config: PipelineConfig,
    pub buffer: SampleBuffer,
    pub filters: FilterBank,
    pub scheduler: UpdateScheduler,
    pub streaming: bool,
    pub sample_rate_hz: Option<f64>,
}

impl PipelineState {
    fn new(config: PipelineConfig) -> Self {
        let scheduler = UpdateScheduler::new(config.fps);
        Self {
            config,
            buffer: SampleBuffer::new(1),
            filters: FilterBank::new(),
            scheduler,
            streaming: false,
            sample_rate_hz: None,
        }
    }

    pub fn channel_set(&self) -> ChannelSet {
        ChannelSet::new(self.config.channel_selection.clone())
    }
}

/// Composition root: source -> buffer -> filters -> spectra -> sinks.
pub struct Pipeline<S: AcquisitionSource> {
    source: S,
    state: PipelineState,
    analyzer: SpectralAnalyzer,
    recorder: DataRecorder,
}

impl<S: AcquisitionSource> Pipeline<S> {
    pub fn new(source: S, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            source,
            state: PipelineState::new(config),
            analyzer: SpectralAnalyzer::new(),
            recorder: DataRecorder::new(),
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_connected(&self) -> bool {
        self.state.sample_rate_hz.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Prepares the board session and starts streaming into it.
    pub fn connect(&mut self) -> Result<(), PipelineError> {
        self.source.prepare()?;
        self.source.start(DEFAULT_RING_CAPACITY)?;
        let fs = self.source.sampling_rate();
        if !(fs > 0.0) {
            return Err(PipelineError::Acquisition(format!(
                "board reported sampling rate {fs}"
            )));
        }
        self.state.sample_rate_hz = Some(fs);
        self.state
            .buffer
            .set_max_samples(self.state.config.time_window().max_samples(fs));
        self.state.scheduler.reset(self.state.config.fps);
        self.state.streaming = true;
        log::info!(
            "streaming at {fs} Hz, {} board channels",
            self.source.channel_indices().len()
        );
        Ok(())
    }

    /// Pauses or resumes ticking. Buffer and filters keep their state.
    pub fn set_streaming(&mut self, streaming: bool) -> Result<(), PipelineError> {
        if streaming && !self.is_connected() {
            return Err(PipelineError::NotStreaming);
        }
        self.state.streaming = streaming;
        Ok(())
    }

    /// Rejects selected channels the connected board does not have.
    fn check_selection(&self, selection: &[usize]) -> Result<(), PipelineError> {
        if !self.is_connected() {
            return Ok(());
        }
        let available = self.source.channel_indices().len();
        match selection.iter().find(|&&c| c >= available) {
            Some(bad) => Err(PipelineError::InvalidInput(format!(
                "channel {bad} not available (source has {available})"
            ))),
            None => Ok(()),
        }
    }

    pub fn update_config(&mut self, config: PipelineConfig) -> Result<(), PipelineError> {
        config.validate()?;
        self.check_selection(&config.channel_selection)?;
        if config.fps != self.state.config.fps {
            self.state.scheduler.reset(config.fps);
        }
        if let Some(fs) = self.state.sample_rate_hz {
            self.state
                .buffer
                .set_max_samples(config.time_window().max_samples(fs));
        }
        self.state.config = config;
        Ok(())
    }

    pub fn start_recording(&mut self, trial: Option<&str>) -> Result<(), PipelineError> {
        let fs = self.state.sample_rate_hz.ok_or(PipelineError::NotStreaming)?;
        let trial = trial.unwrap_or(&self.state.config.trial_name).to_owned();
        let dir: PathBuf = self.state.config.results_dir.clone();
        let channels = self.state.channel_set();
        self.recorder.start(&dir, &trial, &channels, fs)
    }

    pub fn stop_recording(&mut self) -> Result<(), PipelineError> {
        self.recorder.stop()
    }

    /// Stops streaming and drops buffered data and cached designs.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        self.state.streaming = false;
        self.state.buffer.clear();
        self.state.filters.clear();
        self.state.scheduler.reset(self.state.config.fps);
        self.recorder.stop()
    }

    /// Closes the recording, then the board session.
    pub fn disconnect(&mut self) -> Result<(), PipelineError> {
        self.state.streaming = false;
        let recording = self.recorder.stop();
        let board = if self.is_connected() {
            self.source.stop()
        } else {
            Ok(())
        };
        self.state.sample_rate_hz = None;
        recording.and(board)
    }

    /// One cadence step. `Ok(None)` means streaming is stopped and nothing ran.
    pub fn tick(&mut self, sink: &mut dyn DisplaySink) -> Result<Option<TickReport>, PipelineError> {
        if !self.state.streaming {
            return Ok(None);
        }
        self.state.config.validate()?;
        // Checked before the pull so a bad selection never costs a chunk.
        self.check_selection(&self.state.config.channel_selection)?;
        let fs = self.state.sample_rate_hz.ok_or(PipelineError::NotStreaming)?;
        let config = &self.state.config;
        let heavy = config.heavy_analysis();
        let channels = self.state.channel_set();
        let many_channels = channels.len() > MANY_CHANNELS;

        let chunk = self.source.get_new_samples()?;
        if chunk.is_empty() {
            let rescheduled = self.state.scheduler.update(heavy, many_channels);
            return Ok(Some(TickReport {
                frame: None,
                rescheduled,
                issues: Vec::new(),
            }));
        }

        let selected = chunk.select(&channels)?;
        self.state.buffer.append(selected.view(), &channels)?;

        let mut issues = Vec::new();
        if let Err(err) = self.recorder.write_raw(chunk.samples.view()) {
            issues.push(err);
        }

        let config = &self.state.config;
        let window = self.state.buffer.current();
        let FilteredWindow {
            samples,
            skipped_channels,
        } = if config.filtering_enabled {
            self.state.filters.apply(window, fs, &config.filters)?
        } else {
            FilteredWindow {
                samples: window.to_owned(),
                skipped_channels: Vec::new(),
            }
        };

        // One PSD per tick, shared by the spectrum view and band power.
        let psd = heavy.then(|| self.analyzer.compute_psd(samples.view(), fs, config.nperseg));
        let band_power = match (&psd, config.band_power_enabled) {
            (Some(psd), true) => Some(compute_band_power(&psd.freqs, psd.power.view())),
            _ => None,
        };
        if let Some(power) = &band_power {
            if let Err(err) = self.recorder.write_band_power(power) {
                issues.push(err);
            }
        }

        let buffered_samples = samples.ncols();
        let frame = TickFrame {
            sample_rate_hz: fs,
            channel_labels: channels.labels(),
            time_axis: (0..buffered_samples).map(|i| i as f64 / fs).collect(),
            time_domain: config.time_domain_enabled.then_some(samples),
            psd: if config.spectral_display_enabled { psd } else { None },
            band_power,
            buffered_samples,
            filtered: config.filtering_enabled,
            skipped_channels,
        };
        sink.present(&frame);

        let rescheduled = self.state.scheduler.update(heavy, many_channels);
        log::debug!(
            "tick: {} new samples, window {buffered_samples}, interval {:?}",
            chunk.num_samples(),
            self.state.scheduler.interval()
        );
        Ok(Some(TickReport {
            frame: Some(frame),
            rescheduled,
            issues,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::source::{Chunk, ManualSource, SimulatedSource};
    use crate::dsp::{Band, ErrorKind};
    use std::f64::consts::PI;

    const FS: f64 = 250.0;

    #[derive(Default)]
    struct CollectSink {
        frames: Vec<TickFrame>,
    }

    impl DisplaySink for CollectSink {
        fn present(&mut self, frame: &TickFrame) {
            self.frames.push(frame.clone());
        }
    }

    /// 10 Hz (50) + 60 Hz (20) + DC 100, identical on every board channel.
    fn mixed_chunk(channels: usize, start: usize, len: usize) -> Chunk {
        Chunk::new(Array2::from_shape_fn((channels, len), |(_, i)| {
            let t = (start + i) as f64 / FS;
            50.0 * (2.0 * PI * 10.0 * t).sin() + 20.0 * (2.0 * PI * 60.0 * t).sin() + 100.0
        }))
    }

    fn amplitude(signal: &[f64], freq: f64) -> f64 {
        let (mut re, mut im) = (0.0, 0.0);
        for (i, v) in signal.iter().enumerate() {
            let phase = 2.0 * PI * freq * i as f64 / FS;
            re += v * phase.cos();
            im += v * phase.sin();
        }
        2.0 * re.hypot(im) / signal.len() as f64
    }

    fn config(channels: Vec<usize>) -> PipelineConfig {
        PipelineConfig {
            channel_selection: channels,
            ..PipelineConfig::default()
        }
    }

    fn connected(chunks: Vec<Chunk>, config: PipelineConfig) -> Pipeline<ManualSource> {
        let source = ManualSource::new(FS, 8, chunks);
        let mut pipeline = Pipeline::new(source, config).unwrap();
        pipeline.connect().unwrap();
        pipeline
    }

    #[test]
    fn end_to_end_cleans_window() {
        let chunks: Vec<Chunk> = (0..30).map(|k| mixed_chunk(8, k * 50, 50)).collect();
        let mut pipeline = connected(chunks, config(vec![0, 1]));
        let mut sink = CollectSink::default();
        for _ in 0..30 {
            pipeline.tick(&mut sink).unwrap();
            assert!(pipeline.state().buffer.len() <= 1250);
        }
        let frame = sink.frames.last().unwrap();
        assert_eq!(frame.buffered_samples, 1250);
        assert_eq!(frame.channel_labels, ["Ch1", "Ch2"]);
        let trace = frame.time_domain.as_ref().unwrap().row(0).to_vec();
        let mean = trace.iter().sum::<f64>() / trace.len() as f64;
        assert!(mean.abs() < 2.0, "mean {mean}");
        let mid = &trace[250..1000];
        assert!(amplitude(mid, 60.0) < 2.0);
        assert!(amplitude(mid, 10.0) > 50.0 * 10f64.powf(-2.0 / 20.0) * 0.98);

        let bands = frame.band_power.unwrap();
        let alpha = bands.get(Band::Alpha);
        assert!(bands.iter().all(|(_, p)| p >= 0.0));
        assert!(bands.iter().all(|(b, p)| b == Band::Alpha || p < alpha));
        let psd = frame.psd.as_ref().unwrap();
        assert_eq!(psd.nperseg, 250);
    }

    #[test]
    fn stopped_stream_is_a_noop() {
        let mut pipeline = connected(vec![mixed_chunk(8, 0, 100)], config(vec![0]));
        pipeline.set_streaming(false).unwrap();
        assert!(pipeline.tick(&mut NullSink).unwrap().is_none());
        assert_eq!(pipeline.source().remaining(), 1);
        pipeline.set_streaming(true).unwrap();
        assert!(pipeline.tick(&mut NullSink).unwrap().is_some());
        assert_eq!(pipeline.state().buffer.len(), 100);
    }

    #[test]
    fn empty_read_only_reschedules() {
        let mut cfg = config((0..8).collect());
        cfg.fps = 10;
        let mut pipeline = connected(Vec::new(), cfg);
        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        assert!(report.frame.is_none());
        assert_eq!(report.rescheduled, Some(Duration::from_millis(150)));
        assert!(pipeline.state().buffer.is_empty());
    }

    #[test]
    fn cadence_follows_load() {
        let chunks: Vec<Chunk> = (0..3).map(|k| mixed_chunk(8, k * 10, 10)).collect();
        let mut pipeline = connected(chunks, config(vec![0, 1]));
        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        assert_eq!(report.rescheduled, Some(Duration::from_millis(120)));

        let mut light = config(vec![0, 1]);
        light.spectral_display_enabled = false;
        light.band_power_enabled = false;
        pipeline.update_config(light).unwrap();
        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        assert_eq!(report.rescheduled, Some(Duration::from_millis(100)));
        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        assert_eq!(report.rescheduled, None);
        assert!(report.frame.unwrap().psd.is_none());
    }

    #[test]
    fn short_window_passes_through_unfiltered() {
        let mut pipeline = connected(vec![mixed_chunk(8, 0, 10)], config(vec![3]));
        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        let frame = report.frame.unwrap();
        assert_eq!(frame.skipped_channels, vec![0]);
        let trace = frame.time_domain.unwrap();
        assert_eq!(trace, mixed_chunk(1, 0, 10).samples);
        // Ten samples still give a (coarse) spectrum.
        assert_eq!(frame.psd.unwrap().nperseg, 10);
    }

    #[test]
    fn channel_change_restarts_window() {
        let chunks: Vec<Chunk> = (0..4).map(|k| mixed_chunk(8, k * 100, 100)).collect();
        let mut pipeline = connected(chunks, config(vec![0, 1]));
        pipeline.tick(&mut NullSink).unwrap();
        pipeline.tick(&mut NullSink).unwrap();
        assert_eq!(pipeline.state().buffer.current().dim(), (2, 200));

        pipeline.update_config(config(vec![0, 1, 2])).unwrap();
        pipeline.tick(&mut NullSink).unwrap();
        assert_eq!(pipeline.state().buffer.current().dim(), (3, 100));
        let expected = mixed_chunk(3, 200, 100).samples;
        assert_eq!(pipeline.state().buffer.current(), expected.view());
    }

    #[test]
    fn invalid_selection_skips_tick() {
        let mut pipeline = connected(vec![mixed_chunk(8, 0, 10)], config(vec![0]));
        let mut bad = pipeline.state().config.clone();
        bad.channel_selection.clear();
        assert!(pipeline.update_config(bad.clone()).is_err());

        pipeline.state.config = bad;
        let err = pipeline.tick(&mut NullSink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        // Nothing was pulled from the board.
        assert_eq!(pipeline.source().remaining(), 1);

        let mut out_of_range = config(vec![9]);
        out_of_range.fps = 10;
        let err = pipeline.update_config(out_of_range).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn out_of_range_selection_keeps_board_data() {
        let chunks = vec![
            Chunk::new(Array2::from_elem((8, 40), 1.0)),
            Chunk::new(Array2::from_elem((8, 40), 2.0)),
        ];
        let mut pipeline = connected(chunks, config(vec![0]));
        pipeline.state.config = config(vec![9]);
        let err = pipeline.tick(&mut NullSink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(pipeline.source().remaining(), 2);

        pipeline.update_config(config(vec![0])).unwrap();
        pipeline.tick(&mut NullSink).unwrap();
        let window = pipeline.state().buffer.current();
        assert_eq!(window.dim(), (1, 40));
        assert_eq!(window[[0, 0]], 1.0);
    }

    #[test]
    fn recording_writes_rows_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![0, 1]);
        cfg.results_dir = dir.path().to_path_buf();
        cfg.trial_name = "baseline".into();
        let chunks: Vec<Chunk> = (0..3).map(|k| mixed_chunk(8, k * 50, 50)).collect();
        let mut pipeline = connected(chunks, cfg);
        pipeline.start_recording(None).unwrap();
        for _ in 0..3 {
            let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
            assert!(report.issues.is_empty());
        }
        pipeline.stop_recording().unwrap();
        let raw = std::fs::read_to_string(dir.path().join("baseline_raw.csv")).unwrap();
        assert_eq!(raw.lines().count(), 1 + 150);
        let power = std::fs::read_to_string(dir.path().join("baseline_power.csv")).unwrap();
        assert_eq!(power.lines().count(), 1 + 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn disk_full_closes_recording_and_keeps_ticking() {
        let dir = tempfile::tempdir().unwrap();
        // Every write to /dev/full fails with ENOSPC once the buffers flush.
        std::os::unix::fs::symlink("/dev/full", dir.path().join("full_raw.csv")).unwrap();
        let mut cfg = config((0..8).collect());
        cfg.results_dir = dir.path().to_path_buf();
        cfg.trial_name = "full".into();
        let chunks: Vec<Chunk> = (0..2).map(|k| mixed_chunk(8, k * 2000, 2000)).collect();
        let mut pipeline = connected(chunks, cfg);
        pipeline.start_recording(None).unwrap();
        assert!(pipeline.is_recording());

        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        assert!(report.frame.is_some());
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind(), ErrorKind::Persistence);
        assert!(!pipeline.is_recording());

        let report = pipeline.tick(&mut NullSink).unwrap().unwrap();
        assert!(report.issues.is_empty());
    }

    #[test]
    fn reset_clears_session_state() {
        let mut pipeline = connected(vec![mixed_chunk(8, 0, 300)], config(vec![0]));
        pipeline.tick(&mut NullSink).unwrap();
        assert!(!pipeline.state().buffer.is_empty());
        pipeline.reset().unwrap();
        assert!(pipeline.state().buffer.is_empty());
        assert!(!pipeline.state().streaming);
        assert!(pipeline.tick(&mut NullSink).unwrap().is_none());
    }

    #[test]
    fn failed_prepare_is_reported() {
        let source = SimulatedSource::new(FS, 8, 3).failing();
        let mut pipeline = Pipeline::new(source, PipelineConfig::default()).unwrap();
        let err = pipeline.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Acquisition);
        assert!(!pipeline.is_connected());
        assert!(pipeline.set_streaming(true).is_err());
    }
}
