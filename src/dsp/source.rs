use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dsp::{ChannelSet, PipelineError};

/// Ring capacity requested from the board when streaming starts.
pub const DEFAULT_RING_CAPACITY: usize = 45_000;

/// Rectangular block of raw samples, appended atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub samples: Array2<f64>, // channels x samples
}

impl Chunk {
    pub fn new(samples: Array2<f64>) -> Self {
        Self { samples }
    }

    pub fn empty(num_channels: usize) -> Self {
        Self {
            samples: Array2::zeros((num_channels, 0)),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.samples.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.samples.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Picks rows in `channels` order.
    pub fn select(&self, channels: &ChannelSet) -> Result<Array2<f64>, PipelineError> {
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.num_channels()) {
            return Err(PipelineError::InvalidInput(format!(
                "channel {bad} not available (source has {})",
                self.num_channels()
            )));
        }
        Ok(self.samples.select(Axis(0), channels.as_slice()))
    }
}

/// External acquisition device. `get_new_samples` must never block.
pub trait AcquisitionSource {
    fn prepare(&mut self) -> Result<(), PipelineError>;
    fn start(&mut self, buffer_capacity: usize) -> Result<(), PipelineError>;
    fn sampling_rate(&self) -> f64;
    fn channel_indices(&self) -> &[usize];
    fn get_new_samples(&mut self) -> Result<Chunk, PipelineError>;
    fn stop(&mut self) -> Result<(), PipelineError>;
}

impl<S: AcquisitionSource + ?Sized> AcquisitionSource for Box<S> {
    fn prepare(&mut self) -> Result<(), PipelineError> {
        (**self).prepare()
    }
    fn start(&mut self, buffer_capacity: usize) -> Result<(), PipelineError> {
        (**self).start(buffer_capacity)
    }
    fn sampling_rate(&self) -> f64 {
        (**self).sampling_rate()
    }
    fn channel_indices(&self) -> &[usize] {
        (**self).channel_indices()
    }
    fn get_new_samples(&mut self) -> Result<Chunk, PipelineError> {
        (**self).get_new_samples()
    }
    fn stop(&mut self) -> Result<(), PipelineError> {
        (**self).stop()
    }
}

/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<Chunk>,
    sample_rate_hz: f64,
    channels: Vec<usize>,
    started: bool,
}

impl ManualSource {
    pub fn new(sample_rate_hz: f64, num_channels: usize, chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            queue: chunks.into_iter().collect(),
            sample_rate_hz,
            channels: (0..num_channels).collect(),
            started: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl AcquisitionSource for ManualSource {
    fn prepare(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn start(&mut self, _buffer_capacity: usize) -> Result<(), PipelineError> {
        self.started = true;
        Ok(())
    }

    fn sampling_rate(&self) -> f64 {
        self.sample_rate_hz
    }

    fn channel_indices(&self) -> &[usize] {
        &self.channels
    }

    fn get_new_samples(&mut self) -> Result<Chunk, PipelineError> {
        if !self.started {
            return Err(PipelineError::NotStreaming);
        }
        Ok(self
            .queue
            .pop_front()
            .unwrap_or_else(|| Chunk::empty(self.channels.len())))
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        self.started = false;
        Ok(())
    }
}

/// How many samples a pull of [`SimulatedSource`] yields.
#[derive(Clone, Copy, Debug)]
enum Pacing {
    WallClock,
    Fixed(usize),
}

/// Synthetic board: alpha rhythm + mains hum + electrode offset + noise.
pub struct SimulatedSource {
    sample_rate_hz: f64,
    channels: Vec<usize>,
    pacing: Pacing,
    rng: StdRng,
    sample_index: u64,
    last_pull: Option<Instant>,
    ring_capacity: usize,
    prepared: bool,
    streaming: bool,
    fail_prepare: bool,
}

impl SimulatedSource {
    pub fn new(sample_rate_hz: f64, num_channels: usize, seed: u64) -> Self {
        Self {
            sample_rate_hz,
            channels: (0..num_channels).collect(),
            pacing: Pacing::WallClock,
            rng: StdRng::seed_from_u64(seed),
            sample_index: 0,
            last_pull: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            prepared: false,
            streaming: false,
            fail_prepare: false,
        }
    }

    /// Every pull yields exactly `samples` columns, independent of time.
    pub fn fixed_chunk(mut self, samples: usize) -> Self {
        self.pacing = Pacing::Fixed(samples);
        self
    }

    /// Simulates an unplugged board.
    pub fn failing(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Whole samples elapsed since the last pull. The clock only advances by
    /// the time those samples cover, so the remainder counts next pull.
    fn samples_due(&mut self, now: Instant) -> usize {
        let last = self.last_pull.unwrap_or(now);
        let due = (now.saturating_duration_since(last).as_secs_f64() * self.sample_rate_hz) as usize;
        if due > 0 {
            self.last_pull = Some(last + Duration::from_secs_f64(due as f64 / self.sample_rate_hz));
        }
        due
    }

    fn synthesize(&mut self, count: usize) -> Array2<f64> {
        let fs = self.sample_rate_hz;
        let start = self.sample_index;
        let rng = &mut self.rng;
        let samples = Array2::from_shape_fn((self.channels.len(), count), |(ch, i)| {
            let t = (start + i as u64) as f64 / fs;
            let alpha_hz = 9.0 + ch as f64 * 0.5;
            let alpha = 20.0 * (2.0 * PI * alpha_hz * t).sin();
            let mains = 8.0 * (2.0 * PI * 60.0 * t).sin();
            let offset = 100.0 + 25.0 * ch as f64;
            let noise: f64 = rng.gen_range(-5.0..5.0);
            alpha + mains + offset + noise
        });
        self.sample_index += count as u64;
        samples
    }
}

impl AcquisitionSource for SimulatedSource {
    fn prepare(&mut self) -> Result<(), PipelineError> {
        if self.fail_prepare {
            return Err(PipelineError::Acquisition(
                "simulated board did not answer".into(),
            ));
        }
        self.prepared = true;
        Ok(())
    }

    fn start(&mut self, buffer_capacity: usize) -> Result<(), PipelineError> {
        if !self.prepared {
            return Err(PipelineError::Acquisition("session not prepared".into()));
        }
        self.ring_capacity = buffer_capacity.max(1);
        self.streaming = true;
        self.last_pull = Some(Instant::now());
        Ok(())
    }

    fn sampling_rate(&self) -> f64 {
        self.sample_rate_hz
    }

    fn channel_indices(&self) -> &[usize] {
        &self.channels
    }

    fn get_new_samples(&mut self) -> Result<Chunk, PipelineError> {
        if !self.streaming {
            return Err(PipelineError::NotStreaming);
        }
        let count = match self.pacing {
            Pacing::Fixed(n) => n,
            Pacing::WallClock => self.samples_due(Instant::now()),
        };
        // The board ring drops the oldest packets once full.
        let count = count.min(self.ring_capacity);
        Ok(Chunk::new(self.synthesize(count)))
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        self.streaming = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn manual_source_drains_to_empty_chunks() {
        let chunk = Chunk::new(array![[1.0, 2.0], [3.0, 4.0]]);
        let mut source = ManualSource::new(250.0, 2, vec![chunk.clone()]);
        assert!(source.get_new_samples().is_err());
        source.start(DEFAULT_RING_CAPACITY).unwrap();
        assert_eq!(source.get_new_samples().unwrap(), chunk);
        let next = source.get_new_samples().unwrap();
        assert!(next.is_empty());
        assert_eq!(next.num_channels(), 2);
    }

    #[test]
    fn select_reorders_rows() {
        let chunk = Chunk::new(array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]);
        let picked = chunk.select(&ChannelSet::new(vec![2, 0])).unwrap();
        assert_eq!(picked, array![[3.0, 3.0], [1.0, 1.0]]);
        assert!(chunk.select(&ChannelSet::new(vec![3])).is_err());
    }

    #[test]
    fn simulated_source_is_seeded_and_shaped() {
        let mut a = SimulatedSource::new(250.0, 4, 7).fixed_chunk(50);
        let mut b = SimulatedSource::new(250.0, 4, 7).fixed_chunk(50);
        for source in [&mut a, &mut b] {
            source.prepare().unwrap();
            source.start(DEFAULT_RING_CAPACITY).unwrap();
        }
        let ca = a.get_new_samples().unwrap();
        assert_eq!(ca.samples.dim(), (4, 50));
        assert_eq!(ca, b.get_new_samples().unwrap());
    }

    #[test]
    fn wall_clock_pacing_keeps_fractional_samples() {
        let mut source = SimulatedSource::new(100.0, 1, 2);
        source.prepare().unwrap();
        source.start(DEFAULT_RING_CAPACITY).unwrap();
        let t0 = Instant::now();
        source.last_pull = Some(t0);
        // 15 ms at 100 Hz is 1.5 samples, 35 ms is 3.5.
        assert_eq!(source.samples_due(t0 + Duration::from_millis(15)), 1);
        assert_eq!(source.samples_due(t0 + Duration::from_millis(35)), 2);
        assert_eq!(source.samples_due(t0 + Duration::from_millis(35)), 0);
    }

    #[test]
    fn failing_board_reports_acquisition_error() {
        let mut source = SimulatedSource::new(250.0, 8, 1).failing();
        let err = source.prepare().unwrap_err();
        assert_eq!(err.kind(), crate::dsp::ErrorKind::Acquisition);
        assert!(source.start(DEFAULT_RING_CAPACITY).is_err());
    }
}
