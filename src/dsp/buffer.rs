use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

use crate::dsp::PipelineError;

/// Selected channel indices in display order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSet(Vec<usize>);

impl ChannelSet {
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &usize> {
        self.0.iter()
    }

    /// `Ch1`, `Ch2`, ... numbered from the board channel index.
    pub fn labels(&self) -> Vec<String> {
        self.0.iter().map(|idx| format!("Ch{}", idx + 1)).collect()
    }
}

/// Bounded sliding window over the selected channels (channels x samples).
pub struct SampleBuffer {
    data: Array2<f64>,
    channels: ChannelSet,
    max_samples: usize,
}

impl SampleBuffer {
    pub fn new(max_samples: usize) -> Self {
        Self {
            data: Array2::zeros((0, 0)),
            channels: ChannelSet::default(),
            max_samples: max_samples.max(1),
        }
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Live window; callers only get a view.
    pub fn current(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Appends `chunk` (rows already ordered like `channels`). A change of
    /// selection discards everything held so far and reseeds from `chunk`.
    pub fn append(
        &mut self,
        chunk: ArrayView2<'_, f64>,
        channels: &ChannelSet,
    ) -> Result<(), PipelineError> {
        if chunk.nrows() != channels.len() {
            return Err(PipelineError::InvalidInput(format!(
                "chunk has {} rows but {} channels are selected",
                chunk.nrows(),
                channels.len()
            )));
        }
        if chunk.ncols() == 0 {
            return Ok(());
        }
        if *channels != self.channels || self.data.nrows() != chunk.nrows() {
            log::debug!(
                "channel selection changed {:?} -> {:?}; buffer reset",
                self.channels.as_slice(),
                channels.as_slice()
            );
            self.channels = channels.clone();
            self.data = chunk.to_owned();
        } else {
            self.data = concatenate(Axis(1), &[self.data.view(), chunk.view()]).map_err(|e| {
                PipelineError::InvalidInput(format!("cannot append chunk: {e}"))
            })?;
        }
        self.trim();
        Ok(())
    }

    /// Resizes the window; the oldest samples go first.
    pub fn set_max_samples(&mut self, max_samples: usize) {
        self.max_samples = max_samples.max(1);
        self.trim();
    }

    pub fn clear(&mut self) {
        self.data = Array2::zeros((0, 0));
        self.channels = ChannelSet::default();
    }

    fn trim(&mut self) {
        let len = self.data.ncols();
        if len > self.max_samples {
            let start = len - self.max_samples;
            self.data = self.data.slice(s![.., start..]).to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp(rows: usize, cols: usize, start: f64) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| start + c as f64 + 1000.0 * r as f64)
    }

    #[test]
    fn never_exceeds_window() {
        let channels = ChannelSet::new(vec![0, 1]);
        let mut buffer = SampleBuffer::new(100);
        let mut next = 0.0;
        for cols in [30, 1, 64, 0, 99, 250, 7] {
            buffer.append(ramp(2, cols, next).view(), &channels).unwrap();
            next += cols as f64;
            assert!(buffer.len() <= buffer.max_samples());
        }
        assert_eq!(buffer.len(), 100);
        // Newest sample is last, oldest were dropped first.
        let view = buffer.current();
        assert_eq!(view[[0, 99]], next - 1.0);
        assert_eq!(view[[0, 0]], next - 100.0);
    }

    #[test]
    fn selection_change_drops_stale_history() {
        let mut buffer = SampleBuffer::new(1000);
        buffer
            .append(ramp(2, 50, 0.0).view(), &ChannelSet::new(vec![0, 1]))
            .unwrap();
        let three = ChannelSet::new(vec![0, 1, 2]);
        buffer.append(ramp(3, 10, 500.0).view(), &three).unwrap();
        assert_eq!(buffer.current().dim(), (3, 10));
        assert_eq!(buffer.current()[[0, 0]], 500.0);
        assert_eq!(buffer.channels(), &three);

        // Same cardinality, different channels: still a reset.
        let other = ChannelSet::new(vec![4, 5, 6]);
        buffer.append(ramp(3, 5, 900.0).view(), &other).unwrap();
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn empty_chunk_is_noop() {
        let channels = ChannelSet::new(vec![3]);
        let mut buffer = SampleBuffer::new(10);
        buffer.append(ramp(1, 4, 0.0).view(), &channels).unwrap();
        buffer.append(ramp(1, 0, 0.0).view(), &channels).unwrap();
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn shrinking_window_trims_front() {
        let channels = ChannelSet::new(vec![0]);
        let mut buffer = SampleBuffer::new(10);
        buffer.append(ramp(1, 10, 0.0).view(), &channels).unwrap();
        buffer.set_max_samples(4);
        assert_eq!(buffer.current().row(0).to_vec(), vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn row_count_must_match_selection() {
        let mut buffer = SampleBuffer::new(10);
        let err = buffer
            .append(ramp(2, 3, 0.0).view(), &ChannelSet::new(vec![0]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::dsp::ErrorKind::InvalidInput);
    }
}
