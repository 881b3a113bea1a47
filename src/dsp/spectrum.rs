use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2, Axis};
use rustfft::{num_complex::Complex64, FftPlanner};

/// One-sided power spectral density per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct PsdResult {
    pub sample_rate_hz: f64,
    pub nperseg: usize,
    pub freqs: Vec<f64>,
    pub power: Array2<f64>, // channel -> bins, aligned to `freqs`
}

impl PsdResult {
    pub fn resolution_hz(&self) -> f64 {
        if self.nperseg == 0 {
            0.0
        } else {
            self.sample_rate_hz / self.nperseg as f64
        }
    }

    /// Row-wise mean across channels.
    pub fn mean_power(&self) -> Vec<f64> {
        self.power
            .mean_axis(Axis(0))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec![0.0; self.freqs.len()])
    }
}

/// Canonical EEG bands, in output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::Delta, Band::Theta, Band::Alpha, Band::Beta, Band::Gamma];

    pub fn range_hz(self) -> (f64, f64) {
        match self {
            Band::Delta => (1.0, 4.0),
            Band::Theta => (4.0, 8.0),
            Band::Alpha => (8.0, 13.0),
            Band::Beta => (13.0, 30.0),
            Band::Gamma => (30.0, 100.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Band::Delta => "Delta",
            Band::Theta => "Theta",
            Band::Alpha => "Alpha",
            Band::Beta => "Beta",
            Band::Gamma => "Gamma",
        }
    }
}

/// Integrated power per band, indexed like [`Band::ALL`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BandPower(pub [f64; 5]);

impl BandPower {
    pub fn get(&self, band: Band) -> f64 {
        let idx = Band::ALL.iter().position(|b| *b == band).unwrap_or(0);
        self.0[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Band, f64)> + '_ {
        Band::ALL.iter().copied().zip(self.0.iter().copied())
    }
}

/// Welch estimator: Hann segments, 50% overlap, per-segment mean removal,
/// density scaling.
pub struct SpectralAnalyzer {
    planner: FftPlanner<f64>,
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Effective segment length: the override when it fits, otherwise
    /// `min(fs, available)`.
    pub fn segment_length(sample_rate_hz: f64, available: usize, nperseg: Option<usize>) -> usize {
        match nperseg {
            Some(n) if n > 0 && n <= available => n,
            _ => (sample_rate_hz.max(0.0) as usize).min(available),
        }
    }

    pub fn compute_psd(
        &mut self,
        window: ArrayView2<'_, f64>,
        sample_rate_hz: f64,
        nperseg: Option<usize>,
    ) -> PsdResult {
        let available = window.ncols();
        let nperseg = Self::segment_length(sample_rate_hz, available, nperseg);
        let bins = if nperseg == 0 { 0 } else { nperseg / 2 + 1 };
        let freqs: Vec<f64> = (0..bins)
            .map(|k| k as f64 * sample_rate_hz / nperseg as f64)
            .collect();
        let mut power = Array2::zeros((window.nrows(), bins));
        if nperseg == 0 {
            return PsdResult {
                sample_rate_hz,
                nperseg,
                freqs,
                power,
            };
        }

        let fft = self.planner.plan_fft_forward(nperseg);
        let taper = hann(nperseg);
        let scale = 1.0 / (sample_rate_hz * taper.iter().map(|w| w * w).sum::<f64>());
        let step = nperseg - nperseg / 2;
        let mut buffer = vec![Complex64::new(0.0, 0.0); nperseg];

        for (channel, mut out) in window.axis_iter(Axis(0)).zip(power.axis_iter_mut(Axis(0))) {
            // Short rows stay at zero.
            if channel.len() < nperseg {
                continue;
            }
            let samples: Vec<f64> = channel.iter().copied().collect();
            let segments = (samples.len() - nperseg / 2) / step;
            for seg in 0..segments {
                let chunk = &samples[seg * step..seg * step + nperseg];
                let mean = chunk.iter().sum::<f64>() / nperseg as f64;
                for ((slot, v), w) in buffer.iter_mut().zip(chunk).zip(&taper) {
                    *slot = Complex64::new((v - mean) * w, 0.0);
                }
                fft.process(&mut buffer);
                for (k, acc) in out.iter_mut().enumerate() {
                    let mut p = buffer[k].norm_sqr() * scale;
                    let nyquist_bin = nperseg % 2 == 0 && k == bins - 1;
                    if k != 0 && !nyquist_bin {
                        p *= 2.0;
                    }
                    *acc += p;
                }
            }
            if segments > 0 {
                out.mapv_inplace(|v| v / segments as f64);
            }
        }

        PsdResult {
            sample_rate_hz,
            nperseg,
            freqs,
            power,
        }
    }
}

/// Periodic Hann window.
fn hann(len: usize) -> Vec<f64> {
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / len as f64).cos())
        .collect()
}

/// Channel-averaged PSD integrated over each band (trapezoidal rule, bins
/// inside `[low, high]` inclusive).
pub fn compute_band_power(freqs: &[f64], power: ArrayView2<'_, f64>) -> BandPower {
    let mean: Vec<f64> = match power.mean_axis(Axis(0)) {
        Some(m) => m.to_vec(),
        None => return BandPower::default(),
    };
    let mut out = [0.0; 5];
    for (slot, band) in out.iter_mut().zip(Band::ALL) {
        let (low, high) = band.range_hz();
        let points: Vec<(f64, f64)> = freqs
            .iter()
            .zip(&mean)
            .filter(|(f, _)| **f >= low && **f <= high)
            .map(|(f, p)| (*f, *p))
            .collect();
        *slot = points
            .windows(2)
            .map(|w| (w[1].0 - w[0].0) * (w[0].1 + w[1].1) / 2.0)
            .sum();
    }
    BandPower(out)
}
