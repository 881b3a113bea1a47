//! Chebyshev Type I band-pass / band-stop design and zero-phase application.
//!
//! Designs follow the classic analog-prototype route: normalized low-pass
//! poles, frequency transform to band-pass or band-stop, bilinear transform
//! at a pre-warped edge pair. Filtering runs the cascade as second-order
//! sections (transposed direct form II) so narrow notches stay stable in
//! `f64`, forwards then backwards with odd-extension padding and
//! steady-state initial conditions.
use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2, Axis};
use rustfft::num_complex::Complex64;

use crate::config::{BandpassSpec, FilterSettings, NotchSpec};
use crate::dsp::PipelineError;

const IMAG_EPS: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3], // a[0] == 1
}

impl Biquad {
    /// DC gain, `B(1) / A(1)`.
    fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }

    /// State `[z1, z2]` the section settles to for a unit step input.
    fn step_state(&self) -> [f64; 2] {
        let g = self.dc_gain();
        let z2 = self.b[2] - self.a[2] * g;
        let z1 = self.b[1] + self.b[2] - (self.a[1] + self.a[2]) * g;
        [z1, z2]
    }

    fn run(&self, signal: &mut [f64], mut state: [f64; 2]) {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        for sample in signal.iter_mut() {
            let x = *sample;
            let y = b0 * x + state[0];
            state[0] = b1 * x - a1 * y + state[1];
            state[1] = b2 * x - a2 * y;
            *sample = y;
        }
    }
}

/// Designed IIR filter, kept both as polynomial coefficients and as the
/// cascade actually used for filtering.
#[derive(Clone, Debug, PartialEq)]
pub struct IirFilter {
    b: Vec<f64>,
    a: Vec<f64>,
    sections: Vec<Biquad>,
}

impl IirFilter {
    fn from_zpk(zeros: &[Complex64], poles: &[Complex64], gain: f64) -> Self {
        let b = poly(zeros).into_iter().map(|c| c * gain).collect();
        let a = poly(poles);
        let sections = pair_sections(zeros, poles, gain);
        Self { b, a, sections }
    }

    pub fn numerator(&self) -> &[f64] {
        &self.b
    }

    pub fn denominator(&self) -> &[f64] {
        &self.a
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Edge padding for forward-backward filtering; the signal must be
    /// strictly longer than this.
    pub fn padlen(&self) -> usize {
        3 * self.b.len().max(self.a.len())
    }

    /// Magnitude response at `freq_hz`.
    pub fn gain_at(&self, freq_hz: f64, sample_rate_hz: f64) -> f64 {
        let w = 2.0 * PI * freq_hz / sample_rate_hz;
        let z_inv = Complex64::from_polar(1.0, -w);
        let eval = |coeffs: &[f64]| {
            coeffs
                .iter()
                .rev()
                .fold(Complex64::new(0.0, 0.0), |acc, &c| acc * z_inv + c)
        };
        (eval(&self.b) / eval(&self.a)).norm()
    }

    /// Zero-phase filtering of one channel.
    pub fn filtfilt(&self, signal: &[f64]) -> Result<Vec<f64>, PipelineError> {
        let padlen = self.padlen();
        let n = signal.len();
        if n <= padlen {
            return Err(PipelineError::InsufficientData {
                needed: padlen,
                available: n,
            });
        }
        let mut ext = odd_extension(signal, padlen);
        let steady = self.step_states();
        self.run_cascade(&mut ext, &steady);
        ext.reverse();
        self.run_cascade(&mut ext, &steady);
        ext.reverse();
        Ok(ext[padlen..padlen + n].to_vec())
    }

    /// Per-section steady state for a unit step through the whole cascade.
    fn step_states(&self) -> Vec<[f64; 2]> {
        let mut scale = 1.0;
        self.sections
            .iter()
            .map(|section| {
                let [z1, z2] = section.step_state();
                let state = [scale * z1, scale * z2];
                scale *= section.dc_gain();
                state
            })
            .collect()
    }

    fn run_cascade(&self, signal: &mut [f64], steady: &[[f64; 2]]) {
        let x0 = signal.first().copied().unwrap_or(0.0);
        for (section, state) in self.sections.iter().zip(steady) {
            section.run(signal, [state[0] * x0, state[1] * x0]);
        }
    }
}

/// Chebyshev Type I band-pass between `low_hz` and `high_hz`.
pub fn design_bandpass(
    low_hz: f64,
    high_hz: f64,
    sample_rate_hz: f64,
    order: usize,
    ripple_db: f64,
) -> Result<IirFilter, PipelineError> {
    let (low, high) = normalized_edges(low_hz, high_hz, sample_rate_hz)?;
    let (poles, gain) = chebyshev1_prototype(order, ripple_db)?;
    let (wo, bw) = prewarp(low, high);
    let (zeros, poles, gain) = lowpass_to_bandpass(&poles, gain, wo, bw);
    let (zeros, poles, gain) = bilinear(&zeros, &poles, gain);
    Ok(IirFilter::from_zpk(&zeros, &poles, gain))
}

/// Chebyshev Type I band-stop with edges at `center ± bandwidth / 2`.
pub fn design_notch(
    sample_rate_hz: f64,
    center_hz: f64,
    bandwidth_hz: f64,
    order: usize,
    ripple_db: f64,
) -> Result<IirFilter, PipelineError> {
    let half = bandwidth_hz / 2.0;
    let (low, high) = normalized_edges(center_hz - half, center_hz + half, sample_rate_hz)?;
    let (poles, gain) = chebyshev1_prototype(order, ripple_db)?;
    let (wo, bw) = prewarp(low, high);
    let (zeros, poles, gain) = lowpass_to_bandstop(&poles, gain, wo, bw);
    let (zeros, poles, gain) = bilinear(&zeros, &poles, gain);
    Ok(IirFilter::from_zpk(&zeros, &poles, gain))
}

fn normalized_edges(
    low_hz: f64,
    high_hz: f64,
    sample_rate_hz: f64,
) -> Result<(f64, f64), PipelineError> {
    if !(sample_rate_hz > 0.0) {
        return Err(PipelineError::InvalidFilter(format!(
            "sample rate must be positive, got {sample_rate_hz}"
        )));
    }
    let nyquist = sample_rate_hz / 2.0;
    let (low, high) = (low_hz / nyquist, high_hz / nyquist);
    if !(0.0 < low && low < high && high < 1.0) {
        return Err(PipelineError::InvalidFilter(format!(
            "edges {low_hz}..{high_hz} Hz must satisfy 0 < low < high < {nyquist} Hz"
        )));
    }
    Ok((low, high))
}

/// Pre-warped center and bandwidth for a bilinear transform at fs = 2.
fn prewarp(low: f64, high: f64) -> (f64, f64) {
    let warp = |w: f64| 4.0 * (PI * w / 2.0).tan();
    let (low, high) = (warp(low), warp(high));
    ((low * high).sqrt(), high - low)
}

/// Poles and gain of the normalized analog low-pass prototype (no zeros).
fn chebyshev1_prototype(
    order: usize,
    ripple_db: f64,
) -> Result<(Vec<Complex64>, f64), PipelineError> {
    if order == 0 {
        return Err(PipelineError::InvalidFilter("order must be at least 1".into()));
    }
    if !(ripple_db > 0.0) {
        return Err(PipelineError::InvalidFilter(format!(
            "ripple must be positive, got {ripple_db} dB"
        )));
    }
    let n = order as f64;
    let eps = (10f64.powf(0.1 * ripple_db) - 1.0).sqrt();
    let mu = (1.0 / eps).asinh() / n;
    let poles: Vec<Complex64> = (0..order)
        .map(|i| {
            let m = 2.0 * i as f64 - n + 1.0;
            let theta = PI * m / (2.0 * n);
            -Complex64::new(mu, theta).sinh()
        })
        .collect();
    let mut gain = poles
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, p| acc * -p)
        .re;
    if order % 2 == 0 {
        gain /= (1.0 + eps * eps).sqrt();
    }
    Ok((poles, gain))
}

fn lowpass_to_bandpass(
    poles: &[Complex64],
    gain: f64,
    wo: f64,
    bw: f64,
) -> (Vec<Complex64>, Vec<Complex64>, f64) {
    let degree = poles.len();
    let scaled: Vec<Complex64> = poles.iter().map(|p| p * (bw / 2.0)).collect();
    let mut out = Vec::with_capacity(2 * degree);
    for sign in [1.0, -1.0] {
        out.extend(scaled.iter().map(|p| p + sign * (p * p - wo * wo).sqrt()));
    }
    let zeros = vec![Complex64::new(0.0, 0.0); degree];
    (zeros, out, gain * bw.powi(degree as i32))
}

fn lowpass_to_bandstop(
    poles: &[Complex64],
    gain: f64,
    wo: f64,
    bw: f64,
) -> (Vec<Complex64>, Vec<Complex64>, f64) {
    let degree = poles.len();
    let half_bw = Complex64::new(bw / 2.0, 0.0);
    let inverted: Vec<Complex64> = poles.iter().map(|p| half_bw / p).collect();
    let mut out = Vec::with_capacity(2 * degree);
    for sign in [1.0, -1.0] {
        out.extend(inverted.iter().map(|p| p + sign * (p * p - wo * wo).sqrt()));
    }
    let mut zeros = vec![Complex64::new(0.0, wo); degree];
    zeros.extend(std::iter::repeat(Complex64::new(0.0, -wo)).take(degree));
    let denom = poles
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, p| acc * -p);
    (zeros, out, gain * denom.inv().re)
}

/// Bilinear transform at fs = 2 (edges were pre-warped accordingly).
fn bilinear(
    zeros: &[Complex64],
    poles: &[Complex64],
    gain: f64,
) -> (Vec<Complex64>, Vec<Complex64>, f64) {
    let fs2 = Complex64::new(4.0, 0.0);
    let map = |s: &Complex64| (fs2 + s) / (fs2 - s);
    let mut z: Vec<Complex64> = zeros.iter().map(map).collect();
    let p: Vec<Complex64> = poles.iter().map(map).collect();
    z.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(poles.len() - zeros.len()));
    let num = zeros
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, s| acc * (fs2 - s));
    let den = poles
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, s| acc * (fs2 - s));
    (z, p, gain * (num / den).re)
}

/// Real coefficients of `prod (x - r)`, highest power first.
fn poly(roots: &[Complex64]) -> Vec<f64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for root in roots {
        let mut next = vec![Complex64::new(0.0, 0.0); coeffs.len() + 1];
        for (i, c) in coeffs.iter().enumerate() {
            next[i] += *c;
            next[i + 1] -= *c * *root;
        }
        coeffs = next;
    }
    coeffs.into_iter().map(|c| c.re).collect()
}

/// Groups roots into conjugate (or real) pairs.
fn root_pairs(roots: &[Complex64]) -> Vec<[Complex64; 2]> {
    let mut pairs: Vec<[Complex64; 2]> = roots
        .iter()
        .filter(|r| r.im > IMAG_EPS)
        .map(|r| [*r, r.conj()])
        .collect();
    let mut reals: Vec<f64> = roots
        .iter()
        .filter(|r| r.im.abs() <= IMAG_EPS)
        .map(|r| r.re)
        .collect();
    reals.sort_by(|a, b| a.total_cmp(b));
    for pair in reals.chunks(2) {
        let second = pair.get(1).copied().unwrap_or(0.0);
        pairs.push([Complex64::new(pair[0], 0.0), Complex64::new(second, 0.0)]);
    }
    pairs
}

fn quadratic(pair: &[Complex64; 2]) -> [f64; 3] {
    [1.0, -(pair[0] + pair[1]).re, (pair[0] * pair[1]).re]
}

/// Cascade of biquads: poles farthest from the unit circle first, each
/// matched with the nearest remaining zero pair; the overall gain goes on
/// the first section.
fn pair_sections(zeros: &[Complex64], poles: &[Complex64], gain: f64) -> Vec<Biquad> {
    let mut pole_pairs = root_pairs(poles);
    pole_pairs.sort_by(|a, b| {
        let da = (a[0].norm() - 1.0).abs();
        let db = (b[0].norm() - 1.0).abs();
        db.total_cmp(&da)
    });
    let mut zero_pairs = root_pairs(zeros);
    let mut sections = Vec::with_capacity(pole_pairs.len());
    for pole_pair in &pole_pairs {
        let nearest = zero_pairs
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let da = (a[0] - pole_pair[0]).norm().min((a[1] - pole_pair[0]).norm());
                let db = (b[0] - pole_pair[0]).norm().min((b[1] - pole_pair[0]).norm());
                da.total_cmp(&db)
            })
            .map(|(idx, _)| idx);
        let b = match nearest {
            Some(idx) => quadratic(&zero_pairs.remove(idx)),
            None => [1.0, 0.0, 0.0],
        };
        sections.push(Biquad {
            b,
            a: quadratic(pole_pair),
        });
    }
    if let Some(first) = sections.first_mut() {
        for c in &mut first.b {
            *c *= gain;
        }
    }
    sections
}

fn odd_extension(signal: &[f64], padlen: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];
    let mut ext = Vec::with_capacity(n + 2 * padlen);
    ext.extend((1..=padlen).rev().map(|i| 2.0 * first - signal[i]));
    ext.extend_from_slice(signal);
    ext.extend((1..=padlen).map(|i| 2.0 * last - signal[n - 1 - i]));
    ext
}

/// Everything the coefficients depend on.
#[derive(Clone, Copy, Debug, PartialEq)]
struct DesignKey {
    sample_rate_hz: f64,
    settings: FilterSettings,
}

/// Result of one [`FilterBank::apply`] pass.
#[derive(Clone, Debug)]
pub struct FilteredWindow {
    pub samples: Array2<f64>,
    /// Rows passed through unfiltered because the window was too short.
    pub skipped_channels: Vec<usize>,
}

/// Band-pass followed by notch, with designs cached per `(fs, settings)`.
#[derive(Debug, Default)]
pub struct FilterBank {
    cached: Option<(DesignKey, IirFilter, IirFilter)>,
}

impl FilterBank {
    pub fn new() -> Self {
        Self { cached: None }
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    /// Returns `(bandpass, notch)`, designing only when the key changed.
    pub fn designs(
        &mut self,
        sample_rate_hz: f64,
        settings: &FilterSettings,
    ) -> Result<(&IirFilter, &IirFilter), PipelineError> {
        let key = DesignKey {
            sample_rate_hz,
            settings: *settings,
        };
        let stale = !matches!(&self.cached, Some((cached, _, _)) if *cached == key);
        if stale {
            let BandpassSpec {
                lowcut_hz,
                highcut_hz,
                order,
                ripple_db,
            } = settings.bandpass;
            let bandpass = design_bandpass(lowcut_hz, highcut_hz, sample_rate_hz, order, ripple_db)?;
            let NotchSpec {
                center_hz,
                bandwidth_hz,
                order,
                ripple_db,
            } = settings.notch;
            let notch = design_notch(sample_rate_hz, center_hz, bandwidth_hz, order, ripple_db)?;
            log::debug!(
                "designed filters at {sample_rate_hz} Hz: bandpass {} sections, notch {} sections",
                bandpass.sections().len(),
                notch.sections().len()
            );
            self.cached = Some((key, bandpass, notch));
        }
        match &self.cached {
            Some((_, bandpass, notch)) => Ok((bandpass, notch)),
            None => Err(PipelineError::InvalidFilter("no filter designed".into())),
        }
    }

    /// DC removal, band-pass, then notch, per channel, on a copy of `window`.
    pub fn apply(
        &mut self,
        window: ArrayView2<'_, f64>,
        sample_rate_hz: f64,
        settings: &FilterSettings,
    ) -> Result<FilteredWindow, PipelineError> {
        let (bandpass, notch) = self.designs(sample_rate_hz, settings)?;
        let mut samples = window.to_owned();
        let mut skipped_channels = Vec::new();
        for (idx, mut row) in samples.axis_iter_mut(Axis(0)).enumerate() {
            let mean = row.mean().unwrap_or(0.0);
            let centered: Vec<f64> = row.iter().map(|v| v - mean).collect();
            let filtered = bandpass
                .filtfilt(&centered)
                .and_then(|stage| notch.filtfilt(&stage));
            match filtered {
                Ok(out) => {
                    for (dst, src) in row.iter_mut().zip(out) {
                        *dst = src;
                    }
                }
                Err(PipelineError::InsufficientData { needed, available }) => {
                    log::warn!(
                        "channel row {idx}: {available} samples, need more than {needed}; filtering skipped"
                    );
                    skipped_channels.push(idx);
                }
                Err(other) => return Err(other),
            }
        }
        Ok(FilteredWindow {
            samples,
            skipped_channels,
        })
    }
}
