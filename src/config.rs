use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dsp::PipelineError;

/// Width of the sliding analysis window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub seconds: f64,
}

impl TimeWindow {
    pub fn new(seconds: f64) -> Self {
        Self { seconds }
    }

    /// `window_seconds × fs`, truncated, never below one sample.
    pub fn max_samples(&self, sample_rate_hz: f64) -> usize {
        ((self.seconds * sample_rate_hz).floor() as usize).max(1)
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow { seconds: 5.0 }
    }
}

/// Chebyshev Type I band-pass parameters (Hz / dB).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandpassSpec {
    pub lowcut_hz: f64,
    pub highcut_hz: f64,
    pub order: usize,
    pub ripple_db: f64,
}

impl Default for BandpassSpec {
    fn default() -> Self {
        Self {
            lowcut_hz: 0.1,
            highcut_hz: 100.0,
            order: 4,
            ripple_db: 0.5,
        }
    }
}

/// Chebyshev Type I band-stop parameters; the stop band is
/// `center ± bandwidth / 2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotchSpec {
    pub center_hz: f64,
    pub bandwidth_hz: f64,
    pub order: usize,
    pub ripple_db: f64,
}

impl Default for NotchSpec {
    fn default() -> Self {
        // North American mains.
        Self {
            center_hz: 60.0,
            bandwidth_hz: 1.0,
            order: 4,
            ripple_db: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    pub bandpass: BandpassSpec,
    pub notch: NotchSpec,
}

/// Everything a streaming session is configured with. Built once and handed
/// to the pipeline; sinks only ever see the frames it produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window_seconds: f64,
    pub fps: u32,
    pub channel_selection: Vec<usize>,
    pub filtering_enabled: bool,
    pub spectral_display_enabled: bool,
    pub band_power_enabled: bool,
    pub time_domain_enabled: bool,
    pub trial_name: String,
    pub results_dir: PathBuf,
    pub filters: FilterSettings,
    /// Welch segment length; `None` means `min(fs, available samples)`.
    pub nperseg: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_seconds: TimeWindow::default().seconds,
            fps: 10,
            channel_selection: (0..8).collect(),
            filtering_enabled: true,
            spectral_display_enabled: true,
            band_power_enabled: true,
            time_domain_enabled: true,
            trial_name: String::new(),
            results_dir: PathBuf::from("recordings"),
            filters: FilterSettings::default(),
            nperseg: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(text)
            .map_err(|e| PipelineError::InvalidInput(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.channel_selection.is_empty() {
            return Err(PipelineError::InvalidInput("no channel selected".into()));
        }
        if self.fps == 0 {
            return Err(PipelineError::InvalidInput("fps must be greater than zero".into()));
        }
        if !self.window_seconds.is_finite() || self.window_seconds <= 0.0 {
            return Err(PipelineError::InvalidInput(format!(
                "window must be a positive number of seconds, got {}",
                self.window_seconds
            )));
        }
        Ok(())
    }

    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.window_seconds)
    }

    /// Spectral work dominates per-tick cost.
    pub fn heavy_analysis(&self) -> bool {
        self.spectral_display_enabled || self.band_power_enabled
    }
}

/// Parses the window-size text field.
pub fn parse_window_seconds(text: &str) -> Result<f64, PipelineError> {
    let trimmed = text.trim();
    let value: f64 = trimmed
        .parse()
        .map_err(|_| PipelineError::InvalidInput(format!("window '{trimmed}' is not a number")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(PipelineError::InvalidInput(format!(
            "window must be positive, got {value}"
        )));
    }
    Ok(value)
}

/// Parses the FPS text field.
pub fn parse_fps(text: &str) -> Result<u32, PipelineError> {
    let trimmed = text.trim();
    let value: u32 = trimmed
        .parse()
        .map_err(|_| PipelineError::InvalidInput(format!("fps '{trimmed}' is not an integer")))?;
    if value == 0 {
        return Err(PipelineError::InvalidInput("fps must be greater than zero".into()));
    }
    Ok(value)
}
