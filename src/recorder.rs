use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::Local;
use csv::Writer;
use ndarray::ArrayView2;

use crate::dsp::{Band, BandPower, ChannelSet, PipelineError};

type CsvFile = Writer<BufWriter<File>>;

fn create_csv(path: &Path) -> Result<CsvFile, PipelineError> {
    let file = File::create(path)
        .map_err(|e| PipelineError::Persistence(format!("{}: {e}", path.display())))?;
    Ok(Writer::from_writer(BufWriter::new(file)))
}

/// `{trial}_power.csv`: one row of band power per tick.
pub struct BandPowerRecorder {
    writer: CsvFile,
    path: PathBuf,
    rows: u64,
}

impl BandPowerRecorder {
    pub fn create(dir: &Path, trial: &str) -> Result<Self, PipelineError> {
        let path = dir.join(format!("{trial}_power.csv"));
        let mut writer = create_csv(&path)?;
        let mut header = vec!["Time"];
        header.extend(Band::ALL.iter().map(|b| b.name()));
        writer.write_record(&header)?;
        Ok(Self {
            writer,
            path,
            rows: 0,
        })
    }

    pub fn write(&mut self, power: &BandPower) -> Result<(), PipelineError> {
        let mut row = vec![Local::now().format("%Y-%m-%d %H:%M:%S").to_string()];
        row.extend(power.0.iter().map(|v| v.to_string()));
        self.writer.write_record(&row)?;
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<u64, PipelineError> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

/// `{trial}_raw.csv`: one row per raw sample for the channels selected when
/// recording started.
pub struct RawRecorder {
    writer: CsvFile,
    path: PathBuf,
    channels: ChannelSet,
    sample_rate_hz: f64,
    samples_written: u64,
}

impl RawRecorder {
    pub fn create(
        dir: &Path,
        trial: &str,
        channels: ChannelSet,
        sample_rate_hz: f64,
    ) -> Result<Self, PipelineError> {
        let path = dir.join(format!("{trial}_raw.csv"));
        let mut writer = create_csv(&path)?;
        let mut header = vec!["Time".to_string()];
        header.extend((1..=channels.len()).map(|n| format!("Ch{n}")));
        writer.write_record(&header)?;
        Ok(Self {
            writer,
            path,
            channels,
            sample_rate_hz,
            samples_written: 0,
        })
    }

    /// Replays every column of the board chunk as one row; `Time` is seconds
    /// since recording began.
    pub fn write_chunk(&mut self, chunk: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
        if let Some(&bad) = self.channels.iter().find(|&&c| c >= chunk.nrows()) {
            return Err(PipelineError::InvalidInput(format!(
                "recorded channel {bad} missing from chunk"
            )));
        }
        for col in chunk.columns() {
            let t = self.samples_written as f64 / self.sample_rate_hz;
            let mut row = Vec::with_capacity(self.channels.len() + 1);
            row.push(format!("{t:.4}"));
            row.extend(self.channels.iter().map(|&c| col[c].to_string()));
            self.writer.write_record(&row)?;
            self.samples_written += 1;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<u64, PipelineError> {
        self.writer.flush()?;
        Ok(self.samples_written)
    }
}

/// Both trial files. Any write failure closes the recording.
pub struct DataRecorder {
    active: Option<(BandPowerRecorder, RawRecorder)>,
}

impl Default for DataRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl DataRecorder {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(
        &mut self,
        dir: &Path,
        trial: &str,
        channels: &ChannelSet,
        sample_rate_hz: f64,
    ) -> Result<(), PipelineError> {
        let trial = trial.trim();
        if trial.is_empty() {
            return Err(PipelineError::InvalidInput("trial name is required".into()));
        }
        if channels.is_empty() {
            return Err(PipelineError::InvalidInput("no channel selected".into()));
        }
        self.stop()?;
        fs::create_dir_all(dir)
            .map_err(|e| PipelineError::Persistence(format!("{}: {e}", dir.display())))?;
        let power = BandPowerRecorder::create(dir, trial)?;
        let raw = RawRecorder::create(dir, trial, channels.clone(), sample_rate_hz)?;
        log::info!(
            "recording started: {} and {}",
            power.path().display(),
            raw.path().display()
        );
        self.active = Some((power, raw));
        Ok(())
    }

    /// Flushes and closes both files before returning.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        let Some((power, raw)) = self.active.take() else {
            return Ok(());
        };
        let rows = power.finish();
        let samples = raw.finish();
        let (rows, samples) = (rows?, samples?);
        log::info!("recording saved: {rows} band-power rows, {samples} raw samples");
        Ok(())
    }

    pub fn write_band_power(&mut self, power: &BandPower) -> Result<(), PipelineError> {
        let result = match &mut self.active {
            Some((recorder, _)) => recorder.write(power),
            None => return Ok(()),
        };
        self.close_on_error(result)
    }

    pub fn write_raw(&mut self, chunk: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
        let result = match &mut self.active {
            Some((_, recorder)) => recorder.write_chunk(chunk),
            None => return Ok(()),
        };
        self.close_on_error(result)
    }

    fn close_on_error(&mut self, result: Result<(), PipelineError>) -> Result<(), PipelineError> {
        if let Err(err) = result {
            log::warn!("recording stopped after write failure: {err}");
            // The write error is reported, not the close error.
            let _ = self.stop();
            return Err(err);
        }
        Ok(())
    }
}
