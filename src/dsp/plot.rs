use std::io::Cursor;
use std::path::PathBuf;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use ndarray::Array2;
use plotters::prelude::*;

use crate::dsp::error::PipelineError;
use crate::dsp::pipeline::{DisplaySink, TickFrame};
use crate::dsp::spectrum::{BandPower, PsdResult};

/// Vertical spacing between stacked time-domain traces.
pub const TRACE_OFFSET: f64 = 2000.0;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
    /// Captions, axis labels and legends. Needs a system font.
    pub annotate: bool,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            palette: vec![
                RED,
                GREEN,
                BLUE,
                CYAN,
                MAGENTA,
                YELLOW,
                WHITE,
                RGBColor(255, 165, 0),
            ],
            annotate: true,
        }
    }
}

fn value_bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() || (hi - lo).abs() < f64::EPSILON {
        (lo.min(0.0) - 50.0, hi.max(0.0) + 50.0)
    } else {
        (lo, hi)
    }
}

/// Channels stacked `TRACE_OFFSET` apart, newest sample at the right.
pub fn render_time_domain_png(
    time_axis: &[f64],
    samples: &Array2<f64>,
    labels: &[String],
    style: &PlotStyle,
) -> Result<Vec<u8>, PipelineError> {
    if samples.is_empty() {
        return Err(PipelineError::Plot("time-domain window has no samples".into()));
    }
    let stacked = samples
        .outer_iter()
        .enumerate()
        .flat_map(|(idx, row)| {
            let offset = idx as f64 * TRACE_OFFSET;
            row.into_iter().map(move |v| v + offset).collect::<Vec<_>>()
        });
    let (y_min, y_max) = value_bounds(stacked);
    let x_max = time_axis.last().copied().unwrap_or(0.0).max(f64::EPSILON);

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut builder = ChartBuilder::on(&root);
        builder.margin(10);
        if style.annotate {
            builder
                .caption("Time Domain", ("sans-serif", 20).into_font().color(&WHITE))
                .set_label_area_size(LabelAreaPosition::Left, 55)
                .set_label_area_size(LabelAreaPosition::Bottom, 40);
        }
        let mut chart = builder.build_cartesian_2d(0f64..x_max, y_min..y_max)?;
        if style.annotate {
            chart
                .configure_mesh()
                .x_desc("s")
                .light_line_style(WHITE.mix(0.1))
                .draw()?;
        }
        for (idx, row) in samples.outer_iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let offset = idx as f64 * TRACE_OFFSET;
            let series = time_axis
                .iter()
                .copied()
                .zip(row.iter().map(move |v| v + offset));
            let drawn = chart.draw_series(LineSeries::new(series, &color))?;
            if style.annotate {
                drawn
                    .label(labels.get(idx).cloned().unwrap_or_else(|| format!("Ch{}", idx + 1)))
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
        }
        if style.annotate {
            chart
                .configure_series_labels()
                .border_style(WHITE.mix(0.2))
                .background_style(style.background)
                .draw()?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

pub fn render_psd_png(
    psd: &PsdResult,
    labels: &[String],
    style: &PlotStyle,
) -> Result<Vec<u8>, PipelineError> {
    if psd.freqs.is_empty() || psd.power.is_empty() {
        return Err(PipelineError::Plot("spectrum has no bins".into()));
    }
    let x_max = psd.freqs.last().copied().unwrap_or(0.0).max(f64::EPSILON);
    let y_max = psd.power.iter().copied().fold(0.0f64, f64::max).max(1e-3);

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut builder = ChartBuilder::on(&root);
        builder.margin(10);
        if style.annotate {
            builder
                .caption("Power Spectral Density", ("sans-serif", 20).into_font().color(&WHITE))
                .set_label_area_size(LabelAreaPosition::Left, 55)
                .set_label_area_size(LabelAreaPosition::Bottom, 40);
        }
        let mut chart = builder.build_cartesian_2d(0f64..x_max, 0f64..y_max)?;
        if style.annotate {
            chart
                .configure_mesh()
                .x_desc("Hz")
                .light_line_style(WHITE.mix(0.1))
                .draw()?;
        }
        for (idx, row) in psd.power.outer_iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = psd.freqs.iter().copied().zip(row.iter().copied());
            let drawn = chart.draw_series(LineSeries::new(series, &color))?;
            if style.annotate {
                drawn
                    .label(labels.get(idx).cloned().unwrap_or_else(|| format!("Ch{}", idx + 1)))
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
        }
        if style.annotate {
            chart
                .configure_series_labels()
                .border_style(WHITE.mix(0.2))
                .background_style(style.background)
                .draw()?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// One bar per band, in band order.
pub fn render_band_power_png(
    power: &BandPower,
    style: &PlotStyle,
) -> Result<Vec<u8>, PipelineError> {
    let y_max = power.0.iter().copied().fold(0.0f64, f64::max).max(1e-3) * 1.1;
    let bar_color = RGBColor(0, 191, 255);

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut builder = ChartBuilder::on(&root);
        builder.margin(10);
        if style.annotate {
            builder
                .caption("Band Power", ("sans-serif", 20).into_font().color(&WHITE))
                .set_label_area_size(LabelAreaPosition::Left, 55)
                .set_label_area_size(LabelAreaPosition::Bottom, 40);
        }
        let mut chart = builder.build_cartesian_2d(0f64..10f64, 0f64..y_max)?;
        if style.annotate {
            let names: Vec<&str> = power.iter().map(|(band, _)| band.name()).collect();
            chart
                .configure_mesh()
                .disable_x_mesh()
                .x_labels(names.len())
                .x_label_formatter(&|x| {
                    let idx = (*x / 2.0).floor() as usize;
                    names.get(idx).map(|n| n.to_string()).unwrap_or_default()
                })
                .light_line_style(WHITE.mix(0.1))
                .draw()?;
        }
        chart.draw_series(power.0.iter().enumerate().map(|(idx, value)| {
            let left = idx as f64 * 2.0 + 0.25;
            Rectangle::new([(left, 0.0), (left + 1.5, *value)], bar_color.filled())
        }))?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PipelineError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| PipelineError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

/// Display sink that keeps PNG renders of the latest frame and optionally
/// mirrors them to a directory.
#[derive(Default)]
pub struct SnapshotSink {
    style: PlotStyle,
    out_dir: Option<PathBuf>,
    pub time_domain: Option<Vec<u8>>,
    pub psd: Option<Vec<u8>>,
    pub band_power: Option<Vec<u8>>,
    pub last_error: Option<PipelineError>,
}

impl SnapshotSink {
    pub fn new(style: PlotStyle) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }

    pub fn writing_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    fn render(&mut self, frame: &TickFrame) -> Result<(), PipelineError> {
        if let Some(samples) = &frame.time_domain {
            self.time_domain = Some(render_time_domain_png(
                &frame.time_axis,
                samples,
                &frame.channel_labels,
                &self.style,
            )?);
        }
        if let Some(psd) = &frame.psd {
            self.psd = Some(render_psd_png(psd, &frame.channel_labels, &self.style)?);
        }
        if let Some(power) = &frame.band_power {
            self.band_power = Some(render_band_power_png(power, &self.style)?);
        }
        if let Some(dir) = &self.out_dir {
            std::fs::create_dir_all(dir)?;
            let files = [
                ("time_domain.png", &self.time_domain),
                ("psd.png", &self.psd),
                ("band_power.png", &self.band_power),
            ];
            for (name, png) in files {
                if let Some(png) = png {
                    std::fs::write(dir.join(name), png)?;
                }
            }
        }
        Ok(())
    }
}

impl DisplaySink for SnapshotSink {
    fn present(&mut self, frame: &TickFrame) {
        match self.render(frame) {
            Ok(()) => self.last_error = None,
            Err(err) => {
                log::warn!("snapshot render failed: {err}");
                self.last_error = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::SpectralAnalyzer;

    const PNG_MAGIC: [u8; 4] = [0x89, b'P', b'N', b'G'];

    fn quiet_style() -> PlotStyle {
        PlotStyle {
            width: 200,
            height: 100,
            annotate: false,
            ..PlotStyle::default()
        }
    }

    fn frame() -> TickFrame {
        let fs = 250.0;
        let samples = Array2::from_shape_fn((2, 250), |(r, i)| {
            ((r + 1) as f64 * i as f64 / fs * std::f64::consts::TAU * 10.0).sin()
        });
        let psd = SpectralAnalyzer::new().compute_psd(samples.view(), fs, None);
        TickFrame {
            sample_rate_hz: fs,
            channel_labels: vec!["Ch1".into(), "Ch2".into()],
            time_axis: (0..250).map(|i| i as f64 / fs).collect(),
            time_domain: Some(samples),
            band_power: Some(crate::dsp::compute_band_power(&psd.freqs, psd.power.view())),
            psd: Some(psd),
            buffered_samples: 250,
            filtered: false,
            skipped_channels: Vec::new(),
        }
    }

    #[test]
    fn snapshot_sink_renders_all_views() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SnapshotSink::new(quiet_style()).writing_to(dir.path());
        sink.present(&frame());
        assert!(sink.last_error.is_none(), "{:?}", sink.last_error);
        for png in [&sink.time_domain, &sink.psd, &sink.band_power] {
            assert_eq!(png.as_ref().unwrap()[..4], PNG_MAGIC);
        }
        assert!(dir.path().join("band_power.png").exists());
    }

    #[test]
    fn empty_window_is_render_error() {
        let err = render_time_domain_png(&[], &Array2::zeros((1, 0)), &[], &quiet_style())
            .unwrap_err();
        assert_eq!(err.kind(), crate::dsp::ErrorKind::Render);
    }
}
