// src/dsp/mod.rs
pub mod buffer;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod plot;
pub mod scheduler;
pub mod source;
pub mod spectrum;
pub use buffer::{ChannelSet, SampleBuffer};
pub use error::{ErrorKind, PipelineError};
pub use filter::{design_bandpass, design_notch, Biquad, FilterBank, FilteredWindow, IirFilter};
pub use pipeline::{
    DisplaySink, NullSink, Pipeline, PipelineState, TickFrame, TickReport, TickSummary,
};
pub use plot::{
    render_band_power_png, render_psd_png, render_time_domain_png, PlotStyle, SnapshotSink,
};
pub use scheduler::UpdateScheduler;
pub use source::{AcquisitionSource, Chunk, ManualSource, SimulatedSource, DEFAULT_RING_CAPACITY};
pub use spectrum::{compute_band_power, Band, BandPower, PsdResult, SpectralAnalyzer};
