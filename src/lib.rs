//! Real-time EEG processing: acquisition, zero-phase Chebyshev filtering,
//! Welch spectra, band power, recording and an adaptive tick loop.

pub mod config;
pub mod dsp;
pub mod engine;
pub mod recorder;
pub mod types;

pub use config::{BandpassSpec, FilterSettings, NotchSpec, PipelineConfig, TimeWindow};
pub use dsp::{
    AcquisitionSource, Band, BandPower, ChannelSet, DisplaySink, ErrorKind, FilterBank, Pipeline,
    PipelineError, PsdResult, SampleBuffer, SpectralAnalyzer, TickFrame, UpdateScheduler,
};
pub use engine::{spawn_session, SessionHandle};
pub use recorder::DataRecorder;
pub use types::{SessionCommand, SessionEvent};
