use thiserror::Error;

/// Coarse failure classes. Callers branch on these, not on message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Acquisition,
    InsufficientData,
    InvalidInput,
    Persistence,
    Render,
}

#[derive(Clone, Debug, Error)]
pub enum PipelineError {
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    #[error("not enough samples: need more than {needed}, have {available}")]
    InsufficientData { needed: usize, available: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid filter design: {0}")]
    InvalidFilter(String),
    #[error("recording failed: {0}")]
    Persistence(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error("session is not streaming")]
    NotStreaming,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Acquisition(_) | PipelineError::NotStreaming => ErrorKind::Acquisition,
            PipelineError::InsufficientData { .. } => ErrorKind::InsufficientData,
            PipelineError::InvalidInput(_) | PipelineError::InvalidFilter(_) => {
                ErrorKind::InvalidInput
            }
            PipelineError::Persistence(_) => ErrorKind::Persistence,
            PipelineError::Plot(_) => ErrorKind::Render,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::Persistence(value.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(value: csv::Error) -> Self {
        PipelineError::Persistence(value.to_string())
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for PipelineError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        PipelineError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(value: image::ImageError) -> Self {
        PipelineError::Plot(value.to_string())
    }
}
