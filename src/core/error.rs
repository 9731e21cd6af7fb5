use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("missing required recording parameter(s): {fields}")]
    MissingParameter { fields: String },
    #[error("device unavailable: {message}")]
    DeviceUnavailable { message: String },
    #[error("a scan session is already running (session={session_id})")]
    AlreadyRunning { session_id: String },
    #[error("acquisition stopped after {count} consecutive overflows")]
    AcquisitionOverflow { count: u32 },
    #[error("failed to persist {path:?}: {message}")]
    Persistence { path: PathBuf, message: String },
    #[error("validation mismatch for {path:?}: expected {expected} samples, found {found}")]
    ValidationMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("device error: {message}")]
    Device { message: String },
    #[error("format error: {message}")]
    Format { message: String },
    #[error("{message}")]
    Message { message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl CaptureError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn with_context(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        CaptureError::Context {
            context: context.into(),
            source: source.into().into(),
        }
    }

    /// Stable code used in result payloads and bridge error messages.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::MissingParameter { .. } => "missing_parameter",
            CaptureError::DeviceUnavailable { .. } => "device_unavailable",
            CaptureError::AlreadyRunning { .. } => "already_running",
            CaptureError::AcquisitionOverflow { .. } => "acquisition_overflow",
            CaptureError::Persistence { .. } => "persistence_failure",
            CaptureError::ValidationMismatch { .. } => "validation_mismatch",
            CaptureError::Device { .. } => "device_error",
            CaptureError::Format { .. } => "format_error",
            CaptureError::Message { .. } | CaptureError::Context { .. } => "error",
            CaptureError::Io(_) => "io_error",
        }
    }
}
