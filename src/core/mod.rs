pub mod cancel;
pub mod error;
pub mod lock;
pub mod logging;
pub mod timestamp;

pub use cancel::CancelToken;
pub use error::{CaptureError, CaptureResult};
pub use logging::{ComponentLogger, LogContext, WorkerLogger};
pub use timestamp::*;

/// Complex baseband sample as delivered by the device (`complex64`).
pub type Sample = num_complex::Complex32;
