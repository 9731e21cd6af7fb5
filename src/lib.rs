// src/lib.rs
pub mod bridge;
pub mod config;
pub mod core;
pub mod device;
pub mod dsp;
pub mod recorder;
pub mod scanner;
pub mod storage;
pub mod testing;

// Re-export die wichtigsten Typen
pub use bridge::{MessageBridge, SessionRegistry, StreamMessage};
pub use config::NodeConfig;
pub use core::{CancelToken, CaptureError, CaptureResult, ComponentLogger, LogContext, Sample};
pub use recorder::{Recorder, RecordingOutcome, RecordingRequest};
pub use scanner::{ScanConfig, ScanEngine};
pub use storage::{ArtifactStore, FileStore};
