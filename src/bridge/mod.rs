//! Delivery of producer-thread results to async consumers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod analyzer;
pub mod message;
pub mod publishers;
pub mod queue;
pub mod registry;

pub use analyzer::{AnalysisRequest, StreamAnalyzer};
pub use message::{DataMessage, ScanProgress, StreamMessage, StreamViews};
pub use publishers::{BridgeRecorderObserver, BridgeScanPublisher};
pub use queue::{MessageBridge, SchedulerHandle};
pub use registry::{SessionKind, SessionMode, SessionRegistry, SessionSnapshot, SessionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    /// Send `session_started` as soon as an analysis session exists.
    pub session_ack: bool,
    pub grace_period_ms: u64,
    pub chunk_size: usize,
    pub update_interval_ms: u64,
    pub spectrum_fft_size: usize,
}

impl BridgeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            session_ack: true,
            grace_period_ms: 2000,
            chunk_size: 4096,
            update_interval_ms: 100,
            spectrum_fft_size: 1024,
        }
    }
}
