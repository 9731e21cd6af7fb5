//! Radio device abstraction.
//!
//! The hardware driver itself lives outside this crate; recorder and scanner
//! only talk to it through [`DeviceController`].

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::core::{CancelToken, CaptureResult, Sample};

pub mod simulated;

pub use simulated::{SimulatedDevice, SimulatedDeviceConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxSettings {
    pub freq: f64,
    pub rate: f64,
    pub gain: f64,
    pub channel: usize,
    pub bandwidth: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxSettings {
    pub freq: f64,
    pub rate: f64,
    pub gain: f64,
    pub channel: usize,
}

/// One notification from the receive stream.
#[derive(Debug)]
pub enum RxEvent<'a> {
    Samples(&'a [Sample]),
    /// Hardware reported lost samples (consumer too slow).
    Overflow,
}

/// Result of a `record_samples` call.
#[derive(Debug, Clone, Default)]
pub struct Acquisition {
    /// Collected samples; empty when `collect_samples` was false.
    pub samples: Vec<Sample>,
    pub overflow_count: u32,
}

pub trait DeviceController: Send + Sync {
    fn connect(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Tunes the receiver. Returns the sample rate the hardware actually uses.
    fn configure_rx(&self, settings: &RxSettings) -> CaptureResult<f64>;

    fn configure_tx(&self, settings: &TxSettings) -> CaptureResult<f64>;

    /// Streams `duration` seconds of samples.
    ///
    /// Every chunk and overflow is reported through `on_event`; returning
    /// `ControlFlow::Break` ends the stream after the current chunk. Each
    /// blocking read is bounded so `cancel` is observed at least once per
    /// chunk period.
    fn record_samples(
        &self,
        duration: f64,
        channel: usize,
        on_event: &mut dyn FnMut(RxEvent<'_>) -> ControlFlow<()>,
        cancel: &CancelToken,
        collect_samples: bool,
    ) -> CaptureResult<Acquisition>;

    /// Sample rates the hardware can be tuned to, ascending. `None` means any
    /// rate is accepted.
    fn supported_sample_rates(&self) -> Option<Vec<f64>> {
        None
    }
}
