//! Spectral math used by the recorder and the scan engine.

use serde::{Deserialize, Serialize};

use crate::core::{CaptureResult, Sample};

pub mod fft;

pub use fft::{FftProcessor, FftProcessorConfig};

/// One power spectrum, fft-shifted so `frequencies` ascend from -rate/2.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrum {
    /// Baseband frequency of each bin in Hz.
    pub frequencies: Vec<f64>,
    /// Linear power per bin.
    pub power: Vec<f64>,
}

impl Spectrum {
    pub fn len(&self) -> usize {
        self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }

    /// Power in dB with a floor of 1e-12 linear.
    pub fn power_db(&self) -> Vec<f64> {
        self.power.iter().map(|p| to_db(*p)).collect()
    }
}

pub fn to_db(linear: f64) -> f64 {
    10.0 * linear.max(1e-12).log10()
}

pub trait SignalProcessor: Send + Sync {
    fn calculate_spectrum(&self, samples: &[Sample], sample_rate: f64) -> CaptureResult<Spectrum>;

    /// Spectrum over at most `fft_size` samples, overriding the processor's
    /// own transform length.
    fn calculate_spectrum_sized(
        &self,
        samples: &[Sample],
        sample_rate: f64,
        fft_size: usize,
    ) -> CaptureResult<Spectrum> {
        let n = fft_size.min(samples.len());
        self.calculate_spectrum(&samples[..n], sample_rate)
    }

    /// -3 dB bandwidth around the strongest bin, in Hz.
    fn estimate_bandwidth(&self, power_db: &[f64], freq_axis: &[f64]) -> f64;

    fn calculate_bandpass_sample_rate(&self, center_freq: f64, signal_bw: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerStats {
    pub average_power: f64,
    pub average_power_db: f64,
    pub peak_power: f64,
    pub peak_power_db: f64,
    pub rms_amplitude: f64,
    pub peak_amplitude: f64,
}

pub fn power_stats(samples: &[Sample]) -> PowerStats {
    if samples.is_empty() {
        return PowerStats {
            average_power: 0.0,
            average_power_db: -120.0,
            peak_power: 0.0,
            peak_power_db: -120.0,
            rms_amplitude: 0.0,
            peak_amplitude: 0.0,
        };
    }

    let (sum, peak) = samples.iter().fold((0.0f64, 0.0f64), |(sum, peak), s| {
        let p = s.norm_sqr() as f64;
        (sum + p, peak.max(p))
    });
    let average = sum / samples.len() as f64;

    PowerStats {
        average_power: average,
        average_power_db: 10.0 * (average + 1e-12).log10(),
        peak_power: peak,
        peak_power_db: 10.0 * (peak + 1e-12).log10(),
        rms_amplitude: average.sqrt(),
        peak_amplitude: peak.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_stats_empty() {
        let stats = power_stats(&[]);
        assert_eq!(stats.average_power_db, -120.0);
        assert_eq!(stats.peak_amplitude, 0.0);
    }

    #[test]
    fn test_power_stats_unit_tone() {
        let samples = vec![Sample::new(1.0, 0.0); 64];
        let stats = power_stats(&samples);
        assert!((stats.average_power - 1.0).abs() < 1e-9);
        assert!(stats.average_power_db.abs() < 1e-6);
        assert!((stats.peak_amplitude - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_db_floor() {
        assert_eq!(to_db(0.0), -120.0);
        assert!((to_db(100.0) - 20.0).abs() < 1e-9);
    }
}
