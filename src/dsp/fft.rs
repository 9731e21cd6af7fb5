use std::sync::Mutex;

use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use super::{SignalProcessor, Spectrum};
use crate::core::lock::lock_mutex;
use crate::core::{CaptureError, CaptureResult, Sample};

/// Rate the bandpass helper aims for when several candidates are valid.
const PREFERRED_BANDPASS_RATE: f64 = 2e6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FftProcessorConfig {
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
}

fn default_fft_size() -> usize {
    8192
}

impl Default for FftProcessorConfig {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
        }
    }
}

/// Hann-windowed periodogram on top of `rustfft`.
pub struct FftProcessor {
    config: FftProcessorConfig,
    planner: Mutex<FftPlanner<f32>>,
}

impl FftProcessor {
    pub fn new(config: FftProcessorConfig) -> Self {
        Self {
            config,
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Same processor with a different transform length.
    pub fn with_fft_size(fft_size: usize) -> Self {
        Self::new(FftProcessorConfig { fft_size })
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }
}

impl Default for FftProcessor {
    fn default() -> Self {
        Self::new(FftProcessorConfig::default())
    }
}

fn hann(n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| (0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos()) as f32)
        .collect()
}

impl FftProcessor {
    fn periodogram(&self, samples: &[Sample], sample_rate: f64, n: usize) -> CaptureResult<Spectrum> {
        if n == 0 {
            return Ok(Spectrum::default());
        }

        let window = hann(n);
        let window_correction =
            window.iter().map(|w| (*w as f64) * (*w as f64)).sum::<f64>() / n as f64;
        let denominator = sample_rate * n as f64 * window_correction;
        if !denominator.is_finite() || denominator <= 0.0 {
            return Err(CaptureError::message(format!(
                "invalid spectrum normalisation: rate={sample_rate}, fft_size={n}"
            )));
        }

        let mut buffer: Vec<Sample> = samples[..n]
            .iter()
            .zip(&window)
            .map(|(s, w)| {
                let s = if s.re.is_finite() && s.im.is_finite() {
                    *s
                } else {
                    Sample::new(0.0, 0.0)
                };
                s * *w
            })
            .collect();

        let fft = lock_mutex(&self.planner, "FftProcessor::calculate_spectrum").plan_fft_forward(n);
        fft.process(&mut buffer);
        buffer.rotate_right(n / 2);

        let half = (n / 2) as i64;
        let bin_width = sample_rate / n as f64;
        let frequencies = (0..n as i64).map(|i| (i - half) as f64 * bin_width).collect();
        let power = buffer
            .iter()
            .map(|c| {
                let mag2 = c.norm_sqr() as f64;
                if mag2.is_finite() { mag2 / denominator } else { 0.0 }
            })
            .collect();

        Ok(Spectrum { frequencies, power })
    }
}

impl SignalProcessor for FftProcessor {
    fn calculate_spectrum(&self, samples: &[Sample], sample_rate: f64) -> CaptureResult<Spectrum> {
        let n = self.config.fft_size.min(samples.len());
        self.periodogram(samples, sample_rate, n)
    }

    fn calculate_spectrum_sized(
        &self,
        samples: &[Sample],
        sample_rate: f64,
        fft_size: usize,
    ) -> CaptureResult<Spectrum> {
        self.periodogram(samples, sample_rate, fft_size.min(samples.len()))
    }

    fn estimate_bandwidth(&self, power_db: &[f64], freq_axis: &[f64]) -> f64 {
        let len = power_db.len().min(freq_axis.len());
        if len == 0 {
            return 0.0;
        }
        let peak = power_db[..len].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let threshold = peak - 3.0;

        let mut above = power_db[..len].iter().enumerate().filter(|(_, p)| **p >= threshold);
        let Some((lower, _)) = above.next() else {
            return 0.0;
        };
        let upper = above.last().map(|(i, _)| i).unwrap_or(lower);
        (freq_axis[upper] - freq_axis[lower]).max(0.0)
    }

    fn calculate_bandpass_sample_rate(&self, center_freq: f64, signal_bw: f64) -> f64 {
        let f_max = center_freq + signal_bw / 2.0;
        let f_min = center_freq - signal_bw / 2.0;
        if signal_bw <= 0.0 || f_min <= 0.0 {
            return 2.0 * f_max.max(0.0);
        }

        // Bandpass-Abtastung: 2B <= fs <= 2 f_min / (k+1)
        let k_max = (f_min / signal_bw).floor() as u64;
        let fs_min = 2.0 * signal_bw;
        (0..=k_max)
            .filter_map(|k| {
                let fs_max = 2.0 * f_min / (k + 1) as f64;
                (fs_min <= fs_max).then_some((fs_min + fs_max) / 2.0)
            })
            .min_by(|a, b| {
                (a - PREFERRED_BANDPASS_RATE)
                    .abs()
                    .total_cmp(&(b - PREFERRED_BANDPASS_RATE).abs())
            })
            .unwrap_or(2.0 * f_max)
    }
}
