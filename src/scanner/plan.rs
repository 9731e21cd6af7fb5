use serde::Serialize;

use super::ScanConfig;

/// Upper bound for `max_segments` regardless of what a request asks for.
pub const MAX_SEGMENTS_CAP: usize = 20;
const MIN_SEGMENTS: usize = 2;
const MIN_FFT_SIZE: usize = 64;
const MAX_FFT_SIZE: usize = 65536;

/// Derived sweep geometry for one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScanPlan {
    pub sample_rate: f64,
    pub step_size: f64,
    pub num_segments: usize,
    pub fft_size: usize,
    pub max_segments: usize,
}

/// `0` means "use the cap".
pub fn clamp_max_segments(requested: usize) -> usize {
    if requested == 0 {
        return MAX_SEGMENTS_CAP;
    }
    requested.clamp(MIN_SEGMENTS, MAX_SEGMENTS_CAP)
}

/// Smallest supported rate at or above `required`. A device without a rate
/// list takes the required rate as is.
pub fn select_supported_rate(required: f64, supported: Option<&[f64]>) -> Option<f64> {
    match supported {
        None | Some([]) => Some(required),
        Some(rates) => rates.iter().copied().find(|rate| *rate >= required),
    }
}

/// Raises the sample rate when the predicted segment count would exceed
/// `target`. Keeps the configured rate if no supported rate is high enough.
pub fn apply_segment_budget(
    span: f64,
    rate: f64,
    overlap: f64,
    target: usize,
    supported: Option<&[f64]>,
) -> f64 {
    let coverage = 1.0 - overlap;
    if span <= 0.0 || rate <= 0.0 || coverage <= 0.0 {
        return rate;
    }

    let predicted = (span / (rate * coverage)).ceil() as usize + 1;
    if predicted <= target {
        return rate;
    }

    let required = (span / (target - 1) as f64 / coverage.max(1e-6)).max(rate);
    match select_supported_rate(required, supported) {
        Some(selected) => {
            log::info!(
                "segment budget {} exceeded ({} predicted), sample rate {:.0} -> {:.0}",
                target,
                predicted,
                rate,
                selected
            );
            selected
        }
        None => {
            log::warn!(
                "no supported sample rate >= {:.0}, keeping {:.0} ({} segments predicted)",
                required,
                rate,
                predicted
            );
            rate
        }
    }
}

/// Smallest power of two covering `rate / resolution`, within [64, 65536].
pub fn compute_fft_size(rate: f64, resolution: f64) -> usize {
    let wanted = if resolution > 0.0 {
        rate / resolution
    } else {
        MAX_FFT_SIZE as f64
    };
    let mut size = MIN_FFT_SIZE;
    while (size as f64) < wanted && size < MAX_FFT_SIZE {
        size *= 2;
    }
    size
}

/// Step and count for a given rate. Widens the step when the rate alone
/// would need more than `target` segments.
fn step_and_count(
    span: f64,
    rate: f64,
    overlap: f64,
    target: usize,
    supported: Option<&[f64]>,
) -> (f64, f64, usize) {
    let mut rate = rate;
    let mut step = rate * (1.0 - overlap);

    let desired = if span > 0.0 {
        span / (target - 1) as f64
    } else {
        rate
    };

    if step < desired {
        if let Some(bumped) = select_supported_rate(desired / (1.0 - overlap), supported) {
            if bumped > rate {
                rate = bumped;
                step = rate * (1.0 - overlap);
            }
        }
        step = step.max(desired);
    }
    if step <= 0.0 {
        step = desired.max(1.0);
    }

    if span <= 0.0 {
        return (rate, step, 1);
    }

    let mut count = ((span / step).floor() as usize).max(1) + 1;
    if count > target {
        count = target;
        step = span / (target - 1) as f64;
    }
    (rate, step, count)
}

/// Resolves the request into a plan. The returned config carries the
/// effective sample rate, fft size and clamped segment budget.
pub fn compute_plan(config: &ScanConfig, supported: Option<&[f64]>) -> (ScanConfig, ScanPlan) {
    let mut resolved = config.clone();
    resolved.max_segments = clamp_max_segments(config.max_segments);
    resolved.overlap = config.clamped_overlap();

    let span = resolved.span();
    let budgeted = apply_segment_budget(
        span,
        resolved.sample_rate,
        resolved.overlap,
        resolved.max_segments,
        supported,
    );
    let (rate, step_size, num_segments) = step_and_count(
        span,
        budgeted,
        resolved.overlap,
        resolved.max_segments,
        supported,
    );
    resolved.sample_rate = rate;

    let fft_size = match config.fft_size {
        Some(size) if size > 0 => size,
        _ => compute_fft_size(rate, resolved.resolution),
    };
    resolved.fft_size = Some(fft_size);

    let plan = ScanPlan {
        sample_rate: rate,
        step_size,
        num_segments,
        fft_size,
        max_segments: resolved.max_segments,
    };
    (resolved, plan)
}

impl ScanPlan {
    /// Adopts the rate the hardware actually reports. Returns `true` when
    /// the plan changed.
    pub fn resync(&mut self, config: &mut ScanConfig, actual_rate: f64) -> bool {
        let tolerance = (self.sample_rate.abs() * 1e-6).max(1.0);
        if actual_rate <= 0.0 || (actual_rate - self.sample_rate).abs() <= tolerance {
            return false;
        }

        // Kein Rate-Bump mehr, die Hardware hat entschieden
        let (rate, step, count) = step_and_count(
            config.span(),
            actual_rate,
            config.clamped_overlap(),
            self.max_segments,
            Some(&[actual_rate]),
        );
        self.sample_rate = rate;
        self.step_size = step;
        self.num_segments = count;
        config.sample_rate = rate;
        true
    }

    /// Centers of one round, `start + i * step` up to `stop`.
    pub fn centers(&self, config: &ScanConfig) -> Vec<f64> {
        let epsilon = self.step_size * 1e-6;
        let mut centers = Vec::with_capacity(self.num_segments);
        let mut center = config.start_freq;
        while center <= config.stop_freq + epsilon {
            centers.push(center);
            if self.step_size <= 0.0 {
                break;
            }
            center += self.step_size;
        }
        centers
    }
}
