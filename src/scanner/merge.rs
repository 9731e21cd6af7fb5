use crate::core::unix_seconds_now;

use super::{MergedRound, SegmentResult};

/// Points closer than this to the previously kept point are dropped.
pub const DEDUP_TOLERANCE_HZ: f64 = 1.0;

const DOWNSAMPLE_MIN_POINTS: usize = 10_000;
const DOWNSAMPLE_MIN_FFT: usize = 2048;

/// Decimation ratio for wide sweeps with large FFTs.
pub fn downsample_ratio(points: usize, fft_size: usize, span: f64) -> usize {
    if points <= DOWNSAMPLE_MIN_POINTS || fft_size <= DOWNSAMPLE_MIN_FFT {
        return 1;
    }
    if span > 500e6 {
        8
    } else if span > 100e6 {
        4
    } else if span > 20e6 {
        2
    } else {
        1
    }
}

/// Keeps every `ratio`-th point of both axes.
pub fn downsample(frequencies: &mut Vec<f64>, power: &mut Vec<f64>, ratio: usize) {
    if ratio <= 1 {
        return;
    }
    *frequencies = frequencies.iter().copied().step_by(ratio).collect();
    *power = power.iter().copied().step_by(ratio).collect();
}

/// Restricts a segment to `[start, stop]`. An empty result leaves the input
/// untouched so that edge segments still publish something.
pub fn clip_to_band(frequencies: &mut Vec<f64>, power: &mut Vec<f64>, start: f64, stop: f64) {
    let (f, p): (Vec<f64>, Vec<f64>) = frequencies
        .iter()
        .zip(power.iter())
        .filter(|(freq, _)| **freq >= start && **freq <= stop)
        .map(|(freq, pwr)| (*freq, *pwr))
        .unzip();
    if !f.is_empty() {
        *frequencies = f;
        *power = p;
    }
}

/// Frequency-sorted concatenation of all segments of one round.
pub fn merge_round(round: u64, segments: &[SegmentResult]) -> MergedRound {
    let mut points: Vec<(f64, f64)> = segments
        .iter()
        .flat_map(|s| s.frequencies.iter().copied().zip(s.power.iter().copied()))
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut frequencies = Vec::with_capacity(points.len());
    let mut power = Vec::with_capacity(points.len());
    let mut last: Option<f64> = None;
    for (freq, pwr) in points {
        if let Some(prev) = last {
            if freq - prev <= DEDUP_TOLERANCE_HZ {
                continue;
            }
        }
        frequencies.push(freq);
        power.push(pwr);
        last = Some(freq);
    }

    MergedRound {
        round,
        frequencies,
        power,
        segment_count: segments.len(),
        timestamp: unix_seconds_now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: usize, freqs: &[f64]) -> SegmentResult {
        SegmentResult {
            segment_index: index,
            center_freq: freqs.first().copied().unwrap_or(0.0),
            frequencies: freqs.to_vec(),
            power: freqs.iter().map(|f| -f / 1e6).collect(),
            timestamp: 0.0,
        }
    }

    #[test]
    fn test_merge_sorts_and_dedups() {
        let a = segment(0, &[100.0, 101.0, 102.0]);
        let b = segment(1, &[102.5, 101.5, 200.0]);
        let merged = merge_round(3, &[b, a]);

        assert_eq!(merged.round, 3);
        assert_eq!(merged.segment_count, 2);
        assert_eq!(merged.frequencies, vec![100.0, 101.5, 200.0]);
        assert_eq!(merged.power.len(), merged.frequencies.len());
        for pair in merged.frequencies.windows(2) {
            assert!(pair[1] - pair[0] > DEDUP_TOLERANCE_HZ);
        }
    }

    #[test]
    fn test_merge_empty_round() {
        let merged = merge_round(1, &[]);
        assert!(merged.frequencies.is_empty());
        assert_eq!(merged.segment_count, 0);
    }

    #[test]
    fn test_downsample_ratio_thresholds() {
        assert_eq!(downsample_ratio(20_000, 4096, 600e6), 8);
        assert_eq!(downsample_ratio(20_000, 4096, 200e6), 4);
        assert_eq!(downsample_ratio(20_000, 4096, 50e6), 2);
        assert_eq!(downsample_ratio(20_000, 4096, 10e6), 1);
        assert_eq!(downsample_ratio(5_000, 4096, 600e6), 1);
        assert_eq!(downsample_ratio(20_000, 2048, 600e6), 1);
    }

    #[test]
    fn test_downsample_keeps_every_nth() {
        let mut f: Vec<f64> = (0..10).map(f64::from).collect();
        let mut p = f.clone();
        downsample(&mut f, &mut p, 4);
        assert_eq!(f, vec![0.0, 4.0, 8.0]);
        assert_eq!(p, f);
    }

    #[test]
    fn test_clip_to_band() {
        let mut f = vec![1.0, 2.0, 3.0, 4.0];
        let mut p = vec![10.0, 20.0, 30.0, 40.0];
        clip_to_band(&mut f, &mut p, 2.0, 3.0);
        assert_eq!(f, vec![2.0, 3.0]);
        assert_eq!(p, vec![20.0, 30.0]);

        clip_to_band(&mut f, &mut p, 50.0, 60.0);
        assert_eq!(f, vec![2.0, 3.0]);
    }
}
