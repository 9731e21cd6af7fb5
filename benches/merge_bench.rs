use std::time::Instant;

use sdr_capture_node::scanner::SegmentResult;
use sdr_capture_node::scanner::merge::merge_round;

fn main() {
    // 20 Segmente à 8192 Bins mit 10 % Überlappung
    let bins = 8192;
    let bin_width = 2e6 / bins as f64;
    let step = 1.8e6;
    let segments: Vec<SegmentResult> = (0..20)
        .map(|i| {
            let center = 88e6 + i as f64 * step;
            let frequencies: Vec<f64> = (0..bins)
                .map(|b| center + (b as f64 - (bins / 2) as f64) * bin_width)
                .collect();
            SegmentResult {
                segment_index: i,
                center_freq: center,
                power: frequencies.iter().map(|f| -90.0 + (f / 1e5).sin()).collect(),
                frequencies,
                timestamp: 0.0,
            }
        })
        .collect();

    let iterations = 50;
    let start = Instant::now();
    let mut points = 0;
    for round in 0..iterations {
        points = merge_round(round, &segments).frequencies.len();
    }
    let elapsed = start.elapsed();

    println!(
        "Merge benchmark: {} rounds of {} segments ({} points) in {:.2?} ({:.1} rounds/s)",
        iterations,
        segments.len(),
        points,
        elapsed,
        iterations as f64 / elapsed.as_secs_f64()
    );
}
