//! Raw interleaved I/Q with a `Key: value` text sidecar.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::container::{decode_samples, encode_samples};
use super::{MetaValue, SignalMetadata};
use crate::core::{CaptureResult, Sample, iso8601_of};

// Annahmen, falls keine Sidecar-Datei existiert
const DEFAULT_SAMPLE_RATE: f64 = 200e3;
const DEFAULT_CENTER_FREQ: f64 = 10e6;

pub fn sidecar_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("txt")
}

pub fn write_samples<W: Write>(w: &mut W, samples: &[Sample]) -> CaptureResult<()> {
    w.write_all(&encode_samples(samples))?;
    Ok(())
}

pub fn read_samples(path: &Path) -> CaptureResult<Vec<Sample>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 {
        log::warn!(
            "{:?}: {} trailing bytes do not form a full I/Q pair, truncating",
            path,
            bytes.len() % 8
        );
    }
    Ok(decode_samples(&bytes))
}

pub fn write_sidecar<W: Write>(w: &mut W, metadata: &SignalMetadata) -> CaptureResult<()> {
    writeln!(w, "Sample_Rate: {:?}", metadata.sample_rate)?;
    writeln!(w, "Center_Freq: {:?}", metadata.center_freq)?;
    writeln!(w, "Timestamp: {}", metadata.timestamp)?;
    writeln!(w, "Duration: {:?}", metadata.duration)?;
    writeln!(w, "Samples_Count: {}", metadata.samples_count)?;
    writeln!(w, "Signal_Type: {}", metadata.signal_type)?;
    writeln!(w, "RF_Channel: {}", metadata.rf_channel)?;
    writeln!(w, "Gain: {:?}", metadata.gain)?;
    for (key, value) in &metadata.extras {
        writeln!(w, "{key}: {value}")?;
    }
    Ok(())
}

/// Metadata for a binary capture holding `samples_len` samples. Missing
/// sidecar fields keep their defaults; the timestamp falls back to the data
/// file's mtime.
pub fn read_sidecar(data_path: &Path, samples_len: usize) -> CaptureResult<SignalMetadata> {
    let mut metadata = SignalMetadata::new(DEFAULT_SAMPLE_RATE, DEFAULT_CENTER_FREQ, samples_len);
    metadata.timestamp = fs::metadata(data_path)
        .and_then(|m| m.modified())
        .map(iso8601_of)
        .unwrap_or_else(|_| iso8601_of(UNIX_EPOCH));

    let path = sidecar_path(data_path);
    if !path.exists() {
        return Ok(metadata);
    }

    for line in BufReader::new(fs::File::open(&path)?).lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "Sample_Rate" => metadata.sample_rate = value.parse().unwrap_or(metadata.sample_rate),
            "Center_Freq" => metadata.center_freq = value.parse().unwrap_or(metadata.center_freq),
            "Timestamp" => metadata.timestamp = value.to_string(),
            "Duration" => metadata.duration = value.parse().unwrap_or(metadata.duration),
            "Samples_Count" => {
                metadata.samples_count = value.parse().unwrap_or(metadata.samples_count)
            }
            "Signal_Type" => metadata.signal_type = value.to_string(),
            "RF_Channel" => metadata.rf_channel = value.parse().unwrap_or(metadata.rf_channel),
            "Gain" => metadata.gain = value.parse().unwrap_or(metadata.gain),
            "" => {}
            extra => {
                metadata
                    .extras
                    .insert(extra.to_string(), MetaValue::parse(value));
            }
        }
    }

    Ok(metadata)
}
