//! `.rfc` container: header, sample blocks, JSON attribute trailer.
//!
//! ```text
//! "RFCAPv1\0" | compression u8
//! { u32 sample_count | u32 byte_len | payload }*
//! trailer json | u32 trailer_len | "RFCEND\0\0"
//! ```
//!
//! Payloads are interleaved little-endian f32 I/Q, deflated when the header
//! says so. All integers are little-endian.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};

use super::{Extras, FILE_VERSION, SignalMetadata};
use crate::core::{CaptureError, CaptureResult, Sample};

pub const MAGIC: &[u8; 8] = b"RFCAPv1\0";
pub const END_TAG: &[u8; 8] = b"RFCEND\0\0";
const HEADER_LEN: u64 = 9;
const TAIL_LEN: u64 = 12;
const BLOCK_HEADER_LEN: u64 = 8;

const RESERVED_KEYS: [&str; 9] = [
    "sample_rate",
    "center_freq",
    "timestamp",
    "duration",
    "samples_count",
    "signal_type",
    "rf_channel",
    "gain",
    "file_version",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Deflate,
    None,
}

impl Compression {
    fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Deflate => 1,
        }
    }

    fn from_tag(tag: u8) -> CaptureResult<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Deflate),
            other => Err(CaptureError::format(format!("unknown compression tag {other}"))),
        }
    }
}

impl FromStr for Compression {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deflate" | "gzip" => Ok(Compression::Deflate),
            "none" | "" => Ok(Compression::None),
            other => Err(CaptureError::format(format!("unsupported compression '{other}'"))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Deflate => f.write_str("deflate"),
            Compression::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Attributes {
    sample_rate: f64,
    center_freq: f64,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    samples_count: usize,
    #[serde(default = "unknown_signal")]
    signal_type: String,
    #[serde(default)]
    rf_channel: usize,
    #[serde(default)]
    gain: f64,
    #[serde(default)]
    file_version: String,
    #[serde(flatten)]
    extras: Extras,
}

fn unknown_signal() -> String {
    "unknown".to_string()
}

impl Attributes {
    fn from_metadata(metadata: &SignalMetadata) -> Self {
        let extras = metadata
            .extras
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            sample_rate: metadata.sample_rate,
            center_freq: metadata.center_freq,
            timestamp: metadata.timestamp.clone(),
            duration: metadata.duration,
            samples_count: metadata.samples_count,
            signal_type: metadata.signal_type.clone(),
            rf_channel: metadata.rf_channel,
            gain: metadata.gain,
            file_version: FILE_VERSION.to_string(),
            extras,
        }
    }

    fn into_metadata(self) -> SignalMetadata {
        SignalMetadata {
            sample_rate: self.sample_rate,
            center_freq: self.center_freq,
            timestamp: self.timestamp,
            duration: self.duration,
            samples_count: self.samples_count,
            signal_type: self.signal_type,
            rf_channel: self.rf_channel,
            gain: self.gain,
            extras: self.extras,
        }
    }
}

pub fn encode_samples(samples: &[Sample]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 8);
    for s in samples {
        // Vec<u8> writes never fail
        let _ = buf.write_f32::<LittleEndian>(s.re);
        let _ = buf.write_f32::<LittleEndian>(s.im);
    }
    buf
}

pub fn decode_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(8)
        .map(|pair| {
            let mut c = pair;
            let re = c.read_f32::<LittleEndian>().unwrap_or(0.0);
            let im = c.read_f32::<LittleEndian>().unwrap_or(0.0);
            Sample::new(re, im)
        })
        .collect()
}

/// Streaming writer. Blocks can be appended until [`ContainerWriter::finish`].
pub struct ContainerWriter<W: Write> {
    inner: W,
    compression: Compression,
    samples_written: usize,
    blocks_written: usize,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(mut inner: W, compression: Compression) -> CaptureResult<Self> {
        inner.write_all(MAGIC)?;
        inner.write_u8(compression.tag())?;
        Ok(Self {
            inner,
            compression,
            samples_written: 0,
            blocks_written: 0,
        })
    }

    pub fn write_block(&mut self, samples: &[Sample]) -> CaptureResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let raw = encode_samples(samples);
        let payload = match self.compression {
            Compression::None => raw,
            Compression::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
                encoder.write_all(&raw)?;
                encoder.finish()?
            }
        };
        let byte_len = u32::try_from(payload.len())
            .map_err(|_| CaptureError::format("block exceeds 4 GiB"))?;

        self.inner.write_u32::<LittleEndian>(samples.len() as u32)?;
        self.inner.write_u32::<LittleEndian>(byte_len)?;
        self.inner.write_all(&payload)?;
        self.samples_written += samples.len();
        self.blocks_written += 1;
        Ok(())
    }

    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn flush(&mut self) -> CaptureResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Writes the trailer and hands back the underlying writer.
    pub fn finish(mut self, metadata: &SignalMetadata) -> CaptureResult<W> {
        let trailer = serde_json::to_vec(&Attributes::from_metadata(metadata))
            .map_err(|e| CaptureError::with_context("encoding container attributes", e))?;
        self.inner.write_all(&trailer)?;
        self.inner.write_u32::<LittleEndian>(trailer.len() as u32)?;
        self.inner.write_all(END_TAG)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Parsed container layout.
#[derive(Debug)]
struct Layout {
    compression: Compression,
    blocks_end: u64,
    metadata: SignalMetadata,
}

fn read_layout<R: Read + Seek>(reader: &mut R) -> CaptureResult<Layout> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    if file_len < HEADER_LEN + TAIL_LEN {
        return Err(CaptureError::format("container truncated"));
    }

    reader.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CaptureError::format("invalid container magic"));
    }
    let compression = Compression::from_tag(reader.read_u8()?)?;

    reader.seek(SeekFrom::Start(file_len - TAIL_LEN))?;
    let trailer_len = reader.read_u32::<LittleEndian>()? as u64;
    let mut end = [0u8; 8];
    reader.read_exact(&mut end)?;
    if &end != END_TAG {
        return Err(CaptureError::format("missing container end tag (unfinished write?)"));
    }
    if trailer_len + HEADER_LEN + TAIL_LEN > file_len {
        return Err(CaptureError::format(format!("invalid trailer length {trailer_len}")));
    }

    let blocks_end = file_len - TAIL_LEN - trailer_len;
    reader.seek(SeekFrom::Start(blocks_end))?;
    let mut trailer = vec![0u8; trailer_len as usize];
    reader.read_exact(&mut trailer)?;
    let attributes: Attributes = serde_json::from_slice(&trailer)
        .map_err(|e| CaptureError::format(format!("invalid container attributes: {e}")))?;

    Ok(Layout {
        compression,
        blocks_end,
        metadata: attributes.into_metadata(),
    })
}

pub fn read_container(path: &Path) -> CaptureResult<(Vec<Sample>, SignalMetadata)> {
    let mut reader = BufReader::new(File::open(path)?);
    let layout = read_layout(&mut reader)?;

    reader.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut samples = Vec::with_capacity(layout.metadata.samples_count);
    let mut offset = HEADER_LEN;
    while offset < layout.blocks_end {
        let count = reader.read_u32::<LittleEndian>()? as usize;
        let byte_len = reader.read_u32::<LittleEndian>()? as u64;
        offset += BLOCK_HEADER_LEN + byte_len;
        if offset > layout.blocks_end {
            return Err(CaptureError::format("block overruns attribute trailer"));
        }

        let mut payload = vec![0u8; byte_len as usize];
        reader.read_exact(&mut payload)?;
        let raw = match layout.compression {
            Compression::None => payload,
            Compression::Deflate => {
                let mut out = Vec::with_capacity(count * 8);
                DeflateDecoder::new(payload.as_slice()).read_to_end(&mut out)?;
                out
            }
        };
        if raw.len() != count * 8 {
            return Err(CaptureError::format(format!(
                "block declares {} samples but holds {} bytes",
                count,
                raw.len()
            )));
        }
        samples.extend(decode_samples(&raw));
    }

    Ok((samples, layout.metadata))
}

/// Sums block headers without decoding payloads.
pub fn count_samples(path: &Path) -> CaptureResult<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let layout = read_layout(&mut reader)?;

    let mut total = 0usize;
    let mut offset = HEADER_LEN;
    while offset < layout.blocks_end {
        reader.seek(SeekFrom::Start(offset))?;
        total += reader.read_u32::<LittleEndian>()? as usize;
        offset += BLOCK_HEADER_LEN + reader.read_u32::<LittleEndian>()? as u64;
    }
    if offset != layout.blocks_end {
        return Err(CaptureError::format("block table does not end at trailer"));
    }
    Ok(total)
}

pub fn read_metadata(path: &Path) -> CaptureResult<SignalMetadata> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(read_layout(&mut reader)?.metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MetaValue;
    use std::io::Cursor;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new(i as f32, -(i as f32) * 0.5)).collect()
    }

    fn write_to(path: &Path, compression: Compression, blocks: &[Vec<Sample>]) -> SignalMetadata {
        let total = blocks.iter().map(Vec::len).sum();
        let mut metadata = SignalMetadata::new(2e6, 100e6, total);
        metadata.set_extra("overflow_count", 0u32);
        metadata.set_extra("recording_mode", "buffered");

        let file = File::create(path).unwrap();
        let mut writer = ContainerWriter::new(file, compression).unwrap();
        for block in blocks {
            writer.write_block(block).unwrap();
        }
        writer.finish(&metadata).unwrap();
        metadata
    }

    #[test]
    fn test_deflate_container_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rfc");
        let written = write_to(&path, Compression::Deflate, &[samples(1000), samples(24)]);

        let (loaded, metadata) = read_container(&path).unwrap();
        assert_eq!(loaded.len(), 1024);
        assert_eq!(loaded[999], Sample::new(999.0, -499.5));
        assert_eq!(metadata, written);
        assert_eq!(count_samples(&path).unwrap(), 1024);
    }

    #[test]
    fn test_uncompressed_container_counts_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.rfc");
        write_to(&path, Compression::None, &[samples(10), samples(10), samples(5)]);
        assert_eq!(count_samples(&path).unwrap(), 25);
        assert_eq!(read_metadata(&path).unwrap().extra("recording_mode"), Some(&MetaValue::from("buffered")));
    }

    #[test]
    fn test_unfinished_container_is_rejected() {
        let mut buf = Vec::new();
        {
            let mut writer = ContainerWriter::new(&mut buf, Compression::None).unwrap();
            writer.write_block(&samples(4)).unwrap();
        }
        let err = read_layout(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code(), "format_error");
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!("deflate".parse::<Compression>().unwrap(), Compression::Deflate);
        assert_eq!("NONE".parse::<Compression>().unwrap(), Compression::None);
        assert!("lzma".parse::<Compression>().is_err());
    }
}
