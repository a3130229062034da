use log::debug;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

const HEADER_LEN: usize = 44;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no PCM data to encode")]
    EmptyPcm,

    #[error("unsupported bit depth {0}, only 16-bit PCM is produced by Piper")]
    UnsupportedBitDepth(u16),

    #[error("a WAV file needs at least one channel")]
    NoChannels,

    #[error("{0} bytes of PCM do not fit in a WAV data chunk")]
    TooLarge(usize),
}

/// PCM layout of the audio Piper sends. Fixed, never negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl Default for WavFormat {
    fn default() -> Self {
        Self {
            channels: 1,
            bits_per_sample: 16,
            sample_rate: 22050,
        }
    }
}

impl WavFormat {
    fn block_align(&self) -> u16 {
        self.channels.saturating_mul(self.bits_per_sample / 8)
    }

    fn byte_rate(&self) -> u32 {
        self.sample_rate.saturating_mul(u32::from(self.block_align()))
    }
}

/// Wrap little-endian PCM in a canonical 44-byte RIFF/WAVE header.
///
/// The payload is copied verbatim and the data chunk length is exactly
/// `pcm.len()`, odd lengths included.
pub fn encode(pcm: &[u8], format: WavFormat) -> Result<Vec<u8>, EncodeError> {
    if pcm.is_empty() {
        return Err(EncodeError::EmptyPcm);
    }
    if format.bits_per_sample != 16 {
        return Err(EncodeError::UnsupportedBitDepth(format.bits_per_sample));
    }
    if format.channels == 0 {
        return Err(EncodeError::NoChannels);
    }

    let data_size = u32::try_from(pcm.len())
        .ok()
        .filter(|size| *size <= u32::MAX - 36)
        .ok_or(EncodeError::TooLarge(pcm.len()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());

    // RIFF header
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    // fmt chunk, integer PCM
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&format.byte_rate().to_le_bytes());
    out.extend_from_slice(&format.block_align().to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());

    // data chunk
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    out.extend_from_slice(pcm);

    debug!(
        "🎼 Encoded {} bytes of PCM ({} Hz, {} ch)",
        pcm.len(),
        format.sample_rate,
        format.channels
    );
    Ok(out)
}

/// Write `bytes` to `path` through a temp file in the same directory, so the
/// destination is either untouched or complete.
pub fn save(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
