// Recording file I/O: mono 16-bit PCM WAV at the capture sample rate
//
// hound writes the 44-byte header with zero sizes when the file is created
// and patches the RIFF/data sizes on finalize.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::AudioError;

/// Standard WAV spec for recordings: mono 16-bit PCM.
pub fn recording_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn write_failure(path: &Path, err: impl std::fmt::Display) -> AudioError {
    AudioError::WriteFailure {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Streaming writer for one take
pub struct RecordingWriter {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    samples_written: u64,
}

impl RecordingWriter {
    /// Create the file (and parent directories) and write the placeholder header
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self, AudioError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| write_failure(path, e))?;
            }
        }

        let writer =
            WavWriter::create(path, recording_spec(sample_rate)).map_err(|e| write_failure(path, e))?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            samples_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Append samples, clamped to [-1, 1] and quantized to 16 bits
    ///
    /// Stops at the first failing sample; the writer stays usable.
    pub fn write(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        for &sample in samples {
            let s16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            self.writer
                .write_sample(s16)
                .map_err(|e| write_failure(&self.path, e))?;
            self.samples_written += 1;
        }
        Ok(())
    }

    /// Patch the header sizes and flush the file
    pub fn finalize(self) -> Result<u64, AudioError> {
        let path = self.path;
        let written = self.samples_written;
        self.writer.finalize().map_err(|e| write_failure(&path, e))?;
        Ok(written)
    }
}

/// Load all samples from a WAV file as mono f32 in [-1.0, 1.0].
///
/// Multi-channel files are averaged down to mono. Returns (samples, spec) so
/// callers can read the sample rate.
pub fn load_samples(path: &Path) -> Result<(Vec<f32>, WavSpec), AudioError> {
    let mut reader = WavReader::open(path).map_err(|e| AudioError::HardwareError {
        details: format!("Failed to open WAV file {}: {}", path.display(), e),
    })?;

    let spec = reader.spec();
    let read_error = |e: hound::Error| AudioError::HardwareError {
        details: format!("Failed to read WAV samples from {}: {}", path.display(), e),
    };

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<hound::Result<Vec<_>>>()
                .map_err(read_error)?
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<hound::Result<Vec<_>>>()
            .map_err(read_error)?,
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((samples, spec))
}
