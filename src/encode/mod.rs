//! Output formats and encoders

pub mod lossy;
pub mod wav;

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::diagnostics::Warning;
use crate::error::ExtractError;

pub use lossy::{encode_lossy, FrameEncoder, LossyEncoderFactory, Mp3EncoderFactory};
pub use wav::encode_wav;

/// Matches the final extension of a file name
static EXTENSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.[^/.]+$").unwrap_or_else(|e| panic!("invalid extension regex: {}", e))
});

/// Requested output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    Wav,
    Webm,
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::Wav => "audio/wav",
            OutputFormat::Webm => "audio/webm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
            OutputFormat::Webm => "webm",
        }
    }

    /// Whether this is the recorder's native container.
    pub fn is_passthrough(&self) -> bool {
        matches!(self, OutputFormat::Webm)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "wav" => Ok(OutputFormat::Wav),
            "webm" => Ok(OutputFormat::Webm),
            other => Err(ExtractError::Config(format!(
                "unsupported output format {:?} (expected mp3, wav or webm)",
                other
            ))),
        }
    }
}

/// The terminal artifact of an extraction
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub format: OutputFormat,
    pub bytes: Bytes,
    pub mime_type: &'static str,
    pub suggested_filename: String,
    pub warnings: Vec<Warning>,
}

impl EncodedOutput {
    pub fn new(format: OutputFormat, bytes: Bytes, display_name: &str) -> Self {
        Self {
            format,
            bytes,
            mime_type: format.mime_type(),
            suggested_filename: suggested_filename(display_name, format),
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the output carries any warning.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// `movie.final.mp4` + mp3 → `movie.final_audio.mp3`
pub fn suggested_filename(display_name: &str, format: OutputFormat) -> String {
    let stem = EXTENSION_RE.replace(display_name.trim(), "");
    let stem = if stem.is_empty() { "audio" } else { stem.as_ref() };
    format!("{}_audio.{}", stem, format.extension())
}

/// Quantize a float sample to 16-bit PCM: clamp to [-1, 1], scale by 32767,
/// round to nearest.
///
/// WAV and MP3 share this. Rounding differs from plain truncation by at most
/// one step per sample, so WAV bodies are not bit-identical to a writer that
/// truncates (`0.5` stores 16384, not 16383).
pub fn quantize_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}
