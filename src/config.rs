//! Extractor and server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Real-time capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interval at which the playback position is polled, in milliseconds
    pub poll_interval_ms: u64,

    /// Playback counts as finished once it is within this many seconds of
    /// the declared duration
    pub end_epsilon_secs: f64,

    /// Extra wall-clock time granted beyond the duration before capture is
    /// force-stopped
    pub fallback_margin_secs: f64,

    /// Interval at which the recorder emits a chunk, in milliseconds
    pub timeslice_ms: u64,

    /// Sample rate of the capture (Opus only accepts 8/12/16/24/48 kHz)
    pub sample_rate: u32,

    /// Opus bitrate of the captured container in bps
    pub opus_bitrate: u64,

    /// Playback speed relative to real time
    pub playback_rate: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            end_epsilon_secs: 0.1,
            fallback_margin_secs: 1.0,
            timeslice_ms: 1000,
            sample_rate: 48000,
            opus_bitrate: 128000,
            playback_rate: 1.0,
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    /// Wall-clock deadline for a source of `duration_secs`.
    pub fn fallback_deadline(&self, duration_secs: f64) -> Duration {
        Duration::from_secs_f64(
            (duration_secs / self.playback_rate).max(0.0) + self.fallback_margin_secs,
        )
    }

    fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("capture.poll_interval_ms must be > 0".into());
        }
        if self.timeslice_ms == 0 {
            return Err("capture.timeslice_ms must be > 0".into());
        }
        if !(self.playback_rate.is_finite() && self.playback_rate > 0.0) {
            return Err(format!(
                "capture.playback_rate must be > 0, got {}",
                self.playback_rate
            ));
        }
        if !matches!(self.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(format!(
                "capture.sample_rate {} is not an Opus rate",
                self.sample_rate
            ));
        }
        for (name, value) in [
            ("end_epsilon_secs", self.end_epsilon_secs),
            ("fallback_margin_secs", self.fallback_margin_secs),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(format!(
                    "capture.{} must be a finite value >= 0, got {}",
                    name, value
                ));
            }
        }
        Ok(())
    }
}

/// Output encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeConfig {
    /// MP3 bitrate in kbps
    pub mp3_bitrate_kbps: u32,

    /// Samples per channel fed to the MP3 encoder per call
    pub mp3_frame_samples: usize,

    /// Number of leading frames inspected for silence
    pub silence_probe_samples: usize,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            mp3_bitrate_kbps: 128,
            mp3_frame_samples: 1152,
            silence_probe_samples: 1000,
        }
    }
}

/// Input size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Sources above this size are accepted but logged
    pub soft_source_limit_mb: usize,

    /// Hard cap on HTTP request bodies
    pub max_request_size_mb: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_source_limit_mb: 100,
            max_request_size_mb: 1024,
        }
    }
}

impl LimitsConfig {
    pub fn soft_source_limit_bytes(&self) -> usize {
        self.soft_source_limit_mb * 1024 * 1024
    }

    pub fn max_request_size_bytes(&self) -> usize {
        self.max_request_size_mb * 1024 * 1024
    }
}

/// Everything the extraction core needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub capture: CaptureConfig,
    pub encode: EncodeConfig,
    pub limits: LimitsConfig,
}

impl ExtractorConfig {
    /// Check value ranges.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.capture
            .validate()
            .map_err(crate::error::ExtractError::Config)?;
        if self.encode.mp3_frame_samples == 0 {
            return Err(crate::error::ExtractError::Config(
                "encode.mp3_frame_samples must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log output format (pretty, json)
    pub log_format: String,

    /// Extraction settings
    pub extractor: ExtractorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_enabled: true,
            log_level: "debug".to_string(),
            log_format: "pretty".to_string(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.extractor.capture.poll_interval_ms, 100);
        assert_eq!(config.extractor.capture.end_epsilon_secs, 0.1);
        assert_eq!(config.extractor.capture.fallback_margin_secs, 1.0);
        assert_eq!(config.extractor.encode.mp3_frame_samples, 1152);
        assert!(config.extractor.validate().is_ok());
    }

    #[test]
    fn test_fallback_deadline() {
        let capture = CaptureConfig::default();
        assert_eq!(capture.fallback_deadline(5.0), Duration::from_secs(6));

        let fast = CaptureConfig {
            playback_rate: 4.0,
            ..Default::default()
        };
        assert_eq!(fast.fallback_deadline(8.0), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ExtractorConfig::default();
        config.capture.playback_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.capture.sample_rate = 44100;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.encode.mp3_frame_samples = 0;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.capture.fallback_margin_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.capture.fallback_margin_secs = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.capture.end_epsilon_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = ExtractorConfig::default();
        config.capture.end_epsilon_secs = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limits_bytes() {
        let limits = LimitsConfig {
            soft_source_limit_mb: 2,
            max_request_size_mb: 3,
        };
        assert_eq!(limits.soft_source_limit_bytes(), 2 * 1024 * 1024);
        assert_eq!(limits.max_request_size_bytes(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }
}
