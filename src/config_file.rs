//! Configuration file support
//!
//! Loads server configuration from TOML files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{CaptureConfig, EncodeConfig, ExtractorConfig, LimitsConfig, ServerConfig};

/// Configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Server settings
    pub server: ServerSettings,
    /// Capture settings
    pub capture: Option<CaptureSettings>,
    /// Encoder settings
    pub encode: Option<EncodeSettings>,
    /// Logging settings
    pub logging: Option<LoggingSettings>,
    /// Limits settings
    pub limits: Option<LimitsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Playback position poll interval in milliseconds
    pub poll_interval_ms: Option<u64>,
    /// End-of-playback tolerance in seconds
    pub end_epsilon_secs: Option<f64>,
    /// Deadline margin beyond the duration in seconds
    pub fallback_margin_secs: Option<f64>,
    /// Chunk emission interval in milliseconds
    pub timeslice_ms: Option<u64>,
    /// Capture sample rate
    pub sample_rate: Option<u32>,
    /// Opus bitrate in bps
    pub opus_bitrate: Option<u64>,
    /// Playback speed relative to real time
    pub playback_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodeSettings {
    /// MP3 bitrate in kbps
    pub mp3_bitrate_kbps: Option<u32>,
    /// Samples per MP3 encoder call
    pub mp3_frame_samples: Option<usize>,
    /// Leading samples inspected for silence
    pub silence_probe_samples: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsSettings {
    /// Source size above which a warning is logged, in MB
    pub soft_source_limit_mb: Option<usize>,
    /// Maximum request body size in MB
    pub max_request_size_mb: Option<usize>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ConfigFile = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Generate default configuration file
    pub fn default_config() -> Self {
        let capture = CaptureConfig::default();
        let encode = EncodeConfig::default();
        let limits = LimitsConfig::default();
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 3000,
                cors_enabled: Some(true),
            },
            capture: Some(CaptureSettings {
                poll_interval_ms: Some(capture.poll_interval_ms),
                end_epsilon_secs: Some(capture.end_epsilon_secs),
                fallback_margin_secs: Some(capture.fallback_margin_secs),
                timeslice_ms: Some(capture.timeslice_ms),
                sample_rate: Some(capture.sample_rate),
                opus_bitrate: Some(capture.opus_bitrate),
                playback_rate: Some(capture.playback_rate),
            }),
            encode: Some(EncodeSettings {
                mp3_bitrate_kbps: Some(encode.mp3_bitrate_kbps),
                mp3_frame_samples: Some(encode.mp3_frame_samples),
                silence_probe_samples: Some(encode.silence_probe_samples),
            }),
            logging: Some(LoggingSettings {
                level: "debug".to_string(),
                format: Some("pretty".to_string()),
            }),
            limits: Some(LimitsSettings {
                soft_source_limit_mb: Some(limits.soft_source_limit_mb),
                max_request_size_mb: Some(limits.max_request_size_mb),
            }),
        }
    }

    /// Convert to ServerConfig
    pub fn into_server_config(self) -> ServerConfig {
        let capture_defaults = CaptureConfig::default();
        let encode_defaults = EncodeConfig::default();
        let limits_defaults = LimitsConfig::default();

        let capture = self.capture.unwrap_or_default();
        let encode = self.encode.unwrap_or_default();
        let limits = self.limits.unwrap_or_default();

        ServerConfig {
            host: self.server.host,
            port: self.server.port,
            cors_enabled: self.server.cors_enabled.unwrap_or(true),
            log_level: self
                .logging
                .as_ref()
                .map(|l| l.level.clone())
                .unwrap_or_else(|| "debug".to_string()),
            log_format: self
                .logging
                .and_then(|l| l.format)
                .unwrap_or_else(|| "pretty".to_string()),
            extractor: ExtractorConfig {
                capture: CaptureConfig {
                    poll_interval_ms: capture
                        .poll_interval_ms
                        .unwrap_or(capture_defaults.poll_interval_ms),
                    end_epsilon_secs: capture
                        .end_epsilon_secs
                        .unwrap_or(capture_defaults.end_epsilon_secs),
                    fallback_margin_secs: capture
                        .fallback_margin_secs
                        .unwrap_or(capture_defaults.fallback_margin_secs),
                    timeslice_ms: capture.timeslice_ms.unwrap_or(capture_defaults.timeslice_ms),
                    sample_rate: capture.sample_rate.unwrap_or(capture_defaults.sample_rate),
                    opus_bitrate: capture.opus_bitrate.unwrap_or(capture_defaults.opus_bitrate),
                    playback_rate: capture
                        .playback_rate
                        .unwrap_or(capture_defaults.playback_rate),
                },
                encode: EncodeConfig {
                    mp3_bitrate_kbps: encode
                        .mp3_bitrate_kbps
                        .unwrap_or(encode_defaults.mp3_bitrate_kbps),
                    mp3_frame_samples: encode
                        .mp3_frame_samples
                        .unwrap_or(encode_defaults.mp3_frame_samples),
                    silence_probe_samples: encode
                        .silence_probe_samples
                        .unwrap_or(encode_defaults.silence_probe_samples),
                },
                limits: LimitsConfig {
                    soft_source_limit_mb: limits
                        .soft_source_limit_mb
                        .unwrap_or(limits_defaults.soft_source_limit_mb),
                    max_request_size_mb: limits
                        .max_request_size_mb
                        .unwrap_or(limits_defaults.max_request_size_mb),
                },
            },
        }
    }
}

/// Generate default configuration file at the specified path
pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigFile::default_config();
    config.to_file(path)?;
    Ok(())
}
