use thiserror::Error;

use crate::diagnostics::Stage;

/// Main error type for an extraction
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The source bytes are not a decodable media container
    #[error("Media load error: {0}")]
    MediaLoad(String),

    /// The capture session could not start or produced no usable chunks
    #[error("Capture error: {0}")]
    Capture(String),

    /// The assembled capture could not be decoded to samples
    #[error("Decode error: {0}")]
    Decode(String),

    /// The target encoder could not initialize or produced no output
    #[error("Encode error: {0}")]
    Encode(String),

    /// Another invocation holds the shared capture context
    #[error("Another extraction is already in progress")]
    Busy,

    /// The invocation was cancelled by its caller
    #[error("Extraction cancelled")]
    Cancelled,

    /// Invalid configuration or request parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking worker panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl ExtractError {
    /// The pipeline stage the error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            ExtractError::MediaLoad(_) => Stage::LoadMetadata,
            ExtractError::Capture(_) => Stage::Capture,
            ExtractError::Decode(_) => Stage::Decode,
            ExtractError::Encode(_) => Stage::Encode,
            ExtractError::Busy | ExtractError::Config(_) => Stage::Setup,
            ExtractError::Cancelled | ExtractError::Worker(_) => Stage::Pipeline,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::MediaLoad(_) => "media_load",
            ExtractError::Capture(_) => "capture",
            ExtractError::Decode(_) => "decode",
            ExtractError::Encode(_) => "encode",
            ExtractError::Busy => "busy",
            ExtractError::Cancelled => "cancelled",
            ExtractError::Config(_) => "config",
            ExtractError::Worker(_) => "worker",
        }
    }

    /// Human-readable message naming the failed stage.
    pub fn user_message(&self) -> String {
        format!("{} failed: {}", self.stage(), self)
    }
}

impl From<tokio::task::JoinError> for ExtractError {
    fn from(err: tokio::task::JoinError) -> Self {
        ExtractError::Worker(err.to_string())
    }
}

/// FFmpeg-specific errors
#[derive(Error, Debug)]
pub enum FfmpegError {
    /// Failure during global FFmpeg initialization
    #[error("FFmpeg initialization failed: {0}")]
    InitFailed(String),

    /// Failure opening an in-memory input
    #[error("Failed to open input: {0}")]
    OpenInput(String),

    /// Failure locating stream information within the input
    #[error("Failed to find stream info: {0}")]
    FindStreamInfo(String),

    /// Failure instantiating a decoder
    #[error("Failed to create decoder: {0}")]
    DecoderCreate(String),

    /// The requested encoder was not found in this FFmpeg build
    #[error("Failed to find encoder: {0}")]
    EncoderNotFound(String),

    /// Failure opening an encoder with the requested parameters
    #[error("Failed to create encoder: {0}")]
    EncoderCreate(String),

    /// Failure creating an audio resampler
    #[error("Failed to create resampler: {0}")]
    ResamplerCreate(String),

    /// Failure resampling a frame
    #[error("Failed to resample frame: {0}")]
    Resample(String),

    /// Failure creating an output format muxer
    #[error("Failed to create muxer: {0}")]
    MuxerCreate(String),

    /// Failure writing the container header
    #[error("Failed to write header: {0}")]
    WriteHeader(String),

    /// Failure writing a media packet to the container
    #[error("Failed to write packet: {0}")]
    WritePacket(String),

    /// Failure writing the container trailer
    #[error("Failed to write trailer: {0}")]
    WriteTrailer(String),

    /// Failure decoding a packet into frames
    #[error("Failed to decode packet: {0}")]
    DecodePacket(String),

    /// Failure encoding a frame into packets
    #[error("Failed to encode frame: {0}")]
    EncodeFrame(String),

    /// Failure configuring stream contexts or parameters
    #[error("Stream configuration failed: {0}")]
    StreamConfig(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ExtractError>;
