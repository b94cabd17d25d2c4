//! Audio transcoding module
//!
//! This module handles:
//! - Audio decoder initialization from source streams
//! - Resampling to the pipeline's planar-float working format
//! - Encoder initialization (Opus for capture, MP3 for lossy output)
//! - Decoding an assembled capture into a [`pcm::DecodedAudioBuffer`]

pub mod decoder;
pub mod encoder;
pub mod pcm;
pub mod resampler;

pub use pcm::{decode_pcm, DecodedAudioBuffer};
