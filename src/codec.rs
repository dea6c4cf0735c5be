//! Frame codec capability.
//!
//! Codecs are opaque platform components. They may work on their own
//! threads, but everything they produce comes back through an
//! [`OutputSink`] handed to them at creation, which posts into the owning
//! session's event loop.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::{ClipError, Result};
use crate::types::{AudioFrame, EncodedChunk, VideoFrame};

/// What a codec reports back
#[derive(Debug)]
pub enum CodecEvent<T> {
    Output(T),
    Error(ClipError),
}

/// Callback end of a codec, fixed when the codec is created.
pub struct OutputSink<T> {
    deliver: Arc<dyn Fn(CodecEvent<T>) + Send + Sync>,
}

impl<T> Clone for OutputSink<T> {
    fn clone(&self) -> Self {
        Self {
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<T> OutputSink<T> {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(CodecEvent<T>) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn output(&self, item: T) {
        (self.deliver)(CodecEvent::Output(item));
    }

    pub fn error(&self, error: ClipError) {
        (self.deliver)(CodecEvent::Error(error));
    }
}

impl<T> std::fmt::Debug for OutputSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Decoder configuration
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderConfig {
    Video {
        codec: String,
        coded_width: u32,
        coded_height: u32,
        description: Option<Bytes>,
    },
    Audio {
        codec: String,
        sample_rate: u32,
        channel_count: u16,
    },
}

impl DecoderConfig {
    pub fn codec(&self) -> &str {
        match self {
            DecoderConfig::Video { codec, .. } | DecoderConfig::Audio { codec, .. } => codec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareAcceleration {
    NoPreference,
    PreferHardware,
    PreferSoftware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaOption {
    Keep,
    Discard,
}

/// H.264 bitstream layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcFormat {
    /// Length-prefixed NAL units with an out-of-band configuration record
    Avc,
    /// Start-code delimited NAL units
    AnnexB,
}

/// Encoder configuration
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderConfig {
    Video {
        codec: String,
        width: u32,
        height: u32,
        framerate: f64,
        bitrate: u32,
        hardware_acceleration: HardwareAcceleration,
        alpha: AlphaOption,
        avc_format: AvcFormat,
    },
    Audio {
        codec: String,
        sample_rate: u32,
        channel_count: u16,
        bitrate: u32,
    },
}

/// Per-frame encode options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeFrameOptions {
    /// Force a key frame
    pub key_frame: bool,
}

/// Side data attached to an encoder output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMetadata {
    /// Decoder configuration record for the produced bitstream
    pub decoder_config: Option<Bytes>,
}

/// One encoder output event
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutput {
    pub chunk: EncodedChunk,
    pub metadata: Option<ChunkMetadata>,
}

impl EncoderOutput {
    pub fn decoder_config(&self) -> Option<&Bytes> {
        self.metadata.as_ref().and_then(|m| m.decoder_config.as_ref())
    }
}

/// A frame decoder. Output frames go to the sink it was created with.
pub trait Decoder: Send {
    fn configure(&mut self, config: &DecoderConfig) -> Result<()>;

    /// Queue a chunk. Errors from the decode itself arrive on the sink.
    fn decode(&mut self, chunk: EncodedChunk) -> Result<()>;

    /// Chunks queued but not yet turned into output
    fn queue_depth(&self) -> usize;

    fn close(&mut self);
}

/// A frame encoder over frames of type `F`.
#[async_trait]
pub trait Encoder<F: Send + 'static>: Send {
    fn configure(&mut self, config: &EncoderConfig) -> Result<()>;

    /// Queue a frame. The frame is consumed whether or not this succeeds.
    fn encode(&mut self, frame: F, options: EncodeFrameOptions) -> Result<()>;

    fn queue_depth(&self) -> usize;

    /// Emit everything still queued.
    async fn flush(&mut self) -> Result<()>;

    fn close(&mut self);
}

pub type BoxedDecoder = Box<dyn Decoder>;
pub type BoxedVideoEncoder = Box<dyn Encoder<VideoFrame>>;
pub type BoxedAudioEncoder = Box<dyn Encoder<AudioFrame>>;

/// Creates codec instances bound to a pipeline's output sinks.
pub trait CodecProvider: Send + Sync {
    fn video_decoder(&self, sink: OutputSink<VideoFrame>) -> BoxedDecoder;
    fn audio_decoder(&self, sink: OutputSink<AudioFrame>) -> BoxedDecoder;
    fn video_encoder(&self, sink: OutputSink<EncoderOutput>) -> BoxedVideoEncoder;
    fn audio_encoder(&self, sink: OutputSink<EncoderOutput>) -> BoxedAudioEncoder;
}
