//! Container structure engine interface.
//!
//! The pipelines only speak to these traits. `mp4_demux` and `mp4_mux`
//! implement them on top of the `mp4` crate, with `isobmff` and `fragment`
//! reading the boxes the crate does not expose.

mod fragment;
pub(crate) mod isobmff;
pub mod memory;
pub mod mp4_demux;
pub mod mp4_mux;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{AudioCodec, ContainerMetadata, SampleDescriptor, TrackKind};

pub use mp4_demux::Mp4Demuxer;
pub use mp4_mux::{Mp4MuxConfig, Mp4Muxer};

/// What the parser found in the bytes appended so far
#[derive(Debug, Clone)]
pub enum ParseEvent {
    /// Header parsed; reported once per file
    Metadata(ContainerMetadata),
    /// Newly available samples for one track, in container order
    Samples {
        kind: TrackKind,
        samples: Vec<SampleDescriptor>,
    },
}

/// Incremental container parser.
pub trait ContainerParser: Send + 'static {
    /// Feed the next chunk of the byte stream.
    fn append(&mut self, chunk: Bytes) -> Result<Vec<ParseEvent>>;

    /// Stop producing events; later appends are ignored.
    fn stop(&mut self) {}
}

/// Track handle returned by `ContainerWriter::add_track`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub u32);

/// Video track registration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackOptions {
    pub timescale: u32,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    /// Decoder configuration record taken from the encoder's first output
    pub decoder_config: Option<Bytes>,
}

/// Audio track registration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackOptions {
    pub timescale: u32,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub sample_size: u16,
    pub codec: AudioCodec,
    pub handler: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackOptions {
    Video(VideoTrackOptions),
    Audio(AudioTrackOptions),
}

impl TrackOptions {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackOptions::Video(_) => TrackKind::Video,
            TrackOptions::Audio(_) => TrackKind::Audio,
        }
    }
}

/// Container writer.
///
/// Serialized structural units accumulate in `units()`; the list only ever
/// grows, so a reader can keep a cursor into it.
pub trait ContainerWriter: Send + 'static {
    fn add_track(&mut self, options: TrackOptions) -> Result<TrackId>;

    fn add_sample(&mut self, track: TrackId, sample: SampleDescriptor) -> Result<()>;

    /// Serialize everything buffered but not yet turned into units.
    fn flush(&mut self) -> Result<()>;

    fn units(&self) -> &[Bytes];
}

/// Writer shared between a remux session and its progressive output
pub type SharedWriter = Arc<Mutex<Box<dyn ContainerWriter>>>;

pub fn shared_writer<W: ContainerWriter>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}
