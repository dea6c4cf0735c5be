//! Clip extraction over MP4: demux and decode from a byte stream with
//! keyframe-accurate seeking, and encode and remux raw frames into a new
//! file that can be streamed out while it is written.

pub mod codec;
pub mod config;
pub mod container;
pub mod demux;
pub mod error;
pub mod keyframe;
pub mod progressive;
pub mod remux;
pub mod settle;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod tests;

pub use codec::{CodecProvider, Decoder, Encoder, OutputSink};
pub use config::{AudioEncodeConfig, PipelineConfig, RemuxOptions, VideoEncodeConfig};
pub use container::{ContainerParser, ContainerWriter, Mp4Demuxer, Mp4Muxer, SharedWriter};
pub use demux::{DemuxDecoder, DemuxEvent, DemuxHandle, DemuxHandler, DemuxOptions, DemuxState};
pub use error::{ClipError, Result};
pub use progressive::{file_to_stream, OutputStream, ProgressiveStop};
pub use remux::{Recodemux, RemuxHandle, RemuxStatus};
pub use source::{ByteSource, ChannelSource, ReaderSource};
