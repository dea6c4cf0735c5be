//! Shared data model: samples, track buffers, container metadata, frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Microseconds per second, the unit of every chunk and frame timestamp
pub const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Media type of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Audio codec family used when re-encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl AudioCodec {
    /// Codec string handed to the audio encoder
    pub fn codec_string(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "mp4a.40.2",
            AudioCodec::Opus => "opus",
        }
    }

    /// Sample entry type written into the container
    pub fn sample_entry(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "mp4a",
            AudioCodec::Opus => "Opus",
        }
    }
}

/// One sample as reported by the container parser.
///
/// Timestamps and duration are in `timescale` units. The payload is shared,
/// so handing a sample to a decoder more than once never copies it.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDescriptor {
    pub data: Bytes,
    pub dts: i64,
    pub cts: i64,
    pub duration: u32,
    pub is_sync: bool,
    pub timescale: u32,
}

impl SampleDescriptor {
    /// Composition timestamp in microseconds
    pub fn cts_micros(&self) -> i64 {
        (MICROS_PER_SEC * self.cts as f64 / self.timescale as f64) as i64
    }

    /// Duration in microseconds
    pub fn duration_micros(&self) -> u64 {
        (MICROS_PER_SEC * self.duration as f64 / self.timescale as f64) as u64
    }

    /// Convert into decoder input
    pub fn to_chunk(&self) -> EncodedChunk {
        EncodedChunk {
            data: self.data.clone(),
            timestamp: self.cts_micros(),
            duration: self.duration_micros(),
            is_key: self.is_sync,
        }
    }
}

/// Append-only sample list for one track.
///
/// Samples are kept in the order the container reports them. Nothing is
/// ever evicted; the whole track stays in memory for the session.
#[derive(Debug, Clone)]
pub struct TrackBuffer {
    kind: TrackKind,
    samples: Vec<SampleDescriptor>,
}

impl TrackBuffer {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            samples: Vec::new(),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn push(&mut self, sample: SampleDescriptor) {
        if let Some(last) = self.samples.last() {
            if sample.cts < last.cts {
                tracing::trace!(
                    kind = %self.kind,
                    prev = last.cts,
                    cts = sample.cts,
                    "sample composition time goes backwards (reordered stream)"
                );
            }
        }
        self.samples.push(sample);
    }

    pub fn extend<I: IntoIterator<Item = SampleDescriptor>>(&mut self, samples: I) {
        for sample in samples {
            self.push(sample);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SampleDescriptor> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[SampleDescriptor] {
        &self.samples
    }

    /// Every sample from `index` to the end of what is currently known
    pub fn suffix_from(&self, index: usize) -> &[SampleDescriptor] {
        self.samples.get(index..).unwrap_or(&[])
    }

    /// Sum of all sample durations, in the track's timescale units
    pub fn total_duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }
}

/// Video track parameters needed to configure a decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTrackInfo {
    pub track_id: u32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    /// Decoder configuration record (avcC / hvcC / vpcC body)
    #[serde(skip)]
    pub description: Option<Bytes>,
}

/// Audio track parameters needed to configure a decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackInfo {
    pub track_id: u32,
    pub codec: String,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub timescale: u32,
}

/// Container-level metadata as reported by the parser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Total duration in seconds; zero in fragmented headers until corrected
    pub duration_secs: f64,
    pub video: Option<VideoTrackInfo>,
    pub audio: Option<AudioTrackInfo>,
}

impl ContainerMetadata {
    /// Replace the header duration with the sum of known video sample durations.
    pub fn with_corrected_duration(&self, video: &TrackBuffer) -> Self {
        let mut corrected = self.clone();
        if let Some(info) = &self.video {
            if info.timescale > 0 {
                corrected.duration_secs = video.total_duration() as f64 / info.timescale as f64;
            }
        }
        corrected
    }
}

/// Compressed unit flowing between codecs and the container.
///
/// Timestamp and duration are in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub timestamp: i64,
    pub duration: u64,
    pub is_key: bool,
}

impl EncodedChunk {
    /// Copy the payload into an owned buffer and describe it as a container sample.
    pub fn to_sample(&self, timescale: u32) -> SampleDescriptor {
        let scale = timescale as f64 / MICROS_PER_SEC;
        let ts = (self.timestamp as f64 * scale) as i64;
        SampleDescriptor {
            data: Bytes::copy_from_slice(&self.data),
            dts: ts,
            cts: ts,
            duration: (self.duration as f64 * scale) as u32,
            is_sync: self.is_key,
            timescale,
        }
    }
}

/// A raw video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub timestamp: i64,
    pub duration: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// A block of raw audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub timestamp: i64,
    pub duration: u64,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub frame_count: u32,
    pub data: Bytes,
}

/// Pending decode work per track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub video: usize,
    pub audio: usize,
}

impl QueueDepth {
    pub fn is_drained(&self) -> bool {
        self.video == 0 && self.audio == 0
    }
}
