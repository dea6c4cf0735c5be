//! Incremental MP4 parser on top of `mp4::Mp4Reader`.
//!
//! Appended chunks are kept in one contiguous buffer, so a byte's file offset
//! is its index. The top-level boxes are scanned as they complete; once
//! `moov` has been seen the readable part of the buffer is handed to the
//! reader again after every append and only samples not reported before are
//! emitted. A trailing `mdat` that is still arriving is readable up to the
//! bytes received so far.
//!
//! A `moov` carrying `mvex` starts a fragmented file. The reader then only
//! sees `ftyp`/`moov`, and every `moof` is read from the raw bytes once the
//! payloads of all its samples have arrived.

use bytes::Bytes;
use mp4::{ChannelConfig, Mp4Reader, Mp4Track, TrackType};
use std::collections::VecDeque;
use std::io::{Cursor, ErrorKind, Read, Seek};
use std::ops::Range;

use super::fragment::{read_trex, FragmentReader};
use super::isobmff::{find_child, read_box_header, visual_entry, VisualEntry};
use super::{ContainerParser, ParseEvent};
use crate::error::Result;
use crate::types::{AudioTrackInfo, ContainerMetadata, SampleDescriptor, TrackKind, VideoTrackInfo};

/// Reporting position within one track
#[derive(Debug, Clone, Copy)]
struct TrackCursor {
    track_id: u32,
    timescale: u32,
    /// Number of samples already emitted (sample ids are 1-based)
    reported: u32,
}

impl TrackCursor {
    fn new(track_id: u32, timescale: u32) -> Self {
        Self {
            track_id,
            timescale,
            reported: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ParseProgress {
    metadata_sent: bool,
    video: Option<TrackCursor>,
    audio: Option<TrackCursor>,
}

impl ParseProgress {
    /// Read the track metadata and set up the cursors.
    fn start<R: Read + Seek>(&mut self, reader: &Mp4Reader<R>, moov: &[u8]) -> Result<ParseEvent> {
        let metadata = read_metadata(reader, moov)?;
        self.video = metadata
            .video
            .as_ref()
            .map(|v| TrackCursor::new(v.track_id, v.timescale));
        self.audio = metadata
            .audio
            .as_ref()
            .map(|a| TrackCursor::new(a.track_id, a.timescale));
        self.metadata_sent = true;

        tracing::debug!(
            duration = metadata.duration_secs,
            video = ?metadata.video.as_ref().map(|v| &v.codec),
            audio = ?metadata.audio.as_ref().map(|a| &a.codec),
            "mp4 header parsed"
        );
        Ok(ParseEvent::Metadata(metadata))
    }

    fn track(&self, track_id: u32) -> Option<(TrackKind, TrackCursor)> {
        match (self.video, self.audio) {
            (Some(v), _) if v.track_id == track_id => Some((TrackKind::Video, v)),
            (_, Some(a)) if a.track_id == track_id => Some((TrackKind::Audio, a)),
            _ => None,
        }
    }
}

pub struct Mp4Demuxer {
    buffer: Vec<u8>,
    /// End of the complete top-level box prefix
    scan_pos: usize,
    /// Whole `moov` box, header included
    moov: Option<Range<usize>>,
    /// Complete `moof` boxes not read yet
    moofs: VecDeque<Range<usize>>,
    /// Set once a fragmented header has been parsed
    fragments: Option<FragmentReader>,
    /// `scan_pos` at the last parse of a complete prefix
    parsed_pos: usize,
    progress: ParseProgress,
    stopped: bool,
}

impl Mp4Demuxer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scan_pos: 0,
            moov: None,
            moofs: VecDeque::new(),
            fragments: None,
            parsed_pos: 0,
            progress: ParseProgress::default(),
            stopped: false,
        }
    }

    /// Bytes received so far
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Advance over every complete box. Returns the declared end of a
    /// trailing `mdat` that is still arriving.
    fn scan(&mut self) -> Result<Option<u64>> {
        loop {
            let Some(header) = read_box_header(&self.buffer[self.scan_pos..])? else {
                return Ok(None);
            };
            let end = self.scan_pos as u64 + header.size;
            if end > self.buffer.len() as u64 {
                return Ok((&header.kind == b"mdat").then_some(end));
            }
            let range = self.scan_pos..end as usize;
            match &header.kind {
                b"moov" => self.moov = Some(range),
                b"moof" => self.moofs.push_back(range),
                _ => {}
            }
            self.scan_pos = end as usize;
        }
    }

    fn parse_progressive(&mut self, size: u64, moov: Range<usize>) -> Result<Vec<ParseEvent>> {
        let moov_body = box_body(&self.buffer[moov])?;
        let mut reader = Mp4Reader::read_header(Cursor::new(&self.buffer[..]), size)?;
        let progress = &mut self.progress;
        let mut events = Vec::new();

        if !progress.metadata_sent {
            events.push(progress.start(&reader, moov_body)?);
        }

        let cursors = [
            (TrackKind::Video, progress.video.as_mut()),
            (TrackKind::Audio, progress.audio.as_mut()),
        ];
        for (kind, cursor) in cursors {
            let Some(cursor) = cursor else { continue };
            let samples = read_new_samples(&mut reader, cursor)?;
            if !samples.is_empty() {
                events.push(ParseEvent::Samples { kind, samples });
            }
        }

        Ok(events)
    }

    fn parse_fragments(&mut self, moov: Range<usize>) -> Result<Vec<ParseEvent>> {
        let mut events = Vec::new();

        if self.fragments.is_none() {
            let moov_body = box_body(&self.buffer[moov.clone()])?;
            // only the header boxes, never the fragments
            let reader = Mp4Reader::read_header(Cursor::new(&self.buffer[..moov.end]), moov.end as u64)?;
            events.push(self.progress.start(&reader, moov_body)?);
            let defaults = read_trex(moov_body)?;
            tracing::debug!(tracks = defaults.len(), "fragmented mp4");
            self.fragments = Some(FragmentReader::new(defaults));
        }
        let Some(fragments) = self.fragments.as_mut() else {
            return Ok(events);
        };

        while let Some(moof) = self.moofs.front().cloned() {
            let Some(trafs) = fragments.read_moof(&self.buffer, moof)? else {
                break;
            };
            self.moofs.pop_front();

            for traf in trafs {
                let Some((kind, cursor)) = self.progress.track(traf.track_id) else {
                    continue;
                };
                let samples: Vec<SampleDescriptor> = traf
                    .samples
                    .iter()
                    .map(|s| s.to_descriptor(&self.buffer, cursor.timescale))
                    .collect();
                if !samples.is_empty() {
                    events.push(ParseEvent::Samples { kind, samples });
                }
            }
        }
        Ok(events)
    }
}

impl Default for Mp4Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerParser for Mp4Demuxer {
    fn append(&mut self, chunk: Bytes) -> Result<Vec<ParseEvent>> {
        if self.stopped {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(&chunk);

        let partial_mdat = self.scan()?;
        let Some(moov) = self.moov.clone() else {
            return Ok(Vec::new());
        };

        let fragmented = match self.fragments {
            Some(_) => true,
            None if self.progress.metadata_sent => false,
            None => find_child(box_body(&self.buffer[moov.clone()])?, b"mvex")?.is_some(),
        };
        if fragmented {
            return self.parse_fragments(moov);
        }

        let size = match partial_mdat {
            Some(end) => end,
            None if self.scan_pos > self.parsed_pos => self.scan_pos as u64,
            None => return Ok(Vec::new()),
        };
        self.parsed_pos = self.scan_pos;

        self.parse_progressive(size, moov)
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.buffer = Vec::new();
        self.moofs.clear();
    }
}

/// Body of a complete box
fn box_body(box_bytes: &[u8]) -> Result<&[u8]> {
    let header_len = read_box_header(box_bytes)?.map_or(box_bytes.len(), |h| h.header_len as usize);
    Ok(&box_bytes[header_len..])
}

fn read_new_samples<R: Read + Seek>(
    reader: &mut Mp4Reader<R>,
    cursor: &mut TrackCursor,
) -> Result<Vec<SampleDescriptor>> {
    let count = match reader.tracks().get(&cursor.track_id) {
        Some(track) => track.sample_count(),
        None => return Ok(Vec::new()),
    };

    let mut samples = Vec::new();
    while cursor.reported < count {
        let sample_id = cursor.reported + 1;
        match reader.read_sample(cursor.track_id, sample_id) {
            Ok(Some(sample)) => {
                let dts = sample.start_time as i64;
                samples.push(SampleDescriptor {
                    data: sample.bytes,
                    dts,
                    cts: dts + sample.rendering_offset as i64,
                    duration: sample.duration,
                    is_sync: sample.is_sync,
                    timescale: cursor.timescale,
                });
            }
            Ok(None) => {}
            // payload not received yet
            Err(mp4::Error::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        cursor.reported = sample_id;
    }
    Ok(samples)
}

fn read_metadata<R: Read + Seek>(reader: &Mp4Reader<R>, moov: &[u8]) -> Result<ContainerMetadata> {
    let mut ids: Vec<u32> = reader.tracks().keys().copied().collect();
    ids.sort_unstable();

    let mut metadata = ContainerMetadata {
        duration_secs: reader.duration().as_secs_f64(),
        video: None,
        audio: None,
    };

    for id in ids {
        let Some(track) = reader.tracks().get(&id) else {
            continue;
        };
        match track.track_type() {
            Ok(TrackType::Video) if metadata.video.is_none() => {
                let entry = visual_entry(moov, id)?;
                metadata.video = Some(video_info(track, entry));
            }
            Ok(TrackType::Audio) if metadata.audio.is_none() => {
                metadata.audio = Some(audio_info(track));
            }
            _ => {}
        }
    }
    Ok(metadata)
}

fn sample_entry(track: &Mp4Track) -> String {
    track
        .box_type()
        .map(|t| t.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn video_info(track: &Mp4Track, entry: Option<VisualEntry>) -> VideoTrackInfo {
    let (codec, width, height, description) = match entry {
        Some(entry) => (
            entry.codec(),
            entry.width as u32,
            entry.height as u32,
            entry.config.map(|(_, record)| record),
        ),
        None => (sample_entry(track), track.width() as u32, track.height() as u32, None),
    };

    VideoTrackInfo {
        track_id: track.track_id(),
        codec,
        width,
        height,
        timescale: track.timescale(),
        description,
    }
}

fn channel_count(config: ChannelConfig) -> u16 {
    match config {
        ChannelConfig::Mono => 1,
        ChannelConfig::Stereo => 2,
        ChannelConfig::Three => 3,
        ChannelConfig::Four => 4,
        ChannelConfig::Five => 5,
        ChannelConfig::FiveOne => 6,
        ChannelConfig::SevenOne => 8,
    }
}

fn audio_info(track: &Mp4Track) -> AudioTrackInfo {
    AudioTrackInfo {
        track_id: track.track_id(),
        codec: sample_entry(track),
        sample_rate: track.sample_freq_index().map(|i| i.freq()).unwrap_or(0),
        channel_count: track.channel_config().map(channel_count).unwrap_or(0),
        timescale: track.timescale(),
    }
}
