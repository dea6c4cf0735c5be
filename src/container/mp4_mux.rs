//! MP4 container writer on top of `mp4::Mp4Writer`.
//!
//! The file layout is `ftyp`, `mdat`, `moov`. The `ftyp` box is final as soon
//! as the writer starts and is published as the first unit. The `mdat` size
//! is patched when the file is finalized, so everything after `ftyp` is
//! published as a single unit by `flush()`.

use bytes::Bytes;
use mp4::{
    AacConfig, AudioObjectType, AvcConfig, ChannelConfig, HevcConfig, MediaConfig, Mp4Config,
    Mp4Sample, Mp4Writer, SampleFreqIndex, TrackConfig, TrackType, Vp9Config,
};

use super::memory::MemoryWriter;
use super::{AudioTrackOptions, ContainerWriter, TrackId, TrackOptions, VideoTrackOptions};
use crate::error::{ClipError, Result};
use crate::types::{AudioCodec, SampleDescriptor, TrackKind};

/// File-level muxer options
#[derive(Debug, Clone)]
pub struct Mp4MuxConfig {
    pub major_brand: String,
    pub minor_version: u32,
    pub compatible_brands: Vec<String>,
    /// Movie timescale (mvhd)
    pub timescale: u32,
}

impl Default for Mp4MuxConfig {
    fn default() -> Self {
        Self {
            major_brand: "isom".to_string(),
            minor_version: 512,
            compatible_brands: ["isom", "iso2", "avc1", "mp42", "mp41"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timescale: 1000,
        }
    }
}

pub struct Mp4Muxer {
    /// `None` once the file has been finalized
    writer: Option<Mp4Writer<MemoryWriter>>,
    output: MemoryWriter,
    units: Vec<Bytes>,
    header_len: usize,
    tracks: Vec<TrackKind>,
}

impl Mp4Muxer {
    pub fn new(config: Mp4MuxConfig) -> Result<Self> {
        let mp4_config = Mp4Config {
            major_brand: parse_brand(&config.major_brand)?,
            minor_version: config.minor_version,
            compatible_brands: config
                .compatible_brands
                .iter()
                .map(|b| parse_brand(b))
                .collect::<Result<Vec<_>>>()?,
            timescale: config.timescale,
        };

        let output = MemoryWriter::new();
        let writer = Mp4Writer::write_start(output.clone(), &mp4_config)?;

        let head = output.slice(0, 4);
        if head.len() < 4 {
            return Err(ClipError::Container("ftyp was not written".to_string()));
        }
        let header_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;

        Ok(Self {
            writer: Some(writer),
            units: vec![output.slice(0, header_len)],
            output,
            header_len,
            tracks: Vec::new(),
        })
    }

    pub fn is_finalized(&self) -> bool {
        self.writer.is_none()
    }

    fn writer_mut(&mut self) -> Result<&mut Mp4Writer<MemoryWriter>> {
        self.writer
            .as_mut()
            .ok_or_else(|| ClipError::Container("muxer already finalized".to_string()))
    }
}

impl ContainerWriter for Mp4Muxer {
    fn add_track(&mut self, options: TrackOptions) -> Result<TrackId> {
        let kind = options.kind();
        let track_config = match options {
            TrackOptions::Video(video) => video_track_config(&video)?,
            TrackOptions::Audio(audio) => audio_track_config(&audio)?,
        };

        self.writer_mut()?.add_track(&track_config)?;
        self.tracks.push(kind);

        let id = TrackId(self.tracks.len() as u32);
        tracing::debug!(track_id = id.0, %kind, "mp4 track added");
        Ok(id)
    }

    fn add_sample(&mut self, track: TrackId, sample: SampleDescriptor) -> Result<()> {
        if track.0 == 0 || track.0 as usize > self.tracks.len() {
            return Err(ClipError::Container(format!("unknown track {}", track.0)));
        }

        let mp4_sample = Mp4Sample {
            start_time: sample.dts.max(0) as u64,
            duration: sample.duration,
            rendering_offset: (sample.cts - sample.dts) as i32,
            is_sync: sample.is_sync,
            bytes: sample.data,
        };
        self.writer_mut()?.write_sample(track.0, &mp4_sample)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.write_end()?;
            let body = self.output.tail(self.header_len);
            tracing::debug!(
                bytes = body.len(),
                tracks = self.tracks.len(),
                "mp4 finalized"
            );
            self.units.push(body);
        }
        Ok(())
    }

    fn units(&self) -> &[Bytes] {
        &self.units
    }
}

fn parse_brand(brand: &str) -> Result<mp4::FourCC> {
    brand
        .parse()
        .map_err(|_| ClipError::Configuration(format!("invalid brand {:?}", brand)))
}

fn dimension(value: u32, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| ClipError::Configuration(format!("{} {} does not fit the track header", what, value)))
}

fn video_track_config(video: &VideoTrackOptions) -> Result<TrackConfig> {
    let width = dimension(video.width, "width")?;
    let height = dimension(video.height, "height")?;

    let codec = video.codec.as_str();
    let media_conf = if codec.starts_with("avc1") || codec.starts_with("avc3") {
        let record = video.decoder_config.as_ref().ok_or_else(|| {
            ClipError::Configuration("AVC track needs a decoder configuration record".to_string())
        })?;
        let (sps, pps) = split_avc_config_record(record)?;
        MediaConfig::AvcConfig(AvcConfig {
            width,
            height,
            seq_param_set: sps,
            pic_param_set: pps,
        })
    } else if codec.starts_with("hvc1") || codec.starts_with("hev1") {
        MediaConfig::HevcConfig(HevcConfig { width, height })
    } else if codec.starts_with("vp09") {
        MediaConfig::Vp9Config(Vp9Config { width, height })
    } else {
        return Err(ClipError::Configuration(format!(
            "unsupported video codec {:?}",
            codec
        )));
    };

    Ok(TrackConfig {
        track_type: TrackType::Video,
        timescale: video.timescale,
        language: "und".to_string(),
        media_conf,
    })
}

fn audio_track_config(audio: &AudioTrackOptions) -> Result<TrackConfig> {
    let media_conf = match audio.codec {
        AudioCodec::Aac => MediaConfig::AacConfig(AacConfig {
            bitrate: 0,
            profile: AudioObjectType::AacLowComplexity,
            freq_index: sample_rate_to_index(audio.sample_rate)?,
            chan_conf: channels_to_config(audio.channel_count)?,
        }),
        AudioCodec::Opus => {
            return Err(ClipError::Configuration(format!(
                "the mp4 writer has no {} sample entry",
                audio.codec.sample_entry()
            )))
        }
    };

    Ok(TrackConfig {
        track_type: TrackType::Audio,
        timescale: audio.timescale,
        language: "und".to_string(),
        media_conf,
    })
}

fn sample_rate_to_index(sample_rate: u32) -> Result<SampleFreqIndex> {
    Ok(match sample_rate {
        96000 => SampleFreqIndex::Freq96000,
        88200 => SampleFreqIndex::Freq88200,
        64000 => SampleFreqIndex::Freq64000,
        48000 => SampleFreqIndex::Freq48000,
        44100 => SampleFreqIndex::Freq44100,
        32000 => SampleFreqIndex::Freq32000,
        24000 => SampleFreqIndex::Freq24000,
        22050 => SampleFreqIndex::Freq22050,
        16000 => SampleFreqIndex::Freq16000,
        12000 => SampleFreqIndex::Freq12000,
        11025 => SampleFreqIndex::Freq11025,
        8000 => SampleFreqIndex::Freq8000,
        7350 => SampleFreqIndex::Freq7350,
        other => {
            return Err(ClipError::Configuration(format!(
                "no AAC frequency index for {} Hz",
                other
            )))
        }
    })
}

fn channels_to_config(channels: u16) -> Result<ChannelConfig> {
    Ok(match channels {
        1 => ChannelConfig::Mono,
        2 => ChannelConfig::Stereo,
        3 => ChannelConfig::Three,
        4 => ChannelConfig::Four,
        5 => ChannelConfig::Five,
        6 => ChannelConfig::FiveOne,
        8 => ChannelConfig::SevenOne,
        other => {
            return Err(ClipError::Configuration(format!(
                "no AAC channel configuration for {} channels",
                other
            )))
        }
    })
}

/// First SPS and PPS out of an `AVCDecoderConfigurationRecord`.
pub fn split_avc_config_record(record: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let invalid = |what: &str| ClipError::Configuration(format!("avcC record: {}", what));

    if record.len() < 7 || record[0] != 1 {
        return Err(invalid("bad header"));
    }

    let mut pos = 5;
    let num_sps = (record[pos] & 0x1f) as usize;
    pos += 1;
    let mut sps = None;
    for _ in 0..num_sps {
        let (nal, next) = read_nal(record, pos).ok_or_else(|| invalid("truncated SPS"))?;
        sps.get_or_insert_with(|| nal.to_vec());
        pos = next;
    }

    let num_pps = *record.get(pos).ok_or_else(|| invalid("missing PPS count"))? as usize;
    pos += 1;
    let mut pps = None;
    for _ in 0..num_pps {
        let (nal, next) = read_nal(record, pos).ok_or_else(|| invalid("truncated PPS"))?;
        pps.get_or_insert_with(|| nal.to_vec());
        pos = next;
    }

    match (sps, pps) {
        (Some(sps), Some(pps)) => Ok((sps, pps)),
        _ => Err(invalid("no SPS/PPS")),
    }
}

fn read_nal(record: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let len_bytes = record.get(pos..pos + 2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let start = pos + 2;
    let nal = record.get(start..start + len)?;
    Some((nal, start + len))
}
