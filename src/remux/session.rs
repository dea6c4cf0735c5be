//! Remux session event loop.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::RemuxStatus;
use crate::codec::{
    BoxedAudioEncoder, BoxedVideoEncoder, CodecEvent, CodecProvider, EncodeFrameOptions,
    EncoderConfig, EncoderOutput, OutputSink,
};
use crate::config::RemuxOptions;
use crate::container::{AudioTrackOptions, SharedWriter, TrackId, TrackOptions, VideoTrackOptions};
use crate::types::{AudioFrame, EncodedChunk, TrackKind, VideoFrame};

/// Timescale of both output tracks
pub(super) const OUTPUT_TIMESCALE: u32 = 1_000_000;
pub(super) const VIDEO_CODEC: &str = "avc1.42E01F";
const AUDIO_BITRATE: u32 = 128_000;

pub(super) enum Event {
    EncodeVideo(VideoFrame, EncodeFrameOptions),
    EncodeAudio(AudioFrame),
    VideoOutput(CodecEvent<EncoderOutput>),
    AudioOutput(CodecEvent<EncoderOutput>),
    Close(Option<oneshot::Sender<()>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemuxState {
    NoTracks,
    VideoTrackPending,
    BothTracksActive,
    Closed,
}

/// Video track registration waits for the encoder's first configuration record.
enum VideoTrack {
    Pending(Vec<EncodedChunk>),
    Active(TrackId),
    Failed,
}

/// The audio encoder only exists once the audio track is registered.
enum AudioTrack {
    Pending(VecDeque<AudioFrame>),
    Active {
        encoder: BoxedAudioEncoder,
        track: TrackId,
    },
    Failed,
}

/// Encoder-queue based progress
#[derive(Debug, Default)]
struct ProgressMeter {
    high_water: usize,
    progress: f64,
    ended: bool,
}

impl ProgressMeter {
    fn observe(&mut self, depth: usize) {
        self.high_water = self.high_water.max(depth);
    }

    /// Returns `true` on the poll that ends the session's encoding.
    fn update(&mut self, depth: usize) -> bool {
        if self.ended {
            return false;
        }
        if depth == 0 {
            self.ended = true;
            self.progress = 1.0;
            return true;
        }
        self.observe(depth);
        let remaining = depth as f64 / self.high_water as f64;
        self.progress = self.progress.max((1.0 - remaining).clamp(0.0, 1.0));
        false
    }
}

pub(super) struct RemuxSession {
    options: RemuxOptions,
    codecs: Arc<dyn CodecProvider>,
    writer: SharedWriter,
    events: mpsc::UnboundedSender<Event>,
    state: RemuxState,
    video_encoder: Option<BoxedVideoEncoder>,
    video: VideoTrack,
    audio: AudioTrack,
    meter: ProgressMeter,
    poll_interval: Duration,
    video_submitted: u64,
    samples_written: u64,
    status: watch::Sender<RemuxStatus>,
    close_replies: Vec<oneshot::Sender<()>>,
}

impl RemuxSession {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        options: RemuxOptions,
        codecs: Arc<dyn CodecProvider>,
        writer: SharedWriter,
        events: mpsc::UnboundedSender<Event>,
        video_encoder: BoxedVideoEncoder,
        poll_interval: Duration,
        status: watch::Sender<RemuxStatus>,
    ) -> Self {
        Self {
            options,
            codecs,
            writer,
            events,
            state: RemuxState::NoTracks,
            video_encoder: Some(video_encoder),
            video: VideoTrack::Pending(Vec::new()),
            audio: AudioTrack::Pending(VecDeque::new()),
            meter: ProgressMeter::default(),
            poll_interval,
            video_submitted: 0,
            samples_written: 0,
            status,
            close_replies: Vec::new(),
        }
    }

    pub(super) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut poll: Option<Interval> = None;

        loop {
            if poll.is_none() && self.video_submitted > 0 && !self.meter.ended {
                let mut interval =
                    interval_at(Instant::now() + self.poll_interval, self.poll_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                poll = Some(interval);
            } else if poll.is_some() && self.meter.ended {
                poll = None;
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(Event::Close(reply)) => {
                        self.close_replies.extend(reply);
                        self.close(&mut events).await;
                        break;
                    }
                    Some(event) => self.handle_event(event),
                    None => {
                        self.close(&mut events).await;
                        break;
                    }
                },
                _ = next_tick(&mut poll) => self.on_poll(),
            }
        }

        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    fn set_state(&mut self, state: RemuxState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "remux state");
            self.state = state;
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EncodeVideo(frame, options) => self.encode_video(frame, options),
            Event::EncodeAudio(frame) => self.encode_audio(frame),
            Event::VideoOutput(CodecEvent::Output(output)) => self.on_video_output(output),
            Event::AudioOutput(CodecEvent::Output(output)) => self.on_audio_output(output),
            Event::VideoOutput(CodecEvent::Error(e)) => {
                tracing::error!(kind = %TrackKind::Video, error = %e, "encoder error");
            }
            Event::AudioOutput(CodecEvent::Error(e)) => {
                tracing::error!(kind = %TrackKind::Audio, error = %e, "encoder error");
            }
            Event::Close(reply) => self.close_replies.extend(reply),
        }
    }

    fn encode_video(&mut self, frame: VideoFrame, options: EncodeFrameOptions) {
        let Some(encoder) = self.video_encoder.as_mut() else {
            tracing::warn!(timestamp = frame.timestamp, "video frame after close dropped");
            return;
        };
        if let Err(e) = encoder.encode(frame, options) {
            tracing::warn!(error = %e, "video encode failed");
        }
        self.meter.observe(encoder.queue_depth());
        self.video_submitted += 1;
        if self.state == RemuxState::NoTracks {
            self.set_state(RemuxState::VideoTrackPending);
        }
    }

    fn encode_audio(&mut self, frame: AudioFrame) {
        match &mut self.audio {
            AudioTrack::Pending(backlog) => backlog.push_back(frame),
            AudioTrack::Active { encoder, .. } => {
                if let Err(e) = encoder.encode(frame, EncodeFrameOptions::default()) {
                    tracing::warn!(error = %e, "audio encode failed");
                }
            }
            AudioTrack::Failed => {
                tracing::trace!(timestamp = frame.timestamp, "audio frame dropped, no audio track");
            }
        }
    }

    fn on_video_output(&mut self, output: EncoderOutput) {
        if let VideoTrack::Pending(_) = self.video {
            if let Some(record) = output.decoder_config() {
                let record = record.clone();
                self.register_tracks(record);
            }
        }

        match &mut self.video {
            VideoTrack::Pending(held) => held.push(output.chunk),
            VideoTrack::Active(track) => {
                let track = *track;
                self.write_chunk(TrackKind::Video, track, &output.chunk);
            }
            VideoTrack::Failed => {
                tracing::warn!(timestamp = output.chunk.timestamp, "video chunk dropped, no video track");
            }
        }
    }

    fn on_audio_output(&mut self, output: EncoderOutput) {
        match &self.audio {
            AudioTrack::Active { track, .. } => {
                let track = *track;
                self.write_chunk(TrackKind::Audio, track, &output.chunk);
            }
            _ => tracing::warn!("audio chunk without an audio track dropped"),
        }
    }

    /// Register video then audio, start the audio encoder and replay the backlog.
    fn register_tracks(&mut self, record: bytes::Bytes) {
        let video_options = TrackOptions::Video(VideoTrackOptions {
            timescale: OUTPUT_TIMESCALE,
            width: self.options.video.width,
            height: self.options.video.height,
            codec: VIDEO_CODEC.to_string(),
            decoder_config: Some(record),
        });
        let audio = self.options.audio.clone();
        let audio_options = TrackOptions::Audio(AudioTrackOptions {
            timescale: OUTPUT_TIMESCALE,
            sample_rate: audio.sample_rate,
            channel_count: audio.channel_count,
            sample_size: audio.sample_size,
            codec: audio.codec,
            handler: "soun".to_string(),
            name: "SoundHandler".to_string(),
        });

        let (video_track, audio_track) = {
            let mut writer = self.writer.lock();
            let video_track = writer.add_track(video_options);
            let audio_track = video_track
                .as_ref()
                .ok()
                .map(|_| writer.add_track(audio_options));
            (video_track, audio_track)
        };

        let video_track = match video_track {
            Ok(track) => track,
            Err(e) => {
                tracing::error!(error = %e, "video track registration failed");
                self.drop_held_video();
                self.video = VideoTrack::Failed;
                self.audio = AudioTrack::Failed;
                return;
            }
        };
        tracing::debug!(track = video_track.0, "video track registered");
        let held = match mem::replace(&mut self.video, VideoTrack::Active(video_track)) {
            VideoTrack::Pending(held) => held,
            _ => Vec::new(),
        };
        for chunk in &held {
            self.write_chunk(TrackKind::Video, video_track, chunk);
        }

        let backlog = match mem::replace(&mut self.audio, AudioTrack::Failed) {
            AudioTrack::Pending(backlog) => backlog,
            _ => VecDeque::new(),
        };
        let audio_track = match audio_track {
            Some(Ok(track)) => track,
            Some(Err(e)) => {
                tracing::warn!(error = %e, dropped = backlog.len(), "audio track registration failed");
                return;
            }
            None => return,
        };

        let events = self.events.clone();
        let mut encoder = self.codecs.audio_encoder(OutputSink::new(move |ev| {
            let _ = events.send(Event::AudioOutput(ev));
        }));
        let config = EncoderConfig::Audio {
            codec: audio.codec.codec_string().to_string(),
            sample_rate: audio.sample_rate,
            channel_count: audio.channel_count,
            bitrate: AUDIO_BITRATE,
        };
        if let Err(e) = encoder.configure(&config) {
            tracing::warn!(error = %e, dropped = backlog.len(), "audio encoder configuration failed");
            encoder.close();
            return;
        }

        tracing::debug!(track = audio_track.0, backlog = backlog.len(), "audio track registered");
        for frame in backlog {
            if let Err(e) = encoder.encode(frame, EncodeFrameOptions::default()) {
                tracing::warn!(error = %e, "audio encode failed");
            }
        }
        self.audio = AudioTrack::Active {
            encoder,
            track: audio_track,
        };
        self.set_state(RemuxState::BothTracksActive);
    }

    fn drop_held_video(&mut self) {
        if let VideoTrack::Pending(held) = &mut self.video {
            if !held.is_empty() {
                tracing::warn!(dropped = held.len(), "held video chunks dropped");
                held.clear();
            }
        }
    }

    /// One chunk becomes exactly one sample.
    fn write_chunk(&mut self, kind: TrackKind, track: TrackId, chunk: &EncodedChunk) {
        let sample = chunk.to_sample(OUTPUT_TIMESCALE);
        match self.writer.lock().add_sample(track, sample) {
            Ok(()) => self.samples_written += 1,
            Err(e) => tracing::error!(%kind, error = %e, "sample write failed"),
        }
    }

    fn on_poll(&mut self) {
        let depth = self
            .video_encoder
            .as_ref()
            .map(|e| e.queue_depth())
            .unwrap_or(0);
        let ended = self.meter.update(depth);
        self.publish();
        if ended {
            tracing::info!(
                frames = self.video_submitted,
                samples = self.samples_written,
                "video encoding ended"
            );
        }
    }

    fn publish(&self) {
        self.status.send_replace(RemuxStatus {
            progress: self.meter.progress,
            ended: self.meter.ended,
        });
    }

    /// Flush both encoders, write what they produced and release them.
    async fn close(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) {
        if let Some(encoder) = self.video_encoder.as_mut() {
            if let Err(e) = encoder.flush().await {
                tracing::warn!(error = %e, "video encoder flush failed");
            }
        }
        // video output may register the tracks and start the audio encoder
        self.drain_outputs(events);

        if let AudioTrack::Active { encoder, .. } = &mut self.audio {
            if let Err(e) = encoder.flush().await {
                tracing::warn!(error = %e, "audio encoder flush failed");
            }
        }
        self.drain_outputs(events);

        if let Some(mut encoder) = self.video_encoder.take() {
            encoder.close();
        }
        if let AudioTrack::Active { mut encoder, .. } = mem::replace(&mut self.audio, AudioTrack::Failed) {
            encoder.close();
        }
        self.drop_held_video();

        if self.video_submitted > 0 && self.meter.update(0) {
            tracing::debug!("encoding ended by close");
        }
        self.publish();
        self.set_state(RemuxState::Closed);
        tracing::info!(
            frames = self.video_submitted,
            samples = self.samples_written,
            "remux session closed"
        );
    }

    fn drain_outputs(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) {
        while let Ok(event) = events.try_recv() {
            match event {
                Event::VideoOutput(_) | Event::AudioOutput(_) | Event::Close(_) => {
                    self.handle_event(event)
                }
                Event::EncodeVideo(..) | Event::EncodeAudio(_) => {
                    tracing::warn!("frame submitted during close dropped");
                }
            }
        }
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
