//! Encode-remux pipeline.
//!
//! Raw video and audio frames go through encoders from a
//! [`CodecProvider`]; every encoded chunk becomes one sample in a
//! [`ContainerWriter`](crate::container::ContainerWriter). Tracks are
//! registered lazily: the video track needs the encoder's first decoder
//! configuration record, and audio waits in a backlog until then.

mod session;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::codec::{
    AlphaOption, AvcFormat, CodecProvider, EncodeFrameOptions, EncoderConfig,
    HardwareAcceleration, OutputSink,
};
use crate::config::{PipelineConfig, RemuxOptions};
use crate::container::SharedWriter;
use crate::error::{ClipError, Result};
use crate::progressive::{file_to_stream, OutputStream};
use crate::types::{AudioFrame, VideoFrame};

use session::{Event, RemuxSession, VIDEO_CODEC};

/// Encoding progress as published by the session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RemuxStatus {
    /// Share of submitted video frames already encoded, in `[0, 1]`
    pub progress: f64,
    /// The video encoder drained its queue; set once
    pub ended: bool,
}

pub struct Recodemux;

impl Recodemux {
    /// Configure the video encoder and start a session writing into `writer`.
    ///
    /// Fails only when the video encoder rejects its configuration.
    pub fn start(
        options: RemuxOptions,
        codecs: Arc<dyn CodecProvider>,
        writer: SharedWriter,
        config: &PipelineConfig,
    ) -> Result<RemuxHandle> {
        let session_id = Uuid::new_v4();
        let span = tracing::info_span!("remux", session = %session_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let video_events = tx.clone();
        let mut video_encoder = codecs.video_encoder(OutputSink::new(move |ev| {
            let _ = video_events.send(Event::VideoOutput(ev));
        }));
        let encoder_config = EncoderConfig::Video {
            codec: VIDEO_CODEC.to_string(),
            width: options.video.width,
            height: options.video.height,
            framerate: options.video.expect_fps,
            bitrate: options.bitrate,
            hardware_acceleration: HardwareAcceleration::PreferHardware,
            alpha: AlphaOption::Discard,
            avc_format: AvcFormat::Avc,
        };
        if let Err(e) = video_encoder.configure(&encoder_config) {
            video_encoder.close();
            tracing::warn!(parent: &span, error = %e, "video encoder configuration failed");
            return Err(match e {
                ClipError::Configuration(_) => e,
                other => ClipError::Configuration(other.to_string()),
            });
        }

        tracing::info!(
            parent: &span,
            width = options.video.width,
            height = options.video.height,
            bitrate = options.bitrate,
            audio = options.audio.codec.codec_string(),
            "remux session started"
        );

        let (status_tx, status_rx) = watch::channel(RemuxStatus::default());
        let session = RemuxSession::new(
            options,
            codecs,
            writer.clone(),
            tx.clone(),
            video_encoder,
            config.progress_interval(),
            status_tx,
        );
        let task = tokio::spawn(session.run(rx).instrument(span));

        Ok(RemuxHandle {
            session_id,
            events: tx,
            status: status_rx,
            writer,
            time_slice: config.time_slice(),
            closed: false,
            task: Some(task),
        })
    }
}

/// Control handle of a running remux session. Dropping it closes the session.
pub struct RemuxHandle {
    session_id: Uuid,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<RemuxStatus>,
    writer: SharedWriter,
    time_slice: Duration,
    closed: bool,
    task: Option<JoinHandle<()>>,
}

impl RemuxHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Hand a frame to the video encoder. The frame is consumed either way.
    pub fn encode_video_frame(&self, frame: VideoFrame, options: EncodeFrameOptions) {
        if self.events.send(Event::EncodeVideo(frame, options)).is_err() {
            tracing::warn!(session = %self.session_id, "video frame after close dropped");
        }
    }

    /// Queue an audio frame; held back until the audio track exists.
    pub fn encode_audio_frame(&self, frame: AudioFrame) {
        if self.events.send(Event::EncodeAudio(frame)).is_err() {
            tracing::warn!(session = %self.session_id, "audio frame after close dropped");
        }
    }

    pub fn progress(&self) -> f64 {
        self.status.borrow().progress
    }

    pub fn status(&self) -> watch::Receiver<RemuxStatus> {
        self.status.clone()
    }

    /// Resolves once video encoding has ended, or the session is gone.
    pub async fn wait_ended(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.ended).await;
    }

    /// Container writer this session fills
    pub fn writer(&self) -> SharedWriter {
        Arc::clone(&self.writer)
    }

    /// Stream the container as it grows, every `time_slice`.
    pub fn output<F>(&self, time_slice: Duration, on_cancel: F) -> OutputStream
    where
        F: FnOnce() + Send + 'static,
    {
        file_to_stream(self.writer(), time_slice, on_cancel)
    }

    /// `output` with the configured default time slice
    pub fn output_default<F>(&self, on_cancel: F) -> OutputStream
    where
        F: FnOnce() + Send + 'static,
    {
        self.output(self.time_slice, on_cancel)
    }

    /// Flush and release both encoders. Later calls return immediately.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let (reply, rx) = oneshot::channel();
            if self.events.send(Event::Close(Some(reply))).is_ok() {
                let _ = rx.await;
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RemuxHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.events.send(Event::Close(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{shared_writer, TrackId, TrackOptions};
    use crate::tests::fixtures::{audio_input, init_tracing, video_input, FakeCodecs, RecordingWriter, WriterLog};
    use crate::types::AudioCodec;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    fn start(codecs: &FakeCodecs, options: RemuxOptions) -> (RemuxHandle, Arc<Mutex<WriterLog>>) {
        init_tracing();
        let (writer, log) = RecordingWriter::new();
        let handle = Recodemux::start(
            options,
            Arc::new(codecs.clone()),
            shared_writer(writer),
            &PipelineConfig::default(),
        )
        .unwrap();
        (handle, log)
    }

    /// Let the session task catch up with everything sent so far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_configuration() {
        let codecs = FakeCodecs::new();
        let (_handle, _) = start(&codecs, RemuxOptions::default());

        let configs = codecs.state.encoder_configs.lock().clone();
        assert_eq!(
            configs[0],
            EncoderConfig::Video {
                codec: "avc1.42E01F".into(),
                width: 1280,
                height: 720,
                framerate: 30.0,
                bitrate: 5_000_000,
                hardware_acceleration: HardwareAcceleration::PreferHardware,
                alpha: AlphaOption::Discard,
                avc_format: AvcFormat::Avc,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_on_video_configuration() {
        let codecs = FakeCodecs::new();
        codecs.fail_configure("avc1.42E01F");
        let err = Recodemux::start(
            RemuxOptions::default(),
            Arc::new(codecs.clone()),
            shared_writer(RecordingWriter::new().0),
            &PipelineConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ClipError::Configuration(_)));
        assert_eq!(codecs.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_backlog_replayed_in_order() {
        let codecs = FakeCodecs::new();
        codecs.hold_video();
        let (mut handle, log) = start(&codecs, RemuxOptions::default());

        for i in 0..5 {
            handle.encode_audio_frame(audio_input(i));
        }
        handle.encode_video_frame(video_input(0), EncodeFrameOptions { key_frame: true });
        settle().await;
        assert!(log.lock().tracks.is_empty());
        assert!(codecs.audio_encoded().is_empty());

        codecs.release_video(1);
        settle().await;
        {
            let log = log.lock();
            assert!(matches!(log.tracks[0], TrackOptions::Video(_)));
            match &log.tracks[1] {
                TrackOptions::Audio(audio) => {
                    assert_eq!(audio.timescale, 1_000_000);
                    assert_eq!(audio.handler, "soun");
                    assert_eq!(audio.name, "SoundHandler");
                    assert_eq!(audio.codec, AudioCodec::Aac);
                }
                other => panic!("unexpected second track {:?}", other),
            }
        }
        let expected: Vec<i64> = (0..5).map(|i| i * 21_333).collect();
        assert_eq!(codecs.audio_encoded(), expected);

        // audio after registration goes straight through
        handle.encode_audio_frame(audio_input(5));
        settle().await;
        assert_eq!(codecs.audio_encoded().len(), 6);

        let audio_config = codecs
            .state
            .encoder_configs
            .lock()
            .iter()
            .find(|c| matches!(c, EncoderConfig::Audio { .. }))
            .cloned()
            .unwrap();
        assert_eq!(
            audio_config,
            EncoderConfig::Audio {
                codec: "mp4a.40.2".into(),
                sample_rate: 48000,
                channel_count: 2,
                bitrate: 128_000,
            }
        );

        handle.close().await;
        let log = log.lock();
        let audio_samples = log.samples.iter().filter(|(t, _)| *t == TrackId(2)).count();
        assert_eq!(audio_samples, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_become_samples() {
        let codecs = FakeCodecs::new();
        let (mut handle, log) = start(&codecs, RemuxOptions::default());

        for i in 0..3 {
            handle.encode_video_frame(video_input(i), EncodeFrameOptions::default());
        }
        handle.close().await;

        let log = log.lock();
        let video: Vec<_> = log
            .samples
            .iter()
            .filter(|(t, _)| *t == TrackId(1))
            .map(|(_, s)| s.clone())
            .collect();
        assert_eq!(video.len(), 3);
        assert!(video[0].is_sync);
        assert_eq!(video[2].cts, 2 * 33_333);
        assert_eq!(video[2].dts, video[2].cts);
        assert_eq!(video[2].duration, 33_333);
        assert_eq!(video[2].timescale, 1_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_bounds_and_ended_once() {
        let codecs = FakeCodecs::new();
        codecs.hold_video();
        let (mut handle, _log) = start(&codecs, RemuxOptions::default());
        let mut status = handle.status();

        for i in 0..10 {
            handle.encode_video_frame(video_input(i), EncodeFrameOptions::default());
        }
        settle().await;
        assert_eq!(handle.progress(), 0.0);

        let mut seen = Vec::new();
        for _ in 0..9 {
            codecs.release_video(1);
            tokio::time::sleep(Duration::from_millis(100)).await;
            let s = *status.borrow_and_update();
            assert!(!s.ended);
            assert!(s.progress >= 0.0 && s.progress < 1.0);
            seen.push(s.progress);
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen[8] > 0.8);

        codecs.release_video(1);
        handle.wait_ended().await;
        assert_eq!(handle.progress(), 1.0);
        assert!(handle.status().borrow().ended);

        handle.close().await;
        assert!(handle.status().borrow().ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_and_is_idempotent() {
        let codecs = FakeCodecs::new();
        codecs.hold_video();
        let (mut handle, log) = start(&codecs, RemuxOptions::default());

        for i in 0..4 {
            handle.encode_audio_frame(audio_input(i));
            handle.encode_video_frame(video_input(i), EncodeFrameOptions::default());
        }
        handle.close().await;
        handle.close().await;

        let log = log.lock();
        assert_eq!(log.tracks.len(), 2);
        assert_eq!(log.samples.len(), 8);
        // video encoder and audio encoder released
        assert_eq!(codecs.state.closed.load(Ordering::SeqCst), 2);
        drop(log);

        // frames after close are dropped quietly
        handle.encode_video_frame(video_input(9), EncodeFrameOptions::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_audio_encoder() {
        let codecs = FakeCodecs::new();
        codecs.hold_video();
        let (mut handle, log) = start(&codecs, RemuxOptions::default());
        handle.close().await;
        assert!(log.lock().tracks.is_empty());
        assert_eq!(codecs.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_audio_track_keeps_video() {
        let codecs = FakeCodecs::new();
        codecs.fail_configure("opus");
        let mut options = RemuxOptions::default();
        options.audio.codec = AudioCodec::Opus;
        let (mut handle, log) = start(&codecs, options);

        handle.encode_audio_frame(audio_input(0));
        handle.encode_video_frame(video_input(0), EncodeFrameOptions::default());
        handle.encode_audio_frame(audio_input(1));
        handle.close().await;

        let log = log.lock();
        assert_eq!(log.tracks.len(), 2);
        assert!(log.samples.iter().all(|(t, _)| *t == TrackId(1)));
        assert!(codecs.audio_encoded().is_empty());
    }
}
