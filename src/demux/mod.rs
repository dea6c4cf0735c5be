//! Demux-decode pipeline.
//!
//! Streams container bytes from a [`ByteSource`] through a
//! [`ContainerParser`], buffers every sample per track and, on [`seek`],
//! decodes from the nearest preceding sync sample to the end of what is
//! known. Results reach the caller through a [`DemuxHandler`].
//!
//! [`seek`]: DemuxHandle::seek

mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::codec::CodecProvider;
use crate::config::PipelineConfig;
use crate::container::ContainerParser;
use crate::error::{ClipError, Result};
use crate::source::ByteSource;
use crate::types::{AudioFrame, ContainerMetadata, QueueDepth, VideoFrame};

use session::{Command, DemuxSession, Event};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    Idle,
    Parsing,
    Ready,
    Decoding,
    /// Source exhausted, decoders still working
    Draining,
    Complete,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct DemuxOptions {
    pub include_audio: bool,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            include_audio: true,
        }
    }
}

/// Receiver of everything a demux session produces.
///
/// All calls come from the session task, one at a time.
pub trait DemuxHandler: Send + 'static {
    /// Metadata refresh, with the duration recomputed from the known video samples
    fn on_ready(&mut self, metadata: &ContainerMetadata);

    fn on_video_frame(&mut self, frame: VideoFrame);

    fn on_audio_frame(&mut self, frame: AudioFrame);

    /// Both decoders settled; called once per session
    fn on_complete(&mut self);

    fn on_error(&mut self, error: ClipError) {
        tracing::error!(error = %error, "demux error");
    }
}

/// Handler callbacks as values
#[derive(Debug)]
pub enum DemuxEvent {
    Ready(ContainerMetadata),
    VideoFrame(VideoFrame),
    AudioFrame(AudioFrame),
    Complete,
    Error(ClipError),
}

impl DemuxHandler for mpsc::UnboundedSender<DemuxEvent> {
    fn on_ready(&mut self, metadata: &ContainerMetadata) {
        let _ = self.send(DemuxEvent::Ready(metadata.clone()));
    }

    fn on_video_frame(&mut self, frame: VideoFrame) {
        let _ = self.send(DemuxEvent::VideoFrame(frame));
    }

    fn on_audio_frame(&mut self, frame: AudioFrame) {
        let _ = self.send(DemuxEvent::AudioFrame(frame));
    }

    fn on_complete(&mut self) {
        let _ = self.send(DemuxEvent::Complete);
    }

    fn on_error(&mut self, error: ClipError) {
        let _ = self.send(DemuxEvent::Error(error));
    }
}

pub struct DemuxDecoder;

impl DemuxDecoder {
    /// Start a session. Must be called from within a tokio runtime.
    pub fn start<S, P, H>(
        source: S,
        parser: P,
        codecs: Arc<dyn CodecProvider>,
        handler: H,
        options: DemuxOptions,
        config: &PipelineConfig,
    ) -> DemuxHandle
    where
        S: ByteSource,
        P: ContainerParser,
        H: DemuxHandler,
    {
        let session_id = Uuid::new_v4();
        let span = tracing::info_span!("demux", session = %session_id);
        let stopped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = spawn_reader(source, tx.clone(), span.clone());
        let session = {
            let _enter = span.enter();
            DemuxSession::new(
                Box::new(parser),
                codecs.as_ref(),
                handler,
                options,
                config,
                tx.clone(),
                Arc::clone(&stopped),
                reader,
            )
        };
        tracing::info!(
            parent: &span,
            include_audio = options.include_audio,
            "demux session started"
        );
        let task = tokio::spawn(session.run(rx).instrument(span));

        DemuxHandle {
            session_id,
            events: tx,
            stopped,
            task: Some(task),
        }
    }
}

/// The byte source lives in its own task so a slow read never blocks
/// codec callbacks or timers.
fn spawn_reader<S: ByteSource>(
    mut source: S,
    tx: mpsc::UnboundedSender<Event>,
    span: tracing::Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let event = match source.read_chunk().await {
                    Ok(Some(chunk)) => Event::Chunk(chunk),
                    Ok(None) => {
                        let _ = tx.send(Event::SourceEnd);
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Event::SourceFailed(e));
                        break;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
        .instrument(span),
    )
}

/// Control handle of a running demux session. Dropping it stops the session.
pub struct DemuxHandle {
    session_id: Uuid,
    events: mpsc::UnboundedSender<Event>,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl DemuxHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Decode from the sync sample at or before `time_secs` to the end of the
    /// buffered samples, on every enabled track.
    pub async fn seek(&self, time_secs: f64) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Seek { time_secs, reply }) {
            rx.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        }
    }

    pub async fn queue_depth(&self) -> QueueDepth {
        if self.is_stopped() {
            return QueueDepth::default();
        }
        let (reply, rx) = oneshot::channel();
        if self.send(Command::QueueDepth(reply)) {
            rx.await.unwrap_or_default()
        } else {
            QueueDepth::default()
        }
    }

    pub async fn state(&self) -> DemuxState {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::State(reply)) {
            rx.await.unwrap_or(DemuxState::Stopped)
        } else {
            DemuxState::Stopped
        }
    }

    /// Stop the session. No handler callback runs once this returns.
    pub async fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let (reply, rx) = oneshot::channel();
            if self.send(Command::Stop(Some(reply))) {
                let _ = rx.await;
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> bool {
        self.events.send(Event::Command(command)).is_ok()
    }
}

impl Drop for DemuxHandle {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(Event::Command(Command::Stop(None)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ParseEvent;
    use crate::source::ChannelSource;
    use crate::tests::fixtures::{init_tracing, metadata, samples, FakeCodecs, ScriptedParser};
    use crate::types::TrackKind;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        handle: DemuxHandle,
        events: mpsc::UnboundedReceiver<DemuxEvent>,
        input: mpsc::Sender<Result<Bytes>>,
        codecs: FakeCodecs,
    }

    fn start(script: Vec<Result<Vec<ParseEvent>>>, codecs: FakeCodecs, include_audio: bool) -> Harness {
        init_tracing();
        let (input, source) = ChannelSource::channel(16);
        let (parser, _) = ScriptedParser::new(script);
        let (tx, events) = mpsc::unbounded_channel();
        let handle = DemuxDecoder::start(
            source,
            parser,
            Arc::new(codecs.clone()),
            tx,
            DemuxOptions { include_audio },
            &PipelineConfig::default(),
        );
        Harness {
            handle,
            events,
            input,
            codecs,
        }
    }

    /// 30 fps video, sync every 10 frames, zero header duration
    fn video_script(count: usize) -> Vec<Result<Vec<ParseEvent>>> {
        vec![Ok(vec![
            ParseEvent::Metadata(metadata(0.0, 30, false)),
            ParseEvent::Samples {
                kind: TrackKind::Video,
                samples: samples(count, 30, 10),
            },
        ])]
    }

    async fn feed(h: &Harness) {
        h.input.send(Ok(Bytes::from_static(b"moov"))).await.unwrap();
    }

    async fn next_ready(h: &mut Harness) -> ContainerMetadata {
        loop {
            match h.events.recv().await {
                Some(DemuxEvent::Ready(m)) => return m,
                Some(_) => continue,
                None => panic!("session ended before ready"),
            }
        }
    }

    /// Collect events until the channel has been quiet for `quiet`.
    async fn drain(h: &mut Harness, quiet: Duration) -> Vec<DemuxEvent> {
        let mut out = Vec::new();
        while let Ok(Some(ev)) = tokio::time::timeout(quiet, h.events.recv()).await {
            out.push(ev);
        }
        out
    }

    fn count(events: &[DemuxEvent], pred: fn(&DemuxEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_reports_corrected_duration() {
        let mut h = start(video_script(100), FakeCodecs::new(), false);
        feed(&h).await;

        let meta = next_ready(&mut h).await;
        assert!((meta.duration_secs - 100.0 / 30.0).abs() < 1e-9);
        assert_eq!(h.handle.state().await, DemuxState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_resumes_at_preceding_sync_sample() {
        let mut h = start(video_script(30), FakeCodecs::new(), false);
        feed(&h).await;
        next_ready(&mut h).await;

        h.handle.seek(0.35).await.unwrap();
        let decoded = h.codecs.decoded(TrackKind::Video);
        assert_eq!(decoded.len(), 20);
        assert_eq!(decoded[0], 333_333);
        assert_eq!(h.handle.state().await, DemuxState::Decoding);

        let events = drain(&mut h, Duration::from_secs(1)).await;
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::VideoFrame(_))), 20);
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::Complete)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_past_end_submits_nothing() {
        let mut h = start(video_script(30), FakeCodecs::new(), false);
        feed(&h).await;
        next_ready(&mut h).await;

        let err = h.handle.seek(5.0).await.unwrap_err();
        assert!(matches!(err, ClipError::NotFound(_)));
        assert!(h.codecs.decoded(TrackKind::Video).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_before_metadata_is_noop() {
        let h = start(video_script(30), FakeCodecs::new(), false);
        h.handle.seek(1.0).await.unwrap();
        assert!(h.codecs.decoded(TrackKind::Video).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_fires_once() {
        let mut h = start(video_script(30), FakeCodecs::new(), false);
        feed(&h).await;
        next_ready(&mut h).await;

        // nothing decoded yet, so nothing completes
        let idle = drain(&mut h, Duration::from_secs(2)).await;
        assert_eq!(count(&idle, |e| matches!(e, DemuxEvent::Complete)), 0);

        h.handle.seek(0.0).await.unwrap();
        let first = drain(&mut h, Duration::from_secs(1)).await;
        assert_eq!(count(&first, |e| matches!(e, DemuxEvent::Complete)), 1);
        assert_eq!(h.handle.state().await, DemuxState::Complete);

        h.handle.seek(0.9).await.unwrap();
        let second = drain(&mut h, Duration::from_secs(1)).await;
        assert_eq!(count(&second, |e| matches!(e, DemuxEvent::VideoFrame(_))), 10);
        assert_eq!(count(&second, |e| matches!(e, DemuxEvent::Complete)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice() {
        let mut h = start(video_script(30), FakeCodecs::new(), false);
        feed(&h).await;
        next_ready(&mut h).await;

        h.handle.stop().await;
        h.handle.stop().await;
        assert!(h.handle.is_stopped());
        assert_eq!(h.handle.queue_depth().await, QueueDepth::default());
        h.handle.seek(0.0).await.unwrap();
        assert!(h.codecs.decoded(TrackKind::Video).is_empty());

        // handler dropped with the session, nothing after stop
        assert!(h.events.recv().await.is_none());
        assert_eq!(h.codecs.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_ends_session() {
        let script = vec![Err(ClipError::Container("bad box".into()))];
        let mut h = start(script, FakeCodecs::new(), true);
        feed(&h).await;

        let events = drain(&mut h, Duration::from_secs(1)).await;
        assert!(matches!(
            events.as_slice(),
            [DemuxEvent::Error(ClipError::Container(_))]
        ));
        assert!(h.events.recv().await.is_none());
        assert!(h.handle.is_stopped());
        assert_eq!(h.handle.state().await, DemuxState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_chunk_keeps_parsing() {
        let mut script = vec![Err(ClipError::Configuration("unsupported sample entry".into()))];
        script.extend(video_script(30));
        let mut h = start(script, FakeCodecs::new(), false);
        feed(&h).await;
        feed(&h).await;

        assert!(matches!(
            h.events.recv().await,
            Some(DemuxEvent::Error(ClipError::Configuration(_)))
        ));
        let meta = next_ready(&mut h).await;
        assert_eq!(meta.video.unwrap().timescale, 30);
        assert!(!h.handle.is_stopped());
        assert_eq!(h.handle.state().await, DemuxState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_failure_is_reported() {
        let mut h = start(Vec::new(), FakeCodecs::new(), true);
        h.input
            .send(Err(ClipError::Stream("connection reset".into())))
            .await
            .unwrap();

        let events = drain(&mut h, Duration::from_secs(1)).await;
        assert!(matches!(
            events.as_slice(),
            [DemuxEvent::Error(ClipError::Stream(_))]
        ));
    }

    fn av_script() -> Vec<Result<Vec<ParseEvent>>> {
        vec![Ok(vec![
            ParseEvent::Metadata(metadata(1.0, 30, true)),
            ParseEvent::Samples {
                kind: TrackKind::Video,
                samples: samples(30, 30, 10),
            },
            ParseEvent::Samples {
                kind: TrackKind::Audio,
                samples: samples(48, 48000, 1),
            },
        ])]
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_configure_failure_keeps_video() {
        let codecs = FakeCodecs::new();
        codecs.fail_configure("mp4a.40.2");
        let mut h = start(av_script(), codecs, true);
        feed(&h).await;

        let events = drain(&mut h, Duration::from_secs(1)).await;
        assert_eq!(
            count(&events, |e| matches!(e, DemuxEvent::Error(ClipError::Configuration(_)))),
            1
        );
        h.handle.seek(0.0).await.unwrap();
        assert_eq!(h.codecs.decoded(TrackKind::Video).len(), 30);
        assert!(h.codecs.decoded(TrackKind::Audio).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_disabled_ignores_audio_samples() {
        let mut h = start(av_script(), FakeCodecs::new(), false);
        feed(&h).await;
        next_ready(&mut h).await;
        h.handle.seek(0.0).await.unwrap();
        assert_eq!(h.codecs.decoded(TrackKind::Video).len(), 30);
        assert!(h.codecs.decoded(TrackKind::Audio).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_tracks_decode_and_complete() {
        let mut h = start(av_script(), FakeCodecs::new(), true);
        feed(&h).await;
        next_ready(&mut h).await;
        h.handle.seek(0.0).await.unwrap();
        assert_eq!(h.codecs.decoded(TrackKind::Audio).len(), 48);

        let events = drain(&mut h, Duration::from_secs(1)).await;
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::VideoFrame(_))), 30);
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::AudioFrame(_))), 48);
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::Complete)), 1);
    }

    fn is_complete(e: &DemuxEvent) -> bool {
        matches!(e, DemuxEvent::Complete)
    }

    /// Wait for `Complete` and return how long it took.
    async fn time_to_complete(h: &mut Harness) -> Duration {
        let start = tokio::time::Instant::now();
        loop {
            match h.events.recv().await {
                Some(DemuxEvent::Complete) => return start.elapsed(),
                Some(_) => continue,
                None => panic!("session ended before complete"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_waits_for_both_queues() {
        let window = PipelineConfig::default().settle_window();
        let codecs = FakeCodecs::new();
        codecs.hold_decode();
        let mut h = start(av_script(), codecs, true);
        feed(&h).await;
        next_ready(&mut h).await;

        h.handle.seek(0.0).await.unwrap();
        assert_eq!(h.handle.queue_depth().await, QueueDepth { video: 30, audio: 48 });

        // video drains in two bursts while audio stays queued
        h.codecs.release_decoded(TrackKind::Video, 15);
        let events = drain(&mut h, window * 2).await;
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::VideoFrame(_))), 15);
        assert_eq!(count(&events, is_complete), 0);

        h.codecs.release_decoded(TrackKind::Video, 15);
        let events = drain(&mut h, window * 2).await;
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::VideoFrame(_))), 15);
        assert_eq!(count(&events, is_complete), 0, "audio queue still busy");
        assert_eq!(h.handle.queue_depth().await, QueueDepth { video: 0, audio: 48 });

        h.codecs.release_decoded(TrackKind::Audio, 48);
        let waited = time_to_complete(&mut h).await;
        assert!(waited >= window, "completed after {:?}", waited);
        assert!(waited < window * 2, "completed after {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_drain_waits_another_window() {
        let window = PipelineConfig::default().settle_window();
        let codecs = FakeCodecs::new();
        codecs.hold_decode();
        let mut h = start(video_script(30), codecs, false);
        feed(&h).await;
        next_ready(&mut h).await;
        h.handle.seek(0.0).await.unwrap();

        // last output leaves one chunk queued, then that chunk vanishes
        let start = tokio::time::Instant::now();
        h.codecs.release_decoded(TrackKind::Video, 29);
        let events = drain(&mut h, Duration::from_millis(100)).await;
        assert_eq!(count(&events, |e| matches!(e, DemuxEvent::VideoFrame(_))), 29);
        h.codecs.discard_decoded(TrackKind::Video, 1);

        time_to_complete(&mut h).await;
        assert!(start.elapsed() >= window * 2, "completed after {:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_without_config_record_is_disabled() {
        let mut meta = metadata(1.0, 30, true);
        if let Some(video) = meta.video.as_mut() {
            video.codec = "hvc1".to_string();
            video.description = None;
        }
        let script = vec![Ok(vec![
            ParseEvent::Metadata(meta),
            ParseEvent::Samples {
                kind: TrackKind::Video,
                samples: samples(30, 30, 10),
            },
            ParseEvent::Samples {
                kind: TrackKind::Audio,
                samples: samples(48, 48000, 1),
            },
        ])];
        let mut h = start(script, FakeCodecs::new(), true);
        feed(&h).await;

        let events = drain(&mut h, Duration::from_secs(1)).await;
        assert_eq!(
            count(&events, |e| matches!(e, DemuxEvent::Error(ClipError::Configuration(_)))),
            1
        );
        h.handle.seek(0.0).await.unwrap();
        assert!(h.codecs.decoded(TrackKind::Video).is_empty());
        assert_eq!(h.codecs.decoded(TrackKind::Audio).len(), 48);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_refresh_reenters_ready() {
        let codecs = FakeCodecs::new();
        codecs.hold_decode();
        let mut script = video_script(30);
        script.push(Ok(vec![ParseEvent::Samples {
            kind: TrackKind::Video,
            samples: samples(40, 30, 10).split_off(30),
        }]));
        let mut h = start(script, codecs, false);
        feed(&h).await;
        next_ready(&mut h).await;

        h.handle.seek(0.0).await.unwrap();
        assert_eq!(h.handle.state().await, DemuxState::Decoding);

        feed(&h).await;
        let meta = next_ready(&mut h).await;
        assert!((meta.duration_secs - 40.0 / 30.0).abs() < 1e-9);
        assert_eq!(h.handle.state().await, DemuxState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_session() {
        let mut h = start(video_script(30), FakeCodecs::new(), false);
        feed(&h).await;
        next_ready(&mut h).await;

        let Harness {
            handle,
            mut events,
            codecs,
            ..
        } = h;
        drop(handle);
        assert!(events.recv().await.is_none());
        assert_eq!(codecs.state.closed.load(Ordering::SeqCst), 1);
    }
}
