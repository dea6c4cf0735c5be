//! Demux session event loop.

use bytes::Bytes;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{DemuxHandler, DemuxOptions, DemuxState};
use crate::codec::{BoxedDecoder, CodecEvent, CodecProvider, DecoderConfig, OutputSink};
use crate::config::PipelineConfig;
use crate::container::{ContainerParser, ParseEvent};
use crate::error::{ClipError, Result};
use crate::keyframe::find_start_sample_index;
use crate::settle::{sleep_until_deadline, SettleDetector};
use crate::types::{
    AudioFrame, AudioTrackInfo, ContainerMetadata, QueueDepth, SampleDescriptor, TrackBuffer,
    TrackKind, VideoFrame, VideoTrackInfo,
};

pub(super) enum Command {
    Seek {
        time_secs: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    QueueDepth(oneshot::Sender<QueueDepth>),
    State(oneshot::Sender<DemuxState>),
    Stop(Option<oneshot::Sender<()>>),
}

/// Everything the session loop reacts to, in arrival order
pub(super) enum Event {
    Command(Command),
    Chunk(Bytes),
    SourceEnd,
    SourceFailed(ClipError),
    Video(CodecEvent<VideoFrame>),
    Audio(CodecEvent<AudioFrame>),
}

/// One track: its samples and, while enabled, its decoder
struct TrackSlot {
    buffer: TrackBuffer,
    decoder: Option<BoxedDecoder>,
    timescale: u32,
}

impl TrackSlot {
    fn new(kind: TrackKind, decoder: Option<BoxedDecoder>) -> Self {
        Self {
            buffer: TrackBuffer::new(kind),
            decoder,
            timescale: 0,
        }
    }

    fn enabled(&self) -> bool {
        self.decoder.is_some() && self.timescale > 0
    }

    fn queue_depth(&self) -> usize {
        self.decoder.as_ref().map(|d| d.queue_depth()).unwrap_or(0)
    }

    fn disable(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }

    /// Resubmit every sample from `start` to the end of the buffer.
    fn submit_from(&mut self, start: usize) -> Vec<ClipError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        for sample in self.buffer.suffix_from(start) {
            if let Err(e) = decoder.decode(sample.to_chunk()) {
                errors.push(e);
            }
        }
        errors
    }
}

pub(super) struct DemuxSession<H> {
    parser: Box<dyn ContainerParser>,
    handler: H,
    state: DemuxState,
    metadata: Option<ContainerMetadata>,
    video: TrackSlot,
    audio: TrackSlot,
    /// Debounces `on_ready` over bursts of sample batches
    ready: SettleDetector,
    /// Waits for both decode queues to stay empty
    settle: SettleDetector,
    frames_delivered: u64,
    source_done: bool,
    stopped: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    stop_reply: Option<oneshot::Sender<()>>,
}

impl<H: DemuxHandler> DemuxSession<H> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        parser: Box<dyn ContainerParser>,
        codecs: &dyn CodecProvider,
        handler: H,
        options: DemuxOptions,
        config: &PipelineConfig,
        events: mpsc::UnboundedSender<Event>,
        stopped: Arc<AtomicBool>,
        reader: JoinHandle<()>,
    ) -> Self {
        let video_events = events.clone();
        let video_decoder = codecs.video_decoder(OutputSink::new(move |ev| {
            let _ = video_events.send(Event::Video(ev));
        }));

        let audio_decoder = options.include_audio.then(|| {
            codecs.audio_decoder(OutputSink::new(move |ev| {
                let _ = events.send(Event::Audio(ev));
            }))
        });

        Self {
            parser,
            handler,
            state: DemuxState::Idle,
            metadata: None,
            video: TrackSlot::new(TrackKind::Video, Some(video_decoder)),
            audio: TrackSlot::new(TrackKind::Audio, audio_decoder),
            ready: SettleDetector::new(config.ready_debounce()),
            settle: SettleDetector::new(config.settle_window()),
            frames_delivered: 0,
            source_done: false,
            stopped,
            reader: Some(reader),
            stop_reply: None,
        }
    }

    pub(super) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            let ready_at = self.ready.deadline();
            let settle_at = self.settle.deadline();

            let flow = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => ControlFlow::Break(()),
                },
                _ = sleep_until_deadline(ready_at) => {
                    self.on_ready_deadline();
                    ControlFlow::Continue(())
                }
                _ = sleep_until_deadline(settle_at) => {
                    self.on_settle_deadline();
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        self.shutdown();
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(());
        }
    }

    /// Run a handler callback unless the session has been stopped.
    fn dispatch<F: FnOnce(&mut H)>(&mut self, f: F) {
        if !self.stopped.load(Ordering::Acquire) {
            f(&mut self.handler);
        }
    }

    fn report(&mut self, error: ClipError) {
        self.dispatch(|h| h.on_error(error));
    }

    fn set_state(&mut self, state: DemuxState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "demux state");
            self.state = state;
        }
    }

    fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Command(command) => return self.handle_command(command),
            Event::Chunk(chunk) => {
                if self.state == DemuxState::Idle {
                    self.set_state(DemuxState::Parsing);
                }
                match self.parser.append(chunk) {
                    Ok(events) => {
                        for event in events {
                            self.handle_parse_event(event);
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::warn!(error = %e, "container parse failed");
                        self.report(e);
                        return ControlFlow::Break(());
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "chunk rejected by parser");
                        self.report(e);
                    }
                }
            }
            Event::SourceEnd => {
                tracing::info!(
                    video_samples = self.video.buffer.len(),
                    audio_samples = self.audio.buffer.len(),
                    "byte source exhausted"
                );
                self.source_done = true;
                if self.state == DemuxState::Decoding {
                    self.set_state(DemuxState::Draining);
                }
            }
            Event::SourceFailed(e) => {
                tracing::warn!(error = %e, "byte source failed");
                self.report(e);
                return ControlFlow::Break(());
            }
            Event::Video(CodecEvent::Output(frame)) => {
                self.frames_delivered += 1;
                self.decoder_activity();
                self.dispatch(|h| h.on_video_frame(frame));
            }
            Event::Audio(CodecEvent::Output(frame)) => {
                self.frames_delivered += 1;
                self.decoder_activity();
                self.dispatch(|h| h.on_audio_frame(frame));
            }
            Event::Video(CodecEvent::Error(e)) | Event::Audio(CodecEvent::Error(e)) => {
                // a failed chunk leaves the queue without an output
                self.decoder_activity();
                self.report(e);
            }
        }
        ControlFlow::Continue(())
    }

    /// Restart the settle window, noting whether both queues are empty.
    fn decoder_activity(&mut self) {
        let drained = self.queue_depth().is_drained();
        self.settle.touch();
        self.settle.observe(drained);
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Seek { time_secs, reply } => {
                let result = self.seek(time_secs);
                let _ = reply.send(result);
            }
            Command::QueueDepth(reply) => {
                let _ = reply.send(self.queue_depth());
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Stop(reply) => {
                self.stop_reply = reply;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_parse_event(&mut self, event: ParseEvent) {
        match event {
            ParseEvent::Metadata(metadata) => {
                self.configure_video(metadata.video.as_ref());
                self.configure_audio(metadata.audio.as_ref());
                self.metadata = Some(metadata);
                self.ready.touch();
            }
            ParseEvent::Samples { kind, samples } => self.on_samples(kind, samples),
        }
    }

    fn configure_video(&mut self, info: Option<&VideoTrackInfo>) {
        let Some(info) = info else {
            tracing::debug!("container has no video track");
            self.video.disable();
            return;
        };
        if info.description.is_none() {
            tracing::warn!(codec = %info.codec, "no decoder configuration record, video disabled");
            self.video.disable();
            self.report(ClipError::Configuration(format!(
                "{} track has no avcC, hvcC or vpcC record",
                info.codec
            )));
            return;
        }
        let config = DecoderConfig::Video {
            codec: info.codec.clone(),
            coded_width: info.width,
            coded_height: info.height,
            description: info.description.clone(),
        };
        self.configure_track(TrackKind::Video, info.timescale, config);
    }

    fn configure_audio(&mut self, info: Option<&AudioTrackInfo>) {
        if self.audio.decoder.is_none() {
            return;
        }
        let Some(info) = info else {
            tracing::debug!("container has no audio track");
            self.audio.disable();
            return;
        };
        let codec = if info.codec == "mp4a" {
            "mp4a.40.2".to_string()
        } else {
            info.codec.clone()
        };
        let config = DecoderConfig::Audio {
            codec,
            sample_rate: info.sample_rate,
            channel_count: info.channel_count,
        };
        self.configure_track(TrackKind::Audio, info.timescale, config);
    }

    fn configure_track(&mut self, kind: TrackKind, timescale: u32, config: DecoderConfig) {
        let slot = self.slot_mut(kind);
        slot.timescale = timescale;
        let Some(decoder) = slot.decoder.as_mut() else {
            return;
        };
        match decoder.configure(&config) {
            Ok(()) => {
                tracing::debug!(%kind, codec = config.codec(), timescale, "decoder configured");
            }
            Err(e) => {
                tracing::warn!(%kind, codec = config.codec(), error = %e, "decoder configuration failed, track disabled");
                slot.disable();
                self.report(e);
            }
        }
    }

    fn on_samples(&mut self, kind: TrackKind, samples: Vec<SampleDescriptor>) {
        if kind == TrackKind::Audio && self.audio.decoder.is_none() {
            return;
        }
        tracing::trace!(%kind, count = samples.len(), "samples buffered");
        self.slot_mut(kind).buffer.extend(samples);
        self.ready.touch();
    }

    fn on_ready_deadline(&mut self) {
        if !self.ready.check(|| true) {
            return;
        }
        let Some(metadata) = &self.metadata else {
            return;
        };
        let corrected = metadata.with_corrected_duration(&self.video.buffer);
        tracing::debug!(duration = corrected.duration_secs, "metadata ready");
        // every refresh re-enters Ready until decoding has completed
        if !matches!(self.state, DemuxState::Complete | DemuxState::Stopped) {
            self.set_state(DemuxState::Ready);
        }
        self.dispatch(|h| h.on_ready(&corrected));
    }

    fn on_settle_deadline(&mut self) {
        let depth = self.queue_depth();
        let delivered = self.frames_delivered;
        if !self.settle.check(|| depth.is_drained() && delivered > 0) {
            return;
        }
        tracing::info!(frames = delivered, "decoding complete");
        self.settle.cancel();
        self.set_state(DemuxState::Complete);
        self.dispatch(|h| h.on_complete());
    }

    fn seek(&mut self, time_secs: f64) -> Result<()> {
        if self.metadata.is_none() {
            tracing::debug!(time_secs, "seek before metadata ignored");
            return Ok(());
        }

        // locate every track first so a miss submits nothing anywhere
        let mut starts = Vec::with_capacity(2);
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let slot = self.slot(kind);
            if !slot.enabled() {
                continue;
            }
            let target = (time_secs * slot.timescale as f64).ceil() as i64;
            let start = find_start_sample_index(slot.buffer.samples(), target).map_err(|e| {
                tracing::debug!(%kind, time_secs, target, "seek target past buffered samples");
                e
            })?;
            starts.push((kind, start));
        }

        for (kind, start) in starts {
            let slot = self.slot_mut(kind);
            let submitted = slot.buffer.len() - start;
            let errors = slot.submit_from(start);
            tracing::debug!(%kind, time_secs, start, submitted, "seek");
            for e in errors {
                self.report(e);
            }
        }

        self.settle.postpone();
        let drained = self.queue_depth().is_drained();
        self.settle.observe(drained);
        if self.state != DemuxState::Complete {
            let next = if self.source_done {
                DemuxState::Draining
            } else {
                DemuxState::Decoding
            };
            self.set_state(next);
        }
        Ok(())
    }

    fn queue_depth(&self) -> QueueDepth {
        QueueDepth {
            video: self.video.queue_depth(),
            audio: self.audio.queue_depth(),
        }
    }

    fn slot(&self, kind: TrackKind) -> &TrackSlot {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    fn slot_mut(&mut self, kind: TrackKind) -> &mut TrackSlot {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }

    /// Release everything exactly once; the session never dispatches again.
    fn shutdown(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.video.disable();
        self.audio.disable();
        self.parser.stop();
        self.ready.cancel();
        self.settle.cancel();
        self.set_state(DemuxState::Stopped);
        tracing::info!(frames = self.frames_delivered, "demux session stopped");
    }
}
