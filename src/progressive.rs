//! Progressive output of a growing container.
//!
//! A task polls the writer every time slice and forwards the structural
//! units serialized since the last poll as one chunk. Stopping flushes the
//! writer, forwards the remainder and closes the stream. A consumer that
//! drops the receiver cancels the stream without a flush.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::container::SharedWriter;

/// Consumer end of a progressive output
pub struct OutputStream {
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
    pub stop: ProgressiveStop,
}

impl OutputStream {
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Bytes>, ProgressiveStop) {
        (self.receiver, self.stop)
    }
}

/// Finishes a progressive output. Dropping it without `stop` leaves the
/// stream running until the consumer goes away.
pub struct ProgressiveStop {
    tx: Option<oneshot::Sender<()>>,
}

impl ProgressiveStop {
    /// Flush the writer, emit the remainder and close the stream. Only the
    /// first call has an effect.
    pub fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Stream `writer`'s serialized units every `time_slice`.
///
/// `on_cancel` runs if the consumer drops the receiver before the stream
/// is stopped.
pub fn file_to_stream<F>(writer: SharedWriter, time_slice: Duration, on_cancel: F) -> OutputStream
where
    F: FnOnce() + Send + 'static,
{
    let (tx, receiver) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    tokio::spawn(run(writer, time_slice, tx, stop_rx, on_cancel));

    OutputStream {
        receiver,
        stop: ProgressiveStop { tx: Some(stop_tx) },
    }
}

async fn run<F>(
    writer: SharedWriter,
    time_slice: Duration,
    tx: mpsc::UnboundedSender<Bytes>,
    stop_rx: oneshot::Receiver<()>,
    on_cancel: F,
) where
    F: FnOnce() + Send + 'static,
{
    let mut cursor = 0;
    let mut stop_rx = Some(stop_rx);
    let mut ticker = interval_at(Instant::now() + time_slice, time_slice);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let cancelled = loop {
        tokio::select! {
            _ = tx.closed() => break true,
            _ = ticker.tick() => {
                if let Some(chunk) = take_delta(&writer, &mut cursor) {
                    tracing::trace!(bytes = chunk.len(), "progressive chunk");
                    if tx.send(chunk).is_err() {
                        break true;
                    }
                }
            }
            stopped = wait_stop(&mut stop_rx) => {
                if stopped {
                    break false;
                }
                // stop handle dropped without stopping
                stop_rx = None;
            }
        }
    };

    if cancelled {
        tracing::debug!("progressive output cancelled by consumer");
        on_cancel();
        return;
    }

    if let Err(e) = writer.lock().flush() {
        tracing::error!(error = %e, "container flush failed");
    }
    if let Some(chunk) = take_delta(&writer, &mut cursor) {
        let _ = tx.send(chunk);
    }
    tracing::debug!(units = cursor, "progressive output finished");
}

async fn wait_stop(stop_rx: &mut Option<oneshot::Receiver<()>>) -> bool {
    match stop_rx {
        Some(rx) => rx.await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Concatenate every unit past `cursor` and advance it.
fn take_delta(writer: &SharedWriter, cursor: &mut usize) -> Option<Bytes> {
    let writer = writer.lock();
    let units = writer.units();
    if *cursor >= units.len() {
        return None;
    }
    let mut chunk = BytesMut::new();
    for unit in &units[*cursor..] {
        chunk.extend_from_slice(unit);
    }
    *cursor = units.len();
    (!chunk.is_empty()).then(|| chunk.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{shared_writer, TrackOptions, VideoTrackOptions};
    use crate::tests::fixtures::{samples, RecordingWriter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SLICE: Duration = Duration::from_millis(500);

    fn writer_with_track() -> SharedWriter {
        let writer = shared_writer(RecordingWriter::new().0);
        writer
            .lock()
            .add_track(TrackOptions::Video(VideoTrackOptions {
                timescale: 30,
                width: 640,
                height: 360,
                codec: "avc1.42E01F".into(),
                decoder_config: None,
            }))
            .unwrap();
        writer
    }

    fn write_samples(writer: &SharedWriter, count: usize) {
        let mut w = writer.lock();
        for s in samples(count, 30, 10) {
            w.add_sample(crate::container::TrackId(1), s).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_deltas_then_remainder() {
        let writer = writer_with_track();
        let mut out = file_to_stream(writer.clone(), SLICE, || panic!("not cancelled"));

        // header unit only
        tokio::time::sleep(SLICE + Duration::from_millis(1)).await;
        assert_eq!(out.receiver.recv().await.unwrap(), "HEAD");

        // an empty slice emits nothing
        tokio::time::sleep(SLICE).await;
        assert!(out.receiver.try_recv().is_err());

        write_samples(&writer, 2);
        tokio::time::sleep(SLICE).await;
        let chunk = out.receiver.recv().await.unwrap();
        assert_eq!(chunk.len(), 8);

        write_samples(&writer, 1);
        out.stop.stop();
        out.stop.stop();
        let rest = out.receiver.recv().await.unwrap();
        assert_eq!(&rest[rest.len() - 3..], b"END");
        assert_eq!(rest.len(), 4 + 3);
        assert!(out.receiver.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_drop_cancels_without_flush() {
        let writer = writer_with_track();
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);
        let out = file_to_stream(writer.clone(), SLICE, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (receiver, _stop) = out.into_parts();
        drop(receiver);
        tokio::time::sleep(SLICE * 2).await;

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        let units = writer.lock().units().len();
        assert_eq!(units, 1, "no flush after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stop_handle_keeps_streaming() {
        let writer = writer_with_track();
        let (mut receiver, stop) = file_to_stream(writer.clone(), SLICE, || {}).into_parts();
        drop(stop);

        tokio::time::sleep(SLICE + Duration::from_millis(1)).await;
        assert_eq!(receiver.recv().await.unwrap(), "HEAD");
        write_samples(&writer, 1);
        tokio::time::sleep(SLICE).await;
        assert_eq!(receiver.recv().await.unwrap().len(), 4);
    }
}
