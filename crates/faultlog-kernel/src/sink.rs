//! Consumer side: where drained records end up.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

/// Receiver of finished records for one run at a time.
///
/// `reserve_capacity` is called from the producer thread before any records
/// are appended; `append_records` and `on_pipeline_finished` are called from
/// the drain loop. Calls for one run never overlap.
pub trait RecordSink<R>: Send + Sync {
    /// Advisory size hint, called once per run with the snapshotted count.
    fn reserve_capacity(&self, _n: u64) {}

    /// Appends a batch; order across calls is display order.
    fn append_records(&self, records: Vec<R>);

    /// Called exactly once per run after the final drain.
    fn on_pipeline_finished(&self, success: bool);
}

/// Sink that keeps everything it is given. Useful for tests and batch export.
#[derive(Debug)]
pub struct CollectingSink<R> {
    inner: Mutex<Collected<R>>,
}

#[derive(Debug)]
struct Collected<R> {
    records: Vec<R>,
    batches: usize,
    reservations: Vec<u64>,
    finished: Vec<bool>,
}

impl<R> Default for CollectingSink<R> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Collected {
                records: Vec::new(),
                batches: 0,
                reservations: Vec::new(),
                finished: Vec::new(),
            }),
        }
    }
}

impl<R: Clone> CollectingSink<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<R> {
        self.lock().records.clone()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of non-empty `append_records` calls.
    pub fn batch_count(&self) -> usize {
        self.lock().batches
    }

    pub fn reservations(&self) -> Vec<u64> {
        self.lock().reservations.clone()
    }

    /// Every `on_pipeline_finished` value received, in order.
    pub fn finished(&self) -> Vec<bool> {
        self.lock().finished.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Clone + Send> RecordSink<R> for CollectingSink<R> {
    fn reserve_capacity(&self, n: u64) {
        let mut inner = self.lock();
        inner.reservations.push(n);
        inner.records.reserve(usize::try_from(n).unwrap_or(0));
    }

    fn append_records(&self, records: Vec<R>) {
        let mut inner = self.lock();
        inner.batches += 1;
        inner.records.extend(records);
    }

    fn on_pipeline_finished(&self, success: bool) {
        self.lock().finished.push(success);
    }
}

/// Messages delivered by [ChannelSink].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent<R> {
    Reserve(u64),
    Records(Vec<R>),
    Finished { success: bool },
}

/// Sink that forwards every call to an unbounded channel so an application
/// event loop can consume batches at its own pace.
#[derive(Debug, Clone)]
pub struct ChannelSink<R> {
    tx: mpsc::UnboundedSender<SinkEvent<R>>,
}

impl<R: Send> ChannelSink<R> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent<R>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent<R>) {
        if self.tx.send(event).is_err() {
            tracing::debug!("channel sink receiver dropped, discarding event");
        }
    }
}

impl<R: Send> RecordSink<R> for ChannelSink<R> {
    fn reserve_capacity(&self, n: u64) {
        self.send(SinkEvent::Reserve(n));
    }

    fn append_records(&self, records: Vec<R>) {
        self.send(SinkEvent::Records(records));
    }

    fn on_pipeline_finished(&self, success: bool) {
        self.send(SinkEvent::Finished { success });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_tracks_calls() {
        let sink = CollectingSink::<u32>::new();
        sink.reserve_capacity(3);
        sink.append_records(vec![1, 2]);
        sink.append_records(vec![3]);
        sink.on_pipeline_finished(true);

        assert_eq!(sink.records(), vec![1, 2, 3]);
        assert_eq!(sink.batch_count(), 2);
        assert_eq!(sink.reservations(), vec![3]);
        assert_eq!(sink.finished(), vec![true]);
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::<u32>::new();
        sink.reserve_capacity(1);
        sink.append_records(vec![9]);
        sink.on_pipeline_finished(false);

        assert_eq!(rx.recv().await, Some(SinkEvent::Reserve(1)));
        assert_eq!(rx.recv().await, Some(SinkEvent::Records(vec![9])));
        assert_eq!(
            rx.recv().await,
            Some(SinkEvent::Finished { success: false })
        );
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::<u32>::new();
        drop(rx);
        sink.append_records(vec![1]);
        sink.on_pipeline_finished(true);
    }
}
