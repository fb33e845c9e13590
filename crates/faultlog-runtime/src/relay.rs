//! Bounded relay buffer between the producer thread and the drain loop.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Result of [RelayBuffer::push].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Every record was appended.
    Delivered,
    /// The buffer was closed while waiting for space; the first `delivered`
    /// records made it in, the rest were dropped.
    Interrupted { delivered: usize },
}

#[derive(Debug)]
struct RelayState<R> {
    records: Vec<R>,
    closed: bool,
}

/// Capacity-limited holding area with one producer and one consumer.
///
/// `len() <= capacity` holds whenever the lock is released. A push larger
/// than the free space is appended in pieces, waiting for the consumer in
/// between. The lock is held only while records are moved in or out.
#[derive(Debug)]
pub struct RelayBuffer<R> {
    state: Mutex<RelayState<R>>,
    space: Condvar,
    capacity: usize,
}

impl<R> RelayBuffer<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RelayState {
                records: Vec::new(),
                closed: false,
            }),
            space: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Appends `records`, blocking while the buffer is full.
    ///
    /// Returns early with [PushOutcome::Interrupted] once [RelayBuffer::close]
    /// has been called.
    pub fn push(&self, records: Vec<R>) -> PushOutcome {
        let total = records.len();
        let mut pending = records.into_iter();
        let mut remaining = total;
        let mut state = self.lock();
        while remaining > 0 {
            state = self
                .space
                .wait_while(state, |s| !s.closed && s.records.len() >= self.capacity)
                .unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return PushOutcome::Interrupted {
                    delivered: total - remaining,
                };
            }
            let room = self.capacity - state.records.len();
            let take = room.min(remaining);
            state.records.extend(pending.by_ref().take(take));
            remaining -= take;
        }
        PushOutcome::Delivered
    }

    /// Takes everything currently buffered. Never blocks on space; wakes a
    /// producer waiting in [RelayBuffer::push].
    pub fn drain_all(&self) -> Vec<R> {
        let taken = {
            let mut state = self.lock();
            if state.records.is_empty() {
                return Vec::new();
            }
            std::mem::take(&mut state.records)
        };
        self.space.notify_all();
        taken
    }

    /// Drops buffered records without handing them out; returns how many.
    pub fn discard(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            let n = state.records.len();
            state.records.clear();
            n
        };
        self.space.notify_all();
        dropped
    }

    /// Refuses further pushes and wakes a blocked producer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.space.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, RelayState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Type-erased close handle so run control does not carry the record type.
pub(crate) trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

impl<R: Send> Interruptible for RelayBuffer<R> {
    fn interrupt(&self) {
        self.close();
    }
}
