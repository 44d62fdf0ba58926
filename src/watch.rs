//! Change-notification stream.
//!
//! Commits enqueue one event per applied record, in commit order, into a
//! bounded queue. The queue is lossy: when full, the oldest event is dropped
//! and a counter is bumped, so the writer never blocks on a slow consumer.
//! Closing the store wakes the consumer, which drains what is left and then
//! sees `None`, the close sentinel. One consumer per process is supported.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: Vec<u8>,
    /// `None` for deletes.
    pub value: Option<Vec<u8>>,
    pub batch_id: u64,
}

struct WatchQueue {
    events: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

/// Bounded drop-oldest broadcast queue shared between the writer and the
/// consumer handle.
pub(crate) struct Watcher {
    queue: Mutex<WatchQueue>,
    capacity: usize,
    ready: Condvar,
}

impl Watcher {
    pub fn new(capacity: u64) -> Self {
        Self {
            queue: Mutex::new(WatchQueue {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            capacity: capacity.max(1) as usize,
            ready: Condvar::new(),
        }
    }

    /// Enqueue an event, evicting the oldest when the queue is full. Called
    /// under the writer lock, so events arrive in commit order.
    pub fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        if queue.events.len() == self.capacity {
            queue.events.pop_front();
            queue.dropped += 1;
            if queue.dropped % 1000 == 1 {
                warn!(dropped = queue.dropped, "watch queue full, dropping oldest events");
            }
        }
        queue.events.push_back(event);
        drop(queue);
        self.ready.notify_one();
    }

    /// Close the stream. Consumers drain the remaining events and then
    /// receive `None`.
    pub fn close(&self) {
        let mut queue = self.queue.lock();
        queue.closed = true;
        drop(queue);
        self.ready.notify_all();
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.lock().dropped
    }

    fn recv(&self) -> Option<Event> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            if queue.closed {
                return None;
            }
            self.ready.wait(&mut queue);
        }
    }

    fn try_recv(&self) -> Option<Event> {
        self.queue.lock().events.pop_front()
    }
}

/// Consumer handle returned by `Cellar::watch`.
pub struct EventReceiver {
    pub(crate) watcher: Arc<Watcher>,
}

impl EventReceiver {
    /// Block until the next event. `None` once the store is closed and the
    /// queue is drained.
    pub fn recv(&self) -> Option<Event> {
        self.watcher.recv()
    }

    /// Pop an event without blocking.
    pub fn try_recv(&self) -> Option<Event> {
        self.watcher.try_recv()
    }

    /// Events dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.watcher.dropped_count()
    }
}

impl Iterator for EventReceiver {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.recv()
    }
}
