use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::wire::envelope::Envelope;

#[derive(Debug, PartialEq)]
pub enum QueueError {
    Closed { queue: String, function: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { queue, function } => write!(
                f,
                "outbound queue '{queue}' is closed; '{function}' was not enqueued"
            ),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Envelope>,
    closed: bool,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    available: Condvar,
}

/// FIFO hand-off of envelopes to the worker loop that owns the queue.
///
/// Clones share the same buffer; any thread may push, only the owning loop
/// pops.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

impl OutboundQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                available: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn push(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed {
                queue: self.inner.name.clone(),
                function: envelope.function,
            });
        }

        state.entries.push_back(envelope);
        drop(state);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Blocks until an entry is available, the queue is closed, or `timeout`
    /// elapses. A closed queue never yields entries.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Envelope> {
        let state = self.lock();
        let (mut state, _timed_out) = self
            .inner
            .available
            .wait_timeout_while(state, timeout, |state| {
                state.entries.is_empty() && !state.closed
            })
            .expect("outbound queue lock poisoned");

        if state.closed {
            return None;
        }
        state.entries.pop_front()
    }

    /// Rejects further pushes, wakes blocked consumers and hands back the
    /// entries that were never delivered.
    pub fn close(&self) -> Vec<Envelope> {
        let mut state = self.lock();
        state.closed = true;
        let undelivered = state.entries.drain(..).collect();
        drop(state);
        self.inner.available.notify_all();
        undelivered
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().expect("outbound queue lock poisoned")
    }
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}
