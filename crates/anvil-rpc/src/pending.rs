//! Pending call table
//!
//! Maps correlation ids to the continuation waiting for that call's outcome.
//! Every entry is removed exactly once: by its response, by teardown of the
//! connection it was sent on, or by a timed-out blocking caller. Continuations
//! always run after the table lock is released, so they are free to issue
//! new calls.

use anvil_protocol::CorrelationId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

use crate::error::RpcError;
use crate::registry::panic_message;

pub type Outcome = Result<Value, RpcError>;

/// Success/error continuation pair of an asynchronous call.
///
/// Exactly one side runs, exactly once, on the I/O thread (or on the thread
/// that tears the connection down).
pub struct Callbacks {
    continuation: Box<dyn FnOnce(Outcome) + Send>,
}

impl Callbacks {
    pub fn new<S, E>(on_success: S, on_error: E) -> Self
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(RpcError) + Send + 'static,
    {
        Self::from_fn(move |outcome| match outcome {
            Ok(value) => on_success(value),
            Err(err) => on_error(err),
        })
    }

    pub fn from_fn(f: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            continuation: Box::new(f),
        }
    }

    /// Run the continuation, containing any panic it raises.
    pub(crate) fn complete(self, id: CorrelationId, outcome: Outcome) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || (self.continuation)(outcome))) {
            error!(%id, "Continuation panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callbacks")
    }
}

struct PendingCall {
    callbacks: Callbacks,
    /// Epoch whose connection carried the request, once written.
    sent_in: Option<u64>,
}

#[derive(Default)]
pub struct PendingCalls {
    entries: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub(crate) fn register(&self, id: CorrelationId, callbacks: Callbacks) {
        let previous = self.entries.lock().insert(
            id,
            PendingCall {
                callbacks,
                sent_in: None,
            },
        );
        debug_assert!(previous.is_none(), "correlation id {} reused", id);
    }

    pub(crate) fn mark_sent(&self, id: CorrelationId, epoch: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.sent_in = Some(epoch);
        }
    }

    pub(crate) fn take(&self, id: CorrelationId) -> Option<Callbacks> {
        self.entries.lock().remove(&id).map(|entry| entry.callbacks)
    }

    /// Complete the entry for `id`. Returns false if there was none.
    pub(crate) fn resolve(&self, id: CorrelationId, outcome: Outcome) -> bool {
        match self.take(id) {
            Some(callbacks) => {
                callbacks.complete(id, outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every entry with [`RpcError::ConnectionClosed`].
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        Self::fail(drained)
    }

    /// Fail the entries whose request was written during `epoch`; entries
    /// still waiting to be sent survive.
    pub(crate) fn fail_sent_in(&self, epoch: u64) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, entry)| entry.sent_in == Some(epoch))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        Self::fail(drained)
    }

    fn fail(drained: Vec<(CorrelationId, PendingCall)>) -> usize {
        let count = drained.len();
        for (id, entry) in drained {
            entry.callbacks.complete(id, Err(RpcError::ConnectionClosed));
        }
        if count > 0 {
            debug!(count, "Failed pending calls with connection closed");
        }
        count
    }
}
