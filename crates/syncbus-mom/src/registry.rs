//! Correlation of published messages to the echoes and responses they expect.

use crate::error::{CallbackKind, DispatchError};
use crate::message::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

type Outcome = Result<Message, DispatchError>;

struct Pending {
    tx: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

/// Message id to pending waiter, with one timeout task per entry.
#[derive(Clone)]
pub(crate) struct CorrelationRegistry {
    kind: CallbackKind,
    entries: Arc<Mutex<HashMap<String, Pending>>>,
    drained: Arc<Notify>,
}

impl CorrelationRegistry {
    pub(crate) fn new(kind: CallbackKind) -> Self {
        Self {
            kind,
            entries: Arc::new(Mutex::new(HashMap::new())),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Register a waiter for `message_id` that expires after `timeout`.
    pub(crate) fn register(&self, message_id: &str, topic: &str, timeout: Duration) -> Reply {
        let (tx, rx) = oneshot::channel();
        let registry = self.clone();
        let id = message_id.to_string();
        let topic = topic.to_string();
        let mut entries = self.entries.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(&id, &topic);
        });
        entries.insert(message_id.to_string(), Pending { tx, timer });
        drop(entries);
        Reply {
            kind: self.kind,
            message_id: message_id.to_string(),
            rx,
        }
    }

    /// Hand `message` to the waiter registered under `message_id`.
    pub(crate) fn resolve(&self, message_id: &str, message: &Message) -> bool {
        match self.take(message_id) {
            Some(pending) => {
                self.settle(message_id, pending, Ok(message.clone()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&self, message_id: &str) -> bool {
        match self.take(message_id) {
            Some(pending) => {
                let cancelled = DispatchError::Cancelled {
                    kind: self.kind,
                    message_id: message_id.to_string(),
                };
                self.settle(message_id, pending, Err(cancelled));
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn contains(&self, message_id: &str) -> bool {
        self.entries.lock().contains_key(message_id)
    }

    /// Wait until every pending entry has been resolved, expired or cancelled.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn expire(&self, message_id: &str, topic: &str) {
        if let Some(pending) = self.take(message_id) {
            tracing::debug!(kind = %self.kind, message_id, topic, "correlation timed out");
            let timeout = DispatchError::CallbackTimeout {
                kind: self.kind,
                message_id: message_id.to_string(),
                topic: topic.to_string(),
            };
            self.settle(message_id, pending, Err(timeout));
        }
    }

    /// Stop the entry's timer and hand over its outcome. False if the waiter is gone.
    fn settle(&self, message_id: &str, pending: Pending, outcome: Outcome) -> bool {
        pending.timer.abort();
        match pending.tx.send(outcome) {
            Ok(()) => true,
            Err(outcome) => {
                tracing::trace!(
                    kind = %self.kind,
                    message_id,
                    ok = outcome.is_ok(),
                    "waiter dropped before its outcome arrived"
                );
                false
            }
        }
    }

    fn take(&self, message_id: &str) -> Option<Pending> {
        let (pending, empty) = {
            let mut entries = self.entries.lock();
            let pending = entries.remove(message_id);
            (pending, entries.is_empty())
        };
        if pending.is_some() && empty {
            self.drained.notify_waiters();
        }
        pending
    }
}

/// A pending echo or response.
#[derive(Debug)]
pub struct Reply {
    kind: CallbackKind,
    message_id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl Reply {
    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the correlated message, its timeout, or cancellation.
    pub async fn recv(self) -> Result<Message, DispatchError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::Cancelled {
                kind: self.kind,
                message_id: self.message_id,
            }),
        }
    }
}

/// Cancels the pending callbacks of one published message.
#[derive(Clone)]
pub struct Canceller {
    message_id: String,
    echoes: CorrelationRegistry,
    responses: CorrelationRegistry,
}

impl Canceller {
    pub(crate) fn new(
        message_id: String,
        echoes: CorrelationRegistry,
        responses: CorrelationRegistry,
    ) -> Self {
        Self {
            message_id,
            echoes,
            responses,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Synchronously drop pending entries; waiters observe [`DispatchError::Cancelled`].
    pub fn cancel(&self) -> bool {
        let echo = self.echoes.cancel(&self.message_id);
        let response = self.responses.cancel(&self.message_id);
        echo || response
    }

    pub fn is_pending(&self) -> bool {
        self.echoes.contains(&self.message_id) || self.responses.contains(&self.message_id)
    }
}

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canceller")
            .field("message_id", &self.message_id)
            .finish()
    }
}
