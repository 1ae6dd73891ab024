//! Participant presence and dispatcher lifecycle listeners.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;

/// Lifecycle events a dispatcher reports to listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatcherEvent {
    Online,
    Offline,
    /// A participant joined; the callback receives its id.
    Hello,
    /// A participant left, cleanly or through its last will.
    Bye,
    Destroy,
}

/// Ids of the participants currently considered active.
#[derive(Clone, Debug, Default)]
pub struct PresenceSet {
    members: Arc<RwLock<BTreeSet<String>>>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the id was not yet present.
    pub fn add(&self, id: &str) -> bool {
        self.members.write().insert(id.to_string())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.members.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.read().contains(id)
    }

    pub fn members(&self) -> Vec<String> {
        self.members.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn clear(&self) {
        self.members.write().clear();
    }
}

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    callbacks: HashMap<u64, (DispatcherEvent, Callback)>,
}

#[derive(Clone, Default)]
pub(crate) struct ListenerRegistry {
    table: Arc<Mutex<ListenerTable>>,
    detached: Arc<Notify>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, event: DispatcherEvent, callback: Callback) -> Listener {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.callbacks.insert(id, (event, callback));
        Listener {
            id,
            event,
            registry: self.clone(),
        }
    }

    /// Invoke every callback registered for `event`, outside the table lock.
    pub(crate) fn emit(&self, event: DispatcherEvent, participant: &str) {
        let callbacks: Vec<Callback> = self
            .table
            .lock()
            .callbacks
            .values()
            .filter(|(kind, _)| *kind == event)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(participant);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().callbacks.len()
    }

    pub(crate) fn clear(&self) {
        self.table.lock().callbacks.clear();
        self.detached.notify_waiters();
    }

    pub(crate) async fn detached(&self) {
        loop {
            let notified = self.detached.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, id: u64) -> bool {
        let (removed, empty) = {
            let mut table = self.table.lock();
            let removed = table.callbacks.remove(&id).is_some();
            (removed, table.callbacks.is_empty())
        };
        if removed && empty {
            self.detached.notify_waiters();
        }
        removed
    }
}

/// Handle returned by [`crate::Dispatcher::on`].
pub struct Listener {
    id: u64,
    event: DispatcherEvent,
    registry: ListenerRegistry,
}

impl Listener {
    pub fn event(&self) -> DispatcherEvent {
        self.event
    }

    /// Detach the callback. Returns false if it was already gone.
    pub fn unregister(self) -> bool {
        self.registry.remove(self.id)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}
