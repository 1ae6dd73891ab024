//! The replicated document store.
//!
//! One [`SyncStore`] per document id and process. Local changes run as CRDT
//! transactions and leave as debounced binary deltas on the update topic.
//! The server-role replica answers sync requests and adjudicates mutexes;
//! client replicas forward their mutex requests to it.
//!
//! Topics, below the dispatcher prefix:
//!
//! ```text
//! store/{id}/update
//! store/{id}/sync/request
//! store/{id}/sync/response/{owner}
//! store/{id}/mutex/request
//! store/{id}/mutex/response/{owner}
//! store/{id}/mutex/broadcast
//! ```

use crate::buffer::{Flush, OutboundQueue};
use crate::config::StoreConfig;
use crate::engine::{Change, DocumentEngine, Roots, YrsEngine};
use crate::error::{EngineError, Result, StoreError};
use crate::mutex::{self, MutexAction, MutexRequest, MUTEX_ROOT, USER_MUTEX_ROOT};
use crate::state::{Lockable, StateTree};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use syncbus_mom::{
    uid, Body, Canceller, DispatchError, Dispatcher, DispatcherEvent, Listener, Message, OnReceive,
    PublishOptions, Qos,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Root holding the application state tree.
pub const STATE_ROOT: &str = "state";

const SWITCHEROO: &str = "switcheroo";

/// Which side of the mutex and sync protocols a replica plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable store state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreFlags {
    pub initialized: bool,
    pub readonly: bool,
    /// Depth of in-flight blocking operations.
    pub blocking: usize,
    /// Changed since the last persist.
    pub dirty: bool,
    pub persist: bool,
    pub ready: bool,
    pub synchronized: bool,
    pub paused: bool,
    pub destroyed: bool,
    pub role: Option<Role>,
}

/// Store lifecycle and change notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A local patch was applied.
    Patch,
    /// A remote update was applied.
    Update,
    /// A sync response was applied.
    Sync,
    Ready,
    Pause,
    Resume,
    Destroy,
}

struct Topics {
    update: String,
    sync_request: String,
    sync_response: String,
    mutex_request: String,
    mutex_response: String,
    mutex_broadcast: String,
}

impl Topics {
    fn new(dispatcher: &Dispatcher, id: &str) -> Self {
        let owner = dispatcher.client_id();
        Self {
            update: dispatcher.topic(["store", id, "update"]),
            sync_request: dispatcher.topic(["store", id, "sync/request"]),
            sync_response: dispatcher.topic(["store", id, "sync/response", owner]),
            mutex_request: dispatcher.topic(["store", id, "mutex/request"]),
            mutex_response: dispatcher.topic(["store", id, "mutex/response", owner]),
            mutex_broadcast: dispatcher.topic(["store", id, "mutex/broadcast"]),
        }
    }

    fn all(&self) -> [&str; 6] {
        [
            self.update.as_str(),
            self.mutex_broadcast.as_str(),
            self.mutex_request.as_str(),
            self.mutex_response.as_str(),
            self.sync_request.as_str(),
            self.sync_response.as_str(),
        ]
    }
}

/// Work that needs to publish and therefore runs off the dispatcher pump.
enum Inbound {
    SyncRequest(Message),
    MutexRequest(Message),
    Departed(String),
}

struct Inner {
    id: String,
    type_id: String,
    owner: String,
    dispatcher: Dispatcher,
    config: StoreConfig,
    topics: Topics,
    engine: Mutex<Box<dyn DocumentEngine>>,
    flags: watch::Sender<StoreFlags>,
    events: broadcast::Sender<StoreEvent>,
    pending_origins: Mutex<HashSet<String>>,
    outbound: Mutex<OutboundQueue>,
    flush_generation: AtomicU64,
    mutex_requests: Mutex<HashMap<String, Canceller>>,
    role_lock: tokio::sync::Mutex<()>,
    role_to_resume: Mutex<Option<Role>>,
    inbox: mpsc::UnboundedSender<Inbound>,
    inbox_task: Mutex<Option<JoinHandle<()>>>,
    bye_listener: Mutex<Option<Listener>>,
    destroy_listener: Mutex<Option<Listener>>,
}

/// A replicated document. Cheap to clone.
#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<Inner>,
}

/// Decrements the blocking depth when dropped.
struct Blocking<'a> {
    flags: &'a watch::Sender<StoreFlags>,
}

impl Drop for Blocking<'_> {
    fn drop(&mut self) {
        self.flags
            .send_modify(|flags| flags.blocking = flags.blocking.saturating_sub(1));
    }
}

impl SyncStore {
    /// Create an uninitialized store for document `id` on `dispatcher`.
    ///
    /// The store has no role yet; see [`SyncStore::init_with_state`] and
    /// [`SyncStore::set_role`]. It destroys itself when the dispatcher does.
    pub fn new(
        id: impl Into<String>,
        type_id: impl Into<String>,
        persist: bool,
        dispatcher: &Dispatcher,
        config: StoreConfig,
    ) -> Self {
        let id = id.into();
        let engine: Box<dyn DocumentEngine> =
            Box::new(YrsEngine::new([STATE_ROOT, MUTEX_ROOT, USER_MUTEX_ROOT]));
        let (flags, _) = watch::channel(StoreFlags {
            persist,
            ..StoreFlags::default()
        });
        let (events, _) = broadcast::channel(256);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            topics: Topics::new(dispatcher, &id),
            id,
            type_id: type_id.into(),
            owner: dispatcher.client_id().to_string(),
            dispatcher: dispatcher.clone(),
            outbound: Mutex::new(OutboundQueue::new(config.debounce)),
            config,
            engine: Mutex::new(engine),
            flags,
            events,
            pending_origins: Mutex::new(HashSet::new()),
            flush_generation: AtomicU64::new(0),
            mutex_requests: Mutex::new(HashMap::new()),
            role_lock: tokio::sync::Mutex::new(()),
            role_to_resume: Mutex::new(None),
            inbox,
            inbox_task: Mutex::new(None),
            bye_listener: Mutex::new(None),
            destroy_listener: Mutex::new(None),
        });

        let task = tokio::spawn(run_inbox(Arc::downgrade(&inner), inbox_rx));
        *inner.inbox_task.lock() = Some(task);

        let weak = Arc::downgrade(&inner);
        let listener = dispatcher.on(DispatcherEvent::Destroy, move |_| {
            if let Some(inner) = weak.upgrade() {
                let store = SyncStore { inner };
                tokio::spawn(async move { store.destroy().await });
            }
        });
        *inner.destroy_listener.lock() = Some(listener);

        debug!(store_id = %inner.id, type_id = %inner.type_id, "store created");
        SyncStore { inner }
    }

    /// Create a store, seed it with `state` and take `role` in the background.
    pub fn open(
        id: impl Into<String>,
        type_id: impl Into<String>,
        persist: bool,
        dispatcher: &Dispatcher,
        config: StoreConfig,
        role: Role,
        state: StateTree,
    ) -> Self {
        let store = Self::new(id, type_id, persist, dispatcher, config);
        store.init_with_state(state);
        store.spawn_role(role);
        store
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn type_id(&self) -> &str {
        &self.inner.type_id
    }

    /// Participant id of this replica; the mutex owner key.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn flags(&self) -> StoreFlags {
        *self.inner.flags.borrow()
    }

    pub fn role(&self) -> Option<Role> {
        self.flags().role
    }

    pub fn is_initialized(&self) -> bool {
        self.flags().initialized
    }

    pub fn is_readonly(&self) -> bool {
        self.flags().readonly
    }

    pub fn set_readonly(&self, readonly: bool) {
        self.inner.flags.send_modify(|flags| flags.readonly = readonly);
    }

    pub fn is_blocking(&self) -> bool {
        self.flags().blocking > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().dirty
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.inner.flags.send_modify(|flags| flags.dirty = dirty);
    }

    pub fn persist(&self) -> bool {
        self.flags().persist
    }

    pub fn is_ready(&self) -> bool {
        self.flags().ready
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags().synchronized
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags().destroyed
    }

    /// Receive store events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the store flags.
    pub fn watch(&self) -> watch::Receiver<StoreFlags> {
        self.inner.flags.subscribe()
    }

    /// Resolves once the store is ready and synchronized, or destroyed.
    pub async fn when_ready(&self) {
        let mut rx = self.inner.flags.subscribe();
        let _ = rx
            .wait_for(|flags| flags.destroyed || (flags.ready && flags.synchronized))
            .await;
    }

    /// Deep copy of the application state.
    pub fn snapshot(&self) -> StateTree {
        self.inner
            .engine
            .lock()
            .roots()
            .get(STATE_ROOT)
            .cloned()
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.snapshot())
    }

    /// Current owner of `lockable`, if that owner is still an active participant.
    pub fn is_locked(&self, lockable: impl Lockable) -> Option<String> {
        let owner = {
            let engine = self.inner.engine.lock();
            mutex::owner(engine.roots(), lockable.lock_id()).map(str::to_string)
        }?;
        self.inner
            .dispatcher
            .is_active_client(&owner)
            .then_some(owner)
    }

    /// Lock ids held by `owner` according to the local replica.
    pub fn locks_of(&self, owner: &str) -> Vec<String> {
        mutex::locks_of(self.inner.engine.lock().roots(), owner)
    }

    /// Seed the state once. Returns false if the store was already initialized.
    ///
    /// The seeding transaction is local and never broadcast.
    pub fn init_with_state(&self, state: StateTree) -> bool {
        if self.is_initialized() {
            return false;
        }
        self.inner.flags.send_modify(|flags| {
            flags.initialized = true;
            flags.dirty = true;
        });
        if state.is_empty() {
            return true;
        }
        match self.transact("init-", move |roots| {
            roots.insert(STATE_ROOT.to_string(), state);
        }) {
            Ok(_) => true,
            Err(err) => {
                warn!(store_id = %self.id(), error = %err, "failed to seed state");
                false
            }
        }
    }

    /// Run `callback` on the live state as one transaction and broadcast the delta.
    ///
    /// The callback runs under the engine lock and must not call back into the store.
    pub async fn patch<R>(&self, callback: impl FnOnce(&mut StateTree) -> R) -> Result<R> {
        self.ensure_writable()?;
        let result = self.patch_state("patch-", callback).await?;
        self.emit(StoreEvent::Patch);
        Ok(result)
    }

    /// Acquire `lockable` (retrying), patch, and release unless `release_at_end` is false.
    pub async fn mutex<R>(
        &self,
        lockable: impl Lockable,
        release_at_end: bool,
        callback: impl FnOnce(&mut StateTree) -> R,
    ) -> Result<R> {
        self.ensure_writable()?;
        let lock = lockable.lock_id().to_string();
        self.acquire_mutex(lock.as_str()).await?;
        let outcome = self.critical_section(callback).await;
        if release_at_end {
            self.release_mutex(lock.as_str()).await?;
        }
        outcome
    }

    /// Single-attempt [`SyncStore::mutex`]. Fails with [`StoreError::Mutex`] if the lock is unavailable.
    pub async fn try_mutex<R>(
        &self,
        lockable: impl Lockable,
        release_at_end: bool,
        callback: impl FnOnce(&mut StateTree) -> R,
    ) -> Result<R> {
        self.ensure_writable()?;
        let lock = lockable.lock_id().to_string();
        if !self.try_acquire(&lock, release_at_end).await? {
            return Err(StoreError::Mutex {
                store: self.id().to_string(),
                lock,
            });
        }
        let outcome = self.critical_section(callback).await;
        if release_at_end {
            self.release_mutex(lock.as_str()).await?;
        }
        outcome
    }

    /// Acquire `lockable`, retrying until this replica owns it.
    pub async fn acquire_mutex(&self, lockable: impl Lockable) -> Result<bool> {
        self.ensure_writable()?;
        let lock = lockable.lock_id().to_string();
        let _blocking = self.block();
        loop {
            if self.acquire_once(&lock).await? {
                return Ok(true);
            }
            self.ensure_alive()?;
            tokio::time::sleep(self.inner.config.mutex_retry_delay).await;
        }
    }

    /// One acquire attempt. False if another owner holds the lock or this one already does.
    pub async fn try_acquire_mutex(&self, lockable: impl Lockable) -> Result<bool> {
        self.ensure_writable()?;
        let lock = lockable.lock_id().to_string();
        self.try_acquire(&lock, true).await
    }

    /// Release `lockable`, retrying until this replica no longer owns it.
    pub async fn release_mutex(&self, lockable: impl Lockable) -> Result<bool> {
        self.ensure_writable()?;
        let lock = lockable.lock_id().to_string();
        let _blocking = self.block();
        loop {
            if self.release_once(&lock).await? {
                return Ok(true);
            }
            self.ensure_alive()?;
            tokio::time::sleep(self.inner.config.mutex_retry_delay).await;
        }
    }

    /// One release attempt. False if this replica does not own the lock.
    pub async fn try_release_mutex(&self, lockable: impl Lockable) -> Result<bool> {
        self.ensure_writable()?;
        let lock = lockable.lock_id().to_string();
        if self.is_locked(lock.as_str()).as_deref() != Some(self.owner()) {
            return Ok(false);
        }
        let _blocking = self.block();
        self.release_once(&lock).await
    }

    /// Take `role` in a background task, logging failures.
    pub fn spawn_role(&self, role: Role) {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(err) = store.set_role(role).await {
                warn!(store_id = %store.id(), %role, error = %err, "failed to set role");
            }
        });
    }

    /// Switch to `role`. Returns false if nothing changed.
    pub async fn set_role(&self, role: Role) -> Result<bool> {
        let _serial = self.inner.role_lock.lock().await;
        let flags = self.flags();
        if !flags.initialized || flags.destroyed || flags.role == Some(role) {
            return Ok(false);
        }
        let _blocking = self.block();
        self.inner.dispatcher.when_ready().await;

        let previous = flags.role;
        self.inner.flags.send_modify(|flags| flags.role = Some(role));
        info!(store_id = %self.id(), from = ?previous, to = %role, "store role change");

        if previous == Some(Role::Server) {
            self.leave_server_topics().await;
        }

        if previous.is_none() {
            let topics = &self.inner.topics;
            self.ensure_subscribed(&topics.update, self.inner.config.update_qos, false, Some(self.update_handler()))
                .await?;
            self.ensure_subscribed(&topics.mutex_response, Qos::AtLeastOnce, true, None)
                .await?;
            self.ensure_subscribed(&topics.mutex_broadcast, Qos::AtLeastOnce, true, Some(self.broadcast_handler()))
                .await?;
        }

        if role == Role::Server {
            self.join_server_topics().await?;
        }

        match role {
            Role::Client if previous.is_none() => self.sync_state().await?,
            Role::Client => {}
            // the server's replica is authoritative, even when a client sync never completed
            Role::Server => self.inner.flags.send_modify(|flags| flags.synchronized = true),
        }
        if (previous.is_none() || role == Role::Server) && !self.is_ready() {
            self.inner.flags.send_modify(|flags| flags.ready = true);
            self.emit(StoreEvent::Ready);
        }
        if previous.is_some() {
            self.cancel_mutex_requests();
            let notice = Message::to(&self.inner.topics.mutex_broadcast, SWITCHEROO);
            self.inner
                .dispatcher
                .publish(notice, PublishOptions::default())
                .await?;
        }

        self.inner.flags.send_modify(|flags| flags.paused = false);
        Ok(true)
    }

    /// Fetch what the server has and we lack, and apply it as one transaction.
    pub async fn sync_state(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.role() == Some(Role::Server) {
            self.inner.flags.send_modify(|flags| flags.synchronized = true);
            return Ok(());
        }

        let topics = &self.inner.topics;
        self.ensure_subscribed(&topics.sync_response, Qos::AtLeastOnce, false, None)
            .await?;

        let body = if self.is_synchronized() {
            Body::Binary(self.inner.engine.lock().state_vector())
        } else {
            Body::Undefined
        };
        let request = Message::to(&topics.sync_request, body).reply_to(&topics.sync_response);
        let outcome = match self
            .inner
            .dispatcher
            .publish(request, self.request_options())
            .await
        {
            Ok(publication) => publication.response().await,
            Err(err) => Err(err),
        };
        if let Err(err) = self.inner.dispatcher.unsubscribe(&topics.sync_response).await {
            debug!(store_id = %self.id(), error = %err, "sync response unsubscribe failed");
        }

        let response = outcome?;
        let delta = response
            .body
            .as_binary()
            .ok_or_else(|| StoreError::InvalidResponse(format!("sync response for {}", self.id())))?;

        let origin = format!("sync-{}", response.id());
        let change = self.inner.engine.lock().apply(&origin, delta)?;
        if !self.settle(&change) && change.touched {
            self.enqueue(change.delta).await?;
        }

        self.inner.flags.send_modify(|flags| flags.synchronized = true);
        debug!(store_id = %self.id(), touched = change.touched, "store synchronized");
        self.emit(StoreEvent::Sync);
        Ok(())
    }

    /// Flush pending deltas, then leave every topic while remembering the role.
    ///
    /// A server refuses to pause.
    pub async fn pause(&self) -> Result<bool> {
        let _serial = self.inner.role_lock.lock().await;
        let flags = self.flags();
        if !flags.ready || flags.destroyed || flags.paused {
            return Ok(false);
        }
        if flags.role == Some(Role::Server) {
            warn!(store_id = %self.id(), "cannot pause a store with server role");
            return Ok(false);
        }

        info!(store_id = %self.id(), "pausing store");
        self.inner.flags.send_modify(|flags| flags.paused = true);
        self.flush().await?;
        self.leave_all_topics().await;

        *self.inner.role_to_resume.lock() = flags.role;
        self.inner.flags.send_modify(|flags| flags.role = None);
        self.emit(StoreEvent::Pause);
        Ok(true)
    }

    /// Rejoin with the role held before [`SyncStore::pause`].
    pub async fn resume(&self) -> Result<bool> {
        let flags = self.flags();
        if !flags.ready || !flags.paused {
            return Ok(false);
        }
        let Some(role) = self.inner.role_to_resume.lock().take() else {
            return Ok(false);
        };

        info!(store_id = %self.id(), %role, "resuming store");
        let resumed = self.set_role(role).await?;
        self.emit(StoreEvent::Resume);
        Ok(resumed)
    }

    /// Publish everything queued right away.
    pub async fn flush(&self) -> Result<()> {
        let deltas = self.inner.outbound.lock().take();
        if deltas.is_empty() {
            return Ok(());
        }
        let merged = self.inner.engine.lock().merge(&deltas)?;
        self.publish_update(merged).await
    }

    /// Flush, leave every topic and detach from the dispatcher.
    pub async fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        info!(store_id = %self.id(), "destroying store");
        if let Err(err) = self.flush().await {
            warn!(store_id = %self.id(), error = %err, "final flush failed");
        }

        self.inner.flags.send_modify(|flags| flags.destroyed = true);
        self.inner.flush_generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_mutex_requests();
        self.emit(StoreEvent::Destroy);

        self.leave_all_topics().await;
        for slot in [&self.inner.bye_listener, &self.inner.destroy_listener] {
            if let Some(listener) = slot.lock().take() {
                listener.unregister();
            }
        }
        if let Some(task) = self.inner.inbox_task.lock().take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Transactions and outbound deltas
    // ------------------------------------------------------------------------

    /// Run `mutate` as one engine transaction whose origin is registered as pending.
    fn transact<R>(&self, prefix: &str, mutate: impl FnOnce(&mut Roots) -> R) -> Result<(R, Option<Change>)> {
        let origin = format!("{prefix}{}", uid::short(10));
        self.inner.pending_origins.lock().insert(origin.clone());

        let mut mutate = Some(mutate);
        let mut result = None;
        let outcome = self.inner.engine.lock().transact(&origin, &mut |roots: &mut Roots| {
            if let Some(mutate) = mutate.take() {
                result = Some(mutate(roots));
            }
        });

        let change = match outcome {
            Ok(Some(change)) => {
                self.settle(&change);
                Some(change)
            }
            Ok(None) => {
                self.inner.pending_origins.lock().remove(&origin);
                None
            }
            Err(err) => {
                self.inner.pending_origins.lock().remove(&origin);
                return Err(err.into());
            }
        };
        let result = result.ok_or(EngineError::Aborted)?;
        Ok((result, change))
    }

    /// Claim the pending origin of `change`. Returns false for unresolved changes.
    fn settle(&self, change: &Change) -> bool {
        if change.touched {
            self.inner.flags.send_modify(|flags| flags.dirty = true);
        }
        let claimed = self.inner.pending_origins.lock().remove(&change.origin);
        if !claimed {
            debug!(store_id = %self.id(), origin = %change.origin, "unresolved change");
        }
        claimed
    }

    async fn patch_state<R>(&self, prefix: &str, callback: impl FnOnce(&mut StateTree) -> R) -> Result<R> {
        let (result, change) = self.transact(prefix, |roots| {
            callback(roots.entry(STATE_ROOT.to_string()).or_default())
        })?;
        if let Some(change) = change {
            self.enqueue(change.delta).await?;
        }
        Ok(result)
    }

    async fn critical_section<R>(&self, callback: impl FnOnce(&mut StateTree) -> R) -> Result<R> {
        let result = self.patch_state("mutex-", callback).await?;
        self.emit(StoreEvent::Patch);
        Ok(result)
    }

    /// Server-side transaction over all roots, published without debounce.
    async fn patch_internal<R>(&self, mutate: impl FnOnce(&mut Roots) -> R) -> Result<R> {
        let (result, change) = self.transact("patch-internal-", mutate)?;
        if let Some(change) = change {
            let mut deltas = self.inner.outbound.lock().take();
            deltas.push(change.delta);
            let merged = self.inner.engine.lock().merge(&deltas)?;
            self.publish_update(merged).await?;
        }
        Ok(result)
    }

    async fn enqueue(&self, delta: Vec<u8>) -> Result<()> {
        let decision = self.inner.outbound.lock().push(delta);
        match decision {
            Flush::Now => self.flush().await,
            Flush::Deferred(window) => {
                self.schedule_flush(window);
                Ok(())
            }
        }
    }

    /// Arm the trailing timer; any older timer becomes stale.
    fn schedule_flush(&self, window: Duration) {
        let generation = self.inner.flush_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.flush_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let store = SyncStore { inner };
            if let Err(err) = store.flush().await {
                warn!(store_id = %store.id(), error = %err, "debounced flush failed");
            }
        });
    }

    async fn publish_update(&self, delta: Vec<u8>) -> Result<()> {
        let message = Message::to(&self.inner.topics.update, delta).qos(self.inner.config.update_qos);
        self.inner
            .dispatcher
            .publish(message, PublishOptions::default())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutex client side
    // ------------------------------------------------------------------------

    async fn try_acquire(&self, lock: &str, fail_if_held: bool) -> Result<bool> {
        match self.is_locked(lock) {
            Some(owner) if owner == self.inner.owner => Ok(!fail_if_held),
            Some(_) => Ok(false),
            None => {
                let _blocking = self.block();
                self.acquire_once(lock).await
            }
        }
    }

    async fn acquire_once(&self, lock: &str) -> Result<bool> {
        if let Some(owner) = self.is_locked(lock) {
            return Ok(owner == self.inner.owner);
        }
        let granted = self
            .request_mutex(lock, MutexAction::Acquire, |store, owner| {
                owner == Some(store.owner()) && store.is_locked(lock).as_deref() == owner
            })
            .await?;
        debug!(store_id = %self.id(), lock, granted, "acquire attempt");
        Ok(granted)
    }

    async fn release_once(&self, lock: &str) -> Result<bool> {
        if self.is_locked(lock).as_deref() != Some(self.owner()) {
            return Ok(true);
        }
        self.request_mutex(lock, MutexAction::Release, |store, owner| {
            owner != Some(store.owner()) && store.is_locked(lock).as_deref() == owner
        })
        .await
    }

    /// Ask the server to act on `lock` and judge its answer with `accept`.
    ///
    /// Timeouts and cancellations count as a failed attempt.
    async fn request_mutex(
        &self,
        lock: &str,
        action: MutexAction,
        accept: impl Fn(&SyncStore, Option<&str>) -> bool,
    ) -> Result<bool> {
        let topics = &self.inner.topics;
        let body = Body::json(&MutexRequest {
            mutex: lock.to_string(),
            action,
        })?;
        let request = Message::to(&topics.mutex_request, body).reply_to(&topics.mutex_response);
        let publication = self
            .inner
            .dispatcher
            .publish(request, self.request_options())
            .await?;

        let request_id = publication.message.id().to_string();
        self.inner
            .mutex_requests
            .lock()
            .insert(request_id.clone(), publication.canceller());
        let outcome = publication.response().await;
        self.inner.mutex_requests.lock().remove(&request_id);

        match outcome {
            Ok(response) => Ok(accept(self, response.body.as_text())),
            Err(err) if err.is_timeout() || err.is_cancelled() => {
                debug!(store_id = %self.id(), lock, error = %err, "mutex request unanswered");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn cancel_mutex_requests(&self) {
        let pending: Vec<Canceller> = self
            .inner
            .mutex_requests
            .lock()
            .drain()
            .map(|(_, canceller)| canceller)
            .collect();
        for canceller in pending {
            canceller.cancel();
        }
    }

    fn request_options(&self) -> PublishOptions {
        match self.inner.config.request_timeout {
            Some(timeout) => PublishOptions::new().response_timeout(timeout),
            None => PublishOptions::new().response(),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------------

    fn update_handler(&self) -> OnReceive {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |message: Message, _| {
            if let Some(inner) = weak.upgrade() {
                SyncStore { inner }.handle_update(&message);
            }
        })
    }

    fn broadcast_handler(&self) -> OnReceive {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |message: Message, _| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let store = SyncStore { inner };
            if message.body.as_text() == Some(SWITCHEROO) && store.role() == Some(Role::Client) {
                debug!(store_id = %store.id(), from = %message.sender(), "switcheroo");
                store.cancel_mutex_requests();
            }
        })
    }

    fn inbox_handler(&self, wrap: fn(Message) -> Inbound) -> OnReceive {
        let inbox = self.inner.inbox.clone();
        Arc::new(move |message: Message, _| {
            let _ = inbox.send(wrap(message));
        })
    }

    /// Applied inline on the dispatcher pump so later responses see it.
    fn handle_update(&self, message: &Message) {
        let Some(delta) = message.body.as_binary() else {
            warn!(store_id = %self.id(), from = %message.sender(), "update without binary body");
            return;
        };
        let origin = format!("update-from-{}", message.id());
        self.inner.pending_origins.lock().insert(origin.clone());
        let applied = self.inner.engine.lock().apply(&origin, delta);
        match applied {
            Ok(change) => {
                self.settle(&change);
                self.emit(StoreEvent::Update);
            }
            Err(err) => {
                self.inner.pending_origins.lock().remove(&origin);
                warn!(store_id = %self.id(), from = %message.sender(), error = %err, "dropping update");
            }
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        let outcome = match inbound {
            Inbound::SyncRequest(request) => self.answer_sync(&request).await,
            Inbound::MutexRequest(request) => self.answer_mutex(&request).await,
            Inbound::Departed(participant) => self.sweep(&participant).await,
        };
        if let Err(err) = outcome {
            warn!(store_id = %self.id(), error = %err, "inbound request failed");
        }
    }

    async fn answer_sync(&self, request: &Message) -> Result<()> {
        let diff = self.inner.engine.lock().diff(request.body.as_binary())?;
        let Some(reply) = Message::reply(request, diff) else {
            return Err(DispatchError::MissingReplyTo.into());
        };
        self.inner
            .dispatcher
            .publish(reply, PublishOptions::default())
            .await?;
        Ok(())
    }

    async fn answer_mutex(&self, request: &Message) -> Result<()> {
        let body: MutexRequest = request.body.parse()?;
        let sender = request.sender().to_string();
        let dispatcher = self.inner.dispatcher.clone();

        let owner = self
            .patch_internal(|roots| {
                if let Some(current) = mutex::owner(roots, &body.mutex).map(str::to_string) {
                    if current != sender && !dispatcher.is_active_client(&current) {
                        mutex::sweep(roots, &current);
                    }
                }
                mutex::adjudicate(roots, &body, &sender)
            })
            .await?;
        debug!(
            store_id = %self.id(),
            participant = %sender,
            lock = %body.mutex,
            action = ?body.action,
            owner = ?owner,
            "mutex request"
        );

        let Some(reply) = Message::reply(request, owner) else {
            return Err(DispatchError::MissingReplyTo.into());
        };
        self.inner
            .dispatcher
            .publish(reply, PublishOptions::default())
            .await?;
        Ok(())
    }

    async fn sweep(&self, participant: &str) -> Result<()> {
        self.release_locks_of(participant).await.map(|_| ())
    }

    /// Drop every lock `participant` holds. Server only; returns the released lock ids.
    ///
    /// Departures seen while serving are swept automatically. A replica promoted
    /// after its former server left uses this to clear the former server's locks.
    pub async fn release_locks_of(&self, participant: &str) -> Result<Vec<String>> {
        self.ensure_alive()?;
        if self.role() != Some(Role::Server) || self.locks_of(participant).is_empty() {
            return Ok(Vec::new());
        }
        let released = self.patch_internal(|roots| mutex::sweep(roots, participant)).await?;
        if !released.is_empty() {
            info!(store_id = %self.id(), participant, locks = ?released, "released locks of departed participant");
        }
        Ok(released)
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    async fn ensure_subscribed(
        &self,
        topic: &str,
        qos: Qos,
        allow_echo: bool,
        on_receive: Option<OnReceive>,
    ) -> Result<()> {
        if self.inner.dispatcher.is_subscribed(topic) {
            return Ok(());
        }
        self.inner
            .dispatcher
            .subscribe(topic, qos, allow_echo, on_receive)
            .await?;
        Ok(())
    }

    async fn join_server_topics(&self) -> Result<()> {
        let topics = &self.inner.topics;
        self.ensure_subscribed(
            &topics.mutex_request,
            Qos::AtLeastOnce,
            true,
            Some(self.inbox_handler(Inbound::MutexRequest)),
        )
        .await?;
        self.ensure_subscribed(
            &topics.sync_request,
            Qos::AtLeastOnce,
            false,
            Some(self.inbox_handler(Inbound::SyncRequest)),
        )
        .await?;

        let inbox = self.inner.inbox.clone();
        let listener = self.inner.dispatcher.on(DispatcherEvent::Bye, move |participant| {
            let _ = inbox.send(Inbound::Departed(participant.to_string()));
        });
        if let Some(previous) = self.inner.bye_listener.lock().replace(listener) {
            previous.unregister();
        }
        Ok(())
    }

    async fn leave_server_topics(&self) {
        if let Some(listener) = self.inner.bye_listener.lock().take() {
            listener.unregister();
        }
        let topics = &self.inner.topics;
        for topic in [&topics.mutex_request, &topics.sync_request] {
            if let Err(err) = self.inner.dispatcher.unsubscribe(topic).await {
                debug!(store_id = %self.id(), %topic, error = %err, "unsubscribe failed");
            }
        }
    }

    async fn leave_all_topics(&self) {
        if let Some(listener) = self.inner.bye_listener.lock().take() {
            listener.unregister();
        }
        for topic in self.inner.topics.all() {
            if let Err(err) = self.inner.dispatcher.unsubscribe(topic).await {
                debug!(store_id = %self.id(), %topic, error = %err, "unsubscribe failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Flags and events
    // ------------------------------------------------------------------------

    fn block(&self) -> Blocking<'_> {
        self.inner.flags.send_modify(|flags| flags.blocking += 1);
        Blocking {
            flags: &self.inner.flags,
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(StoreError::Destroyed(self.id().to_string()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.is_readonly() {
            return Err(StoreError::ReadonlyState(self.id().to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStore")
            .field("id", &self.inner.id)
            .field("type_id", &self.inner.type_id)
            .field("owner", &self.inner.owner)
            .field("flags", &self.flags())
            .finish()
    }
}

async fn run_inbox(inner: Weak<Inner>, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        SyncStore { inner }.handle_inbound(inbound).await;
    }
}
