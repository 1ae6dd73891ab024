//! The coordination hub.
//!
//! One [`SyncHub`] per process. Server candidates elect a leader among
//! themselves; the leader serves every document (server-role replicas),
//! keeps the registry of who has which document open and persists them.
//! The other candidates mirror every open document as clients so they can
//! take over when the leader leaves. Pure clients only mirror what they
//! open themselves.
//!
//! Topics, below the dispatcher prefix:
//!
//! ```text
//! hub/control/broadcast              election and readiness
//! hub/control/{client}               answers to our election requests
//! public/hub/instance/request        open/close/delete requests to the leader
//! public/hub/instance/response       the leader's open/close/delete broadcasts
//! ```

use crate::config::HubConfig;
use crate::election::{self, Ballot, I_AM, READY, READY_QUERY, WHO_IS_IN_CHARGE};
use crate::error::{HubError, Result};
use crate::persistence::PersistenceAdapter;
use crate::state::{self as hub_state, HUB_STATE_ID, HUB_STATE_TYPE};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use syncbus_mom::{
    Body, Dispatcher, DispatcherEvent, Listener, Message, OnReceive, PublishOptions, Qos,
};
use syncbus_store::{Role, StateFactory, StateTree, StoreConfig, SyncStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a participant asks the leader to do with a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Open,
    Close,
    Delete,
}

impl InstanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceAction::Open => "open",
            InstanceAction::Close => "close",
            InstanceAction::Delete => "delete",
        }
    }
}

/// Body of instance requests and of the leader's broadcasts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub type_id: String,
    pub action: InstanceAction,
}

/// Position of a hub in the election.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HubRole {
    #[default]
    Undecided,
    Client,
    Server,
}

impl fmt::Display for HubRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HubRole::Undecided => "undecided",
            HubRole::Client => "client",
            HubRole::Server => "server",
        })
    }
}

/// Observable hub state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStatus {
    pub role: HubRole,
    pub ready: bool,
    /// The leader announced it is ready.
    pub leader_ready: bool,
    pub destroyed: bool,
}

struct Topics {
    control_broadcast: String,
    control_private: String,
    instance_request: String,
    instance_response: String,
}

impl Topics {
    fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            control_broadcast: dispatcher.topic(["hub", "control", "broadcast"]),
            control_private: dispatcher.topic(["hub", "control", dispatcher.client_id()]),
            instance_request: dispatcher.topic(["public", "hub", "instance", "request"]),
            instance_response: dispatcher.topic(["public", "hub", "instance", "response"]),
        }
    }
}

/// Work that needs to publish or await, handled in order on the hub's inbox task.
enum Command {
    Control(Message),
    Request(Message),
    Response(Message),
    Hello(String),
    Bye(String),
}

enum Verdict {
    Lead(Vec<String>),
    Follow(String),
}

struct Inner {
    dispatcher: Dispatcher,
    config: HubConfig,
    adapter: Arc<dyn PersistenceAdapter>,
    can_be_server: bool,
    factories: HashMap<String, StateFactory>,
    topics: Topics,
    status: watch::Sender<HubStatus>,
    ballot: Mutex<Ballot>,
    /// Ranking of the won election until the hub state is seeded with it.
    pending_ranking: Mutex<Option<Vec<String>>>,
    leader: Mutex<Option<String>>,
    instances: RwLock<HashMap<String, SyncStore>>,
    /// Replicated hub state; server candidates only.
    hub_store: Option<SyncStore>,
    inbox: mpsc::UnboundedSender<Command>,
    inbox_task: Mutex<Option<JoinHandle<()>>>,
    persist_job: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<Listener>>,
}

/// Coordination hub of one participant. Cheap to clone.
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<Inner>,
}

impl SyncHub {
    /// Create a hub and run its start-up: election for server candidates,
    /// subscription to the leader's broadcasts for pure clients.
    ///
    /// `mode` is [`Role::Server`] for a server candidate.
    pub async fn start(
        dispatcher: &Dispatcher,
        adapter: Arc<dyn PersistenceAdapter>,
        mode: Role,
        config: HubConfig,
        factories: impl IntoIterator<Item = StateFactory>,
    ) -> Result<Self> {
        let hub = Self::new(dispatcher, adapter, mode, config, factories);
        hub.init().await?;
        Ok(hub)
    }

    /// Create a hub without starting it; see [`SyncHub::init`].
    pub fn new(
        dispatcher: &Dispatcher,
        adapter: Arc<dyn PersistenceAdapter>,
        mode: Role,
        config: HubConfig,
        factories: impl IntoIterator<Item = StateFactory>,
    ) -> Self {
        let can_be_server = mode == Role::Server;
        let hub_store = can_be_server.then(|| {
            let store_config = StoreConfig {
                debounce: Duration::ZERO,
                ..config.store.clone()
            };
            let store = SyncStore::new(HUB_STATE_ID, HUB_STATE_TYPE, false, dispatcher, store_config);
            store.set_readonly(true);
            store
        });
        let (status, _) = watch::channel(HubStatus {
            role: if can_be_server {
                HubRole::Undecided
            } else {
                HubRole::Client
            },
            ..HubStatus::default()
        });
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            topics: Topics::new(dispatcher),
            dispatcher: dispatcher.clone(),
            config,
            adapter,
            can_be_server,
            factories: factories
                .into_iter()
                .map(|factory| (factory.type_id().to_string(), factory))
                .collect(),
            status,
            ballot: Mutex::new(Ballot::new(dispatcher.client_id())),
            pending_ranking: Mutex::new(None),
            leader: Mutex::new(None),
            instances: RwLock::new(HashMap::new()),
            hub_store,
            inbox,
            inbox_task: Mutex::new(None),
            persist_job: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(run_inbox(Arc::downgrade(&inner), inbox_rx));
        *inner.inbox_task.lock() = Some(task);

        let weak = Arc::downgrade(&inner);
        let listener = dispatcher.on(DispatcherEvent::Destroy, move |_| {
            if let Some(inner) = weak.upgrade() {
                let hub = SyncHub { inner };
                tokio::spawn(async move { hub.destroy().await });
            }
        });
        inner.listeners.lock().push(listener);

        SyncHub { inner }
    }

    /// Run the start-up sequence. Resolves once the hub is ready.
    pub async fn init(&self) -> Result<()> {
        if self.inner.can_be_server {
            self.init_server_candidate().await
        } else {
            self.init_client().await
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn client_id(&self) -> &str {
        self.inner.dispatcher.client_id()
    }

    pub fn status(&self) -> HubStatus {
        *self.inner.status.borrow()
    }

    pub fn role(&self) -> HubRole {
        self.status().role
    }

    pub fn is_server(&self) -> bool {
        self.role() == HubRole::Server
    }

    pub fn is_client(&self) -> bool {
        self.role() == HubRole::Client
    }

    pub fn is_ready(&self) -> bool {
        self.status().ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.status().destroyed
    }

    /// Whether this hub may ever serve documents.
    pub fn can_be_server(&self) -> bool {
        self.inner.can_be_server
    }

    /// True while any open document runs a blocking operation.
    pub fn is_blocking(&self) -> bool {
        self.inner
            .instances
            .read()
            .values()
            .any(SyncStore::is_blocking)
    }

    /// Resolves once the hub is ready, or destroyed.
    pub async fn when_ready(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|status| status.ready || status.destroyed).await;
    }

    pub fn watch(&self) -> watch::Receiver<HubStatus> {
        self.inner.status.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<SyncStore> {
        self.inner.instances.read().get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.instances.read().contains_key(id)
    }

    /// Number of document instances held locally.
    pub fn open_instances(&self) -> usize {
        self.inner.instances.read().len()
    }

    /// Ids of the document instances held locally, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.instances.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The participant currently in charge, as far as this hub knows.
    pub fn leader(&self) -> Option<String> {
        if self.is_server() {
            return Some(self.client_id().to_string());
        }
        let ranked = self.hub_state().and_then(|state| {
            hub_state::first_active(&state, |id| self.inner.dispatcher.is_active_client(id))
        });
        let recorded = self.inner.leader.lock().clone();
        ranked.or_else(|| recorded.filter(|id| self.inner.dispatcher.is_active_client(id)))
    }

    /// Snapshot of the replicated hub state, once it has been received.
    pub fn hub_state(&self) -> Option<StateTree> {
        self.inner
            .hub_store
            .as_ref()
            .filter(|store| store.is_synchronized())
            .map(SyncStore::snapshot)
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    /// Open a new document of a registered type under a fresh id.
    pub async fn create(&self, type_id: &str) -> Result<SyncStore> {
        let factory = self
            .inner
            .factories
            .get(type_id)
            .ok_or_else(|| HubError::UnknownType(type_id.to_string()))?;
        let id = factory.next_id();
        self.open(&id, type_id).await
    }

    /// Open document `id` of type `type_id`.
    ///
    /// Returns the local replica right away; it becomes ready once the leader
    /// has answered. Await [`SyncStore::when_ready`] before reading it.
    pub async fn open(&self, id: &str, type_id: &str) -> Result<SyncStore> {
        self.ensure_alive()?;
        let existing = self.get(id);
        if let Some(store) = existing {
            if self.inner.can_be_server {
                self.request(id, store.type_id(), InstanceAction::Open).await?;
            }
            return Ok(store);
        }

        let factory = self
            .inner
            .factories
            .get(type_id)
            .ok_or_else(|| HubError::UnknownType(type_id.to_string()))?;
        let store = self
            .inner
            .instances
            .write()
            .entry(id.to_string())
            .or_insert_with(|| {
                SyncStore::new(
                    id,
                    type_id,
                    factory.persist(),
                    &self.inner.dispatcher,
                    self.inner.config.store.clone(),
                )
            })
            .clone();

        self.request(id, type_id, InstanceAction::Open).await?;
        Ok(store)
    }

    /// Give up interest in document `id`.
    ///
    /// Pure clients drop their replica at once; candidates keep mirroring it
    /// until the leader tears it down. Returns false if the document was not open.
    pub async fn close(&self, id: &str) -> Result<bool> {
        self.close_or_delete(id, InstanceAction::Close).await
    }

    /// Like [`SyncHub::close`]; the leader also removes the persisted state
    /// once nobody is interested anymore.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.close_or_delete(id, InstanceAction::Delete).await
    }

    async fn close_or_delete(&self, id: &str, action: InstanceAction) -> Result<bool> {
        self.ensure_alive()?;
        let Some(store) = self.get(id) else {
            return Ok(false);
        };
        self.request(id, store.type_id(), action).await?;

        if !self.inner.can_be_server {
            self.inner.instances.write().remove(id);
            store.destroy().await;
        }
        Ok(self.inner.can_be_server || !self.has(id))
    }

    async fn request(&self, id: &str, type_id: &str, action: InstanceAction) -> Result<()> {
        self.when_ready().await;
        self.ensure_alive()?;
        let body = Body::json(&InstanceRequest {
            id: id.to_string(),
            type_id: type_id.to_string(),
            action,
        })?;
        self.inner
            .dispatcher
            .publish(Message::to(&self.inner.topics.instance_request, body), PublishOptions::default())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Persist every persistable document that changed, or all of them with `force`.
    ///
    /// Only the leader persists. Returns how many documents were written.
    pub async fn persist_all(&self, force: bool) -> usize {
        if !self.is_server() {
            return 0;
        }
        let instances: Vec<SyncStore> = self
            .inner
            .instances
            .read()
            .values()
            .filter(|store| store.persist())
            .cloned()
            .collect();
        if instances.is_empty() {
            return 0;
        }
        let due: Vec<SyncStore> = instances
            .iter()
            .filter(|store| force || store.is_dirty())
            .cloned()
            .collect();
        info!(
            client_id = %self.client_id(),
            due = due.len(),
            total = instances.len(),
            "persisting store instances"
        );

        let mut written = 0;
        for store in due {
            store.set_dirty(false);
            if self.persist_instance(&store).await {
                written += 1;
            }
        }
        written
    }

    async fn persist_instance(&self, store: &SyncStore) -> bool {
        if !self.is_server() || !store.persist() || !store.is_initialized() {
            return false;
        }
        match self.inner.adapter.set(store.snapshot()).await {
            Ok(_) => true,
            Err(err) => {
                warn!(store_id = %store.id(), error = %err, "failed to persist store");
                false
            }
        }
    }

    fn start_persist_job(&self) {
        let interval = self.inner.config.persist_interval;
        if !self.inner.can_be_server || interval.is_zero() {
            return;
        }
        let mut slot = self.inner.persist_job.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncHub { inner }.persist_all(false).await;
            }
        }));
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Leave: persist, tear down every document and detach from the dispatcher.
    pub async fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        info!(client_id = %self.client_id(), role = %self.role(), "destroying hub");
        if let Some(job) = self.inner.persist_job.lock().take() {
            job.abort();
        }

        let topics = &self.inner.topics;
        for topic in [
            &topics.control_broadcast,
            &topics.control_private,
            &topics.instance_request,
            &topics.instance_response,
        ] {
            if let Err(err) = self.inner.dispatcher.unsubscribe(topic).await {
                debug!(%topic, error = %err, "unsubscribe during destroy failed");
            }
        }

        self.persist_all(false).await;
        self.inner.status.send_modify(|status| status.destroyed = true);

        let instances: Vec<SyncStore> = self
            .inner
            .instances
            .write()
            .drain()
            .map(|(_, store)| store)
            .collect();
        for store in instances {
            store.destroy().await;
        }
        if let Some(hub_store) = &self.inner.hub_store {
            hub_store.destroy().await;
        }

        let listeners: Vec<Listener> = self.inner.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.unregister();
        }
        if let Some(task) = self.inner.inbox_task.lock().take() {
            task.abort();
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(HubError::Destroyed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Start-up
    // ------------------------------------------------------------------------

    async fn init_client(&self) -> Result<()> {
        self.inner.dispatcher.when_ready().await;
        self.ensure_subscribed(
            &self.inner.topics.control_broadcast,
            false,
            Some(self.control_handler()),
        )
        .await?;
        self.register_presence_listeners();
        self.ensure_subscribed(
            &self.inner.topics.instance_response,
            true,
            Some(self.forward(Command::Response)),
        )
        .await?;
        self.inner.status.send_modify(|status| status.ready = true);
        // a leader that became ready before we subscribed announces itself on request
        self.publish_control(READY_QUERY).await?;
        info!(client_id = %self.client_id(), "hub ready as pure client");
        Ok(())
    }

    async fn init_server_candidate(&self) -> Result<()> {
        self.inner.dispatcher.when_ready().await;
        let topics = &self.inner.topics;
        self.ensure_subscribed(&topics.control_broadcast, false, Some(self.control_handler()))
            .await?;

        match self.elect().await? {
            Verdict::Lead(ranking) => {
                info!(client_id = %self.client_id(), ?ranking, "I am in charge");
                *self.inner.pending_ranking.lock() = Some(ranking);
                *self.inner.leader.lock() = Some(self.client_id().to_string());
                self.inner.status.send_modify(|status| status.role = HubRole::Server);
            }
            Verdict::Follow(leader) => {
                info!(client_id = %self.client_id(), %leader, "participant is in charge");
                *self.inner.leader.lock() = Some(leader);
                self.inner.status.send_modify(|status| status.role = HubRole::Client);
                self.wait_for_leader().await?;
            }
        }

        self.init_hub_state().await?;
        self.register_presence_listeners();
        self.reopen_handles();
        self.ensure_subscribed(&topics.instance_request, true, Some(self.forward(Command::Request)))
            .await?;
        self.ensure_subscribed(&topics.instance_response, true, Some(self.forward(Command::Response)))
            .await?;
        self.start_persist_job();

        self.inner.status.send_modify(|status| {
            status.ready = true;
            status.leader_ready = true;
        });
        if self.is_server() {
            self.publish_control(READY).await?;
        }
        info!(client_id = %self.client_id(), role = %self.role(), "hub ready");
        Ok(())
    }

    /// Ask who is in charge until someone answers or we rank first.
    async fn elect(&self) -> Result<Verdict> {
        let topics = &self.inner.topics;
        self.ensure_subscribed(&topics.control_private, false, None).await?;

        let mut rounds = 0;
        let mut lost = 0;
        let verdict = loop {
            if self.is_destroyed() {
                break Err(HubError::Destroyed);
            }
            rounds += 1;
            if let Some(max) = self.inner.config.max_election_rounds {
                if rounds > max {
                    break Err(HubError::ElectionExhausted(max));
                }
            }

            debug!(client_id = %self.client_id(), round = rounds, "asking who is in charge");
            let request = Message::to(&topics.control_broadcast, WHO_IS_IN_CHARGE)
                .reply_to(&topics.control_private);
            let options = PublishOptions::new()
                .response()
                .response_timeout(self.inner.config.election_timeout);
            let publication = match self.inner.dispatcher.publish(request, options).await {
                Ok(publication) => publication,
                Err(err) => break Err(err.into()),
            };
            self.inner.ballot.lock().arm(publication.canceller());

            match publication.response().await {
                Ok(answer) => {
                    self.inner.ballot.lock().disarm();
                    break Ok(Verdict::Follow(answer.sender().to_string()));
                }
                Err(err) if err.is_cancelled() => {
                    debug!(client_id = %self.client_id(), "election restarted by a fellow candidate");
                }
                Err(err) if err.is_timeout() => {
                    let ranking = self.inner.ballot.lock().close();
                    if ranking.first().map(String::as_str) == Some(self.client_id()) {
                        break Ok(Verdict::Lead(ranking));
                    }
                    lost += 1;
                    let delay = election::jittered(self.inner.config.backoff(lost));
                    debug!(
                        client_id = %self.client_id(),
                        favourite = ?ranking.first(),
                        ?delay,
                        "lost election round, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err.into()),
            }
        };

        if let Err(err) = self.inner.dispatcher.unsubscribe(&topics.control_private).await {
            debug!(error = %err, "unsubscribe of election reply topic failed");
        }
        verdict
    }

    async fn wait_for_leader(&self) -> Result<()> {
        self.publish_control(READY_QUERY).await?;
        let mut rx = self.inner.status.subscribe();
        let _ = rx
            .wait_for(|status| status.leader_ready || status.destroyed)
            .await;
        self.ensure_alive()
    }

    /// Seed the hub state as leader, or mirror the leader's as candidate.
    async fn init_hub_state(&self) -> Result<()> {
        let Some(hub_store) = &self.inner.hub_store else {
            return Ok(());
        };
        if self.is_server() {
            {
                let mut pending = self.inner.pending_ranking.lock();
                let ranking = pending
                    .take()
                    .unwrap_or_else(|| vec![self.client_id().to_string()]);
                let state = hub_state::fresh(
                    self.client_id(),
                    &ranking,
                    &self.inner.dispatcher.active_clients(),
                );
                hub_store.set_readonly(false);
                hub_store.init_with_state(state);
            }
            hub_store.set_role(Role::Server).await?;
        } else {
            hub_store.set_readonly(true);
            hub_store.init_with_state(StateTree::new());
            hub_store.set_role(Role::Client).await?;
        }
        Ok(())
    }

    fn register_presence_listeners(&self) {
        let mut listeners = self.inner.listeners.lock();
        for (event, command) in [
            (DispatcherEvent::Hello, Command::Hello as fn(String) -> Command),
            (DispatcherEvent::Bye, Command::Bye as fn(String) -> Command),
        ] {
            let inbox = self.inner.inbox.clone();
            listeners.push(self.inner.dispatcher.on(event, move |participant| {
                let _ = inbox.send(command(participant.to_string()));
            }));
        }
    }

    /// Mirror every document the leader has open.
    fn reopen_handles(&self) {
        if self.is_server() {
            return;
        }
        let Some(state) = self.hub_state() else {
            return;
        };
        for (id, type_id) in hub_state::handles(&state) {
            self.open_as_client(&id, &type_id);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn post(&self, command: Command) {
        if self.inner.inbox.send(command).is_err() {
            debug!(client_id = %self.client_id(), "hub inbox closed");
        }
    }

    fn forward(&self, command: fn(Message) -> Command) -> OnReceive {
        let inbox = self.inner.inbox.clone();
        Arc::new(move |message: Message, _: bool| {
            let _ = inbox.send(command(message));
        })
    }

    fn control_handler(&self) -> OnReceive {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |message: Message, _: bool| {
            if let Some(inner) = weak.upgrade() {
                SyncHub { inner }.on_control(message);
            }
        })
    }

    /// Runs on the dispatcher pump; anything that publishes goes to the inbox.
    fn on_control(&self, message: Message) {
        let status = self.status();
        match message.body.as_text() {
            Some(WHO_IS_IN_CHARGE) => match status.role {
                HubRole::Server => self.post(Command::Control(message)),
                HubRole::Undecided => {
                    if self.inner.ballot.lock().join(message.sender()) {
                        info!(
                            client_id = %self.client_id(),
                            candidate = %message.sender(),
                            "new candidate joins the election"
                        );
                    }
                }
                HubRole::Client => {}
            },
            Some(READY_QUERY) if status.role == HubRole::Server && status.ready => {
                self.post(Command::Control(message));
            }
            Some(READY) if status.role != HubRole::Server => {
                *self.inner.leader.lock() = Some(message.sender().to_string());
                self.inner
                    .status
                    .send_modify(|status| status.leader_ready = true);
            }
            _ => {}
        }
    }

    async fn handle(&self, command: Command) -> Result<()> {
        match command {
            Command::Control(message) => self.answer_control(message).await,
            Command::Request(message) => self.answer_request(message).await,
            Command::Response(message) => {
                self.follow_response(message).await;
                Ok(())
            }
            Command::Hello(participant) => {
                self.patch_hub_state(|state| hub_state::add_client(state, &participant))
                    .await;
                Ok(())
            }
            Command::Bye(participant) => {
                self.handle_departure(&participant).await;
                Ok(())
            }
        }
    }

    async fn answer_control(&self, message: Message) -> Result<()> {
        match message.body.as_text() {
            Some(WHO_IS_IN_CHARGE) => {
                if let Some(reply) = Message::reply(&message, I_AM) {
                    self.inner
                        .dispatcher
                        .publish(reply, PublishOptions::default())
                        .await?;
                }
                let position = self.register_candidate(message.sender()).await;
                info!(
                    client_id = %self.client_id(),
                    candidate = %message.sender(),
                    position,
                    "server candidate registered"
                );
            }
            Some(READY_QUERY) => self.publish_control(READY).await?,
            _ => {}
        }
        Ok(())
    }

    async fn publish_control(&self, body: &str) -> Result<()> {
        let message = Message::to(&self.inner.topics.control_broadcast, body);
        self.inner
            .dispatcher
            .publish(message, PublishOptions::default())
            .await?;
        Ok(())
    }

    /// Add a candidate to the ranking; before the hub state exists it joins the seed.
    async fn register_candidate(&self, candidate: &str) -> usize {
        {
            let mut pending = self.inner.pending_ranking.lock();
            if let Some(ranking) = pending.as_mut() {
                if let Some(position) = ranking.iter().position(|id| id == candidate) {
                    return position + 1;
                }
                ranking.push(candidate.to_string());
                return ranking.len();
            }
        }
        self.patch_hub_state(|state| hub_state::add_candidate(state, candidate))
            .await
            .unwrap_or(0)
    }

    /// Leader side of open/close/delete.
    async fn answer_request(&self, message: Message) -> Result<()> {
        if !self.is_server() {
            return Ok(());
        }
        let request: InstanceRequest = message.body.parse()?;
        let sender = message.sender();
        let id = request.id.as_str();

        let inform = match request.action {
            InstanceAction::Open => {
                self.open_as_server(id, &request.type_id).await?;
                self.patch_hub_state(|state| {
                    hub_state::open_handle(state, sender, id, &request.type_id)
                })
                .await
                .unwrap_or(false)
            }
            InstanceAction::Close | InstanceAction::Delete => {
                let remaining = self
                    .patch_hub_state(|state| hub_state::close_handle(state, sender, id))
                    .await;
                let abandoned = remaining == Some(0);
                if abandoned {
                    self.close_instance(id).await;
                    if request.action == InstanceAction::Delete {
                        self.forget_persisted(id).await;
                    }
                }
                abandoned
            }
        };
        info!(
            client_id = %self.client_id(),
            participant = %sender,
            action = request.action.as_str(),
            store_id = %id,
            inform,
            "instance request"
        );

        if inform {
            self.broadcast(&request).await?;
        }
        Ok(())
    }

    async fn broadcast(&self, request: &InstanceRequest) -> Result<()> {
        let message = Message::to(&self.inner.topics.instance_response, Body::json(request)?);
        self.inner
            .dispatcher
            .publish(message, PublishOptions::default())
            .await?;
        Ok(())
    }

    /// Follower side of the leader's broadcasts.
    async fn follow_response(&self, message: Message) {
        if self.is_server() {
            return;
        }
        let request: InstanceRequest = match message.body.parse() {
            Ok(request) => request,
            Err(err) => {
                warn!(client_id = %self.client_id(), error = %err, "invalid instance broadcast");
                return;
            }
        };
        let id = request.id.as_str();
        match request.action {
            InstanceAction::Open => {
                if self.open_as_client(id, &request.type_id).is_some() {
                    debug!(client_id = %self.client_id(), store_id = %id, "mirroring store");
                }
            }
            InstanceAction::Close | InstanceAction::Delete => {
                if self.close_instance(id).await {
                    info!(
                        client_id = %self.client_id(),
                        store_id = %id,
                        action = request.action.as_str(),
                        "store closed by leader"
                    );
                }
            }
        }
    }

    async fn handle_departure(&self, participant: &str) {
        if !self.inner.can_be_server {
            let mut leader = self.inner.leader.lock();
            if leader.as_deref() == Some(participant) {
                *leader = None;
            }
            return;
        }
        if self.is_current_leader(participant) {
            self.take_over(participant).await;
        }

        let emptied = self
            .patch_hub_state(|state| hub_state::remove_participant(state, participant))
            .await
            .unwrap_or_default();
        if !emptied.is_empty() {
            info!(
                client_id = %self.client_id(),
                emptied = emptied.len(),
                open = self.open_instances(),
                "closing handles with no participants left"
            );
        }
        for (id, type_id) in emptied {
            self.close_instance(&id).await;
            let request = InstanceRequest {
                id,
                type_id,
                action: InstanceAction::Close,
            };
            if let Err(err) = self.broadcast(&request).await {
                warn!(store_id = %request.id, error = %err, "failed to broadcast close");
            }
        }
    }

    fn is_current_leader(&self, participant: &str) -> bool {
        let first = self
            .hub_state()
            .and_then(|state| hub_state::server_order(&state).into_iter().next());
        first.or_else(|| self.inner.leader.lock().clone()).as_deref() == Some(participant)
    }

    /// Promote ourselves if we are the next active candidate in rank order.
    async fn take_over(&self, former: &str) -> bool {
        if !self.inner.can_be_server || self.is_server() {
            return false;
        }
        let next = self.hub_state().and_then(|state| {
            hub_state::first_active(&state, |id| self.inner.dispatcher.is_active_client(id))
        });
        if next.as_deref() != Some(self.client_id()) {
            info!(
                client_id = %self.client_id(),
                next = ?next,
                former = %former,
                "another candidate takes over the leadership"
            );
            *self.inner.leader.lock() = next;
            return false;
        }

        *self.inner.leader.lock() = Some(self.client_id().to_string());
        self.inner.status.send_modify(|status| status.role = HubRole::Server);

        if let Some(hub_store) = &self.inner.hub_store {
            hub_store.set_readonly(false);
            if let Err(err) = hub_store.set_role(Role::Server).await {
                warn!(error = %err, "hub state failed to take the server role");
            }
        }
        let instances: Vec<SyncStore> = self.inner.instances.read().values().cloned().collect();
        for store in instances {
            if let Err(err) = store.set_role(Role::Server).await {
                warn!(store_id = %store.id(), error = %err, "store failed to take the server role");
                continue;
            }
            // the former leader left before this replica listened for departures
            if let Err(err) = store.release_locks_of(former).await {
                warn!(store_id = %store.id(), error = %err, "failed to release locks of former leader");
            }
        }
        let owner = self.client_id().to_string();
        self.patch_hub_state(|state| hub_state::change_leadership(state, &owner))
            .await;

        info!(client_id = %self.client_id(), former = %former, "replacing the leadership");
        if let Err(err) = self.publish_control(READY).await {
            warn!(client_id = %self.client_id(), error = %err, "failed to announce the leadership");
        }
        self.persist_all(true).await;
        true
    }

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    /// Make sure the server-role replica of `id` exists, hydrated from
    /// persistence when possible.
    async fn open_as_server(&self, id: &str, type_id: &str) -> Result<SyncStore> {
        let existing = self.get(id);
        if let Some(store) = existing.filter(|store| store.is_ready() && store.is_synchronized()) {
            return Ok(store);
        }

        if let Some(state) = self.load_persisted(id).await {
            return self.install(id, type_id, true, Role::Server, state).await;
        }

        let factory = self
            .inner
            .factories
            .get(type_id)
            .ok_or_else(|| HubError::UnknownType(type_id.to_string()))?;
        let state = factory.create(Some(id));
        self.install(id, type_id, factory.persist(), Role::Server, state)
            .await
    }

    async fn load_persisted(&self, id: &str) -> Option<StateTree> {
        match self.inner.adapter.has(id).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!(store_id = %id, error = %err, "persistence lookup failed");
                return None;
            }
        }
        match self.inner.adapter.get(id).await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(store_id = %id, error = %err, "failed to load persisted state");
                None
            }
        }
    }

    async fn install(
        &self,
        id: &str,
        type_id: &str,
        persist: bool,
        role: Role,
        state: StateTree,
    ) -> Result<SyncStore> {
        let store = self
            .inner
            .instances
            .write()
            .entry(id.to_string())
            .or_insert_with(|| {
                SyncStore::new(
                    id,
                    type_id,
                    persist,
                    &self.inner.dispatcher,
                    self.inner.config.store.clone(),
                )
            })
            .clone();
        store.init_with_state(state);
        store.set_role(role).await?;
        Ok(store)
    }

    /// Mirror `id` as client. Pure clients only mirror what they opened.
    fn open_as_client(&self, id: &str, type_id: &str) -> Option<SyncStore> {
        let Some(factory) = self.inner.factories.get(type_id) else {
            warn!(client_id = %self.client_id(), %type_id, "no state factory for type");
            return None;
        };
        let store = {
            let mut instances = self.inner.instances.write();
            match instances.get(id) {
                Some(store) => store.clone(),
                None if self.inner.can_be_server => {
                    let store = SyncStore::new(
                        id,
                        type_id,
                        factory.persist(),
                        &self.inner.dispatcher,
                        self.inner.config.store.clone(),
                    );
                    instances.insert(id.to_string(), store.clone());
                    store
                }
                None => return None,
            }
        };
        store.init_with_state(StateTree::new());
        store.spawn_role(Role::Client);
        Some(store)
    }

    /// Drop the local replica of `id`, persisting it first on the leader.
    async fn close_instance(&self, id: &str) -> bool {
        let removed = self.inner.instances.write().remove(id);
        let Some(store) = removed else {
            return false;
        };
        self.persist_instance(&store).await;
        store.destroy().await;
        true
    }

    async fn forget_persisted(&self, id: &str) {
        if let Err(err) = self.inner.adapter.delete(id).await {
            warn!(store_id = %id, error = %err, "failed to delete persisted state");
        }
    }

    /// Patch the hub state if we are its writer. Errors are logged.
    async fn patch_hub_state<R>(&self, callback: impl FnOnce(&mut StateTree) -> R) -> Option<R> {
        let hub_store = self.inner.hub_store.as_ref()?;
        if !self.is_server() {
            return None;
        }
        match hub_store.patch(callback).await {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(client_id = %self.client_id(), error = %err, "failed to patch hub state");
                None
            }
        }
    }

    async fn ensure_subscribed(&self, topic: &str, allow_echo: bool, handler: Option<OnReceive>) -> Result<()> {
        if self.inner.dispatcher.is_subscribed(topic) {
            return Ok(());
        }
        self.inner
            .dispatcher
            .subscribe(topic, Qos::AtLeastOnce, allow_echo, handler)
            .await?;
        Ok(())
    }
}

async fn run_inbox(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let hub = SyncHub { inner };
        if let Err(err) = hub.handle(command).await {
            warn!(client_id = %hub.client_id(), error = %err, "hub command failed");
        }
    }
}

impl fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHub")
            .field("client_id", &self.client_id())
            .field("status", &self.status())
            .field("instances", &self.instance_ids())
            .finish()
    }
}
