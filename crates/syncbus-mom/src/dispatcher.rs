//! The dispatcher: subscriptions, correlated publish, and presence over a [`Transport`].

use crate::codec::{self, RawMessage};
use crate::config::DispatcherConfig;
use crate::error::{CallbackKind, DispatchError, Result};
use crate::message::{join_topic, normalize_topic, Message, MessageBuilder, Qos};
use crate::presence::{DispatcherEvent, Listener, ListenerRegistry, PresenceSet};
use crate::registry::{Canceller, CorrelationRegistry, Reply};
use crate::transport::{Transport, TransportEvent};
use crate::uid;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const HELLO: &str = "hello";
const BYE: &str = "bye";

/// Receive handler: the message and whether it is our own echo.
pub type OnReceive = Arc<dyn Fn(Message, bool) + Send + Sync>;

/// Connection state of a dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub online: bool,
    pub ready: bool,
    pub destroyed: bool,
}

/// Which replies a publish should wait for.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub expect_echo: bool,
    pub expect_response: bool,
    pub echo_timeout: Option<Duration>,
    pub response_timeout: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echo(mut self) -> Self {
        self.expect_echo = true;
        self
    }

    pub fn response(mut self) -> Self {
        self.expect_response = true;
        self
    }

    pub fn echo_timeout(mut self, timeout: Duration) -> Self {
        self.expect_echo = true;
        self.echo_timeout = Some(timeout);
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.expect_response = true;
        self.response_timeout = Some(timeout);
        self
    }
}

/// A sent message and the replies it is waiting for.
#[derive(Debug)]
pub struct Publication {
    pub message: Message,
    pub echo: Option<Reply>,
    pub response: Option<Reply>,
    canceller: Canceller,
}

impl Publication {
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    /// Wait for the response. Fails immediately if none was requested.
    pub async fn response(self) -> Result<Message> {
        match self.response {
            Some(reply) => reply.recv().await,
            None => Err(DispatchError::Cancelled {
                kind: CallbackKind::Response,
                message_id: self.message.head.message_id,
            }),
        }
    }

    /// Wait for our own echo. Fails immediately if none was requested.
    pub async fn echo(self) -> Result<Message> {
        match self.echo {
            Some(reply) => reply.recv().await,
            None => Err(DispatchError::Cancelled {
                kind: CallbackKind::Echo,
                message_id: self.message.head.message_id,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlChannel {
    Broadcast,
    Private,
}

#[derive(Clone)]
enum Handler {
    Deliver(Option<OnReceive>),
    Control(ControlChannel),
}

#[derive(Clone)]
struct Subscription {
    echo_allowed: bool,
    handler: Handler,
}

struct Inner {
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    echoes: CorrelationRegistry,
    responses: CorrelationRegistry,
    presence: PresenceSet,
    listeners: ListenerRegistry,
    status: watch::Sender<Status>,
    pump: Mutex<Option<JoinHandle<()>>>,
    control_broadcast: String,
    control_private: String,
}

/// Pub/sub dispatcher owned by one participant. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Connect through `transport` and start processing inbound traffic.
    ///
    /// The returned dispatcher becomes ready once the control topics are
    /// subscribed and the hello is out; see [`Dispatcher::when_ready`].
    pub async fn connect(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let control_broadcast = join_topic([
            config.topic_prefix.as_str(),
            "public/dispatcher/control/broadcast",
        ]);
        let control_private = join_topic([
            config.topic_prefix.as_str(),
            "public/dispatcher/control",
            config.client_id.as_str(),
        ]);
        let (status, _) = watch::channel(Status::default());

        let inner = Arc::new(Inner {
            config,
            transport,
            subscriptions: RwLock::new(HashMap::new()),
            echoes: CorrelationRegistry::new(CallbackKind::Echo),
            responses: CorrelationRegistry::new(CallbackKind::Response),
            presence: PresenceSet::new(),
            listeners: ListenerRegistry::default(),
            status,
            pump: Mutex::new(None),
            control_broadcast,
            control_private,
        });
        let dispatcher = Dispatcher { inner };

        let will = dispatcher.stamp(MessageBuilder::new(&dispatcher.inner.control_broadcast, BYE).build());
        let will = codec::encode(&will, None)?;
        let events = dispatcher
            .inner
            .transport
            .connect(&dispatcher.inner.config.client_id, Some(will))
            .await?;

        let pump = tokio::spawn(run_pump(Arc::downgrade(&dispatcher.inner), events));
        *dispatcher.inner.pump.lock() = Some(pump);
        info!(client_id = %dispatcher.client_id(), "dispatcher connecting");
        Ok(dispatcher)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Build a topic under this dispatcher's prefix.
    pub fn topic<I, S>(&self, segments: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = vec![self.inner.config.topic_prefix.clone()];
        parts.extend(segments.into_iter().map(|s| s.as_ref().to_string()));
        join_topic(parts)
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().online
    }

    pub fn is_ready(&self) -> bool {
        self.status().ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.status().destroyed
    }

    pub fn is_active_client(&self, id: &str) -> bool {
        self.inner.presence.contains(id)
    }

    pub fn active_clients(&self) -> Vec<String> {
        self.inner.presence.members()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner
            .subscriptions
            .read()
            .contains_key(&normalize_topic(topic))
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.inner.subscriptions.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of echo and response callbacks still pending.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.echoes.len() + self.inner.responses.len()
    }

    pub async fn when_ready(&self) {
        self.wait_for(|status| status.ready).await;
    }

    pub async fn when_online(&self) {
        self.wait_for(|status| status.online).await;
    }

    pub async fn when_offline(&self) {
        self.wait_for(|status| !status.online).await;
    }

    async fn wait_for(&self, predicate: impl FnMut(&Status) -> bool) {
        let mut rx = self.inner.status.subscribe();
        if rx.wait_for(predicate).await.is_err() {
            debug!("status channel closed while waiting");
        }
    }

    /// Register a lifecycle callback.
    pub fn on<F>(&self, event: DispatcherEvent, callback: F) -> Listener
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.listeners.add(event, Arc::new(callback))
    }

    /// Forward every occurrence of `event` into a channel.
    pub fn on_channel(&self, event: DispatcherEvent) -> (Listener, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.on(event, move |id| {
            let _ = tx.send(id.to_string());
        });
        (listener, rx)
    }

    /// Subscribe to `topic`. Fails if already subscribed.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
        allow_echo: bool,
        on_receive: Option<OnReceive>,
    ) -> Result<()> {
        if self.is_destroyed() {
            return Err(DispatchError::Destroyed);
        }
        self.subscribe_with(topic, qos, allow_echo, Handler::Deliver(on_receive))
            .await
    }

    async fn subscribe_with(&self, topic: &str, qos: Qos, echo_allowed: bool, handler: Handler) -> Result<()> {
        let topic = normalize_topic(topic);
        {
            let mut subscriptions = self.inner.subscriptions.write();
            if subscriptions.contains_key(&topic) {
                return Err(DispatchError::AlreadySubscribed(topic));
            }
            subscriptions.insert(
                topic.clone(),
                Subscription {
                    echo_allowed,
                    handler,
                },
            );
        }

        if let Err(err) = self.inner.transport.subscribe(&topic, qos, !echo_allowed).await {
            self.inner.subscriptions.write().remove(&topic);
            return Err(err.into());
        }
        debug!(client_id = %self.client_id(), %topic, qos = qos.level(), echo_allowed, "subscribed");
        Ok(())
    }

    /// Drop a subscription. Returns false if the topic was not subscribed.
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let topic = normalize_topic(topic);
        if self.inner.subscriptions.write().remove(&topic).is_none() {
            return Ok(false);
        }
        self.inner.transport.unsubscribe(&topic).await?;
        debug!(client_id = %self.client_id(), %topic, "unsubscribed");
        Ok(true)
    }

    /// Publish once the dispatcher is ready, registering any requested correlations.
    pub async fn publish(&self, message: impl Into<Message>, options: PublishOptions) -> Result<Publication> {
        if self.is_destroyed() {
            return Err(DispatchError::Destroyed);
        }
        self.when_ready().await;
        self.publish_now(message.into(), options).await
    }

    async fn publish_now(&self, message: Message, options: PublishOptions) -> Result<Publication> {
        let message = self.stamp(message);
        let topic = message.meta.topic.clone();
        let message_id = message.head.message_id.clone();

        if options.expect_echo {
            let echo_allowed = self
                .inner
                .subscriptions
                .read()
                .get(&topic)
                .map(|sub| sub.echo_allowed)
                .unwrap_or(false);
            if !echo_allowed {
                return Err(DispatchError::EchoNotSubscribed(topic));
            }
        }
        if options.expect_response {
            let reply_to = message.head.reply_to.clone().ok_or(DispatchError::MissingReplyTo)?;
            if !self.is_subscribed(&reply_to) {
                return Err(DispatchError::ReplyToNotSubscribed(reply_to));
            }
        }

        let raw = codec::encode(&message, self.inner.config.compression_threshold)?;

        let echo = options.expect_echo.then(|| {
            let timeout = options.echo_timeout.unwrap_or(self.inner.config.echo_timeout);
            self.inner.echoes.register(&message_id, &topic, timeout)
        });
        let response = options.expect_response.then(|| {
            let timeout = options
                .response_timeout
                .unwrap_or(self.inner.config.response_timeout);
            self.inner.responses.register(&message_id, &topic, timeout)
        });
        let canceller = Canceller::new(
            message_id.clone(),
            self.inner.echoes.clone(),
            self.inner.responses.clone(),
        );

        if let Err(err) = self.inner.transport.publish(raw).await {
            canceller.cancel();
            return Err(err.into());
        }

        Ok(Publication {
            message,
            echo,
            response,
            canceller,
        })
    }

    /// Fill in sender, id, timestamp and revision.
    fn stamp(&self, mut message: Message) -> Message {
        message.head.sender = self.inner.config.client_id.clone();
        if message.head.message_id.is_empty() {
            message.head.message_id = uid::slug();
        }
        message.head.timestamp = chrono::Utc::now().timestamp_millis();
        message.head.revision = self.inner.config.revision.clone();
        message
    }

    /// Leave the bus: notify listeners, drain correlations, unsubscribe, say bye, disconnect.
    ///
    /// With `force` pending correlations are cancelled instead of awaited.
    pub async fn destroy(&self, force: bool) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        info!(client_id = %self.client_id(), force, "destroying dispatcher");
        self.inner
            .listeners
            .emit(DispatcherEvent::Destroy, self.client_id());

        let detach = self.inner.config.listener_detach_timeout;
        if tokio::time::timeout(detach, self.inner.listeners.detached())
            .await
            .is_err()
        {
            warn!(
                client_id = %self.client_id(),
                remaining = self.inner.listeners.len(),
                "listeners did not detach in time, dropping them"
            );
            self.inner.listeners.clear();
        }

        if force {
            self.inner.echoes.cancel_all();
            self.inner.responses.cancel_all();
        } else {
            tokio::join!(self.inner.echoes.drained(), self.inner.responses.drained());
        }

        self.inner.status.send_modify(|status| status.destroyed = true);

        for topic in self.subscriptions() {
            if let Err(err) = self.unsubscribe(&topic).await {
                debug!(%topic, error = %err, "unsubscribe during destroy failed");
            }
        }

        let bye = MessageBuilder::new(&self.inner.control_broadcast, BYE).build();
        if let Err(err) = self.publish_now(bye, PublishOptions::default()).await {
            debug!(error = %err, "bye not delivered");
        }
        self.inner.transport.disconnect(force).await?;

        self.inner.status.send_modify(|status| {
            status.online = false;
            status.ready = false;
        });
        self.inner.presence.clear();
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        Ok(())
    }

    async fn handle_connect(&self) -> Result<()> {
        self.inner.status.send_modify(|status| status.online = true);
        self.inner.presence.add(self.client_id());

        let broadcast = self.inner.control_broadcast.clone();
        let private = self.inner.control_private.clone();
        for (topic, channel) in [
            (broadcast.clone(), ControlChannel::Broadcast),
            (private.clone(), ControlChannel::Private),
        ] {
            if !self.is_subscribed(&topic) {
                self.subscribe_with(&topic, Qos::AtLeastOnce, false, Handler::Control(channel))
                    .await?;
            }
        }

        let hello = MessageBuilder::new(&broadcast, HELLO).reply_to(&private).build();
        self.publish_now(hello, PublishOptions::default()).await?;

        self.inner.status.send_modify(|status| status.ready = true);
        info!(client_id = %self.client_id(), "dispatcher ready");
        self.inner
            .listeners
            .emit(DispatcherEvent::Online, self.client_id());
        Ok(())
    }

    fn handle_disconnect(&self) {
        self.inner.status.send_modify(|status| {
            status.online = false;
            status.ready = false;
        });
        info!(client_id = %self.client_id(), "dispatcher offline");
        self.inner
            .listeners
            .emit(DispatcherEvent::Offline, self.client_id());
    }

    async fn handle_raw(&self, raw: RawMessage) {
        let Some(subscription) = self.inner.subscriptions.read().get(&raw.topic).cloned() else {
            return;
        };

        if self.inner.config.simulates_latency() {
            let delay = {
                let min = self.inner.config.min_latency.as_millis() as u64;
                let max = self.inner.config.max_latency.as_millis() as u64;
                rand::thread_rng().gen_range(min..=max.max(min))
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let message = match codec::decode(raw, self.inner.config.max_body_size) {
            Ok(message) => message,
            Err(err) => {
                warn!(client_id = %self.client_id(), error = %err, "dropping undecodable message");
                return;
            }
        };

        if !self.can_handle(&message, subscription.echo_allowed) {
            return;
        }
        let is_echo = message.head.sender == self.client_id();

        match &subscription.handler {
            Handler::Control(channel) => self.handle_control(*channel, &message).await,
            Handler::Deliver(Some(on_receive)) => on_receive(message.clone(), is_echo),
            Handler::Deliver(None) => {}
        }

        if is_echo {
            self.inner.echoes.resolve(&message.head.message_id, &message);
        }
        if let Some(reference) = &message.head.reference {
            self.inner.responses.resolve(reference, &message);
        }
    }

    fn can_handle(&self, message: &Message, subscription_echo: bool) -> bool {
        let head = &message.head;
        if head.revision != self.inner.config.revision {
            warn!(
                client_id = %self.client_id(),
                topic = %message.meta.topic,
                expected = %self.inner.config.revision,
                got = %head.revision,
                "dropping message with mismatching revision"
            );
            return false;
        }
        head.echo_allowed == Some(true)
            || subscription_echo
            || head.receiver.as_deref() == Some(self.client_id())
            || head.sender != self.client_id()
    }

    async fn handle_control(&self, channel: ControlChannel, message: &Message) {
        let sender = message.head.sender.as_str();
        if sender == self.client_id() {
            return;
        }
        match message.body.as_text() {
            Some(HELLO) => {
                if self.inner.presence.add(sender) {
                    debug!(client_id = %self.client_id(), participant = sender, "hello");
                    self.inner.listeners.emit(DispatcherEvent::Hello, sender);
                }
                if channel == ControlChannel::Broadcast {
                    if let Some(reply) = Message::reply(message, HELLO) {
                        if let Err(err) = self.publish_now(reply.build(), PublishOptions::default()).await {
                            warn!(error = %err, participant = sender, "failed to greet back");
                        }
                    }
                }
            }
            Some(BYE) => {
                if self.inner.presence.remove(sender) {
                    debug!(client_id = %self.client_id(), participant = sender, "bye");
                    self.inner.listeners.emit(DispatcherEvent::Bye, sender);
                }
            }
            other => {
                warn!(body = ?other, participant = sender, "unknown control message");
            }
        }
    }
}

impl From<MessageBuilder> for Message {
    fn from(builder: MessageBuilder) -> Self {
        builder.build()
    }
}

async fn run_pump(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let dispatcher = Dispatcher { inner };
        match event {
            TransportEvent::Connected => {
                if let Err(err) = dispatcher.handle_connect().await {
                    error!(client_id = %dispatcher.client_id(), error = %err, "connect handshake failed");
                }
            }
            TransportEvent::Disconnected => dispatcher.handle_disconnect(),
            TransportEvent::Message(raw) => dispatcher.handle_raw(raw).await,
        }
    }
}
