//! Pub/sub transport abstraction and an in-process broker.

use crate::codec::RawMessage;
use crate::error::TransportError;
use crate::message::Qos;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle and delivery events produced by a connected transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(RawMessage),
}

/// Abstract pub/sub transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect as `client_id`, registering a last will delivered on unclean disconnect.
    async fn connect(
        &self,
        client_id: &str,
        last_will: Option<RawMessage>,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Subscribe to a topic. With `no_local` the broker never returns our own publications.
    async fn subscribe(&self, topic: &str, qos: Qos, no_local: bool) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, message: RawMessage) -> Result<(), TransportError>;

    /// Disconnect. A graceful disconnect discards the last will.
    async fn disconnect(&self, force: bool) -> Result<(), TransportError>;
}

struct Session {
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashMap<String, (Qos, bool)>,
    last_will: Option<RawMessage>,
}

/// In-memory broker for testing and simulation.
///
/// Topics match exactly. Each client receives messages through one channel, so
/// messages from one publisher arrive in publish order.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unconnected transport bound to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: RwLock::new(None),
        }
    }

    pub fn connected_clients(&self) -> Vec<String> {
        let mut clients: Vec<_> = self.sessions.read().keys().cloned().collect();
        clients.sort();
        clients
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|session| session.subscriptions.contains_key(topic))
            .count()
    }

    fn route(&self, sender: &str, message: &RawMessage) {
        let sessions = self.sessions.read();
        for (client_id, session) in sessions.iter() {
            let Some((_, no_local)) = session.subscriptions.get(&message.topic) else {
                continue;
            };
            if *no_local && client_id == sender {
                continue;
            }
            let _ = session.events.send(TransportEvent::Message(message.clone()));
        }
    }

    fn drop_session(&self, client_id: &str, deliver_will: bool) {
        let session = self.sessions.write().remove(client_id);
        if let Some(session) = session {
            let _ = session.events.send(TransportEvent::Disconnected);
            if deliver_will {
                if let Some(will) = session.last_will {
                    self.route(client_id, &will);
                }
            }
        }
    }
}

/// One client's connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: RwLock<Option<String>>,
}

impl MemoryTransport {
    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    /// Drop the connection uncleanly; the broker publishes the last will.
    pub fn kill(&self) {
        if let Some(client_id) = self.client_id.write().take() {
            self.broker.drop_session(&client_id, true);
        }
    }

    fn connected_id(&self) -> Result<String, TransportError> {
        self.client_id.read().clone().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        client_id: &str,
        last_will: Option<RawMessage>,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.broker.sessions.write();
            if sessions.contains_key(client_id) {
                return Err(TransportError::ConnectionFailed(format!(
                    "client id {} already connected",
                    client_id
                )));
            }
            let _ = tx.send(TransportEvent::Connected);
            sessions.insert(
                client_id.to_string(),
                Session {
                    events: tx,
                    subscriptions: HashMap::new(),
                    last_will,
                },
            );
        }
        *self.client_id.write() = Some(client_id.to_string());
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str, qos: Qos, no_local: bool) -> Result<(), TransportError> {
        let client_id = self.connected_id()?;
        let mut sessions = self.broker.sessions.write();
        let session = sessions
            .get_mut(&client_id)
            .ok_or_else(|| TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "session closed".to_string(),
            })?;
        session.subscriptions.insert(topic.to_string(), (qos, no_local));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client_id = self.connected_id()?;
        if let Some(session) = self.broker.sessions.write().get_mut(&client_id) {
            session.subscriptions.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, message: RawMessage) -> Result<(), TransportError> {
        let client_id = self.connected_id()?;
        if !self.broker.sessions.read().contains_key(&client_id) {
            return Err(TransportError::PublishFailed {
                topic: message.topic,
                reason: "session closed".to_string(),
            });
        }
        self.broker.route(&client_id, &message);
        Ok(())
    }

    async fn disconnect(&self, _force: bool) -> Result<(), TransportError> {
        if let Some(client_id) = self.client_id.write().take() {
            self.broker.drop_session(&client_id, false);
        }
        Ok(())
    }
}
