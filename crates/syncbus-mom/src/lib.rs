//! syncbus-mom: message-oriented middleware for syncbus participants.
//!
//! A [`Dispatcher`] wraps a pub/sub [`Transport`] and adds:
//!
//! - subscriptions with optional echo delivery of our own messages
//! - publish with correlated echoes and responses, timeouts and cancellation
//! - presence tracking from hello/bye control messages and last wills
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use syncbus_mom::{Dispatcher, DispatcherConfigBuilder, MemoryBroker, Message, PublishOptions, Qos};
//!
//! # async fn demo() -> syncbus_mom::Result<()> {
//! let broker = MemoryBroker::new();
//! let config = DispatcherConfigBuilder::new().client_id("alice").build();
//! let dispatcher = Dispatcher::connect(config, Arc::new(broker.transport())).await?;
//! dispatcher.when_ready().await;
//!
//! dispatcher.subscribe("chat", Qos::AtLeastOnce, true, None).await?;
//! let publication = dispatcher
//!     .publish(Message::to("chat", "hi"), PublishOptions::new().echo())
//!     .await?;
//! let echo = publication.echo().await?;
//! assert_eq!(echo.body.as_text(), Some("hi"));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod presence;
pub mod registry;
pub mod transport;
pub mod uid;

pub use codec::RawMessage;
pub use config::{DispatcherConfig, DispatcherConfigBuilder};
pub use dispatcher::{Dispatcher, OnReceive, Publication, PublishOptions, Status};
pub use error::{CallbackKind, CodecError, DispatchError, Result, TransportError};
pub use message::{Body, ContentType, Head, Message, MessageBuilder, Meta, Qos};
pub use presence::{DispatcherEvent, Listener, PresenceSet};
pub use registry::{Canceller, Reply};
pub use transport::{MemoryBroker, MemoryTransport, Transport, TransportEvent};
