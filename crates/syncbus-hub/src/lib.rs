//! syncbus-hub: leader election, document handles and persistence.
//!
//! Every process runs one [`SyncHub`]. Server candidates elect the byte-wise
//! smallest participant id as leader; the leader serves and persists every
//! open document while the remaining candidates mirror them and take over,
//! in rank order, when the leader leaves. Pure clients open documents
//! through the leader and drop them when done.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use syncbus_hub::{HubConfig, MemoryAdapter, SyncHub};
//! use syncbus_mom::{Dispatcher, DispatcherConfig, MemoryBroker};
//! use syncbus_store::{Role, StateFactory, StateTree};
//!
//! # async fn demo() -> syncbus_hub::Result<()> {
//! let broker = MemoryBroker::new();
//! let dispatcher = Dispatcher::connect(DispatcherConfig::default(), Arc::new(broker.transport())).await?;
//! let notes = StateFactory::new("note", true, |_| {
//!     let mut state = StateTree::new();
//!     state.insert("title".into(), json!(""));
//!     state
//! });
//!
//! let hub = SyncHub::start(&dispatcher, Arc::new(MemoryAdapter::new()), Role::Server, HubConfig::default(), [notes]).await?;
//! let note = hub.create("note").await?;
//! note.when_ready().await;
//! note.patch(|state| state.insert("title".into(), json!("hello"))).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod election;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod state;

pub use config::{HubConfig, HubConfigBuilder};
pub use error::{HubError, PersistenceError, Result};
pub use hub::{HubRole, HubStatus, InstanceAction, InstanceRequest, SyncHub};
pub use persistence::{FileAdapter, MemoryAdapter, NullAdapter, PersistenceAdapter};
