//! syncbus-store: CRDT-backed replicated documents with a distributed mutex.
//!
//! Each [`SyncStore`] holds one document replica. Local patches run as
//! `yrs` transactions, their deltas are debounced onto the document's
//! update topic, and the replica with the [`Role::Server`] role answers
//! sync requests from joiners and adjudicates mutex requests.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use syncbus_mom::{Dispatcher, DispatcherConfig, MemoryBroker};
//! use syncbus_store::{Role, StateTree, StoreConfig, SyncStore};
//!
//! # async fn demo() -> syncbus_store::Result<()> {
//! let broker = MemoryBroker::new();
//! let dispatcher = Dispatcher::connect(DispatcherConfig::default(), Arc::new(broker.transport())).await?;
//!
//! let store = SyncStore::open("doc", "note", true, &dispatcher, StoreConfig::default(), Role::Server, StateTree::new());
//! store.when_ready().await;
//!
//! store.mutex("title", true, |state| {
//!     state.insert("title".into(), json!("hello"));
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod mutex;
pub mod state;
pub mod store;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use engine::{Change, DocumentEngine, Roots, YrsEngine};
pub use error::{EngineError, Result, StoreError};
pub use mutex::{MutexAction, MutexRequest};
pub use state::{long_text, Lockable, StateFactory, StateTree};
pub use store::{Role, StoreEvent, StoreFlags, SyncStore, STATE_ROOT};
