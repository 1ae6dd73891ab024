//! Application state trees, lockables and state factories.

use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

/// A JSON object holding one document's state.
pub type StateTree = Map<String, Value>;

pub const ID_KEY: &str = "_id";
pub const TYPE_KEY: &str = "_type";
pub const PERSIST_KEY: &str = "_persist";
/// Marker key of a long text leaf, merged character by character.
pub const LONG_TEXT_KEY: &str = "_longText";

/// Wrap `text` as a collaboratively edited text leaf.
pub fn long_text(text: impl Into<String>) -> Value {
    json!({ LONG_TEXT_KEY: text.into() })
}

/// The text of a long text leaf.
pub fn as_long_text(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(LONG_TEXT_KEY)?.as_str()
}

pub fn id_of(state: &StateTree) -> Option<&str> {
    state.get(ID_KEY).and_then(Value::as_str)
}

pub fn type_of(state: &StateTree) -> Option<&str> {
    state.get(TYPE_KEY).and_then(Value::as_str)
}

pub fn persist_of(state: &StateTree) -> bool {
    state.get(PERSIST_KEY).and_then(Value::as_bool).unwrap_or(true)
}

/// Anything that names a mutex.
pub trait Lockable {
    fn lock_id(&self) -> &str;
}

impl Lockable for str {
    fn lock_id(&self) -> &str {
        self
    }
}

impl Lockable for String {
    fn lock_id(&self) -> &str {
        self
    }
}

/// A state subtree locks by its `_id`.
impl Lockable for StateTree {
    fn lock_id(&self) -> &str {
        id_of(self).unwrap_or_default()
    }
}

impl Lockable for Value {
    fn lock_id(&self) -> &str {
        self.get(ID_KEY).and_then(Value::as_str).unwrap_or_default()
    }
}

impl<T: Lockable + ?Sized> Lockable for &T {
    fn lock_id(&self) -> &str {
        (**self).lock_id()
    }
}

/// Produces fresh ids while building a state shape.
pub type IdGenerator = dyn Fn() -> String + Send + Sync;

type Shape = dyn Fn(&IdGenerator) -> StateTree + Send + Sync;

/// Creates initial state for one document type.
#[derive(Clone)]
pub struct StateFactory {
    type_id: String,
    persist: bool,
    shape: Arc<Shape>,
    ids: Arc<IdGenerator>,
}

impl StateFactory {
    pub fn new<F>(type_id: impl Into<String>, persist: bool, shape: F) -> Self
    where
        F: Fn(&IdGenerator) -> StateTree + Send + Sync + 'static,
    {
        Self {
            type_id: type_id.into(),
            persist,
            shape: Arc::new(shape),
            ids: Arc::new(syncbus_mom::uid::slug),
        }
    }

    /// Replace the id generator.
    pub fn with_ids<G>(mut self, ids: G) -> Self
    where
        G: Fn() -> String + Send + Sync + 'static,
    {
        self.ids = Arc::new(ids);
        self
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn persist(&self) -> bool {
        self.persist
    }

    pub fn next_id(&self) -> String {
        (self.ids)()
    }

    /// Build a state tree stamped with `_id`, `_type` and `_persist`.
    pub fn create(&self, id: Option<&str>) -> StateTree {
        let mut state = (self.shape)(&*self.ids);
        let id = id.map(str::to_string).unwrap_or_else(|| self.next_id());
        state.insert(ID_KEY.to_string(), Value::String(id));
        state.insert(TYPE_KEY.to_string(), Value::String(self.type_id.clone()));
        state.insert(PERSIST_KEY.to_string(), Value::Bool(self.persist));
        state
    }
}

impl fmt::Debug for StateFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFactory")
            .field("type_id", &self.type_id)
            .field("persist", &self.persist)
            .finish()
    }
}
