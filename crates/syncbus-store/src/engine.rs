//! CRDT document engine.
//!
//! The store only sees JSON [`Roots`]; this module owns the translation
//! between JSON trees and the `yrs` node types. Maps become `MapRef`s,
//! arrays become `ArrayRef`s, long text leaves become `TextRef`s and every
//! other value is stored as a scalar.

use crate::error::EngineError;
use crate::state::{as_long_text, long_text, StateTree};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

/// Named top-level trees of one document.
pub type Roots = BTreeMap<String, StateTree>;

/// One committed transaction, local or remote.
#[derive(Clone, Debug)]
pub struct Change {
    /// Origin tag of the transaction that produced the change.
    pub origin: String,
    /// Binary delta that reproduces the change on another replica.
    pub delta: Vec<u8>,
    /// Whether the visible roots changed.
    pub touched: bool,
}

/// A CRDT document exposed as JSON roots.
pub trait DocumentEngine: Send {
    /// Current materialized roots.
    fn roots(&self) -> &Roots;

    /// Run `mutate` on a copy of the roots and commit the difference as one
    /// transaction. Returns `None` when nothing changed.
    fn transact(
        &mut self,
        origin: &str,
        mutate: &mut dyn FnMut(&mut Roots),
    ) -> Result<Option<Change>, EngineError>;

    /// Apply a remote delta as one transaction.
    fn apply(&mut self, origin: &str, delta: &[u8]) -> Result<Change, EngineError>;

    /// Encoded version vector.
    fn state_vector(&self) -> Vec<u8>;

    /// Delta containing everything missing from `state_vector` (everything if `None`).
    fn diff(&self, state_vector: Option<&[u8]>) -> Result<Vec<u8>, EngineError>;

    /// Merge several deltas into one.
    fn merge(&self, deltas: &[Vec<u8>]) -> Result<Vec<u8>, EngineError>;
}

/// [`DocumentEngine`] backed by a `yrs` document.
pub struct YrsEngine {
    doc: Doc,
    maps: BTreeMap<String, MapRef>,
    cache: Roots,
}

impl YrsEngine {
    pub fn new<I, S>(root_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let doc = Doc::new();
        let maps: BTreeMap<String, MapRef> = root_names
            .into_iter()
            .map(|name| {
                let name = name.as_ref().to_string();
                let map = doc.get_or_insert_map(name.as_str());
                (name, map)
            })
            .collect();
        let cache = maps.keys().map(|name| (name.clone(), StateTree::new())).collect();
        Self { doc, maps, cache }
    }

    fn refresh(&mut self) -> bool {
        let next: Roots = {
            let txn = self.doc.transact();
            self.maps
                .iter()
                .map(|(name, map)| (name.clone(), read_map(&txn, map)))
                .collect()
        };
        let touched = next != self.cache;
        self.cache = next;
        touched
    }
}

impl DocumentEngine for YrsEngine {
    fn roots(&self) -> &Roots {
        &self.cache
    }

    fn transact(
        &mut self,
        origin: &str,
        mutate: &mut dyn FnMut(&mut Roots),
    ) -> Result<Option<Change>, EngineError> {
        let mut next = self.cache.clone();
        mutate(&mut next);
        if next == self.cache {
            return Ok(None);
        }

        let delta = {
            let empty = StateTree::new();
            let mut txn = self.doc.transact_mut_with(origin);
            for (name, map) in &self.maps {
                let old = self.cache.get(name).unwrap_or(&empty);
                let new = next.get(name).unwrap_or(&empty);
                sync_map(&mut txn, map, old, new);
            }
            txn.encode_update_v1()
        };
        let touched = self.refresh();
        Ok(Some(Change {
            origin: origin.to_string(),
            delta,
            touched,
        }))
    }

    fn apply(&mut self, origin: &str, delta: &[u8]) -> Result<Change, EngineError> {
        let update = Update::decode_v1(delta).map_err(|e| EngineError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut_with(origin);
            txn.apply_update(update)
                .map_err(|e| EngineError::Apply(e.to_string()))?;
        }
        let touched = self.refresh();
        Ok(Change {
            origin: origin.to_string(),
            delta: delta.to_vec(),
            touched,
        })
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, state_vector: Option<&[u8]>) -> Result<Vec<u8>, EngineError> {
        let remote = match state_vector {
            Some(bytes) => StateVector::decode_v1(bytes).map_err(|e| EngineError::Decode(e.to_string()))?,
            None => StateVector::default(),
        };
        Ok(self.doc.transact().encode_state_as_update_v1(&remote))
    }

    fn merge(&self, deltas: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        match deltas {
            [] => Ok(Vec::new()),
            [single] => Ok(single.clone()),
            _ => {
                let parts: Vec<&[u8]> = deltas.iter().map(Vec::as_slice).collect();
                yrs::merge_updates_v1(&parts).map_err(|e| EngineError::Merge(e.to_string()))
            }
        }
    }
}

// ============================================================================
// JSON -> yrs
// ============================================================================

fn is_plain_object(value: &Value) -> bool {
    value.is_object() && as_long_text(value).is_none()
}

fn sync_map(txn: &mut TransactionMut, map: &MapRef, old: &StateTree, new: &StateTree) {
    for key in old.keys() {
        if !new.contains_key(key) {
            map.remove(txn, key);
        }
    }
    for (key, value) in new {
        match old.get(key) {
            Some(previous) if previous == value => {}
            Some(previous) => {
                let existing = map.get(&*txn, key);
                if !update_in_place(txn, existing, previous, value) {
                    insert_entry(txn, map, key, value);
                }
            }
            None => insert_entry(txn, map, key, value),
        }
    }
}

/// Merge `value` into an existing shared node of the same shape.
fn update_in_place(txn: &mut TransactionMut, existing: Option<Out>, previous: &Value, value: &Value) -> bool {
    match (existing, previous, value) {
        (Some(Out::YMap(nested)), Value::Object(old), Value::Object(new))
            if is_plain_object(previous) && is_plain_object(value) =>
        {
            sync_map(txn, &nested, old, new);
            true
        }
        (Some(Out::YArray(array)), Value::Array(old), Value::Array(new)) => {
            sync_array(txn, &array, old, new);
            true
        }
        (Some(Out::YText(text)), _, _) => match (as_long_text(previous), as_long_text(value)) {
            (Some(old), Some(new)) => {
                sync_text(txn, &text, old, new);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn insert_entry(txn: &mut TransactionMut, map: &MapRef, key: &str, value: &Value) {
    if let Some(text) = as_long_text(value) {
        map.insert(txn, key, TextPrelim::new(text));
        return;
    }
    match value {
        Value::Object(entries) => {
            let nested = map.insert(txn, key, MapPrelim::default());
            for (k, v) in entries {
                insert_entry(txn, &nested, k, v);
            }
        }
        Value::Array(items) => {
            let array = map.insert(txn, key, ArrayPrelim::default());
            for (index, item) in items.iter().enumerate() {
                insert_item(txn, &array, index as u32, item);
            }
        }
        scalar => {
            map.insert(txn, key, scalar_to_any(scalar));
        }
    }
}

fn insert_item(txn: &mut TransactionMut, array: &ArrayRef, index: u32, value: &Value) {
    if let Some(text) = as_long_text(value) {
        array.insert(txn, index, TextPrelim::new(text));
        return;
    }
    match value {
        Value::Object(entries) => {
            let nested = array.insert(txn, index, MapPrelim::default());
            for (k, v) in entries {
                insert_entry(txn, &nested, k, v);
            }
        }
        Value::Array(items) => {
            let nested = array.insert(txn, index, ArrayPrelim::default());
            for (offset, item) in items.iter().enumerate() {
                insert_item(txn, &nested, offset as u32, item);
            }
        }
        scalar => {
            array.insert(txn, index, scalar_to_any(scalar));
        }
    }
}

/// Rewrite only the changed middle section so concurrent appends and
/// prepends from other replicas survive.
fn sync_array(txn: &mut TransactionMut, array: &ArrayRef, old: &[Value], new: &[Value]) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let room = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(room)
        .take_while(|(a, b)| a == b)
        .count();
    let removed = old.len() - prefix - suffix;
    let inserted = new.len() - prefix - suffix;

    if removed == inserted {
        for offset in 0..removed {
            let index = (prefix + offset) as u32;
            let existing = array.get(&*txn, index);
            if !update_in_place(txn, existing, &old[prefix + offset], &new[prefix + offset]) {
                array.remove_range(txn, index, 1);
                insert_item(txn, array, index, &new[prefix + offset]);
            }
        }
        return;
    }

    if removed > 0 {
        array.remove_range(txn, prefix as u32, removed as u32);
    }
    for (offset, item) in new[prefix..prefix + inserted].iter().enumerate() {
        insert_item(txn, array, (prefix + offset) as u32, item);
    }
}

/// Byte offsets; the document uses the default byte offset kind.
fn sync_text(txn: &mut TransactionMut, text: &TextRef, old: &str, new: &str) {
    let prefix: usize = old
        .chars()
        .zip(new.chars())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .sum();
    let suffix: usize = old[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .sum();
    let suffix = suffix.min(old.len() - prefix).min(new.len() - prefix);

    let removed = old.len() - prefix - suffix;
    if removed > 0 {
        text.remove_range(txn, prefix as u32, removed as u32);
    }
    let inserted = &new[prefix..new.len() - suffix];
    if !inserted.is_empty() {
        text.insert(txn, prefix as u32, inserted);
    }
}

/// Containers are expanded by the callers into shared types.
fn scalar_to_any(value: &Value) -> Any {
    match value {
        Value::Bool(flag) => Any::Bool(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => Any::BigInt(integer),
            None => Any::Number(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => Any::String(text.as_str().into()),
        Value::Null | Value::Array(_) | Value::Object(_) => Any::Null,
    }
}

// ============================================================================
// yrs -> JSON
// ============================================================================

fn read_map<T: ReadTxn>(txn: &T, map: &MapRef) -> StateTree {
    map.iter(txn)
        .map(|(key, value)| (key.to_string(), read_out(txn, value)))
        .collect()
}

fn read_out<T: ReadTxn>(txn: &T, value: Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(&any),
        Out::YMap(map) => Value::Object(read_map(txn, &map)),
        Out::YArray(array) => Value::Array(array.iter(txn).map(|item| read_out(txn, item)).collect()),
        Out::YText(text) => long_text(text.get_string(txn)),
        _ => Value::Null,
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(flag) => Value::Bool(*flag),
        Any::Number(number) => Number::from_f64(*number).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(integer) => Value::from(*integer),
        Any::String(text) => Value::String(text.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), any_to_json(value)))
                .collect(),
        ),
    }
}
