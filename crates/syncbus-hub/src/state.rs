//! The hub's own replicated state.
//!
//! Every server candidate mirrors one store with this shape; only the leader
//! writes it.
//!
//! ```text
//! {
//!   "serverOrder": ["01H...", "01J..."],          // leadership ranking
//!   "servers":     {"01H...": true, "01J...": false},
//!   "handles":     {"<doc>": {"type": "<type>", "participants": {"<id>": true}}},
//!   "clients":     {"<id>": {"<doc>": true}}
//! }
//! ```
//!
//! A handle whose last participant leaves is removed.

use serde_json::{Map, Value};
use syncbus_store::state::{ID_KEY, PERSIST_KEY, TYPE_KEY};
use syncbus_store::StateTree;

pub const HUB_STATE_ID: &str = "syncbus-hub-state";
pub const HUB_STATE_TYPE: &str = "syncbus-hub";

const SERVER_ORDER: &str = "serverOrder";
const SERVERS: &str = "servers";
const HANDLES: &str = "handles";
const CLIENTS: &str = "clients";
const TYPE: &str = "type";
const PARTICIPANTS: &str = "participants";

/// Initial state written by a freshly elected leader.
pub fn fresh(owner: &str, ranking: &[String], active: &[String]) -> StateTree {
    let mut state = StateTree::new();
    state.insert(ID_KEY.into(), Value::String(HUB_STATE_ID.into()));
    state.insert(TYPE_KEY.into(), Value::String(HUB_STATE_TYPE.into()));
    state.insert(PERSIST_KEY.into(), Value::Bool(false));
    state.insert(
        SERVER_ORDER.into(),
        Value::Array(ranking.iter().cloned().map(Value::String).collect()),
    );
    state.insert(
        SERVERS.into(),
        Value::Object(
            ranking
                .iter()
                .map(|candidate| (candidate.clone(), Value::Bool(candidate == owner)))
                .collect(),
        ),
    );
    state.insert(HANDLES.into(), Value::Object(Map::new()));
    state.insert(CLIENTS.into(), Value::Object(Map::new()));
    for participant in active.iter().chain(ranking) {
        add_client(&mut state, participant);
    }
    state
}

/// The object under `key`, created or replaced when missing or of another kind.
fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
}

fn object<'a>(state: &'a StateTree, key: &str) -> Option<&'a Map<String, Value>> {
    state.get(key).and_then(Value::as_object)
}

/// Candidate ids in leadership order.
pub fn server_order(state: &StateTree) -> Vec<String> {
    state
        .get(SERVER_ORDER)
        .and_then(Value::as_array)
        .map(|order| {
            order
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The first candidate in rank order that `is_active` accepts.
pub fn first_active(state: &StateTree, is_active: impl Fn(&str) -> bool) -> Option<String> {
    server_order(state)
        .into_iter()
        .find(|candidate| is_active(candidate))
}

/// Whether `candidate` has announced itself as leader.
pub fn is_leading(state: &StateTree, candidate: &str) -> bool {
    object(state, SERVERS)
        .and_then(|servers| servers.get(candidate))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Mark `candidate` as the current leader.
pub fn change_leadership(state: &mut StateTree, candidate: &str) {
    if let Some(servers) = object_entry(state, SERVERS) {
        servers.insert(candidate.to_string(), Value::Bool(true));
    }
}

/// Append `candidate` to the ranking. Returns its 1-based position.
pub fn add_candidate(state: &mut StateTree, candidate: &str) -> usize {
    add_client(state, candidate);
    let order = state
        .entry(SERVER_ORDER.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !order.is_array() {
        *order = Value::Array(Vec::new());
    }
    let Value::Array(order) = order else {
        return 0;
    };
    if let Some(position) = order.iter().position(|c| c.as_str() == Some(candidate)) {
        return position + 1;
    }
    order.push(Value::String(candidate.to_string()));
    if let Some(servers) = object_entry(state, SERVERS) {
        servers
            .entry(candidate.to_string())
            .or_insert(Value::Bool(false));
    }
    server_order(state).len()
}

pub fn add_client(state: &mut StateTree, participant: &str) {
    if let Some(clients) = object_entry(state, CLIENTS) {
        clients
            .entry(participant.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Forget a departed participant: its ranking slot and its interest in every handle.
///
/// Returns `(document id, type id)` of the handles nobody is interested in anymore.
pub fn remove_participant(state: &mut StateTree, participant: &str) -> Vec<(String, String)> {
    if let Some(Value::Array(order)) = state.get_mut(SERVER_ORDER) {
        order.retain(|candidate| candidate.as_str() != Some(participant));
    }
    if let Some(servers) = object_entry(state, SERVERS) {
        servers.remove(participant);
    }

    let documents: Vec<String> = object_entry(state, CLIENTS)
        .and_then(|clients| clients.remove(participant))
        .and_then(|documents| documents.as_object().map(|d| d.keys().cloned().collect()))
        .unwrap_or_default();

    let mut emptied = Vec::new();
    for document in documents {
        if let Some(type_id) = drop_interest(state, participant, &document) {
            emptied.push((document, type_id));
        }
    }
    emptied
}

/// Record interest of `participant` in `document`. Returns true if it is new.
pub fn open_handle(state: &mut StateTree, participant: &str, document: &str, type_id: &str) -> bool {
    let Some(handle) = object_entry(state, HANDLES).and_then(|handles| object_entry(handles, document)) else {
        return false;
    };
    handle
        .entry(TYPE.to_string())
        .or_insert_with(|| Value::String(type_id.to_string()));
    let newly = object_entry(handle, PARTICIPANTS)
        .map(|participants| {
            participants
                .insert(participant.to_string(), Value::Bool(true))
                .is_none()
        })
        .unwrap_or(false);
    if let Some(documents) = object_entry(state, CLIENTS).and_then(|clients| object_entry(clients, participant)) {
        documents.insert(document.to_string(), Value::Bool(true));
    }
    newly
}

/// Drop interest of `participant` in `document`. Returns how many participants remain.
pub fn close_handle(state: &mut StateTree, participant: &str, document: &str) -> usize {
    if let Some(Value::Object(documents)) =
        object_entry(state, CLIENTS).and_then(|clients| clients.get_mut(participant))
    {
        documents.remove(document);
    }
    if drop_interest(state, participant, document).is_some() {
        return 0;
    }
    participants(state, document).len()
}

/// Remove one participant from a handle, deleting the handle once empty.
///
/// Returns the handle's type id if it was deleted.
fn drop_interest(state: &mut StateTree, participant: &str, document: &str) -> Option<String> {
    let handles = object_entry(state, HANDLES)?;
    let handle = handles.get_mut(document)?.as_object_mut()?;
    if let Some(Value::Object(participants)) = handle.get_mut(PARTICIPANTS) {
        participants.remove(participant);
        if !participants.is_empty() {
            return None;
        }
    }
    let type_id = handle
        .get(TYPE)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    handles.remove(document);
    Some(type_id)
}

/// Every open handle as `(document id, type id)`.
pub fn handles(state: &StateTree) -> Vec<(String, String)> {
    object(state, HANDLES)
        .map(|handles| {
            handles
                .iter()
                .map(|(document, handle)| {
                    let type_id = handle
                        .get(TYPE)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    (document.clone(), type_id)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Participants interested in `document`, sorted.
pub fn participants(state: &StateTree, document: &str) -> Vec<String> {
    let mut ids: Vec<String> = object(state, HANDLES)
        .and_then(|handles| handles.get(document))
        .and_then(|handle| handle.get(PARTICIPANTS))
        .and_then(Value::as_object)
        .map(|participants| participants.keys().cloned().collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

/// Participants the leader knows about, sorted.
pub fn clients(state: &StateTree) -> Vec<String> {
    let mut ids: Vec<String> = object(state, CLIENTS)
        .map(|clients| clients.keys().cloned().collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_fresh_state_ranks_and_registers() {
        let state = fresh("a", &ids(&["a", "b"]), &ids(&["a", "b", "c"]));
        assert_eq!(server_order(&state), ids(&["a", "b"]));
        assert!(is_leading(&state, "a"));
        assert!(!is_leading(&state, "b"));
        assert_eq!(clients(&state), ids(&["a", "b", "c"]));
        assert!(handles(&state).is_empty());
    }

    #[test]
    fn test_add_candidate_is_idempotent() {
        let mut state = fresh("a", &ids(&["a"]), &[]);
        assert_eq!(add_candidate(&mut state, "b"), 2);
        assert_eq!(add_candidate(&mut state, "c"), 3);
        assert_eq!(add_candidate(&mut state, "b"), 2);
        assert_eq!(server_order(&state), ids(&["a", "b", "c"]));
        assert!(clients(&state).contains(&"c".to_string()));
    }

    #[test]
    fn test_first_active_skips_departed() {
        let state = fresh("a", &ids(&["a", "b", "c"]), &[]);
        assert_eq!(first_active(&state, |id| id != "a"), Some("b".into()));
        assert_eq!(first_active(&state, |_| false), None);
    }

    #[test]
    fn test_open_handle_reports_new_interest() {
        let mut state = fresh("a", &ids(&["a"]), &[]);
        assert!(open_handle(&mut state, "x", "doc", "note"));
        assert!(!open_handle(&mut state, "x", "doc", "note"));
        assert!(open_handle(&mut state, "y", "doc", "note"));

        assert_eq!(participants(&state, "doc"), ids(&["x", "y"]));
        assert_eq!(handles(&state), vec![("doc".to_string(), "note".to_string())]);
    }

    #[test]
    fn test_close_handle_deletes_empty_handle() {
        let mut state = fresh("a", &ids(&["a"]), &[]);
        open_handle(&mut state, "x", "doc", "note");
        open_handle(&mut state, "y", "doc", "note");

        assert_eq!(close_handle(&mut state, "x", "doc"), 1);
        assert_eq!(close_handle(&mut state, "y", "doc"), 0);
        assert!(handles(&state).is_empty());
        // closing something unknown reports nobody left
        assert_eq!(close_handle(&mut state, "y", "doc"), 0);
    }

    #[test]
    fn test_remove_participant_releases_handles() {
        let mut state = fresh("a", &ids(&["a", "b"]), &[]);
        add_client(&mut state, "x");
        open_handle(&mut state, "x", "solo", "note");
        open_handle(&mut state, "x", "shared", "note");
        open_handle(&mut state, "y", "shared", "note");

        let emptied = remove_participant(&mut state, "x");
        assert_eq!(emptied, vec![("solo".to_string(), "note".to_string())]);
        assert_eq!(participants(&state, "shared"), ids(&["y"]));
        assert!(!clients(&state).contains(&"x".to_string()));

        remove_participant(&mut state, "a");
        assert_eq!(server_order(&state), ids(&["b"]));
        assert!(!is_leading(&state, "a"));
    }

    #[test]
    fn test_malformed_sections_are_replaced() {
        let mut state = fresh("a", &ids(&["a", "b"]), &[]);
        state.insert(SERVERS.into(), Value::String("garbage".into()));
        state.insert(HANDLES.into(), Value::Array(Vec::new()));
        state.insert(CLIENTS.into(), Value::Null);

        change_leadership(&mut state, "b");
        assert!(is_leading(&state, "b"));
        assert!(open_handle(&mut state, "x", "doc", "note"));
        assert_eq!(participants(&state, "doc"), ids(&["x"]));
        assert_eq!(clients(&state), ids(&["x"]));
        assert_eq!(close_handle(&mut state, "x", "doc"), 0);
    }

    #[test]
    fn test_change_leadership() {
        let mut state = fresh("a", &ids(&["a", "b"]), &[]);
        change_leadership(&mut state, "b");
        assert!(is_leading(&state, "b"));
    }
}
