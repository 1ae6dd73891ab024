//! Mutex registry kept inside the replicated document.
//!
//! Two roots hold the registry: `mutexRegistry` maps a lock id to its owner
//! and `userMutexRegistry` maps an owner to the set of lock ids it holds.
//! Only the server-role replica writes them; every replica reads them.

use crate::engine::Roots;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MUTEX_ROOT: &str = "mutexRegistry";
pub const USER_MUTEX_ROOT: &str = "userMutexRegistry";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutexAction {
    Acquire,
    Release,
}

/// Body of a mutex request message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexRequest {
    pub mutex: String,
    pub action: MutexAction,
}

/// Current owner of `lock`.
pub fn owner<'a>(roots: &'a Roots, lock: &str) -> Option<&'a str> {
    roots.get(MUTEX_ROOT)?.get(lock)?.as_str()
}

/// Lock ids held by `owner`, sorted.
pub fn locks_of(roots: &Roots, owner: &str) -> Vec<String> {
    let mut locks: Vec<String> = roots
        .get(USER_MUTEX_ROOT)
        .and_then(|users| users.get(owner))
        .and_then(Value::as_object)
        .map(|held| held.keys().cloned().collect())
        .unwrap_or_default();
    locks.sort();
    locks
}

/// Give `lock` to `requester` if it is free. Returns whether the requester owns it afterwards.
pub fn acquire(roots: &mut Roots, lock: &str, requester: &str) -> bool {
    if let Some(current) = owner(roots, lock) {
        return current == requester;
    }
    roots
        .entry(MUTEX_ROOT.to_string())
        .or_default()
        .insert(lock.to_string(), Value::String(requester.to_string()));
    let held = roots
        .entry(USER_MUTEX_ROOT.to_string())
        .or_default()
        .entry(requester.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !held.is_object() {
        *held = Value::Object(Map::new());
    }
    if let Some(held) = held.as_object_mut() {
        held.insert(lock.to_string(), Value::Bool(true));
    }
    true
}

/// Release `lock` if `requester` owns it. Returns whether anything changed.
pub fn release(roots: &mut Roots, lock: &str, requester: &str) -> bool {
    if owner(roots, lock) != Some(requester) {
        return false;
    }
    if let Some(locks) = roots.get_mut(MUTEX_ROOT) {
        locks.remove(lock);
    }
    forget(roots, requester, lock);
    true
}

/// Release every lock `departed` holds and drop its reverse index entry.
pub fn sweep(roots: &mut Roots, departed: &str) -> Vec<String> {
    let held = locks_of(roots, departed);
    let mut released = Vec::with_capacity(held.len());
    if let Some(locks) = roots.get_mut(MUTEX_ROOT) {
        for lock in held {
            if locks.get(&lock).and_then(Value::as_str) == Some(departed) {
                locks.remove(&lock);
                released.push(lock);
            }
        }
    }
    if let Some(users) = roots.get_mut(USER_MUTEX_ROOT) {
        users.remove(departed);
    }
    released
}

/// Apply a request from `requester` and return the resulting owner.
pub fn adjudicate(roots: &mut Roots, request: &MutexRequest, requester: &str) -> Option<String> {
    match request.action {
        MutexAction::Acquire => {
            acquire(roots, &request.mutex, requester);
        }
        MutexAction::Release => {
            release(roots, &request.mutex, requester);
        }
    }
    owner(roots, &request.mutex).map(str::to_string)
}

fn forget(roots: &mut Roots, holder: &str, lock: &str) {
    let Some(users) = roots.get_mut(USER_MUTEX_ROOT) else {
        return;
    };
    let now_empty = match users.get_mut(holder).and_then(Value::as_object_mut) {
        Some(held) => {
            held.remove(lock);
            held.is_empty()
        }
        None => false,
    };
    if now_empty {
        users.remove(holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roots() -> Roots {
        let mut roots = Roots::new();
        roots.insert(MUTEX_ROOT.into(), Map::new());
        roots.insert(USER_MUTEX_ROOT.into(), Map::new());
        roots
    }

    #[test]
    fn test_acquire_free_lock() {
        let mut roots = roots();
        assert!(acquire(&mut roots, "doc", "alice"));
        assert_eq!(owner(&roots, "doc"), Some("alice"));
        assert_eq!(locks_of(&roots, "alice"), vec!["doc".to_string()]);
    }

    #[test]
    fn test_acquire_held_lock_fails() {
        let mut roots = roots();
        acquire(&mut roots, "doc", "alice");
        assert!(!acquire(&mut roots, "doc", "bob"));
        assert!(acquire(&mut roots, "doc", "alice"));
        assert_eq!(owner(&roots, "doc"), Some("alice"));
        assert!(locks_of(&roots, "bob").is_empty());
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let mut roots = roots();
        acquire(&mut roots, "doc", "alice");
        let before = roots.clone();
        assert!(!release(&mut roots, "doc", "bob"));
        assert_eq!(roots, before);

        assert!(release(&mut roots, "doc", "alice"));
        assert_eq!(owner(&roots, "doc"), None);
        assert!(roots[USER_MUTEX_ROOT].is_empty());
    }

    #[test]
    fn test_sweep_releases_only_departed_locks() {
        let mut roots = roots();
        acquire(&mut roots, "a", "alice");
        acquire(&mut roots, "b", "alice");
        acquire(&mut roots, "c", "bob");

        let released = sweep(&mut roots, "alice");
        assert_eq!(released, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(owner(&roots, "a"), None);
        assert_eq!(owner(&roots, "c"), Some("bob"));
        assert!(locks_of(&roots, "alice").is_empty());
        assert!(sweep(&mut roots, "nobody").is_empty());
    }

    #[test]
    fn test_adjudicate_reports_resulting_owner() {
        let mut roots = roots();
        let acquire_req = MutexRequest {
            mutex: "doc".into(),
            action: MutexAction::Acquire,
        };
        let release_req = MutexRequest {
            mutex: "doc".into(),
            action: MutexAction::Release,
        };
        assert_eq!(adjudicate(&mut roots, &acquire_req, "alice"), Some("alice".into()));
        assert_eq!(adjudicate(&mut roots, &acquire_req, "bob"), Some("alice".into()));
        assert_eq!(adjudicate(&mut roots, &release_req, "bob"), Some("alice".into()));
        assert_eq!(adjudicate(&mut roots, &release_req, "alice"), None);
    }

    #[test]
    fn test_request_wire_shape() {
        let request = MutexRequest {
            mutex: "doc".into(),
            action: MutexAction::Release,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"mutex": "doc", "action": "release"})
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Acquire(usize, usize),
        Release(usize, usize),
        Sweep(usize),
    }

    const OWNERS: [&str; 3] = ["alice", "bob", "carol"];
    const LOCKS: [&str; 4] = ["l0", "l1", "l2", "l3"];

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..LOCKS.len(), 0..OWNERS.len()).prop_map(|(l, o)| Op::Acquire(l, o)),
            (0..LOCKS.len(), 0..OWNERS.len()).prop_map(|(l, o)| Op::Release(l, o)),
            (0..OWNERS.len()).prop_map(Op::Sweep),
        ]
    }

    proptest! {
        #[test]
        fn prop_registry_and_reverse_index_agree(ops in prop::collection::vec(op_strategy(), 0..60)) {
            let mut roots = roots();
            for op in ops {
                match op {
                    Op::Acquire(l, o) => {
                        let previous = owner(&roots, LOCKS[l]).map(str::to_string);
                        let granted = acquire(&mut roots, LOCKS[l], OWNERS[o]);
                        match previous {
                            Some(p) => prop_assert_eq!(granted, p == OWNERS[o]),
                            None => prop_assert!(granted),
                        }
                    }
                    Op::Release(l, o) => {
                        let before = roots.clone();
                        let is_owner = owner(&roots, LOCKS[l]) == Some(OWNERS[o]);
                        let changed = release(&mut roots, LOCKS[l], OWNERS[o]);
                        prop_assert_eq!(changed, is_owner);
                        if !is_owner {
                            prop_assert_eq!(&roots, &before);
                        }
                    }
                    Op::Sweep(o) => {
                        sweep(&mut roots, OWNERS[o]);
                        prop_assert!(locks_of(&roots, OWNERS[o]).is_empty());
                    }
                }

                for lock in LOCKS {
                    let holders: Vec<_> = OWNERS
                        .iter()
                        .filter(|o| locks_of(&roots, o).iter().any(|l| l == lock))
                        .collect();
                    match owner(&roots, lock) {
                        Some(current) => prop_assert_eq!(holders, vec![&current]),
                        None => prop_assert!(holders.is_empty()),
                    }
                }
            }
        }
    }
}
