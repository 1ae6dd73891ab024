//! Participant and message identifiers.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::cmp::Ordering;
use ulid::Ulid;

/// A globally unique slug, used for participant ids and message ids.
pub fn slug() -> String {
    Ulid::new().to_string()
}

/// A short random token for correlation keys and transaction origins.
pub fn short(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Total order over participant ids used for leader ranking.
pub fn compare(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}
