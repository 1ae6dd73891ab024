//! Leader election bookkeeping.
//!
//! A round broadcasts "who is in charge?" and waits for the leader's "i am".
//! Candidates asking the same question during the round are recorded on the
//! [`Ballot`]; each new one cancels the pending request so the round starts
//! over with everyone known. A round that ends in silence ranks the recorded
//! candidates byte-wise and the first one takes the lead.

use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;
use syncbus_mom::{uid, Canceller};

/// Control bodies exchanged on the hub's control topics.
pub const WHO_IS_IN_CHARGE: &str = "who is in charge?";
pub const I_AM: &str = "i am";
pub const READY_QUERY: &str = "ready?";
pub const READY: &str = "ready";

/// Sort candidate ids into leadership order, dropping duplicates.
pub fn rank_candidates<I, S>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ranking: Vec<String> = candidates.into_iter().map(Into::into).collect();
    ranking.sort_by(|a, b| uid::compare(a, b));
    ranking.dedup();
    ranking
}

/// `base` plus up to half of it again, at random.
pub fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 2;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Candidates seen during the current round and the round's pending request.
#[derive(Debug)]
pub struct Ballot {
    own: String,
    candidates: BTreeSet<String>,
    pending: Option<Canceller>,
}

impl Ballot {
    pub fn new(own: impl Into<String>) -> Self {
        let own = own.into();
        let candidates = BTreeSet::from([own.clone()]);
        Self {
            own,
            candidates,
            pending: None,
        }
    }

    /// Record a fellow candidate. A newcomer cancels the pending request.
    pub fn join(&mut self, candidate: &str) -> bool {
        if !self.candidates.insert(candidate.to_string()) {
            return false;
        }
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
        true
    }

    pub fn knows(&self, candidate: &str) -> bool {
        self.candidates.contains(candidate)
    }

    /// Remember the request of the running round so a newcomer can restart it.
    pub fn arm(&mut self, canceller: Canceller) {
        self.pending = Some(canceller);
    }

    pub fn disarm(&mut self) {
        self.pending = None;
    }

    /// End a silent round: the ranking of everyone seen, starting over with only ourselves.
    pub fn close(&mut self) -> Vec<String> {
        self.pending = None;
        let seen = std::mem::replace(&mut self.candidates, BTreeSet::from([self.own.clone()]));
        rank_candidates(seen)
    }
}
