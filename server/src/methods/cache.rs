//! Outcomes of executed invocations, kept so that a resent invocation is
//! answered instead of run twice.

use lagless_engine::{InvocationId, Outcome, UserId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Identifies an invocation across connections of the same client.
///
/// The caller is part of the key, so an outcome is only ever replayed to
/// the user it was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub client_id: String,
    pub user_id: Option<UserId>,
    pub invocation_id: InvocationId,
}

impl CacheKey {
    pub fn new(
        client_id: impl Into<String>,
        user_id: Option<&str>,
        invocation_id: impl Into<InvocationId>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.map(str::to_string),
            invocation_id: invocation_id.into(),
        }
    }
}

/// What the caller of [`ResultCache::begin`] should do.
#[derive(Debug)]
pub enum Begin {
    /// First time this invocation is seen; run it and call `complete`
    Run,
    /// Another execution is in flight; its outcome arrives here
    Wait(oneshot::Receiver<Outcome>),
    /// Already executed
    Done(Outcome),
}

enum Entry {
    Running(Vec<oneshot::Sender<Outcome>>),
    Done(Outcome),
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, Entry>,
    /// Completed keys, oldest first
    completed: VecDeque<CacheKey>,
}

/// Bounded cache of invocation outcomes.
///
/// Only completed entries count against the capacity and they are evicted
/// oldest first. In-flight entries are never evicted.
pub struct ResultCache {
    capacity: usize,
    state: Mutex<State>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim an invocation for execution.
    pub fn begin(&self, key: &CacheKey) -> Begin {
        let mut state = self.state();
        match state.entries.get_mut(key) {
            Some(Entry::Done(outcome)) => Begin::Done(outcome.clone()),
            Some(Entry::Running(waiters)) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Begin::Wait(rx)
            }
            None => {
                state.entries.insert(key.clone(), Entry::Running(Vec::new()));
                Begin::Run
            }
        }
    }

    /// Record the outcome of a claimed invocation and wake its waiters.
    pub fn complete(&self, key: CacheKey, outcome: Outcome) {
        let waiters = {
            let mut state = self.state();
            let previous = state
                .entries
                .insert(key.clone(), Entry::Done(outcome.clone()));
            state.completed.push_back(key);
            while state.completed.len() > self.capacity {
                if let Some(evicted) = state.completed.pop_front() {
                    state.entries.remove(&evicted);
                }
            }
            match previous {
                Some(Entry::Running(waiters)) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Number of completed outcomes held.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state().completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn confirmed(n: i64) -> Outcome {
        Outcome::Confirmed { result: json!(n) }
    }

    #[test]
    fn second_begin_sees_the_outcome() {
        let cache = ResultCache::new(8);
        let key = CacheKey::new("c1", Some("u1"), "1");
        assert!(matches!(cache.begin(&key), Begin::Run));
        cache.complete(key.clone(), confirmed(1));
        assert!(matches!(cache.begin(&key), Begin::Done(o) if o == confirmed(1)));

        // Same invocation id from another client is independent
        assert!(matches!(cache.begin(&CacheKey::new("c2", Some("u1"), "1")), Begin::Run));
    }

    #[test]
    fn outcomes_are_not_shared_between_users() {
        let cache = ResultCache::new(8);
        let key = CacheKey::new("c1", Some("u1"), "1");
        assert!(matches!(cache.begin(&key), Begin::Run));
        cache.complete(key, confirmed(1));

        assert!(matches!(cache.begin(&CacheKey::new("c1", Some("u2"), "1")), Begin::Run));
        assert!(matches!(cache.begin(&CacheKey::new("c1", None, "1")), Begin::Run));
    }

    #[tokio::test]
    async fn waiters_receive_the_outcome() {
        let cache = ResultCache::new(8);
        let key = CacheKey::new("c1", None, "1");
        assert!(matches!(cache.begin(&key), Begin::Run));
        let Begin::Wait(rx) = cache.begin(&key) else {
            panic!("expected to wait");
        };
        cache.complete(key, confirmed(7));
        assert_eq!(rx.await.unwrap(), confirmed(7));
    }

    #[test]
    fn oldest_completed_entries_are_evicted() {
        let cache = ResultCache::new(2);
        for n in 0..3 {
            let key = CacheKey::new("c1", None, n.to_string());
            assert!(matches!(cache.begin(&key), Begin::Run));
            cache.complete(key, confirmed(n));
        }
        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.begin(&CacheKey::new("c1", None, "0")), Begin::Run));
        assert!(matches!(cache.begin(&CacheKey::new("c1", None, "2")), Begin::Done(_)));
    }
}
