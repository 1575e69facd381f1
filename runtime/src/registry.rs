//! Per-key subscriber registry.
//!
//! Tracks who is listening to each key and reports [`Observation`] changes:
//! the first subscriber makes a key `Active`, removing the last one makes it
//! `Inactive`. The client feeds those changes to the inactivity GC.

use composable_query_core::{FetchError, Observation, QueryState, RequestId};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked on every state change of a key.
///
/// Receives the new state, the key's cached value and, for rejections, the
/// error. It runs outside the client's locks and may call back into the
/// client.
pub type Subscriber =
    Arc<dyn Fn(QueryState, Option<&Value>, Option<&FetchError>) + Send + Sync + 'static>;

/// Identifies one registered subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Most keys have one or two subscribers.
type Entries = SmallVec<[(SubscriberId, Subscriber); 2]>;

/// Subscriber lists keyed by request.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: u64,
    keys: HashMap<RequestId, Entries>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for `key`.
    ///
    /// Returns [`Observation::Active`] when this is the key's first subscriber.
    pub fn add(&mut self, key: &RequestId, subscriber: Subscriber) -> (SubscriberId, Option<Observation>) {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);

        let entries = self.keys.entry(key.clone()).or_default();
        entries.push((id, subscriber));
        let change = (entries.len() == 1).then_some(Observation::Active);
        (id, change)
    }

    /// Remove one subscriber. Unknown ids are ignored.
    ///
    /// Returns [`Observation::Inactive`] when the key's last subscriber left.
    pub fn remove(&mut self, key: &RequestId, id: SubscriberId) -> Option<Observation> {
        let entries = self.keys.get_mut(key)?;
        let before = entries.len();
        entries.retain(|(sid, _)| *sid != id);

        if entries.len() == before {
            return None;
        }
        if entries.is_empty() {
            self.keys.remove(key);
            return Some(Observation::Inactive);
        }
        None
    }

    /// Snapshot of the key's subscribers, in registration order.
    #[must_use]
    pub fn subscribers(&self, key: &RequestId) -> Vec<Subscriber> {
        self.keys
            .get(key)
            .map(|entries| entries.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default()
    }

    /// Number of subscribers for the key.
    #[must_use]
    pub fn count(&self, key: &RequestId) -> usize {
        self.keys.get(key).map_or(0, SmallVec::len)
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Subscriber {
        Arc::new(|_: QueryState, _: Option<&Value>, _: Option<&FetchError>| {})
    }

    #[test]
    fn first_subscriber_activates_and_last_deactivates() {
        let mut registry = SubscriberRegistry::new();
        let key = RequestId::from("k");

        let (a, change) = registry.add(&key, noop());
        assert_eq!(change, Some(Observation::Active));
        let (b, change) = registry.add(&key, noop());
        assert_eq!(change, None);
        assert_eq!(registry.count(&key), 2);

        assert_eq!(registry.remove(&key, a), None);
        assert_eq!(registry.remove(&key, b), Some(Observation::Inactive));
        assert_eq!(registry.count(&key), 0);
    }

    #[test]
    fn removing_twice_is_harmless() {
        let mut registry = SubscriberRegistry::new();
        let key = RequestId::from("k");
        let (a, _) = registry.add(&key, noop());

        assert_eq!(registry.remove(&key, a), Some(Observation::Inactive));
        assert_eq!(registry.remove(&key, a), None);
    }

    #[test]
    fn remove_only_drops_the_given_subscriber() {
        let mut registry = SubscriberRegistry::new();
        let key = RequestId::from("k");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let (a, _) = registry.add(&key, noop());
        registry.add(&key, Arc::new(move |_: QueryState, _: Option<&Value>, _: Option<&FetchError>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        registry.remove(&key, a);

        for subscriber in registry.subscribers(&key) {
            subscriber(QueryState::Completed, None, None);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique_across_keys() {
        let mut registry = SubscriberRegistry::new();
        let (a, _) = registry.add(&RequestId::from("x"), noop());
        let (b, _) = registry.add(&RequestId::from("y"), noop());
        assert_ne!(a, b);
    }
}
