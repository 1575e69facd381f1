//! Framework-agnostic query watch.
//!
//! UI layers usually want "the latest snapshot" rather than a callback. A
//! [`QueryWatch`] subscribes to one key and republishes every notification on
//! a [`tokio::sync::watch`] channel.

use chrono::{DateTime, Utc};
use composable_query_core::{FetchError, QueryState, Request};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use crate::client::{Client, Subscription};
use crate::error::ClientError;
use crate::registry::Subscriber;

/// Coarse status for presentation layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No data or error yet, or a fetch is outstanding
    Pending,
    /// A stream is delivering values
    Streaming,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl From<QueryState> for QueryStatus {
    fn from(state: QueryState) -> Self {
        match state {
            QueryState::Idle | QueryState::Fetching => Self::Pending,
            QueryState::Streaming => Self::Streaming,
            QueryState::Completed => Self::Completed,
            QueryState::Failed => Self::Failed,
        }
    }
}

/// One observed moment of a key.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    /// Status derived from the key's state
    pub status: QueryStatus,
    /// Cached value at the time of the notification
    pub data: Option<Value>,
    /// Error of the last rejection, if that is what produced this snapshot
    pub error: Option<FetchError>,
    /// When the snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl QuerySnapshot {
    fn new(state: QueryState, data: Option<Value>, error: Option<FetchError>) -> Self {
        Self {
            status: state.into(),
            data,
            error,
            updated_at: Utc::now(),
        }
    }

    /// Whether the key is settled.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self.status, QueryStatus::Completed | QueryStatus::Failed)
    }
}

/// Latest-snapshot view of one key. Dropping it unsubscribes.
#[derive(Debug)]
pub struct QueryWatch {
    receiver: watch::Receiver<QuerySnapshot>,
    subscription: Subscription,
}

impl QueryWatch {
    /// Borrow the latest snapshot.
    #[must_use]
    pub fn borrow(&self) -> watch::Ref<'_, QuerySnapshot> {
        self.receiver.borrow()
    }

    /// Clone the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> QuerySnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ChannelClosed`] if the key stopped publishing.
    pub async fn changed(&mut self) -> Result<QuerySnapshot, ClientError> {
        self.receiver
            .changed()
            .await
            .map_err(|_| ClientError::ChannelClosed)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Wait until a snapshot satisfies `predicate`, checking the current one
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ChannelClosed`] if the key stopped publishing.
    pub async fn wait_until<F>(&mut self, predicate: F) -> Result<QuerySnapshot, ClientError>
    where
        F: FnMut(&QuerySnapshot) -> bool,
    {
        let snapshot = self
            .receiver
            .wait_for(predicate)
            .await
            .map_err(|_| ClientError::ChannelClosed)?;
        Ok(snapshot.clone())
    }

    /// The underlying subscription, e.g. for `cancel` or `fetch_more`.
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Drop for QueryWatch {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl Client {
    /// Fetch `request` and watch its key.
    ///
    /// The first snapshot reflects what the client already knows about the
    /// key.
    ///
    /// # Errors
    ///
    /// See [`Client::fetch`].
    pub fn watch(&self, request: &Request) -> Result<QueryWatch, ClientError> {
        let id = request.id();
        let initial = QuerySnapshot::new(
            self.state_of(id).unwrap_or_default(),
            self.cached(id),
            None,
        );
        let (sender, receiver) = watch::channel(initial);

        let subscriber: Subscriber = Arc::new(
            move |state: QueryState, data: Option<&Value>, error: Option<&FetchError>| {
                sender.send_replace(QuerySnapshot::new(state, data.cloned(), error.cloned()));
            },
        );
        let subscription = self.fetch(request, Some(subscriber))?;

        Ok(QueryWatch {
            receiver,
            subscription,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use composable_query_core::{FetchContext, FetchOutcome};
    use serde_json::json;

    #[test]
    fn status_follows_state() {
        assert_eq!(QueryStatus::from(QueryState::Idle), QueryStatus::Pending);
        assert_eq!(QueryStatus::from(QueryState::Fetching), QueryStatus::Pending);
        assert_eq!(QueryStatus::from(QueryState::Streaming), QueryStatus::Streaming);
        assert_eq!(QueryStatus::from(QueryState::Failed), QueryStatus::Failed);
    }

    #[tokio::test]
    async fn watch_publishes_completion() {
        let client = Client::new(|_r: &Request, _c: FetchContext| {
            FetchOutcome::future(async { Ok(json!("done")) })
        });
        let req = Request::single(json!({ "w": 1 })).unwrap();

        let mut watch = client.watch(&req).unwrap();
        assert_eq!(watch.snapshot().status, QueryStatus::Pending);

        let snapshot = watch.wait_until(QuerySnapshot::is_settled).await.unwrap();
        assert_eq!(snapshot.status, QueryStatus::Completed);
        assert_eq!(snapshot.data, Some(json!("done")));
    }

    #[tokio::test]
    async fn dropping_the_watch_unsubscribes() {
        let client = Client::new(|_r: &Request, _c: FetchContext| FetchOutcome::empty());
        let req = Request::single(json!({ "w": 2 })).unwrap();

        let watch = client.watch(&req).unwrap();
        assert_eq!(client.subscriber_count(req.id()), 1);
        drop(watch);
        assert_eq!(client.subscriber_count(req.id()), 0);
    }
}
