//! Interface to the underlying key-value store.
//!
//! The wire protocol and client of the store itself are external collaborators;
//! this crate only needs two primitives: a prefix `Get` returning a revision
//! header, and a prefix `Watch` resumable from a revision. Implement [`KvStore`]
//! for your store client and everything above (locators, balancers, rollout
//! watchers) works unchanged.

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Error type for store-level failures.
///
/// Transport errors are opaque to this crate; they are retried internally and
/// never surfaced to balancing callers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A raw key-value pair as stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawKv {
    /// Full storage key.
    pub key: String,
    /// Stored value; may be empty, notably for delete events.
    pub value: String,
}

impl RawKv {
    /// Creates a raw pair from anything string-like.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of a prefix `Get`: the matching pairs plus the store revision the
/// snapshot was taken at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvSnapshot {
    /// All pairs under the requested prefix.
    pub kvs: Vec<RawKv>,
    /// Store revision of the response header; the watch cursor starts here.
    pub revision: i64,
}

/// Kind of a single watched change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A key was created or updated.
    Put,
    /// A key was deleted.
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => f.write_str("PUT"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// One changed pair within a watch batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchItem {
    /// Whether the pair was put or deleted.
    pub kind: EventKind,
    /// The affected pair; deletes usually carry an empty value.
    pub kv: RawKv,
}

/// One message from a watch stream.
///
/// A batch with no items is an idle progress notification: it only advances the
/// revision cursor, proving the stream is still alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchBatch {
    /// Revision of the response header. Monotonically non-decreasing.
    pub revision: i64,
    /// Changes contained in this message.
    pub items: Vec<WatchItem>,
}

/// Stream of watch messages as produced by [`KvStore::watch`].
pub type WatchStream = BoxStream<'static, Result<WatchBatch, BoxError>>;

/// The two store primitives this crate consumes.
///
/// Both operations fail with transport-level errors that the watch layer treats
/// as retryable; implementations should not retry internally.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns all pairs under `prefix` together with the response revision.
    async fn get(&self, prefix: &str) -> Result<KvSnapshot, BoxError>;

    /// Opens a watch for changes under `prefix`, starting at `from_revision`
    /// (inclusive). The returned stream ends or yields an error on any stream
    /// breakage; the caller handles reconnection.
    async fn watch(&self, prefix: &str, from_revision: i64) -> Result<WatchStream, BoxError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use futures::StreamExt;
    use futures::stream;
    use tokio::sync::mpsc;

    use super::{BoxError, KvSnapshot, KvStore, WatchBatch, WatchStream};

    /// Behavior of one `watch()` call on the mock.
    pub(crate) enum WatchScript {
        /// Yield the given results, then stay silent forever.
        ItemsThenPending(Vec<Result<WatchBatch, String>>),
        /// Yield the given results, then end the stream.
        ItemsThenClose(Vec<Result<WatchBatch, String>>),
        /// Yield whatever is pushed into the receiver.
        Live(mpsc::UnboundedReceiver<Result<WatchBatch, String>>),
        /// Never finish creating the watch at all.
        NeverReady,
        /// Fail watch creation outright.
        Fail(String),
    }

    /// Scripted in-memory store for exercising the watch layer.
    pub(crate) struct MockStore {
        /// Responses popped by successive `get()` calls; when exhausted, an
        /// empty snapshot at revision 0 is returned.
        pub(crate) snapshots: Mutex<VecDeque<Result<KvSnapshot, String>>>,
        /// Scripts popped by successive `watch()` calls; when exhausted, the
        /// watch pends forever.
        pub(crate) scripts: Mutex<VecDeque<WatchScript>>,
        /// `from_revision` argument of every `watch()` call, in order.
        pub(crate) watch_revisions: Mutex<Vec<i64>>,
    }

    impl MockStore {
        pub(crate) fn new() -> Self {
            Self {
                snapshots: Mutex::new(VecDeque::new()),
                scripts: Mutex::new(VecDeque::new()),
                watch_revisions: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn push_snapshot(&self, snapshot: Result<KvSnapshot, String>) {
            self.snapshots.lock().unwrap().push_back(snapshot);
        }

        pub(crate) fn push_script(&self, script: WatchScript) {
            self.scripts.lock().unwrap().push_back(script);
        }

        pub(crate) fn watch_revisions(&self) -> Vec<i64> {
            self.watch_revisions.lock().unwrap().clone()
        }
    }

    fn into_stream(items: Vec<Result<WatchBatch, String>>, close: bool) -> WatchStream {
        let head = stream::iter(
            items
                .into_iter()
                .map(|r| r.map_err(|e| BoxError::from(e))),
        );
        if close {
            head.boxed()
        } else {
            head.chain(stream::pending()).boxed()
        }
    }

    #[async_trait::async_trait]
    impl KvStore for MockStore {
        async fn get(&self, _prefix: &str) -> Result<KvSnapshot, BoxError> {
            let next = self.snapshots.lock().unwrap().pop_front();
            match next {
                Some(Ok(snapshot)) => Ok(snapshot),
                Some(Err(e)) => Err(e.into()),
                None => Ok(KvSnapshot::default()),
            }
        }

        async fn watch(&self, _prefix: &str, from_revision: i64) -> Result<WatchStream, BoxError> {
            self.watch_revisions.lock().unwrap().push(from_revision);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(WatchScript::ItemsThenPending(items)) => Ok(into_stream(items, false)),
                Some(WatchScript::ItemsThenClose(items)) => Ok(into_stream(items, true)),
                Some(WatchScript::Live(rx)) => {
                    let live = stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    })
                    .map(|r| r.map_err(BoxError::from));
                    Ok(live.boxed())
                }
                Some(WatchScript::NeverReady) => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Some(WatchScript::Fail(e)) => Err(e.into()),
                None => Ok(stream::pending().boxed()),
            }
        }
    }
}
