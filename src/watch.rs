//! Resilient prefix watching over a [`KvStore`].
//!
//! Turns the store's raw `Get` + `Watch` primitives into a single ordered
//! [`KvEvent`] stream per key prefix:
//!
//! 1. Bootstraps with a prefix `Get`, retried until it succeeds, and emits one
//!    `Put` event carrying every existing key
//! 2. Opens a watch from the revision after the snapshot, so nothing is
//!    re-delivered and nothing is lost in between
//! 3. Advances the revision cursor on every message, declares the stream stale
//!    when nothing at all (data or idle progress notification) arrives within
//!    the progress timeout, and reconnects from the cursor
//!
//! Restarts never move the cursor backward. The worst observable effect of a
//! reconnect is a duplicate `Put` for an unchanged key, which consumers treat
//! as a no-op. All store errors are retried for as long as the consumer keeps
//! the receiving end open; dropping the receiver shuts the loop down.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time;

use crate::key::{self, Kv, KvEvent};
use crate::store::{EventKind, KvStore, RawKv, WatchStream};

/// Timing knobs of the watch loop, process-wide defaults overridable per call.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Delay between retries after any store failure.
    pub retry_delay: Duration,
    /// Timeout for one bootstrap `Get` attempt.
    pub get_timeout: Duration,
    /// Timeout for watch creation; a watch that doesn't materialize in time is
    /// treated as failed.
    pub create_timeout: Duration,
    /// Maximum silence on an established stream before it is declared stale.
    /// Conservative: long enough to absorb the store's own idle-keepalive
    /// interval plus network slack.
    pub progress_timeout: Duration,
    /// Capacity of the emitted event channel.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            get_timeout: Duration::from_secs(10),
            create_timeout: Duration::from_secs(30),
            progress_timeout: Duration::from_secs(20 * 60 + 30),
            channel_capacity: 16,
        }
    }
}

/// Starts watching `prefix` and returns the translated event stream.
///
/// The stream stays open until the receiver is dropped; store failures are
/// retried indefinitely and never surface to the consumer.
pub fn watch_prefix<S: KvStore>(
    store: Arc<S>,
    prefix: impl Into<String>,
    config: WatchConfig,
) -> mpsc::Receiver<KvEvent> {
    let prefix = prefix.into();
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    tokio::spawn(async move {
        tracing::debug!("watching for {prefix:?} by prefix");
        watch_loop(&*store, &prefix, &config, &tx).await;
        tracing::debug!("done watching {prefix:?}");
    });
    rx
}

async fn watch_loop<S: KvStore>(
    store: &S,
    prefix: &str,
    config: &WatchConfig,
    tx: &mpsc::Sender<KvEvent>,
) {
    let Some(mut cursor) = bootstrap(store, prefix, config, tx).await else {
        return;
    };

    loop {
        match run_stream(store, prefix, &mut cursor, config, tx).await {
            StreamEnd::Shutdown => return,
            StreamEnd::Restart(reason) => {
                tracing::warn!("{prefix:?} watch failed, current revision: {cursor}: {reason}");
            }
        }
        if wait_or_closed(config.retry_delay, tx).await {
            return;
        }
    }
}

/// Fetches the existing values, emitting them as one `Put` event.
///
/// Retried until the store answers; returns the snapshot revision to start
/// watching from, or `None` on shutdown.
async fn bootstrap<S: KvStore>(
    store: &S,
    prefix: &str,
    config: &WatchConfig,
    tx: &mpsc::Sender<KvEvent>,
) -> Option<i64> {
    tracing::debug!("{prefix:?} fetching existing values");

    loop {
        match time::timeout(config.get_timeout, store.get(prefix)).await {
            Ok(Ok(snapshot)) => {
                if snapshot.kvs.is_empty() {
                    tracing::debug!("{prefix:?} no existing values found");
                } else {
                    let kvs = decode_kvs(&snapshot.kvs);
                    if !kvs.is_empty()
                        && tx
                            .send(KvEvent {
                                kind: EventKind::Put,
                                kvs,
                            })
                            .await
                            .is_err()
                    {
                        return None;
                    }
                }
                return Some(snapshot.revision);
            }
            Ok(Err(e)) => tracing::warn!("{prefix:?} failed to fetch existing values: {e}"),
            Err(_) => tracing::warn!("{prefix:?} fetch timed out"),
        }

        if wait_or_closed(config.retry_delay, tx).await {
            return None;
        }
    }
}

enum StreamEnd {
    /// Consumer is gone; stop for good.
    Shutdown,
    /// Stream broke or went stale; reconnect from the cursor.
    Restart(String),
}

async fn run_stream<S: KvStore>(
    store: &S,
    prefix: &str,
    cursor: &mut i64,
    config: &WatchConfig,
    tx: &mpsc::Sender<KvEvent>,
) -> StreamEnd {
    // Start from the next revision, otherwise the last delivered event would
    // be re-delivered.
    let from_revision = *cursor + 1;
    tracing::debug!("init {prefix:?} watch client, revision: {from_revision}");

    let created = tokio::select! {
        created = time::timeout(config.create_timeout, store.watch(prefix, from_revision)) => created,
        () = tx.closed() => return StreamEnd::Shutdown,
    };
    let mut stream: WatchStream = match created {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return StreamEnd::Restart(format!("watch create error: {e}")),
        Err(_) => return StreamEnd::Restart("watch create timed out".to_string()),
    };

    loop {
        let next = tokio::select! {
            next = time::timeout(config.progress_timeout, stream.next()) => next,
            () = tx.closed() => return StreamEnd::Shutdown,
        };

        match next {
            Err(_) => return StreamEnd::Restart("progress timeout".to_string()),
            Ok(None) => return StreamEnd::Restart("watch stream closed unexpectedly".to_string()),
            Ok(Some(Err(e))) => return StreamEnd::Restart(format!("watch stream error: {e}")),
            Ok(Some(Ok(batch))) => {
                if batch.revision > *cursor {
                    *cursor = batch.revision;
                }
                if batch.items.is_empty() {
                    tracing::debug!("progress notify, revision: {cursor}");
                    continue;
                }
                for item in batch.items {
                    let kvs = decode_kvs(std::slice::from_ref(&item.kv));
                    if kvs.is_empty() {
                        continue;
                    }
                    tracing::debug!("{prefix:?} watcher: {} {}", item.kind, item.kv.key);
                    let event = KvEvent {
                        kind: item.kind,
                        kvs,
                    };
                    if tx.send(event).await.is_err() {
                        return StreamEnd::Shutdown;
                    }
                }
            }
        }
    }
}

/// Decodes raw pairs, skipping and logging the ones that fail to parse.
fn decode_kvs(raw: &[RawKv]) -> Vec<Kv> {
    let mut kvs = Vec::with_capacity(raw.len());
    for pair in raw {
        match key::decode_kv(pair) {
            Ok(kv) => kvs.push(kv),
            Err(e) => tracing::warn!("skipping undecodable pair: {e}"),
        }
    }
    kvs
}

/// Sleeps for `delay`, returning `true` if the consumer went away meanwhile.
async fn wait_or_closed(delay: Duration, tx: &mpsc::Sender<KvEvent>) -> bool {
    tokio::select! {
        () = time::sleep(delay) => false,
        () = tx.closed() => true,
    }
}
