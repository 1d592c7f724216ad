//! Subscription registry, live fan-out and per-subscription delivery.

use super::cancel::CancelToken;
use super::handle::WatchHandle;
use super::types::{CloseReason, WatchBatch, WatchConfig, WatchRequest, WatchState};
use crate::backend::{Backend, EventSink};
use crate::error::{EngineError, Result};
use crate::types::{ChangeSet, EventKind, KeyRange, Revision, WatchId};
use crossbeam_channel::{bounded, select, Receiver, Select, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// State shared by a subscription's registry entry, delivery thread and
/// handle.
pub(crate) struct Shared {
    pub(crate) id: WatchId,
    state: AtomicU8,
    reason: Mutex<Option<CloseReason>>,
    /// Highest revision delivered or skipped as a duplicate.
    cursor: AtomicI64,
    pub(crate) cancel: CancelToken,
}

impl Shared {
    fn new(id: WatchId) -> Self {
        Self {
            id,
            state: AtomicU8::new(WatchState::Registered as u8),
            reason: Mutex::new(None),
            cursor: AtomicI64::new(0),
            cancel: CancelToken::new(),
        }
    }

    pub(crate) fn state(&self) -> WatchState {
        WatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Advance the lifecycle; never leaves `Closed`.
    fn advance(&self, next: WatchState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != WatchState::Closed as u8).then_some(next as u8)
            });
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }

    pub(crate) fn cursor(&self) -> Revision {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Record `reason` (the first one wins), enter `Closed` and wake the
    /// delivery thread.
    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                debug!(watch_id = self.id, reason = ?reason, "watch closed");
                *slot = Some(reason);
            }
        }
        self.state.store(WatchState::Closed as u8, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Registry entry.
struct Subscription {
    shared: Arc<Shared>,
    range: KeyRange,
    /// Live changes awaiting the delivery thread.
    queue: Sender<ChangeSet>,
}

/// The live subscription table.
pub(crate) struct Registry {
    subscriptions: RwLock<HashMap<WatchId, Subscription>>,
    next_id: AtomicI64,
}

impl Registry {
    fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Remove `id` and close it with `reason`.
    pub(crate) fn close(&self, id: WatchId, reason: CloseReason) {
        let removed = self.subscriptions.write().remove(&id);
        if let Some(sub) = removed {
            sub.shared.close(reason);
        }
    }

    fn len(&self) -> usize {
        self.subscriptions.read().len()
    }
}

/// Fans committed changes out to subscriptions.
///
/// The dispatcher is the backend's [`EventSink`]: `publish` runs under the
/// commit lock, only ever `try_send`s, and evicts any subscription whose
/// queue is full.
pub struct WatchDispatcher {
    registry: Arc<Registry>,
    config: WatchConfig,
}

impl WatchDispatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Open a subscription against `backend`.
    ///
    /// Only revisions after the request's start revision are delivered. The
    /// subscription is registered for live changes before its history is
    /// read, and live changes at or below the snapshot head are dropped, so
    /// every matching revision is delivered exactly once.
    pub fn open(&self, backend: Arc<dyn Backend>, request: WatchRequest) -> Result<WatchHandle> {
        if request.start_revision < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "negative start revision {}",
                request.start_revision
            )));
        }

        // Read head before registering so "from now" covers everything
        // committed after this point
        let start = if request.start_revision == 0 {
            backend.current_revision()
        } else {
            request.start_revision
        };

        // Replay begins at start + 1; events at the compacted revision are gone
        let compacted = backend.compacted_revision();
        if start < compacted {
            return Err(EngineError::Compacted {
                requested: start,
                compacted,
            });
        }

        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(Shared::new(id));
        let (queue_tx, queue_rx) = bounded(self.config.queue_size);
        let (output_tx, output_rx) = bounded(self.config.channel_size);

        self.registry.subscriptions.write().insert(
            id,
            Subscription {
                shared: Arc::clone(&shared),
                range: request.range.clone(),
                queue: queue_tx,
            },
        );

        let delivery = Delivery {
            shared: Arc::clone(&shared),
            registry: Arc::clone(&self.registry),
            request,
            start,
            queue: queue_rx,
            output: output_tx,
        };

        let spawned = std::thread::Builder::new()
            .name(format!("watch-{}", id))
            .spawn(move || delivery.run(backend));
        if let Err(e) = spawned {
            self.registry.close(id, CloseReason::Failed(e.to_string()));
            return Err(e.into());
        }

        debug!(watch_id = id, start, "watch opened");
        Ok(WatchHandle::new(shared, Arc::clone(&self.registry), start, output_rx))
    }

    /// Number of subscriptions currently registered.
    pub fn watcher_count(&self) -> usize {
        self.registry.len()
    }

    /// Close every subscription as canceled.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.registry.subscriptions.write().drain().collect();
        for (_, sub) in drained {
            sub.shared.close(CloseReason::Canceled);
        }
    }
}

impl EventSink for WatchDispatcher {
    fn publish(&self, changes: &ChangeSet) {
        let mut evicted = Vec::new();

        {
            let subs = self.registry.subscriptions.read();
            for (id, sub) in subs.iter() {
                let events: Vec<_> = changes
                    .events
                    .iter()
                    .filter(|e| sub.range.contains(&e.kv.key))
                    .cloned()
                    .collect();
                if events.is_empty() {
                    continue;
                }

                let batch = ChangeSet {
                    revision: changes.revision,
                    events,
                };
                match sub.queue.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => evicted.push((*id, CloseReason::Lagging)),
                    Err(TrySendError::Disconnected(_)) => {
                        evicted.push((*id, CloseReason::Disconnected))
                    }
                }
            }
        }

        for (id, reason) in evicted {
            if reason == CloseReason::Lagging {
                warn!(watch_id = id, revision = changes.revision, "evicting lagging watch");
            }
            self.registry.close(id, reason);
        }
    }
}

impl Drop for WatchDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything a delivery thread owns.
struct Delivery {
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    request: WatchRequest,
    /// Revision after which events are delivered.
    start: Revision,
    queue: Receiver<ChangeSet>,
    output: Sender<WatchBatch>,
}

impl Delivery {
    fn run(self, backend: Arc<dyn Backend>) {
        let reason = self.stream(backend);
        self.registry.close(self.shared.id, reason.clone());
        // Not in the registry any more when closed by someone else
        self.shared.close(reason);
    }

    /// Replay, then tail live changes until something closes the
    /// subscription.
    fn stream(&self, backend: Arc<dyn Backend>) -> CloseReason {
        self.shared.advance(WatchState::Replaying);

        let snapshot = backend.changes_since(&self.request.range, self.start.saturating_add(1));
        // History is read once; the live path never touches the backend
        drop(backend);

        let (history, head) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(EngineError::Compacted { compacted, .. }) => {
                return CloseReason::Compacted(compacted)
            }
            Err(e) => return CloseReason::Failed(e.to_string()),
        };

        trace!(
            watch_id = self.shared.id,
            batches = history.len(),
            head,
            "replaying history"
        );
        for changes in history {
            if let Err(reason) = self.deliver(changes) {
                return reason;
            }
        }

        // Anything at or below the snapshot head was either replayed or is
        // not after the requested start
        let floor = head.max(self.start);
        self.shared.cursor.fetch_max(floor, Ordering::SeqCst);
        self.shared.advance(WatchState::Live);

        loop {
            select! {
                recv(self.queue) -> msg => match msg {
                    Ok(changes) => {
                        if changes.revision <= self.shared.cursor() {
                            continue;
                        }
                        if let Err(reason) = self.deliver(changes) {
                            return reason;
                        }
                    }
                    Err(_) => return self.closed_reason(),
                },
                recv(self.shared.cancel.signal()) -> _ => return self.closed_reason(),
            }
        }
    }

    /// Filter one revision's changes and hand them to the consumer.
    fn deliver(&self, changes: ChangeSet) -> std::result::Result<(), CloseReason> {
        let revision = changes.revision;
        let events: Vec<_> = changes
            .events
            .into_iter()
            .filter(|e| match e.kind {
                EventKind::Put => !self.request.filter_put,
                EventKind::Delete => !self.request.filter_delete,
            })
            .map(|mut e| {
                if !self.request.prev_kv {
                    e.prev_kv = None;
                }
                e
            })
            .collect();

        self.shared.cursor.fetch_max(revision, Ordering::SeqCst);
        if events.is_empty() {
            return Ok(());
        }

        let mut batch = WatchBatch {
            watch_id: self.shared.id,
            revision,
            events,
        };
        loop {
            // Checked and sent under the reason lock, so nothing is handed
            // over once the subscription is closed
            {
                let reason = self.shared.reason.lock();
                if let Some(reason) = reason.as_ref() {
                    return Err(reason.clone());
                }
                match self.output.try_send(batch) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(unsent)) => batch = unsent,
                    Err(TrySendError::Disconnected(_)) => return Err(CloseReason::Disconnected),
                }
            }

            // Sole producer: once the channel has room it keeps it
            let mut ready = Select::new();
            ready.send(&self.output);
            ready.recv(self.shared.cancel.signal());
            ready.ready();
        }
    }

    fn closed_reason(&self) -> CloseReason {
        self.shared.reason().unwrap_or(CloseReason::Canceled)
    }
}
