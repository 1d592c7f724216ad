//! Consumer side of a subscription.

use super::dispatcher::{Registry, Shared};
use super::types::{CloseReason, WatchBatch, WatchState};
use crate::error::{EngineError, Result};
use crate::types::{Revision, WatchId};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Handle for receiving a subscription's batches.
///
/// Batches arrive in strictly increasing revision order. Once the stream
/// ends every receive returns the terminal error: `SubscriptionLagging`
/// after an eviction, `Compacted` if history was discarded, otherwise
/// `WatchCanceled`. Dropping the handle closes the subscription.
pub struct WatchHandle {
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    start: Revision,
    receiver: Receiver<WatchBatch>,
}

impl WatchHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        registry: Arc<Registry>,
        start: Revision,
        receiver: Receiver<WatchBatch>,
    ) -> Self {
        Self {
            shared,
            registry,
            start,
            receiver,
        }
    }

    pub fn id(&self) -> WatchId {
        self.shared.id
    }

    pub fn state(&self) -> WatchState {
        self.shared.state()
    }

    /// Revision after which this subscription delivers changes. For a
    /// "from now" watch this is the head at open time.
    pub fn start_revision(&self) -> Revision {
        self.start
    }

    /// Highest revision the delivery thread has passed.
    pub fn last_revision(&self) -> Revision {
        self.shared.cursor()
    }

    /// Why the subscription closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason()
    }

    /// Block until the next batch.
    pub fn recv(&self) -> Result<WatchBatch> {
        self.receiver.recv().map_err(|_| self.terminal_error())
    }

    /// Next batch if one is ready.
    pub fn try_recv(&self) -> Result<Option<WatchBatch>> {
        match self.receiver.try_recv() {
            Ok(batch) => Ok(Some(batch)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.terminal_error()),
        }
    }

    /// Next batch, or `None` if nothing arrives within `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WatchBatch>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.terminal_error()),
        }
    }

    /// Stop the subscription. Its registry entry is released immediately.
    pub fn cancel(&self) {
        self.registry.close(self.shared.id, CloseReason::Canceled);
    }

    fn terminal_error(&self) -> EngineError {
        let watch_id = self.shared.id;
        match self.shared.reason() {
            Some(CloseReason::Lagging) => EngineError::SubscriptionLagging { watch_id },
            Some(CloseReason::Compacted(compacted)) => EngineError::Compacted {
                requested: self.start,
                compacted,
            },
            Some(CloseReason::Failed(msg)) => {
                EngineError::BackendUnavailable(io::Error::new(io::ErrorKind::Other, msg))
            }
            Some(CloseReason::Canceled) | Some(CloseReason::Disconnected) | None => {
                EngineError::WatchCanceled { watch_id }
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.registry.close(self.shared.id, CloseReason::Disconnected);
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("start", &self.start)
            .finish()
    }
}
