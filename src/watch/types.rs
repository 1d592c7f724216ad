//! Watch requests, delivered batches and subscription lifecycle types.

use crate::error::{EngineError, Result};
use crate::types::{KeyRange, Revision, WatchEvent, WatchId};
use serde::{Deserialize, Serialize};

/// Sizing for watch delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Live batches buffered per subscription before it is evicted as
    /// lagging.
    /// Default: 256
    pub queue_size: usize,

    /// Batches buffered between a delivery thread and its consumer.
    /// Default: 64
    pub channel_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            channel_size: 64,
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(EngineError::Config(
                "watch.queue_size must be greater than zero".into(),
            ));
        }
        if self.channel_size == 0 {
            return Err(EngineError::Config(
                "watch.channel_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters of a new subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchRequest {
    pub range: KeyRange,

    /// Deliver changes after this revision (0 = only changes after the
    /// watch opens).
    pub start_revision: Revision,

    /// Attach the previous key state to each event.
    pub prev_kv: bool,

    /// Drop put events.
    pub filter_put: bool,

    /// Drop delete events.
    pub filter_delete: bool,
}

impl WatchRequest {
    /// Watch `range` from now on.
    pub fn new(range: KeyRange) -> Self {
        Self {
            range,
            start_revision: 0,
            prev_kv: false,
            filter_put: false,
            filter_delete: false,
        }
    }

    /// Replay history committed after `revision`.
    pub fn from_revision(mut self, revision: Revision) -> Self {
        self.start_revision = revision;
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    pub fn without_puts(mut self) -> Self {
        self.filter_put = true;
        self
    }

    pub fn without_deletes(mut self) -> Self {
        self.filter_delete = true;
        self
    }
}

/// Events delivered to one subscription for one revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchBatch {
    pub watch_id: WatchId,
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WatchState {
    /// Receiving live changes into its queue; history not read yet.
    Registered = 0,
    /// Streaming history from the backend.
    Replaying = 1,
    /// Forwarding live changes.
    Live = 2,
    /// Terminal.
    Closed = 3,
}

impl WatchState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => WatchState::Registered,
            1 => WatchState::Replaying,
            2 => WatchState::Live,
            _ => WatchState::Closed,
        }
    }
}

/// Why a subscription closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit cancel by the owner.
    Canceled,
    /// The consumer went away.
    Disconnected,
    /// Evicted because its queue overflowed.
    Lagging,
    /// Requested history was compacted away.
    Compacted(Revision),
    /// History could not be read.
    Failed(String),
}
