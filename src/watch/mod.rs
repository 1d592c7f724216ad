//! Revision-ordered change streams.
//!
//! Each subscription moves through `Registered → Replaying → Live → Closed`:
//! - it is added to the registry first, so live changes start queuing
//! - its delivery thread reads history from the backend (`Replaying`)
//! - queued changes at or below the snapshot head are skipped (`Live`)
//!
//! Publishing never blocks: a subscription whose bounded queue is full is
//! evicted and its consumer sees `SubscriptionLagging`.
//!
//! # Example
//!
//! ```ignore
//! let handle = engine.watch(WatchRequest::new(KeyRange::prefix("jobs/")))?;
//! loop {
//!     match handle.recv() {
//!         Ok(batch) => println!("revision {}: {} events", batch.revision, batch.events.len()),
//!         Err(EngineError::SubscriptionLagging { .. }) => break, // reopen from a later revision
//!         Err(_) => break,
//!     }
//! }
//! ```

mod cancel;
mod dispatcher;
mod handle;
mod types;

pub use cancel::CancelToken;
pub use dispatcher::WatchDispatcher;
pub use handle::WatchHandle;
pub use types::{CloseReason, WatchBatch, WatchConfig, WatchRequest, WatchState};
