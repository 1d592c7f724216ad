//! Cooperative cancellation for delivery threads.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    canceled: AtomicBool,
    /// Dropped on cancel, which disconnects `signal`.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Shared flag plus a channel that becomes ready once canceled, so a
/// blocked `select!` wakes up.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Cancel the token. Returns true for the call that did it.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.canceled.swap(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
        first
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Receiver that never yields a message and disconnects on cancel.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{select, RecvError};
    use std::time::Duration;

    #[test]
    fn test_cancel_once() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_canceled());

        assert!(token.cancel());
        assert!(!clone.cancel());
        assert!(clone.is_canceled());
    }

    #[test]
    fn test_signal_wakes_blocked_select() {
        let token = CancelToken::new();
        let (_tx, rx) = bounded::<u32>(1);

        let waiter = {
            let token = token.clone();
            std::thread::spawn(move || {
                select! {
                    recv(rx) -> _ => false,
                    recv(token.signal()) -> msg => msg == Err(RecvError),
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(waiter.join().unwrap());
    }
}
