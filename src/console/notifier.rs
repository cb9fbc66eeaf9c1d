//! "New pending items" notice.
//!
//! Fires once when pending inbox items appear while no notice is showing,
//! then stays quiet until the consumer dismisses it or the pending count
//! drops back to zero.

use tokio::sync::watch;
use tracing::info;

/// What a subscriber renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingNotice {
    pub visible: bool,
    /// Pending count as of the last poll.
    pub count: usize,
    /// How many times the notice has fired.
    pub fired: u64,
}

pub struct PendingNotifier {
    tx: watch::Sender<PendingNotice>,
}

impl Default for PendingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PendingNotice::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<PendingNotice> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> PendingNotice {
        *self.tx.borrow()
    }

    /// Feeds the pending count from a successful inbox poll.
    /// Returns true when the notice fired on this call.
    pub fn observe(&self, pending: usize) -> bool {
        let mut fired = false;
        self.tx.send_if_modified(|notice| {
            let before = *notice;
            if pending == 0 {
                notice.visible = false;
            } else if !notice.visible {
                notice.visible = true;
                notice.fired += 1;
                fired = true;
            }
            notice.count = pending;
            *notice != before
        });
        if fired {
            info!("{pending} submission(s) awaiting approval");
        }
        fired
    }

    /// Hides the notice. The next poll that still reports pending items
    /// fires it again.
    pub fn dismiss(&self) {
        self.tx.send_if_modified(|notice| {
            let was_visible = notice.visible;
            notice.visible = false;
            was_visible
        });
    }
}
