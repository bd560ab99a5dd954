use iris_types::state::UiSnapshot;
use tokio::sync::watch;

/// Single-writer holder of the UI snapshot.
///
/// Writers always install a complete new snapshot, so readers holding a
/// [`watch::Receiver`] never observe a half-applied update.
pub struct StateStore {
    tx: watch::Sender<UiSnapshot>,
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(UiSnapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> UiSnapshot {
        self.tx.borrow().clone()
    }

    /// Derives the next snapshot from the current one and installs it.
    /// Readers are only woken when something actually changed.
    pub fn update(&self, derive: impl FnOnce(&UiSnapshot) -> UiSnapshot) {
        let next = {
            let current = self.tx.borrow();
            let next = derive(&current);
            if next == *current {
                return;
            }
            next
        };
        self.tx.send_replace(next);
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
