use tokio::sync::watch;

/// Hangup notification for one call.
///
/// The owner bumps a counter on every `disconnect()`; a signal created
/// before the bump is raised, one created after it is not. A dropped
/// owner counts as a hangup.
#[derive(Debug, Clone)]
pub struct HangupSignal {
    rx: watch::Receiver<u64>,
    generation: u64,
}

impl HangupSignal {
    pub fn new(rx: watch::Receiver<u64>) -> Self {
        let generation = *rx.borrow();
        Self { rx, generation }
    }

    pub fn is_raised(&self) -> bool {
        self.rx.has_changed().is_err() || *self.rx.borrow() != self.generation
    }

    /// Resolves once the signal is raised. Cancel safe.
    pub async fn raised(&mut self) {
        loop {
            if *self.rx.borrow_and_update() != self.generation {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
