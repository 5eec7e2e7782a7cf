//! Shared readiness flag with a single writer

use tokio::sync::watch;

/// Create a readiness flag, initially not ready
pub fn readiness() -> (ReadinessSetter, Readiness) {
    let (tx, rx) = watch::channel(false);
    (ReadinessSetter { tx }, Readiness { rx })
}

/// The only handle that can flip readiness. Not `Clone`.
#[derive(Debug)]
pub struct ReadinessSetter {
    tx: watch::Sender<bool>,
}

impl ReadinessSetter {
    /// Publish a new readiness value
    pub fn set(&self, ready: bool) {
        self.tx.send_replace(ready);
    }

    /// Another reader of this flag
    pub fn handle(&self) -> Readiness {
        Readiness {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the readiness flag
#[derive(Debug, Clone)]
pub struct Readiness {
    rx: watch::Receiver<bool>,
}

impl Readiness {
    /// Current value
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until ready; returns false if the setter was dropped first
    pub async fn wait_ready(&mut self) -> bool {
        self.rx.wait_for(|ready| *ready).await.is_ok()
    }
}
