use std::sync::Arc;
use tokio::sync::watch;

/// Counting gate that suppresses reply sends while side work is outstanding
/// (image recognition on a freshly captured picture, for instance).
///
/// Sends wait for the gate instead of being dropped.
#[derive(Clone)]
pub struct SendGate {
    holds: Arc<watch::Sender<usize>>,
}

impl Default for SendGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SendGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self { holds: Arc::new(tx) }
    }

    /// Close the gate until the returned guard is dropped.
    pub fn hold(&self) -> SendGateHold {
        self.holds.send_modify(|n| *n += 1);
        SendGateHold {
            holds: self.holds.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.holds.borrow() == 0
    }

    pub fn outstanding(&self) -> usize {
        *self.holds.borrow()
    }

    pub async fn wait_open(&self) {
        let mut rx = self.holds.subscribe();
        // The sender lives as long as `self`, so the wait cannot observe a
        // closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[must_use = "the gate reopens as soon as the hold is dropped"]
pub struct SendGateHold {
    holds: Arc<watch::Sender<usize>>,
}

impl Drop for SendGateHold {
    fn drop(&mut self) {
        self.holds.send_modify(|n| *n = n.saturating_sub(1));
    }
}
