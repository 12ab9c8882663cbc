//! Simulated trigger cable between a pulse source and detectors.
//!
//! Pulses travel as bursts so a source that crosses several pulse positions
//! in one update (or fires everything at once in instant mode) sends a single
//! message instead of overflowing the channel.

use tokio::sync::broadcast;

const LINE_CAPACITY: usize = 1024;

/// A burst of consecutive trigger pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseBurst {
    /// Index of the first pulse in the burst.
    pub first: u64,
    /// Number of pulses.
    pub count: u64,
}

/// Fan-out trigger line.
#[derive(Debug, Clone)]
pub struct TriggerLine {
    name: &'static str,
    tx: broadcast::Sender<PulseBurst>,
}

impl TriggerLine {
    /// Create an idle line.
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = broadcast::channel(LINE_CAPACITY);
        Self { name, tx }
    }

    /// Line name for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attach a listener. Only bursts fired after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<PulseBurst> {
        self.tx.subscribe()
    }

    /// Fire `count` pulses starting at index `first`.
    ///
    /// Firing with nobody listening is not an error; the pulses are lost
    /// as they would be on an unplugged cable.
    pub fn fire(&self, first: u64, count: u64) {
        if count == 0 {
            return;
        }
        if self.tx.send(PulseBurst { first, count }).is_err() {
            tracing::trace!(line = self.name, first, count, "Pulses fired with no listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bursts_reach_every_listener() {
        let line = TriggerLine::new("test");
        let mut a = line.subscribe();
        let mut b = line.subscribe();

        line.fire(0, 3);
        line.fire(3, 2);

        assert_eq!(a.recv().await.unwrap(), PulseBurst { first: 0, count: 3 });
        assert_eq!(a.recv().await.unwrap(), PulseBurst { first: 3, count: 2 });
        assert_eq!(b.recv().await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_empty_burst_not_sent() {
        let line = TriggerLine::new("test");
        let mut rx = line.subscribe();
        line.fire(0, 0);
        assert!(rx.try_recv().is_err());
    }
}
