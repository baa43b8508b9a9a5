// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Readiness Gate
//!
//! Process-wide state tracking whether the connection is established. Every
//! public operation awaits the gate so calls issued before `connect` (or
//! during a reconnect) queue safely instead of failing. Reconnection resets
//! the gate and a new ready transition is expected to follow.

use tokio::sync::watch;

/// One-shot-per-epoch readiness signal.
///
/// Built on a watch channel so waiters await the transition instead of
/// polling a flag. `reset` re-arms the gate for the next connection epoch.
#[derive(Debug)]
pub struct ReadyGate {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        ReadyGate::new()
    }
}

impl ReadyGate {
    pub fn new() -> ReadyGate {
        let (tx, rx) = watch::channel(false);
        ReadyGate { tx, rx }
    }

    /// True when the current connection epoch is established.
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Marks the current epoch ready, waking every waiter.
    pub fn set_ready(&self) {
        self.tx.send_replace(true);
    }

    /// Re-arms the gate for the next epoch.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Waits until the current epoch is ready.
    ///
    /// Returns immediately when the gate is already open.
    pub async fn wait_ready(&self) {
        let mut rx = self.rx.clone();
        // the sender lives in self, so the channel cannot be closed here
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn opens_for_waiters_queued_before_ready() {
        let gate = Arc::new(ReadyGate::new());
        assert!(!gate.is_ready());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_ready().await })
        };

        gate.set_ready();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_ready() {
        let gate = ReadyGate::new();
        gate.set_ready();

        tokio::time::timeout(Duration::from_millis(50), gate.wait_ready())
            .await
            .expect("must not block");
    }

    #[tokio::test]
    async fn reset_rearms_for_next_epoch() {
        let gate = Arc::new(ReadyGate::new());
        gate.set_ready();
        gate.reset();
        assert!(!gate.is_ready());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_ready().await })
        };

        // waiter must block until the next epoch opens
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set_ready();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
