//! Per-connection stream gate.
//!
//! A connection's read loop and an application-level stream consumer share
//! one socket. When the read loop sees a stream tag it raises the gate and
//! parks; the consumer waits for the gate to be raised, reads the raw bytes
//! itself, then lowers the gate so the read loop resumes.
//!
//! Contract: exactly one party raises (the read loop) and one party lowers
//! (the current consumer). Nothing else touches the gate.

use tokio::sync::watch;

/// Two-state rendezvous between a read loop and a stream consumer.
#[derive(Debug)]
pub struct StreamGate {
    raised: watch::Sender<bool>,
}

impl StreamGate {
    /// A lowered gate.
    pub fn new() -> Self {
        let (raised, _) = watch::channel(false);
        Self { raised }
    }

    /// Mark a stream as pending. Called by the read loop only.
    pub fn raise(&self) {
        self.raised.send_replace(true);
    }

    /// Mark the pending stream as consumed. Called by the consumer only.
    pub fn lower(&self) {
        self.raised.send_replace(false);
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.borrow()
    }

    /// Wait until a stream is pending.
    pub async fn wait_raised(&self) {
        let mut rx = self.raised.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Wait until the consumer has released the stream.
    pub async fn wait_lowered(&self) {
        let mut rx = self.raised.subscribe();
        let _ = rx.wait_for(|raised| !*raised).await;
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}
