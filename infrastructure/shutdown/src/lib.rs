// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! A cancellation primitive shared by every long-running Sable service. A single [`Shutdown`] owns the trigger;
//! any number of cloned [`ShutdownSignal`]s can be awaited by tasks that must exit when the node goes down.

use tokio::sync::watch;

/// The owning side of the shutdown channel. Dropping the `Shutdown` also triggers it.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Signal all `ShutdownSignal`s. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.trigger();
    }
}

/// A cloneable signal that resolves once the owning [`Shutdown`] is triggered or dropped.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the shutdown trigger. Returns immediately if already triggered.
    pub async fn wait(&mut self) {
        // A closed channel means the Shutdown was dropped, which also counts as triggered.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn signal_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.to_signal();
        assert!(!signal.is_triggered());

        shutdown.trigger();
        // Check that this does not panic/deadlock
        shutdown.trigger();

        signal.wait().await;
        assert!(signal.is_triggered());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn signal_resolves_when_shutdown_dropped() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.to_signal();
        drop(shutdown);
        signal.wait().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn clones_see_the_same_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        let mut signals = vec![signal.clone(), signal.clone(), signal];
        shutdown.trigger();
        for signal in &mut signals {
            signal.wait().await;
        }
    }
}
