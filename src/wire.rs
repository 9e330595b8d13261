//! Wires connecting gates, with two-phase readiness signalling.
//!
//! A wire carries `num_simd` parallel Boolean values as two bit vectors: the
//! party's additive share of the wire mask (written during the setup phase)
//! and the publicly reconstructed masked value (written during the online
//! phase). Each share is published through a monotone latch: once set it
//! never changes, any number of downstream gates may wait on it, and waiters
//! arriving after publication return immediately.

use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use crate::bitvec::BitVector;

/// A set-once cell with async waiters.
#[derive(Debug)]
pub(crate) struct Latch<T> {
    cell: OnceLock<T>,
    notify: Notify,
}

impl<T> Latch<T> {
    pub(crate) fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Publishes the value and wakes all waiters. Panics if already set;
    /// every latch has exactly one writer.
    pub(crate) fn set(&self, value: T) {
        if self.cell.set(value).is_err() {
            panic!("latch set twice");
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Waits until the value is published.
    pub(crate) async fn wait(&self) -> &T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the check so a publication between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(value) = self.cell.get() {
                return value;
            }
            notified.await;
        }
    }
}

/// A shared handle to a wire. Input wires of a gate are clones of the
/// producing gate's handle; the bit vectors themselves are never copied.
pub type WireRef = Arc<BooleanWire>;

/// A Boolean wire holding this party's secret share of the wire mask and
/// the public masked value, each behind its own readiness latch.
#[derive(Debug)]
pub struct BooleanWire {
    num_simd: usize,
    secret: Latch<BitVector>,
    public: Latch<BitVector>,
}

impl BooleanWire {
    /// Creates a wire carrying `num_simd` parallel values, with neither
    /// phase ready.
    pub fn new(num_simd: usize) -> WireRef {
        Arc::new(Self {
            num_simd,
            secret: Latch::new(),
            public: Latch::new(),
        })
    }

    /// The number of parallel values on this wire.
    pub fn num_simd(&self) -> usize {
        self.num_simd
    }

    /// Publishes the secret share and marks the wire setup-ready.
    pub(crate) fn set_secret_share(&self, share: BitVector) {
        assert_eq!(share.len(), self.num_simd, "secret share has wrong size");
        self.secret.set(share);
    }

    /// Publishes the public share and marks the wire online-ready.
    pub(crate) fn set_public_share(&self, share: BitVector) {
        assert_eq!(share.len(), self.num_simd, "public share has wrong size");
        self.public.set(share);
    }

    /// Whether the setup phase of the producing gate has published the
    /// secret share.
    pub fn setup_ready(&self) -> bool {
        self.secret.is_set()
    }

    /// Whether the online phase of the producing gate has published the
    /// public share.
    pub fn online_ready(&self) -> bool {
        self.public.is_set()
    }

    /// Waits until the secret share is available and returns it.
    pub async fn wait_setup(&self) -> &BitVector {
        self.secret.wait().await
    }

    /// Waits until the public share is available and returns it.
    pub async fn wait_online(&self) -> &BitVector {
        self.public.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiters_see_published_value() {
        let wire = BooleanWire::new(3);
        assert!(!wire.setup_ready());
        let waiter = wire.wait_setup();
        wire.set_secret_share(BitVector::zeros(3));
        assert_eq!(waiter.await.len(), 3);
        assert!(wire.setup_ready());
        // late waiters return immediately
        assert_eq!(wire.wait_setup().await.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_waiters_wake() {
        let wire = BooleanWire::new(1);
        let wire2 = wire.clone();
        let waiter = tokio::spawn(async move { wire2.wait_online().await.len() });
        tokio::task::yield_now().await;
        wire.set_public_share(BitVector::zeros(1));
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[test]
    #[should_panic]
    fn double_publish_panics() {
        let wire = BooleanWire::new(1);
        wire.set_secret_share(BitVector::zeros(1));
        wire.set_secret_share(BitVector::zeros(1));
    }
}
