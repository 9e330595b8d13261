//! Demultiplexing of tagged bit-vector messages.
//!
//! Gates register the messages they expect at construction time, keyed by
//! `(sender, id)`. When the transport delivers a frame, the matching slot is
//! completed, independently of the order in which frames arrive. Each slot
//! is single-use: a second message for the same key and a message without a
//! slot both indicate that the peer diverged from the protocol and are
//! fatal.

use std::collections::HashMap;
use std::mem;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::bitvec::BitVector;
use crate::Error;

/// A one-shot future resolving to the payload of an expected message.
///
/// If the computation is aborted before the message arrives, awaiting the
/// future fails with [`Error::ProtocolFailure`].
#[derive(Debug)]
pub struct MessageFuture {
    rx: oneshot::Receiver<BitVector>,
}

impl MessageFuture {
    /// Waits for the message to arrive.
    pub async fn recv(self) -> Result<BitVector, Error> {
        self.rx.await.map_err(|_| Error::ProtocolFailure)
    }
}

#[derive(Debug)]
enum Slot {
    Pending {
        num_bits: usize,
        tx: oneshot::Sender<BitVector>,
    },
    Completed,
}

/// The table mapping `(sender, id)` to the single-use slot awaiting it.
#[derive(Debug, Default)]
pub(crate) struct MessageMux {
    table: Mutex<HashMap<(usize, u64), Slot>>,
}

impl MessageMux {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates the slot for a `num_bits` message from `sender` tagged with
    /// `id`.
    ///
    /// Panics if a slot for the same key already exists; ids are allocated
    /// monotonically, so a collision is a bug in the caller.
    pub(crate) fn register(&self, sender: usize, id: u64, num_bits: usize) -> MessageFuture {
        let (tx, rx) = oneshot::channel();
        let prev = self
            .table
            .lock()
            .expect("poison")
            .insert((sender, id), Slot::Pending { num_bits, tx });
        if prev.is_some() {
            panic!("message slot ({sender}, {id}) registered twice");
        }
        MessageFuture { rx }
    }

    /// Routes an incoming message to its slot.
    pub(crate) fn dispatch(&self, sender: usize, id: u64, payload: BitVector) -> Result<(), Error> {
        let mut table = self.table.lock().expect("poison");
        let Some(slot) = table.get_mut(&(sender, id)) else {
            return Err(Error::UnregisteredMessage { party: sender, id });
        };
        match mem::replace(slot, Slot::Completed) {
            Slot::Pending { num_bits, tx } => {
                if payload.len() != num_bits {
                    return Err(Error::SizeMismatch {
                        expected: num_bits,
                        actual: payload.len(),
                    });
                }
                // The receiver may already be gone if the computation was
                // aborted; the message is simply dropped then.
                let _ = tx.send(payload);
                Ok(())
            }
            Slot::Completed => Err(Error::DuplicateMessage { party: sender, id }),
        }
    }

    /// Fails every outstanding slot, releasing all waiters with
    /// [`Error::ProtocolFailure`].
    pub(crate) fn poison(&self) {
        let mut table = self.table.lock().expect("poison");
        for slot in table.values_mut() {
            *slot = Slot::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_out_of_order() -> Result<(), Error> {
        let mux = MessageMux::new();
        let fut_a = mux.register(1, 7, 4);
        let fut_b = mux.register(1, 3, 2);
        mux.dispatch(1, 3, BitVector::zeros(2))?;
        mux.dispatch(1, 7, BitVector::zeros(4))?;
        assert_eq!(fut_a.recv().await?.len(), 4);
        assert_eq!(fut_b.recv().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_duplicate_and_unregistered() {
        let mux = MessageMux::new();
        let _fut = mux.register(0, 1, 1);
        mux.dispatch(0, 1, BitVector::zeros(1)).unwrap();
        assert!(matches!(
            mux.dispatch(0, 1, BitVector::zeros(1)),
            Err(Error::DuplicateMessage { party: 0, id: 1 })
        ));
        assert!(matches!(
            mux.dispatch(2, 9, BitVector::zeros(1)),
            Err(Error::UnregisteredMessage { party: 2, id: 9 })
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_size() {
        let mux = MessageMux::new();
        let _fut = mux.register(0, 1, 8);
        assert!(matches!(
            mux.dispatch(0, 1, BitVector::zeros(4)),
            Err(Error::SizeMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn poison_releases_waiters() {
        let mux = MessageMux::new();
        let fut = mux.register(1, 1, 1);
        mux.poison();
        assert!(matches!(fut.recv().await, Err(Error::ProtocolFailure)));
    }
}
