//! The per-party computation context.
//!
//! A [`Provider`] is constructed once per party and handed to every gate. It
//! bundles the party's identity, the deterministic allocation of gate and
//! input ids, the correlated randomness shared with each peer, the message
//! demultiplexer and the OT registration. Gates hold it behind an [`Arc`]
//! and never mutate it apart from the monotone id counters.
//!
//! Gate ids double as protocol agreement: all parties must construct their
//! gates in the same order, so that equal gates carry equal ids and the
//! deterministic job assignment ([`Provider::is_my_job`]) picks the same
//! party everywhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, trace};

use crate::bitvec::BitVector;
use crate::channel::{recv_frame, send_frame, Channel};
use crate::mux::{MessageFuture, MessageMux};
use crate::ot::{OtManager, XcotBitReceiver, XcotBitSender, OT_ID_BASE};
use crate::rng::{exchange_seeds, SharedRandomness};
use crate::Error;

/// Sentinel output owner meaning that every party receives the output.
pub const ALL_PARTIES: usize = usize::MAX;

/// The process-wide context of one party in a computation.
pub struct Provider<C: Channel> {
    channel: C,
    my_id: usize,
    num_parties: usize,
    mux: MessageMux,
    ot: OtManager,
    my_randomness: Vec<Option<SharedRandomness>>,
    their_randomness: Vec<Option<SharedRandomness>>,
    next_gate_id: AtomicU64,
    next_input_id: AtomicU64,
}

impl<C: Channel> Provider<C> {
    /// Sets up the context for party `my_id` of `num_parties`, performing
    /// the pairwise randomness handshake over the given channel.
    ///
    /// All parties must call this before constructing any gates.
    pub async fn setup(channel: C, my_id: usize, num_parties: usize) -> Result<Arc<Self>, Error> {
        assert!(my_id < num_parties, "party id out of range");
        let (my_randomness, their_randomness) =
            exchange_seeds(&channel, my_id, num_parties).await?;
        Ok(Arc::new(Self {
            channel,
            my_id,
            num_parties,
            mux: MessageMux::new(),
            ot: OtManager::new(num_parties),
            my_randomness,
            their_randomness,
            next_gate_id: AtomicU64::new(0),
            next_input_id: AtomicU64::new(0),
        }))
    }

    /// The id of this party, in `0..num_parties`.
    pub fn my_id(&self) -> usize {
        self.my_id
    }

    /// The total number of parties in the computation.
    pub fn num_parties(&self) -> usize {
        self.num_parties
    }

    /// Whether this party is the one responsible for the asymmetric step of
    /// the gate with the given id. Exactly one party answers `true` for any
    /// id, and all parties agree on which.
    pub fn is_my_job(&self, gate_id: u64) -> bool {
        gate_id % self.num_parties as u64 == self.my_id as u64
    }

    /// Allocates the next gate id.
    pub(crate) fn next_gate_id(&self) -> u64 {
        let id = self.next_gate_id.fetch_add(1, Ordering::Relaxed);
        assert!(id < OT_ID_BASE, "gate id space exhausted");
        id
    }

    /// Reserves `num_wires` consecutive input ids and returns the first.
    pub fn get_next_input_id(&self, num_wires: usize) -> u64 {
        self.next_input_id
            .fetch_add(num_wires as u64, Ordering::Relaxed)
    }

    /// The randomness stream this party generated for `peer`.
    pub fn my_randomness_for(&self, peer: usize) -> &SharedRandomness {
        self.my_randomness[peer]
            .as_ref()
            .unwrap_or_else(|| panic!("no randomness shared with party {peer}"))
    }

    /// The randomness stream `peer` generated for this party.
    pub fn their_randomness_for(&self, peer: usize) -> &SharedRandomness {
        self.their_randomness[peer]
            .as_ref()
            .unwrap_or_else(|| panic!("no randomness shared with party {peer}"))
    }

    /// Allocates the single-use slot for a `num_bits` message from `sender`
    /// tagged with `id`.
    pub fn register_for_bits_message(
        &self,
        sender: usize,
        id: u64,
        num_bits: usize,
    ) -> MessageFuture {
        assert!(
            sender != self.my_id && sender < self.num_parties,
            "cannot register for messages from party {sender}"
        );
        self.mux.register(sender, id, num_bits)
    }

    /// Allocates one slot per peer for a `num_bits` message tagged with
    /// `id`. The own index holds `None`.
    pub fn register_for_bits_messages(&self, id: u64, num_bits: usize) -> Vec<Option<MessageFuture>> {
        (0..self.num_parties)
            .map(|p| (p != self.my_id).then(|| self.mux.register(p, id, num_bits)))
            .collect()
    }

    /// Sends `payload` to `dest`, tagged with `id`.
    pub async fn send_bits_message(
        &self,
        dest: usize,
        id: u64,
        payload: &BitVector,
    ) -> Result<(), Error> {
        send_frame(&self.channel, dest, id, payload).await?;
        Ok(())
    }

    /// Sends `payload` to every peer, tagged with `id`.
    pub async fn broadcast_bits_message(&self, id: u64, payload: &BitVector) -> Result<(), Error> {
        try_join_all(
            (0..self.num_parties)
                .filter(|p| *p != self.my_id)
                .map(|p| send_frame(&self.channel, p, id, payload)),
        )
        .await?;
        Ok(())
    }

    /// Registers a sender-side correlated transfer of `num_bits` bits with
    /// `peer`. Must happen before the setup phase starts.
    pub fn register_send_xcot_bit(self: &Arc<Self>, peer: usize, num_bits: usize) -> XcotBitSender<C> {
        XcotBitSender::register(self, peer, num_bits)
    }

    /// Registers a receiver-side correlated transfer of `num_bits` bits
    /// with `peer`. Must happen before the setup phase starts.
    pub fn register_receive_xcot_bit(
        self: &Arc<Self>,
        peer: usize,
        num_bits: usize,
    ) -> XcotBitReceiver<C> {
        XcotBitReceiver::register(self, peer, num_bits)
    }

    pub(crate) fn ot_manager(&self) -> &OtManager {
        &self.ot
    }

    /// Fails every outstanding message future.
    pub(crate) fn poison(&self) {
        self.mux.poison();
    }

    /// Receives frames from every peer and routes them to their slots. The
    /// caller races this against the phase that consumes the messages: a
    /// protocol violation or transport failure fails immediately, while
    /// the loop returns successfully once every peer has cleanly closed
    /// its end.
    pub(crate) async fn dispatch_incoming(&self) -> Result<(), Error> {
        try_join_all(
            (0..self.num_parties)
                .filter(|p| *p != self.my_id)
                .map(|p| self.dispatch_from(p)),
        )
        .await?;
        Ok(())
    }

    async fn dispatch_from(&self, peer: usize) -> Result<(), Error> {
        loop {
            let Some(frame) = recv_frame(&self.channel, peer).await? else {
                // A peer that already sent everything we need may finish
                // and close its end first. Slots it left unfilled are
                // released when the phase ends.
                debug!(peer, "peer closed the connection");
                return Ok(());
            };
            trace!(
                sender = peer,
                id = frame.id,
                num_bits = frame.payload.len(),
                "dispatching message"
            );
            self.mux.dispatch(peer, frame.id, frame.payload)?;
        }
    }
}
