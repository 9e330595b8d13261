//! XOR-correlated oblivious transfer on bits.
//!
//! The AND gate consumes a two-party additive sharing of `a & b` produced by
//! correlated OT: after a transfer over `n` bits, the sender holds output
//! bits `t`, the receiver holds output bits `o`, and
//! `t ^ o = correlations & choices`.
//!
//! The transfers are instantiated in two steps. A bulk random OT per peer
//! and direction runs before the setup phase: the sender commits to a curve
//! point `S = yB`, the receiver answers with one blinded point per bit, and
//! both sides derive pad bits from keyed point hashes (the classic
//! Chou-Orlandi construction over Ristretto). The gate-facing handles then
//! turn the random pads into the requested correlated transfer with two
//! short derandomization messages, so each handle only ever touches its own
//! disjoint range of the pads.
//!
//! All OT traffic is multiplexed over the regular message layer under a
//! reserved id namespace; both parties derive identical ids from their
//! registration order alone.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_TABLE;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoBasepointTable, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::thread_rng;
use tracing::trace;

use crate::bitvec::BitVector;
use crate::channel::Channel;
use crate::mux::MessageFuture;
use crate::provider::Provider;
use crate::wire::Latch;
use crate::Error;

/// Lowest message id used for OT traffic; gate ids stay below this bound.
pub(crate) const OT_ID_BASE: u64 = 1 << 32;

/// Tag of the bulk commitment point `S`, sent by the OT sender.
const OT_SETUP_S: u64 = OT_ID_BASE;
/// Tag of the bulk blinded points `R`, sent by the OT receiver.
const OT_SETUP_R: u64 = OT_ID_BASE + 1;
const OT_DERAND_BASE: u64 = OT_ID_BASE + 2;

/// Tag of the choice corrections of the handle with the given index.
fn correction_id(index: u64) -> u64 {
    OT_DERAND_BASE + 2 * index
}

/// Tag of the masked messages of the handle with the given index.
fn message_id(index: u64) -> u64 {
    OT_DERAND_BASE + 2 * index + 1
}

/// Derives one pad bit from a curve point, domain-separated by the bit
/// index.
fn hash_point_bit(tweak: u128, pt: &RistrettoPoint) -> bool {
    let h = blake3::keyed_hash(pt.compress().as_bytes(), &tweak.to_le_bytes());
    h.as_bytes()[0] & 1 == 1
}

fn decode_point(bytes: &[u8]) -> Result<RistrettoPoint, Error> {
    let compressed = CompressedRistretto::from_slice(bytes).map_err(|_| Error::InvalidOtPoint)?;
    compressed.decompress().ok_or(Error::InvalidOtPoint)
}

#[derive(Debug)]
pub(crate) struct SenderPads {
    p0: BitVector,
    p1: BitVector,
}

#[derive(Debug)]
pub(crate) struct ReceiverPads {
    choices: BitVector,
    pads: BitVector,
}

#[derive(Debug)]
struct Direction<P> {
    num_handles: u64,
    num_bits: usize,
    pads: Arc<Latch<P>>,
}

impl<P> Direction<P> {
    fn new() -> Self {
        Self {
            num_handles: 0,
            num_bits: 0,
            pads: Arc::new(Latch::new()),
        }
    }

    fn alloc(&mut self, num_bits: usize) -> (u64, Range<usize>, Arc<Latch<P>>) {
        let index = self.num_handles;
        let range = self.num_bits..self.num_bits + num_bits;
        self.num_handles += 1;
        self.num_bits += num_bits;
        (index, range, Arc::clone(&self.pads))
    }
}

/// Per-peer bookkeeping of registered transfers, split by the role this
/// party plays in them.
#[derive(Debug)]
pub(crate) struct OtManager {
    as_sender: Vec<Mutex<Direction<SenderPads>>>,
    as_receiver: Vec<Mutex<Direction<ReceiverPads>>>,
}

impl OtManager {
    pub(crate) fn new(num_parties: usize) -> Self {
        Self {
            as_sender: (0..num_parties)
                .map(|_| Mutex::new(Direction::new()))
                .collect(),
            as_receiver: (0..num_parties)
                .map(|_| Mutex::new(Direction::new()))
                .collect(),
        }
    }

    fn alloc_send(&self, peer: usize, num_bits: usize) -> (u64, Range<usize>, Arc<Latch<SenderPads>>) {
        self.as_sender[peer].lock().expect("poison").alloc(num_bits)
    }

    fn alloc_recv(
        &self,
        peer: usize,
        num_bits: usize,
    ) -> (u64, Range<usize>, Arc<Latch<ReceiverPads>>) {
        self.as_receiver[peer].lock().expect("poison").alloc(num_bits)
    }
}

/// One pending bulk random-OT exchange, with its message slots already
/// registered.
pub(crate) enum BaseExchange {
    Send {
        peer: usize,
        num_bits: usize,
        blinded: MessageFuture,
        pads: Arc<Latch<SenderPads>>,
    },
    Recv {
        peer: usize,
        num_bits: usize,
        commitment: MessageFuture,
        pads: Arc<Latch<ReceiverPads>>,
    },
}

/// Registers the message slots of every non-empty bulk exchange.
///
/// This must run before the dispatch loop processes any incoming frame, so
/// that a fast peer cannot race the registration.
pub(crate) fn prepare_base_exchanges<C: Channel>(provider: &Provider<C>) -> Vec<BaseExchange> {
    let manager = provider.ot_manager();
    let mut exchanges = vec![];
    for peer in 0..provider.num_parties() {
        if peer == provider.my_id() {
            continue;
        }
        let send = manager.as_sender[peer].lock().expect("poison");
        if send.num_bits > 0 {
            exchanges.push(BaseExchange::Send {
                peer,
                num_bits: send.num_bits,
                blinded: provider.register_for_bits_message(peer, OT_SETUP_R, 256 * send.num_bits),
                pads: Arc::clone(&send.pads),
            });
        }
        let recv = manager.as_receiver[peer].lock().expect("poison");
        if recv.num_bits > 0 {
            exchanges.push(BaseExchange::Recv {
                peer,
                num_bits: recv.num_bits,
                commitment: provider.register_for_bits_message(peer, OT_SETUP_S, 256),
                pads: Arc::clone(&recv.pads),
            });
        }
    }
    exchanges
}

/// Runs one bulk random-OT exchange to completion and publishes the pads.
pub(crate) async fn run_base_exchange<C: Channel>(
    provider: &Provider<C>,
    exchange: BaseExchange,
) -> Result<(), Error> {
    match exchange {
        BaseExchange::Send {
            peer,
            num_bits,
            blinded,
            pads,
        } => {
            trace!(peer, num_bits, "running base OTs as sender");
            let y = Scalar::random(&mut thread_rng());
            let s = &y * RISTRETTO_BASEPOINT_TABLE;
            let commitment = BitVector::from_bytes(s.compress().as_bytes(), 256);
            provider.send_bits_message(peer, OT_SETUP_S, &commitment).await?;
            let blinded = blinded.recv().await?.to_bytes();
            let ys = y * s;
            let mut p0 = BitVector::new();
            let mut p1 = BitVector::new();
            for i in 0..num_bits {
                let r = decode_point(&blinded[32 * i..32 * (i + 1)])?;
                let yr = y * r;
                p0.push(hash_point_bit(i as u128, &yr));
                p1.push(hash_point_bit(i as u128, &(yr - ys)));
            }
            pads.set(SenderPads { p0, p1 });
        }
        BaseExchange::Recv {
            peer,
            num_bits,
            commitment,
            pads,
        } => {
            trace!(peer, num_bits, "running base OTs as receiver");
            let s = decode_point(&commitment.recv().await?.to_bytes())?;
            let s_table = RistrettoBasepointTable::create(&s);
            let choices = BitVector::random(num_bits);
            let mut blinded = Vec::with_capacity(32 * num_bits);
            let mut derived = BitVector::new();
            for i in 0..num_bits {
                let x = Scalar::random(&mut thread_rng());
                let mut r = &x * RISTRETTO_BASEPOINT_TABLE;
                if choices.get(i) {
                    r += s;
                }
                blinded.extend_from_slice(r.compress().as_bytes());
                derived.push(hash_point_bit(i as u128, &(&x * &s_table)));
            }
            let blinded = BitVector::from_bytes(&blinded, 256 * num_bits);
            provider.send_bits_message(peer, OT_SETUP_R, &blinded).await?;
            pads.set(ReceiverPads {
                choices,
                pads: derived,
            });
        }
    }
    Ok(())
}

/// The sender side of a correlated transfer over bits.
///
/// Stages must run in order: `set_correlations`, `send_messages`,
/// `compute_outputs`, `get_outputs`. `send_messages` suspends until the
/// peer's corrections arrive.
pub struct XcotBitSender<C: Channel> {
    provider: Arc<Provider<C>>,
    peer: usize,
    num_bits: usize,
    index: u64,
    range: Range<usize>,
    pads: Arc<Latch<SenderPads>>,
    correlations: Option<BitVector>,
    corrections: Option<MessageFuture>,
    outputs: Option<BitVector>,
}

impl<C: Channel> XcotBitSender<C> {
    pub(crate) fn register(provider: &Arc<Provider<C>>, peer: usize, num_bits: usize) -> Self {
        let (index, range, pads) = provider.ot_manager().alloc_send(peer, num_bits);
        let corrections = provider.register_for_bits_message(peer, correction_id(index), num_bits);
        Self {
            provider: Arc::clone(provider),
            peer,
            num_bits,
            index,
            range,
            pads,
            correlations: None,
            corrections: Some(corrections),
            outputs: None,
        }
    }

    /// Fixes the XOR correlation between each pair of transferred bits.
    pub fn set_correlations(&mut self, correlations: BitVector) -> Result<(), Error> {
        if correlations.len() != self.num_bits {
            return Err(Error::SizeMismatch {
                expected: self.num_bits,
                actual: correlations.len(),
            });
        }
        self.correlations = Some(correlations);
        Ok(())
    }

    /// Answers the peer's corrections with the masked messages and fixes
    /// this side's outputs.
    pub async fn send_messages(&mut self) -> Result<(), Error> {
        let correlations = self.correlations.take().ok_or(Error::ProtocolFailure)?;
        let corrections = self.corrections.take().ok_or(Error::ProtocolFailure)?;
        let pads = self.pads.wait().await;
        let p0 = pads.p0.subset(self.range.start, self.range.end);
        let p1 = pads.p1.subset(self.range.start, self.range.end);
        let d = corrections.recv().await?;
        let flip = &p0 ^ &p1;
        let messages = &flip ^ &correlations;
        self.outputs = Some(&p0 ^ &(&d & &flip));
        self.provider
            .send_bits_message(self.peer, message_id(self.index), &messages)
            .await
    }

    /// Finalizes the outputs; for the sender this is a no-op kept for
    /// symmetry with the receiver.
    pub async fn compute_outputs(&mut self) -> Result<(), Error> {
        if self.outputs.is_none() {
            return Err(Error::ProtocolFailure);
        }
        Ok(())
    }

    /// Takes the output bits `t` with `t ^ o = correlations & choices`.
    pub fn get_outputs(&mut self) -> Result<BitVector, Error> {
        self.outputs.take().ok_or(Error::ProtocolFailure)
    }
}

/// The receiver side of a correlated transfer over bits.
///
/// Stages must run in order: `set_choices`, `send_corrections`,
/// `compute_outputs`, `get_outputs`. `compute_outputs` suspends until the
/// peer's messages arrive.
pub struct XcotBitReceiver<C: Channel> {
    provider: Arc<Provider<C>>,
    peer: usize,
    num_bits: usize,
    index: u64,
    range: Range<usize>,
    pads: Arc<Latch<ReceiverPads>>,
    choices: Option<BitVector>,
    messages: Option<MessageFuture>,
    outputs: Option<BitVector>,
}

impl<C: Channel> XcotBitReceiver<C> {
    pub(crate) fn register(provider: &Arc<Provider<C>>, peer: usize, num_bits: usize) -> Self {
        let (index, range, pads) = provider.ot_manager().alloc_recv(peer, num_bits);
        let messages = provider.register_for_bits_message(peer, message_id(index), num_bits);
        Self {
            provider: Arc::clone(provider),
            peer,
            num_bits,
            index,
            range,
            pads,
            choices: None,
            messages: Some(messages),
            outputs: None,
        }
    }

    /// Fixes the choice bit of each transfer.
    pub fn set_choices(&mut self, choices: BitVector) -> Result<(), Error> {
        if choices.len() != self.num_bits {
            return Err(Error::SizeMismatch {
                expected: self.num_bits,
                actual: choices.len(),
            });
        }
        self.choices = Some(choices);
        Ok(())
    }

    /// Sends the corrections that align the random base pads with the
    /// actual choices.
    pub async fn send_corrections(&mut self) -> Result<(), Error> {
        let choices = self.choices.take().ok_or(Error::ProtocolFailure)?;
        let pads = self.pads.wait().await;
        let random_choices = pads.choices.subset(self.range.start, self.range.end);
        let corrections = &choices ^ &random_choices;
        self.choices = Some(choices);
        self.provider
            .send_bits_message(self.peer, correction_id(self.index), &corrections)
            .await
    }

    /// Awaits the peer's masked messages and unmasks the chosen one per
    /// bit.
    pub async fn compute_outputs(&mut self) -> Result<(), Error> {
        let choices = self.choices.take().ok_or(Error::ProtocolFailure)?;
        let messages = self.messages.take().ok_or(Error::ProtocolFailure)?;
        let pads = self.pads.wait().await;
        let derived = pads.pads.subset(self.range.start, self.range.end);
        let u = messages.recv().await?;
        self.outputs = Some(&derived ^ &(&choices & &u));
        Ok(())
    }

    /// Takes the output bits `o` with `t ^ o = correlations & choices`.
    pub fn get_outputs(&mut self) -> Result<BitVector, Error> {
        self.outputs.take().ok_or(Error::ProtocolFailure)
    }
}
