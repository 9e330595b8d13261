//! The Boolean gates and their two-phase protocol logic.
//!
//! Every value on a wire is represented as a mask `delta`, XOR-shared among
//! the parties, together with the public masked value `Delta = v ^ delta`.
//! A gate's setup phase produces the secret mask shares of its output wires
//! from input-independent data; its online phase produces the public masked
//! values once the inputs are known. XOR and (for the non-responsible
//! party) INV are local; Input, Output and AND exchange messages tagged
//! with the gate id, so no ordering between different gates is ever needed.
//!
//! Gates must be constructed in the same order at every party: gate ids are
//! allocated sequentially and double as message tags and as the input to
//! the deterministic job assignment.

use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::trace;

use crate::bitvec::BitVector;
use crate::channel::Channel;
use crate::mux::MessageFuture;
use crate::ot::{XcotBitReceiver, XcotBitSender};
use crate::provider::{Provider, ALL_PARTIES};
use crate::wire::{BooleanWire, WireRef};
use crate::Error;

/// A gate node of the circuit graph.
///
/// The executor calls `evaluate_setup` on every gate, then
/// `evaluate_online` on every gate; a gate's own setup always finishes
/// before its online phase starts, but no ordering exists between distinct
/// gates beyond what wire readiness and message arrival impose.
#[async_trait(?Send)]
pub trait BooleanGate {
    /// The unique, globally agreed id of this gate.
    fn gate_id(&self) -> u64;

    /// Runs the input-independent phase.
    async fn evaluate_setup(&mut self) -> Result<(), Error>;

    /// Runs the input-dependent phase.
    async fn evaluate_online(&mut self) -> Result<(), Error>;
}

fn uniform_num_simd(wires: &[WireRef]) -> Result<usize, Error> {
    let Some(first) = wires.first() else {
        return Err(Error::NoWires);
    };
    let num_simd = first.num_simd();
    if wires.iter().any(|w| w.num_simd() != num_simd) {
        return Err(Error::SimdCountMismatch);
    }
    Ok(num_simd)
}

fn binary_inputs(in_a: &[WireRef], in_b: &[WireRef]) -> Result<(usize, usize), Error> {
    let simd_a = uniform_num_simd(in_a)?;
    let simd_b = uniform_num_simd(in_b)?;
    if in_a.len() != in_b.len() {
        return Err(Error::WireCountMismatch {
            a: in_a.len(),
            b: in_b.len(),
        });
    }
    if simd_a != simd_b {
        return Err(Error::SimdCountMismatch);
    }
    Ok((in_a.len(), simd_a))
}

fn fresh_wires(num_wires: usize, num_simd: usize) -> Vec<WireRef> {
    (0..num_wires).map(|_| BooleanWire::new(num_simd)).collect()
}

/// The input gate at the party that owns the input value.
///
/// Setup draws a random mask share per wire and derives the peers' shares
/// from the shared randomness streams, so that no message is needed to
/// distribute the mask. Online consumes the actual input bits from the
/// promise returned at construction and broadcasts the masked value.
pub struct InputGateSender<C: Channel> {
    gate_id: u64,
    provider: Arc<Provider<C>>,
    num_wires: usize,
    num_simd: usize,
    input_id: u64,
    input: Option<oneshot::Receiver<Vec<BitVector>>>,
    public_shares: Vec<BitVector>,
    outputs: Vec<WireRef>,
}

impl<C: Channel> InputGateSender<C> {
    /// Creates the gate and the promise through which the circuit builder
    /// later supplies the input, one bit vector of length `num_simd` per
    /// wire.
    pub fn new(
        provider: &Arc<Provider<C>>,
        num_wires: usize,
        num_simd: usize,
    ) -> Result<(Self, oneshot::Sender<Vec<BitVector>>), Error> {
        if num_wires == 0 {
            return Err(Error::NoWires);
        }
        let gate_id = provider.next_gate_id();
        let input_id = provider.get_next_input_id(num_wires);
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            gate_id,
            provider: Arc::clone(provider),
            num_wires,
            num_simd,
            input_id,
            input: Some(rx),
            public_shares: Vec::with_capacity(num_wires),
            outputs: fresh_wires(num_wires, num_simd),
        };
        Ok((gate, tx))
    }

    /// The output wires of this gate.
    pub fn outputs(&self) -> &[WireRef] {
        &self.outputs
    }
}

#[async_trait(?Send)]
impl<C: Channel> BooleanGate for InputGateSender<C> {
    fn gate_id(&self) -> u64 {
        self.gate_id
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "input sender setup");
        let my_id = self.provider.my_id();
        for (i, wire) in self.outputs.iter().enumerate() {
            let secret_share = BitVector::random(self.num_simd);
            let mut public_share = secret_share.clone();
            wire.set_secret_share(secret_share);
            for p in (0..self.provider.num_parties()).filter(|p| *p != my_id) {
                public_share ^= &self
                    .provider
                    .my_randomness_for(p)
                    .get_bits(self.input_id + i as u64, self.num_simd);
            }
            self.public_shares.push(public_share);
        }
        Ok(())
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "input sender online");
        let inputs = self
            .input
            .take()
            .ok_or(Error::ProtocolFailure)?
            .await
            .map_err(|_| Error::ProtocolFailure)?;
        if inputs.len() != self.num_wires {
            return Err(Error::BadInput {
                expected: self.num_wires,
                actual: inputs.len(),
            });
        }
        let mut public_shares = BitVector::new();
        for ((wire, mut public_share), input_bits) in self
            .outputs
            .iter()
            .zip(mem::take(&mut self.public_shares))
            .zip(inputs)
        {
            if input_bits.len() != self.num_simd {
                return Err(Error::BadInput {
                    expected: self.num_simd,
                    actual: input_bits.len(),
                });
            }
            public_share ^= &input_bits;
            public_shares.append(&public_share);
            wire.set_public_share(public_share);
        }
        self.provider
            .broadcast_bits_message(self.gate_id, &public_shares)
            .await
    }
}

/// The input gate at every party other than the input owner.
///
/// Setup derives this party's mask share from the stream the owner seeded;
/// online receives the broadcast masked value.
pub struct InputGateReceiver<C: Channel> {
    gate_id: u64,
    provider: Arc<Provider<C>>,
    num_simd: usize,
    input_owner: usize,
    input_id: u64,
    public_shares: Option<MessageFuture>,
    outputs: Vec<WireRef>,
}

impl<C: Channel> InputGateReceiver<C> {
    /// Creates the receiving end of the input gate owned by `input_owner`.
    pub fn new(
        provider: &Arc<Provider<C>>,
        input_owner: usize,
        num_wires: usize,
        num_simd: usize,
    ) -> Result<Self, Error> {
        if num_wires == 0 {
            return Err(Error::NoWires);
        }
        if input_owner >= provider.num_parties() || input_owner == provider.my_id() {
            return Err(Error::InvalidInputOwner(input_owner));
        }
        let gate_id = provider.next_gate_id();
        let input_id = provider.get_next_input_id(num_wires);
        let public_shares =
            provider.register_for_bits_message(input_owner, gate_id, num_wires * num_simd);
        Ok(Self {
            gate_id,
            provider: Arc::clone(provider),
            num_simd,
            input_owner,
            input_id,
            public_shares: Some(public_shares),
            outputs: fresh_wires(num_wires, num_simd),
        })
    }

    /// The output wires of this gate.
    pub fn outputs(&self) -> &[WireRef] {
        &self.outputs
    }
}

#[async_trait(?Send)]
impl<C: Channel> BooleanGate for InputGateReceiver<C> {
    fn gate_id(&self) -> u64 {
        self.gate_id
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "input receiver setup");
        let rng = self.provider.their_randomness_for(self.input_owner);
        for (i, wire) in self.outputs.iter().enumerate() {
            wire.set_secret_share(rng.get_bits(self.input_id + i as u64, self.num_simd));
        }
        Ok(())
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "input receiver online");
        let public_shares = self
            .public_shares
            .take()
            .ok_or(Error::ProtocolFailure)?
            .recv()
            .await?;
        for (i, wire) in self.outputs.iter().enumerate() {
            wire.set_public_share(public_shares.subset(i * self.num_simd, (i + 1) * self.num_simd));
        }
        Ok(())
    }
}

/// The output gate, reconstructing cleartext values at the designated
/// party, or at all parties when constructed with [`ALL_PARTIES`].
///
/// The gate consumes its input wires. Every party contributes its mask
/// shares to the recipients; a recipient XORs all shares into the public
/// masked value, which peels off the mask and leaves the cleartext.
pub struct OutputGate<C: Channel> {
    gate_id: u64,
    provider: Arc<Provider<C>>,
    output_owner: usize,
    inputs: Vec<WireRef>,
    share_futures: Vec<Option<MessageFuture>>,
    promise: Option<oneshot::Sender<Vec<BitVector>>>,
    future: Option<oneshot::Receiver<Vec<BitVector>>>,
}

impl<C: Channel> OutputGate<C> {
    /// Creates the gate; `output_owner` is a party id or [`ALL_PARTIES`].
    pub fn new(
        provider: &Arc<Provider<C>>,
        inputs: Vec<WireRef>,
        output_owner: usize,
    ) -> Result<Self, Error> {
        if inputs.is_empty() {
            return Err(Error::NoWires);
        }
        if output_owner != ALL_PARTIES && output_owner >= provider.num_parties() {
            return Err(Error::InvalidOutputParty(output_owner));
        }
        let gate_id = provider.next_gate_id();
        let my_id = provider.my_id();
        let num_bits = inputs.iter().map(|w| w.num_simd()).sum();
        let share_futures = if output_owner == ALL_PARTIES || output_owner == my_id {
            provider.register_for_bits_messages(gate_id, num_bits)
        } else {
            vec![]
        };
        let (tx, rx) = oneshot::channel();
        Ok(Self {
            gate_id,
            provider: Arc::clone(provider),
            output_owner,
            inputs,
            share_futures,
            promise: Some(tx),
            future: Some(rx),
        })
    }

    fn is_recipient(&self) -> bool {
        self.output_owner == ALL_PARTIES || self.output_owner == self.provider.my_id()
    }

    /// The future resolving to the cleartext outputs, one bit vector per
    /// input wire.
    ///
    /// Fails with [`Error::NotMyOutput`] if this party is not a recipient.
    pub fn get_output_future(&mut self) -> Result<oneshot::Receiver<Vec<BitVector>>, Error> {
        if !self.is_recipient() {
            return Err(Error::NotMyOutput);
        }
        self.future.take().ok_or(Error::ProtocolFailure)
    }
}

#[async_trait(?Send)]
impl<C: Channel> BooleanGate for OutputGate<C> {
    fn gate_id(&self) -> u64 {
        self.gate_id
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        // nothing to do
        Ok(())
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "output online");
        let my_id = self.provider.my_id();
        let mut my_secret_share = BitVector::new();
        for wire in &self.inputs {
            my_secret_share.append(wire.wait_setup().await);
        }
        if self.output_owner != my_id {
            if self.output_owner == ALL_PARTIES {
                self.provider
                    .broadcast_bits_message(self.gate_id, &my_secret_share)
                    .await?;
            } else {
                self.provider
                    .send_bits_message(self.output_owner, self.gate_id, &my_secret_share)
                    .await?;
            }
        }
        if self.is_recipient() {
            for future in mem::take(&mut self.share_futures).into_iter().flatten() {
                my_secret_share ^= &future.recv().await?;
            }
            let mut outputs = Vec::with_capacity(self.inputs.len());
            let mut bit_offset = 0;
            for wire in &self.inputs {
                let num_simd = wire.num_simd();
                let mut output = my_secret_share.subset(bit_offset, bit_offset + num_simd);
                output ^= wire.wait_online().await;
                outputs.push(output);
                bit_offset += num_simd;
            }
            let promise = self.promise.take().ok_or(Error::ProtocolFailure)?;
            // The caller may have dropped the future; the output is simply
            // discarded then.
            let _ = promise.send(outputs);
        }
        Ok(())
    }
}

/// The XOR gate. Purely local: both shares of the output are the XOR of
/// the corresponding input shares.
pub struct XorGate {
    gate_id: u64,
    inputs_a: Vec<WireRef>,
    inputs_b: Vec<WireRef>,
    outputs: Vec<WireRef>,
}

impl XorGate {
    /// Creates an XOR gate over two equally shaped wire bundles.
    pub fn new<C: Channel>(
        provider: &Provider<C>,
        inputs_a: Vec<WireRef>,
        inputs_b: Vec<WireRef>,
    ) -> Result<Self, Error> {
        let (num_wires, num_simd) = binary_inputs(&inputs_a, &inputs_b)?;
        Ok(Self {
            gate_id: provider.next_gate_id(),
            inputs_a,
            inputs_b,
            outputs: fresh_wires(num_wires, num_simd),
        })
    }

    /// The output wires of this gate.
    pub fn outputs(&self) -> &[WireRef] {
        &self.outputs
    }
}

#[async_trait(?Send)]
impl BooleanGate for XorGate {
    fn gate_id(&self) -> u64 {
        self.gate_id
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        for ((wire_a, wire_b), wire_o) in self.inputs_a.iter().zip(&self.inputs_b).zip(&self.outputs)
        {
            let share_a = wire_a.wait_setup().await;
            let share_b = wire_b.wait_setup().await;
            wire_o.set_secret_share(share_a ^ share_b);
        }
        Ok(())
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        for ((wire_a, wire_b), wire_o) in self.inputs_a.iter().zip(&self.inputs_b).zip(&self.outputs)
        {
            let share_a = wire_a.wait_online().await;
            let share_b = wire_b.wait_online().await;
            wire_o.set_public_share(share_a ^ share_b);
        }
        Ok(())
    }
}

/// The NOT gate.
///
/// Flipping the combined mask flips the cleartext, so it suffices that
/// exactly one party inverts its mask share while the public share passes
/// through unchanged. The responsible party is picked by the deterministic
/// job assignment; every other party forwards its input wires as outputs
/// without touching them.
pub struct InvGate {
    gate_id: u64,
    is_my_job: bool,
    inputs: Vec<WireRef>,
    outputs: Vec<WireRef>,
}

impl InvGate {
    /// Creates a NOT gate over a wire bundle.
    pub fn new<C: Channel>(provider: &Provider<C>, inputs: Vec<WireRef>) -> Result<Self, Error> {
        let num_simd = uniform_num_simd(&inputs)?;
        let gate_id = provider.next_gate_id();
        let is_my_job = provider.is_my_job(gate_id);
        let outputs = if is_my_job {
            fresh_wires(inputs.len(), num_simd)
        } else {
            // forward: outputs alias the inputs, no new wires
            inputs.clone()
        };
        Ok(Self {
            gate_id,
            is_my_job,
            inputs,
            outputs,
        })
    }

    /// The output wires of this gate.
    pub fn outputs(&self) -> &[WireRef] {
        &self.outputs
    }
}

#[async_trait(?Send)]
impl BooleanGate for InvGate {
    fn gate_id(&self) -> u64 {
        self.gate_id
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        if !self.is_my_job {
            return Ok(());
        }
        for (wire_in, wire_o) in self.inputs.iter().zip(&self.outputs) {
            let v: &BitVector = wire_in.wait_setup().await;
            wire_o.set_secret_share(!v);
        }
        Ok(())
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        if !self.is_my_job {
            return Ok(());
        }
        for (wire_in, wire_o) in self.inputs.iter().zip(&self.outputs) {
            wire_o.set_public_share(wire_in.wait_online().await.clone());
        }
        Ok(())
    }
}

/// The two-party AND gate.
///
/// Setup produces a fresh random output mask and a two-party sharing of
/// `delta_a & delta_b` via one correlated OT in each direction. Online
/// combines the shared products with the public input values, adds the
/// public product term at exactly one party, and reconstructs the output's
/// public share with a single message exchange.
pub struct AndGate<C: Channel> {
    gate_id: u64,
    provider: Arc<Provider<C>>,
    num_simd: usize,
    inputs_a: Vec<WireRef>,
    inputs_b: Vec<WireRef>,
    outputs: Vec<WireRef>,
    share_future: Option<MessageFuture>,
    ot_sender: XcotBitSender<C>,
    ot_receiver: XcotBitReceiver<C>,
    delta_a_share: BitVector,
    delta_b_share: BitVector,
    big_delta_y_share: BitVector,
}

impl<C: Channel> AndGate<C> {
    /// Creates an AND gate over two equally shaped wire bundles.
    ///
    /// Only two-party computations are supported; other party counts fail
    /// with [`Error::UnsupportedPartyCount`].
    pub fn new(
        provider: &Arc<Provider<C>>,
        inputs_a: Vec<WireRef>,
        inputs_b: Vec<WireRef>,
    ) -> Result<Self, Error> {
        if provider.num_parties() != 2 {
            return Err(Error::UnsupportedPartyCount(provider.num_parties()));
        }
        let (num_wires, num_simd) = binary_inputs(&inputs_a, &inputs_b)?;
        let gate_id = provider.next_gate_id();
        let peer = 1 - provider.my_id();
        let num_bits = num_wires * num_simd;
        let share_future = provider.register_for_bits_message(peer, gate_id, num_bits);
        let ot_sender = provider.register_send_xcot_bit(peer, num_bits);
        let ot_receiver = provider.register_receive_xcot_bit(peer, num_bits);
        Ok(Self {
            gate_id,
            provider: Arc::clone(provider),
            num_simd,
            inputs_a,
            inputs_b,
            outputs: fresh_wires(num_wires, num_simd),
            share_future: Some(share_future),
            ot_sender,
            ot_receiver,
            delta_a_share: BitVector::new(),
            delta_b_share: BitVector::new(),
            big_delta_y_share: BitVector::new(),
        })
    }

    /// The output wires of this gate.
    pub fn outputs(&self) -> &[WireRef] {
        &self.outputs
    }
}

#[async_trait(?Send)]
impl<C: Channel> BooleanGate for AndGate<C> {
    fn gate_id(&self) -> u64 {
        self.gate_id
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "and setup");
        let mut big_delta_y_share = BitVector::new();
        for wire_o in &self.outputs {
            let secret_share = BitVector::random(self.num_simd);
            big_delta_y_share.append(&secret_share);
            wire_o.set_secret_share(secret_share);
        }

        let mut delta_a_share = BitVector::new();
        let mut delta_b_share = BitVector::new();
        for (wire_a, wire_b) in self.inputs_a.iter().zip(&self.inputs_b) {
            delta_a_share.append(wire_a.wait_setup().await);
            delta_b_share.append(wire_b.wait_setup().await);
        }

        let mut delta_ab_share = &delta_a_share & &delta_b_share;

        self.ot_receiver.set_choices(delta_a_share.clone())?;
        self.ot_receiver.send_corrections().await?;
        self.ot_sender.set_correlations(delta_b_share.clone())?;
        self.ot_sender.send_messages().await?;
        self.ot_receiver.compute_outputs().await?;
        self.ot_sender.compute_outputs().await?;
        delta_ab_share ^= &self.ot_sender.get_outputs()?;
        delta_ab_share ^= &self.ot_receiver.get_outputs()?;
        big_delta_y_share ^= &delta_ab_share;

        self.delta_a_share = delta_a_share;
        self.delta_b_share = delta_b_share;
        self.big_delta_y_share = big_delta_y_share;
        Ok(())
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        trace!(gate_id = self.gate_id, "and online");
        let mut big_delta_a = BitVector::new();
        let mut big_delta_b = BitVector::new();
        for (wire_a, wire_b) in self.inputs_a.iter().zip(&self.inputs_b) {
            big_delta_a.append(wire_a.wait_online().await);
            big_delta_b.append(wire_b.wait_online().await);
        }

        let mut big_delta_y_share = mem::take(&mut self.big_delta_y_share);
        big_delta_y_share ^= &(&big_delta_a & &self.delta_b_share);
        big_delta_y_share ^= &(&big_delta_b & &self.delta_a_share);
        // the public product term must enter the sum exactly once
        if self.provider.is_my_job(self.gate_id) {
            big_delta_y_share ^= &(&big_delta_a & &big_delta_b);
        }

        self.provider
            .broadcast_bits_message(self.gate_id, &big_delta_y_share)
            .await?;
        let peer_share = self
            .share_future
            .take()
            .ok_or(Error::ProtocolFailure)?
            .recv()
            .await?;
        big_delta_y_share ^= &peer_share;

        for (i, wire_o) in self.outputs.iter().enumerate() {
            wire_o.set_public_share(
                big_delta_y_share.subset(i * self.num_simd, (i + 1) * self.num_simd),
            );
        }
        Ok(())
    }
}

/// Constructs the input gate for `input_owner`'s input at the calling
/// party, returning the boxed gate, the input promise (at the owner only)
/// and the output wires.
pub fn input_gate<C: Channel + 'static>(
    provider: &Arc<Provider<C>>,
    input_owner: usize,
    num_wires: usize,
    num_simd: usize,
) -> Result<
    (
        Box<dyn BooleanGate>,
        Option<oneshot::Sender<Vec<BitVector>>>,
        Vec<WireRef>,
    ),
    Error,
> {
    if input_owner == provider.my_id() {
        let (gate, promise) = InputGateSender::new(provider, num_wires, num_simd)?;
        let outputs = gate.outputs().to_vec();
        Ok((Box::new(gate), Some(promise), outputs))
    } else {
        let gate = InputGateReceiver::new(provider, input_owner, num_wires, num_simd)?;
        let outputs = gate.outputs().to_vec();
        Ok((Box::new(gate), None, outputs))
    }
}

/// Constructs an output gate, returning the boxed gate and, at recipients,
/// the future resolving to the cleartext outputs.
pub fn output_gate<C: Channel + 'static>(
    provider: &Arc<Provider<C>>,
    inputs: Vec<WireRef>,
    output_owner: usize,
) -> Result<
    (
        Box<dyn BooleanGate>,
        Option<oneshot::Receiver<Vec<BitVector>>>,
    ),
    Error,
> {
    let mut gate = OutputGate::new(provider, inputs, output_owner)?;
    let future = match gate.get_output_future() {
        Ok(future) => Some(future),
        Err(Error::NotMyOutput) => None,
        Err(e) => return Err(e),
    };
    Ok((Box::new(gate), future))
}

/// Constructs an XOR gate, returning the boxed gate and its output wires.
pub fn xor_gate<C: Channel + 'static>(
    provider: &Arc<Provider<C>>,
    inputs_a: Vec<WireRef>,
    inputs_b: Vec<WireRef>,
) -> Result<(Box<dyn BooleanGate>, Vec<WireRef>), Error> {
    let gate = XorGate::new(provider.as_ref(), inputs_a, inputs_b)?;
    let outputs = gate.outputs().to_vec();
    Ok((Box::new(gate), outputs))
}

/// Constructs a NOT gate, returning the boxed gate and its output wires.
pub fn inv_gate<C: Channel + 'static>(
    provider: &Arc<Provider<C>>,
    inputs: Vec<WireRef>,
) -> Result<(Box<dyn BooleanGate>, Vec<WireRef>), Error> {
    let gate = InvGate::new(provider.as_ref(), inputs)?;
    let outputs = gate.outputs().to_vec();
    Ok((Box::new(gate), outputs))
}

/// Constructs an AND gate, returning the boxed gate and its output wires.
pub fn and_gate<C: Channel + 'static>(
    provider: &Arc<Provider<C>>,
    inputs_a: Vec<WireRef>,
    inputs_b: Vec<WireRef>,
) -> Result<(Box<dyn BooleanGate>, Vec<WireRef>), Error> {
    let gate = AndGate::new(provider, inputs_a, inputs_b)?;
    let outputs = gate.outputs().to_vec();
    Ok((Box::new(gate), outputs))
}
