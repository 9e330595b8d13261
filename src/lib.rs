//! MPC engine for Boolean circuits based on a two-phase masked secret
//! sharing, in the style of
//! [ABY2.0](https://eprint.iacr.org/2020/1225)-like protocols.
//!
//! Every wire value `v` is represented as a random mask `delta`, XOR-shared
//! among the parties, plus the public masked value `Delta = v ^ delta`. The
//! input-independent setup phase distributes masks and the correlated
//! randomness needed by AND gates; the online phase then reconstructs the
//! masked values with one short message exchange per interactive gate. XOR
//! and NOT are free of communication.
//!
//! Construction order is part of the protocol: all parties must build the
//! same gates in the same order, which makes gate ids, message tags and the
//! per-gate job assignment agree everywhere without coordination.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod bitvec;
pub mod channel;
pub mod executor;
pub mod gates;
pub mod mux;
pub mod ot;
pub mod provider;
pub mod rng;
pub mod wire;

pub use bitvec::BitVector;
pub use executor::Executor;
pub use provider::{Provider, ALL_PARTIES};

/// A custom error type for the engine's computation and communication.
#[derive(Debug)]
pub enum Error {
    /// The number of provided input bits does not match what the input
    /// gate expects.
    BadInput {
        /// The expected number of elements or bits.
        expected: usize,
        /// The number actually provided.
        actual: usize,
    },
    /// A bit vector had the wrong size for its slot; the peer deviated
    /// from the protocol.
    SizeMismatch {
        /// The registered size in bits.
        expected: usize,
        /// The received size in bits.
        actual: usize,
    },
    /// A second message arrived for an already completed slot.
    DuplicateMessage {
        /// The sending party.
        party: usize,
        /// The message tag.
        id: u64,
    },
    /// A message arrived for which no slot was ever registered.
    UnregisteredMessage {
        /// The sending party.
        party: usize,
        /// The message tag.
        id: u64,
    },
    /// The output future was requested by a party that does not receive
    /// the output.
    NotMyOutput,
    /// The computation was aborted, a stage was driven out of order, or a
    /// pending future was poisoned by an earlier failure.
    ProtocolFailure,
    /// A base-OT message did not decode to a valid curve point.
    InvalidOtPoint,
    /// A gate was constructed without any wires.
    NoWires,
    /// The two input bundles of a binary gate have different wire counts.
    WireCountMismatch {
        /// Wires in the first bundle.
        a: usize,
        /// Wires in the second bundle.
        b: usize,
    },
    /// The wires of a gate carry different numbers of parallel values.
    SimdCountMismatch,
    /// The gate does not support the number of parties of this
    /// computation.
    UnsupportedPartyCount(usize),
    /// The output owner is not a valid party.
    InvalidOutputParty(usize),
    /// The input owner is not a valid peer.
    InvalidInputOwner(usize),
    /// A message could not be sent or received.
    Channel(channel::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadInput { expected, actual } => {
                write!(f, "Wrong input, expected {expected} elements, found {actual}")
            }
            Error::SizeMismatch { expected, actual } => {
                write!(f, "Wrong message size, expected {expected} bits, found {actual}")
            }
            Error::DuplicateMessage { party, id } => {
                write!(f, "Duplicate message from party {party} with tag {id}")
            }
            Error::UnregisteredMessage { party, id } => {
                write!(f, "Unexpected message from party {party} with tag {id}")
            }
            Error::NotMyOutput => f.write_str("This party does not receive the output"),
            Error::ProtocolFailure => f.write_str("The computation was aborted"),
            Error::InvalidOtPoint => f.write_str("Invalid point in base OT message"),
            Error::NoWires => f.write_str("The number of wires must be positive"),
            Error::WireCountMismatch { a, b } => {
                write!(f, "Mismatched wire counts: {a} != {b}")
            }
            Error::SimdCountMismatch => {
                f.write_str("All wires of a gate must carry the same number of values")
            }
            Error::UnsupportedPartyCount(n) => {
                write!(f, "The gate does not support {n} parties")
            }
            Error::InvalidOutputParty(p) => write!(f, "Party {p} is not a valid output party"),
            Error::InvalidInputOwner(p) => write!(f, "Party {p} is not a valid input owner"),
            Error::Channel(e) => write!(f, "Channel error: {e}"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}
