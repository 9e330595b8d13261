//! Byte transport between parties.
//!
//! The engine is written against the abstract [`Channel`] trait so that the
//! same protocol code runs over network sockets, in-process queues or any
//! other transport. A channel moves opaque byte messages; the engine frames
//! every message as a tagged bit vector (see [`crate::mux`]) and the sender
//! identity is carried by the connection itself.
//!
//! Receiving distinguishes a cleanly closed connection from a transport
//! failure: end of stream is how a finished peer says goodbye and is
//! reported as `Ok(None)`, while a stall or any other receive failure is an
//! error that aborts the computation.
//!
//! [`SimpleChannel`] wires up all parties of a computation within a single
//! process and is used by the tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{error::Elapsed, timeout};

use crate::bitvec::BitVector;

/// Errors raised while sending, receiving or (de-)serializing messages.
#[derive(Debug, Error)]
pub enum Error {
    /// The message could not be sent over the channel.
    #[error("could not send message to party {party}: {reason}")]
    Send {
        /// The intended recipient.
        party: usize,
        /// The transport-level failure.
        reason: String,
    },
    /// The message could not be received over the channel.
    #[error("could not receive message from party {party}: {reason}")]
    Recv {
        /// The expected sender.
        party: usize,
        /// The transport-level failure.
        reason: String,
    },
    /// The message bytes could not be encoded or decoded.
    #[error("could not encode or decode message: {0}")]
    Serde(String),
}

/// A communication channel used to send/receive messages to/from another
/// party.
///
/// Implementations determine how messages are physically transmitted; the
/// protocol only relies on per-peer FIFO delivery of whole messages.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index.
    // We allow the async_fn_in_trait lint because we don't want to enforce
    // returning Send futures, which would rule out single-threaded
    // transports.
    #[allow(async_fn_in_trait)]
    async fn send_bytes_to(&self, party: usize, msg: Vec<u8>) -> Result<(), Self::SendError>;

    /// Awaits the next message from the party with the given index.
    ///
    /// Returns `Ok(None)` once the peer has cleanly closed its end of the
    /// connection. Every error, including a peer that stalls without
    /// closing, is a transport failure and aborts the computation.
    #[allow(async_fn_in_trait)]
    async fn recv_bytes_from(&self, party: usize) -> Result<Option<Vec<u8>>, Self::RecvError>;
}

/// A message as it travels over a channel: a tag identifying the slot it is
/// destined for and the payload bits.
#[derive(Debug, Deserialize)]
pub(crate) struct Frame {
    pub(crate) id: u64,
    pub(crate) payload: BitVector,
}

#[derive(Serialize)]
struct FrameRef<'a> {
    id: u64,
    payload: &'a BitVector,
}

/// Serializes and sends one tagged bit-vector message.
pub(crate) async fn send_frame(
    channel: &impl Channel,
    party: usize,
    id: u64,
    payload: &BitVector,
) -> Result<(), Error> {
    let bytes = bincode::options()
        .serialize(&FrameRef { id, payload })
        .map_err(|e| Error::Serde(format!("{e:?}")))?;
    channel
        .send_bytes_to(party, bytes)
        .await
        .map_err(|e| Error::Send {
            party,
            reason: format!("{e:?}"),
        })
}

/// Receives and deserializes one tagged bit-vector message; `Ok(None)`
/// signals that the peer has closed its end.
pub(crate) async fn recv_frame(
    channel: &impl Channel,
    party: usize,
) -> Result<Option<Frame>, Error> {
    let bytes = channel
        .recv_bytes_from(party)
        .await
        .map_err(|e| Error::Recv {
            party,
            reason: format!("{e:?}"),
        })?;
    let Some(bytes) = bytes else {
        return Ok(None);
    };
    bincode::options()
        .deserialize(&bytes)
        .map(Some)
        .map_err(|e| Error::Serde(format!("{e:?}")))
}

/// How long a [`SimpleChannel`] receive waits before reporting the peer as
/// stalled. A peer that is merely slow has its frames buffered anyway, so
/// silence this long means it is stuck.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames buffered per direction before senders are backpressured.
const FRAME_BUFFER: usize = 1024;

/// One duplex connection between this party and a single peer.
struct Link {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Link {
    /// Creates the two ends of a connection between two parties.
    fn duplex() -> (Link, Link) {
        let (to_right, from_left) = mpsc::channel(FRAME_BUFFER);
        let (to_left, from_right) = mpsc::channel(FRAME_BUFFER);
        (
            Link {
                tx: to_right,
                rx: Mutex::new(from_right),
            },
            Link {
                tx: to_left,
                rx: Mutex::new(from_left),
            },
        )
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Link")
    }
}

/// An in-memory transport connecting all parties of a computation within a
/// single process.
///
/// Dropping a party's channel closes its connections, which peers observe
/// as end of stream.
#[derive(Debug)]
pub struct SimpleChannel {
    links: Vec<Option<Link>>,
    sent: AtomicU64,
}

impl SimpleChannel {
    /// Connects `parties` parties pairwise; entry `i` of the returned
    /// vector is party `i`'s channel.
    pub fn channels(parties: usize) -> Vec<Self> {
        let mut channels: Vec<Self> = (0..parties)
            .map(|_| SimpleChannel {
                links: (0..parties).map(|_| None).collect(),
                sent: AtomicU64::new(0),
            })
            .collect();
        for a in 0..parties {
            for b in a + 1..parties {
                let (left, right) = Link::duplex();
                channels[a].links[b] = Some(left);
                channels[b].links[a] = Some(right);
            }
        }
        channels
    }

    /// The number of payload bytes this party has handed to the transport.
    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn link(&self, party: usize) -> &Link {
        self.links[party]
            .as_ref()
            .unwrap_or_else(|| panic!("party {party} is not connected"))
    }
}

impl Channel for SimpleChannel {
    type SendError = mpsc::error::SendError<Vec<u8>>;
    type RecvError = Elapsed;

    async fn send_bytes_to(&self, party: usize, msg: Vec<u8>) -> Result<(), Self::SendError> {
        self.sent.fetch_add(msg.len() as u64, Ordering::Relaxed);
        self.link(party).tx.send(msg).await
    }

    async fn recv_bytes_from(&self, party: usize) -> Result<Option<Vec<u8>>, Elapsed> {
        let mut rx = self.link(party).rx.lock().await;
        timeout(RECV_TIMEOUT, rx.recv()).await
    }
}
