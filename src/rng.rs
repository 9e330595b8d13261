//! Correlated randomness shared between pairs of parties.
//!
//! During setup, every ordered pair of parties agrees on a 256-bit seed; the
//! party that generated the seed calls the resulting stream "mine", the
//! party that received it calls the same stream "theirs". Both sides expand
//! the seed into an identical deterministic bit stream, so a value one party
//! derives from the stream never has to be transmitted: the other party can
//! derive the exact same bits locally.

use futures::future::{try_join, try_join_all};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::bitvec::BitVector;
use crate::channel::{recv_frame, send_frame, Channel};
use crate::Error;

/// The message tag reserved for the one-time seed exchange.
pub(crate) const SEED_EXCHANGE_ID: u64 = u64::MAX;

/// A deterministic, seekable stream of bits shared with one peer.
///
/// `get_bits` is pure: it derives the requested range from the stored seed
/// on every call, so concurrent callers reading disjoint ranges never
/// contend on shared state.
#[derive(Debug, Clone)]
pub struct SharedRandomness {
    seed: [u8; 32],
}

impl SharedRandomness {
    /// Creates the stream from an agreed-upon seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Returns bits `[bit_offset, bit_offset + len)` of the stream.
    ///
    /// Identical arguments yield identical bits on both sides of the pair.
    pub fn get_bits(&self, bit_offset: u64, len: usize) -> BitVector {
        if len == 0 {
            return BitVector::new();
        }
        // ChaCha20 is seekable in 32-bit words; start at the word containing
        // the first requested bit and trim the lead-in afterwards.
        let first_word = bit_offset / 32;
        let end_byte = (bit_offset + len as u64).div_ceil(8);
        let mut rng = ChaCha20Rng::from_seed(self.seed);
        rng.set_word_pos(first_word as u128);
        let num_bytes = (end_byte - first_word * 4) as usize;
        let mut buf = vec![0u8; num_bytes];
        rng.fill_bytes(&mut buf);
        let lead_in = (bit_offset - first_word * 32) as usize;
        BitVector::from_bytes(&buf, num_bytes * 8).subset(lead_in, lead_in + len)
    }
}

/// Performs the pairwise seed exchange with every peer.
///
/// Returns `(mine, theirs)`, indexed by party id: `mine[p]` is the stream
/// this party generated for peer `p`, `theirs[p]` the stream peer `p`
/// generated for this party. The own index holds `None` in both.
pub(crate) async fn exchange_seeds<C: Channel>(
    channel: &C,
    my_id: usize,
    num_parties: usize,
) -> Result<(Vec<Option<SharedRandomness>>, Vec<Option<SharedRandomness>>), Error> {
    let seeds: Vec<[u8; 32]> = (0..num_parties).map(|_| rand::random()).collect();
    let sends = (0..num_parties).filter(|p| *p != my_id).map(|p| {
        let payload = BitVector::from_bytes(&seeds[p], 256);
        async move {
            send_frame(channel, p, SEED_EXCHANGE_ID, &payload).await?;
            Ok::<(), Error>(())
        }
    });
    let recvs = (0..num_parties)
        .filter(|p| *p != my_id)
        .map(|p| async move {
            // a peer disappearing before the handshake is done cannot be
            // a finished peer
            let frame = recv_frame(channel, p)
                .await?
                .ok_or(Error::ProtocolFailure)?;
            if frame.id != SEED_EXCHANGE_ID {
                return Err(Error::UnregisteredMessage {
                    party: p,
                    id: frame.id,
                });
            }
            if frame.payload.len() != 256 {
                return Err(Error::SizeMismatch {
                    expected: 256,
                    actual: frame.payload.len(),
                });
            }
            Ok((p, frame.payload))
        });
    let (_, received) = try_join(try_join_all(sends), try_join_all(recvs)).await?;

    let mut mine = vec![None; num_parties];
    let mut theirs = vec![None; num_parties];
    for p in (0..num_parties).filter(|p| *p != my_id) {
        mine[p] = Some(SharedRandomness::from_seed(seeds[p]));
    }
    for (p, payload) in received {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&payload.to_bytes());
        theirs[p] = Some(SharedRandomness::from_seed(seed));
    }
    Ok((mine, theirs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bits() {
        let a = SharedRandomness::from_seed([7; 32]);
        let b = SharedRandomness::from_seed([7; 32]);
        assert_eq!(a.get_bits(17, 100), b.get_bits(17, 100));
        assert_ne!(a.get_bits(0, 100), b.get_bits(100, 100));
    }

    #[test]
    fn seeking_matches_sequential_reads() {
        let rng = SharedRandomness::from_seed([42; 32]);
        let all = rng.get_bits(0, 256);
        let mut pieced = rng.get_bits(0, 13);
        pieced.append(&rng.get_bits(13, 51));
        pieced.append(&rng.get_bits(64, 192));
        assert_eq!(all, pieced);
        assert_eq!(rng.get_bits(37, 21), all.subset(37, 58));
    }
}
