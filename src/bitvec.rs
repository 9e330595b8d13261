//! A dense container of bits, the unit of data every protocol message and
//! every wire share is made of.
//!
//! Bits are stored packed, least-significant bit first within each byte, so
//! the serialized form is exactly the in-memory storage with the unused high
//! bits of the final byte cleared.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitXor, BitXorAssign, Not};

use bitvec::prelude::{BitVec, Lsb0};
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};

/// A sequence of bits with exact length tracking.
///
/// Pointwise operations (`^`, `&`, `!`) require both operands to have the
/// same length; mismatched lengths indicate a bug in the calling code and
/// panic.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawBits", try_from = "RawBits")]
pub struct BitVector {
    bits: BitVec<u8, Lsb0>,
}

impl BitVector {
    /// Creates an empty bit vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bit vector of `len` zero bits.
    pub fn zeros(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    /// Creates a uniformly random bit vector of `len` bits using the
    /// thread-local CSPRNG.
    pub fn random(len: usize) -> Self {
        Self::random_with(&mut thread_rng(), len)
    }

    /// Creates a uniformly random bit vector of `len` bits from `rng`.
    pub fn random_with(rng: &mut impl RngCore, len: usize) -> Self {
        let mut bytes = vec![0u8; len.div_ceil(8)];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(&bytes, len)
    }

    /// Builds a bit vector from packed bytes, keeping the first `len` bits.
    ///
    /// Panics if `bytes` is too short to hold `len` bits.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        assert!(
            bytes.len() * 8 >= len,
            "{} bytes cannot hold {len} bits",
            bytes.len()
        );
        let mut bits = BitVec::from_slice(bytes);
        bits.truncate(len);
        Self { bits }
    }

    /// Returns the packed little-endian bytes, with the unused high bits of
    /// the final byte set to zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.bits.as_raw_slice().to_vec();
        bytes.truncate(self.len().div_ceil(8));
        let tail = self.len() % 8;
        if tail != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= (1u8 << tail) - 1;
            }
        }
        bytes
    }

    /// The number of bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the vector contains no bits.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The bit at position `i`.
    pub fn get(&self, i: usize) -> bool {
        self.bits[i]
    }

    /// Sets the bit at position `i`.
    pub fn set(&mut self, i: usize, value: bool) {
        self.bits.set(i, value);
    }

    /// Appends a single bit.
    pub fn push(&mut self, value: bool) {
        self.bits.push(value);
    }

    /// Appends all bits of `other`, growing this vector by `other.len()`.
    pub fn append(&mut self, other: &BitVector) {
        self.bits.extend_from_bitslice(other.bits.as_bitslice());
    }

    /// Returns the bits in the half-open range `[lo, hi)` as a new vector.
    pub fn subset(&self, lo: usize, hi: usize) -> BitVector {
        Self {
            bits: self.bits[lo..hi].to_bitvec(),
        }
    }

    /// Iterates over the bits from position 0 upward.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().by_vals()
    }

    fn check_len(&self, other: &BitVector) {
        assert_eq!(
            self.len(),
            other.len(),
            "bit vector length mismatch: {} != {}",
            self.len(),
            other.len()
        );
    }
}

impl FromIterator<bool> for BitVector {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        Self {
            bits: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.iter() {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl BitXorAssign<&BitVector> for BitVector {
    fn bitxor_assign(&mut self, rhs: &BitVector) {
        self.check_len(rhs);
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(rhs.bits.as_raw_slice())
        {
            *a ^= *b;
        }
    }
}

impl BitXor<&BitVector> for &BitVector {
    type Output = BitVector;

    fn bitxor(self, rhs: &BitVector) -> BitVector {
        let mut out = self.clone();
        out ^= rhs;
        out
    }
}

impl BitAndAssign<&BitVector> for BitVector {
    fn bitand_assign(&mut self, rhs: &BitVector) {
        self.check_len(rhs);
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(rhs.bits.as_raw_slice())
        {
            *a &= *b;
        }
    }
}

impl BitAnd<&BitVector> for &BitVector {
    type Output = BitVector;

    fn bitand(self, rhs: &BitVector) -> BitVector {
        let mut out = self.clone();
        out &= rhs;
        out
    }
}

impl Not for &BitVector {
    type Output = BitVector;

    fn not(self) -> BitVector {
        let mut out = self.clone();
        for byte in out.bits.as_raw_mut_slice() {
            *byte = !*byte;
        }
        out
    }
}

/// The canonical serialized form: an exact bit count followed by the packed
/// bytes, final byte zero-padded in its high bits.
#[derive(Serialize, Deserialize)]
struct RawBits {
    num_bits: u64,
    bytes: Vec<u8>,
}

impl From<BitVector> for RawBits {
    fn from(bv: BitVector) -> Self {
        RawBits {
            num_bits: bv.len() as u64,
            bytes: bv.to_bytes(),
        }
    }
}

impl TryFrom<RawBits> for BitVector {
    type Error = String;

    fn try_from(raw: RawBits) -> Result<Self, String> {
        let num_bits = raw.num_bits as usize;
        if raw.bytes.len() != num_bits.div_ceil(8) {
            return Err(format!(
                "expected {} bytes for {num_bits} bits, got {}",
                num_bits.div_ceil(8),
                raw.bytes.len()
            ));
        }
        Ok(BitVector::from_bytes(&raw.bytes, num_bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_subset() {
        let mut a: BitVector = [true, false, true].into_iter().collect();
        let b: BitVector = [false, false, true, true].into_iter().collect();
        a.append(&b);
        assert_eq!(a.len(), 7);
        assert_eq!(a.subset(3, 7), b);
        assert_eq!(a.subset(0, 3).iter().collect::<Vec<_>>(), vec![
            true, false, true
        ]);
    }

    #[test]
    fn pointwise_ops() {
        let a: BitVector = [true, true, false, false].into_iter().collect();
        let b: BitVector = [true, false, true, false].into_iter().collect();
        let xor = &a ^ &b;
        let and = &a & &b;
        let not = !&a;
        assert_eq!(xor.iter().collect::<Vec<_>>(), vec![
            false, true, true, false
        ]);
        assert_eq!(and.iter().collect::<Vec<_>>(), vec![
            true, false, false, false
        ]);
        assert_eq!(not.iter().collect::<Vec<_>>(), vec![
            false, false, true, true
        ]);
    }

    #[test]
    #[should_panic]
    fn mismatched_xor_panics() {
        let a = BitVector::zeros(3);
        let b = BitVector::zeros(4);
        let _ = &a ^ &b;
    }

    #[test]
    fn final_byte_is_padded() {
        let mut a = BitVector::from_bytes(&[0xff, 0xff], 11);
        assert_eq!(a.to_bytes(), vec![0xff, 0x07]);
        a = !&a;
        assert_eq!(a.to_bytes(), vec![0x00, 0x00]);
    }

    #[test]
    fn serde_round_trip() {
        use bincode::Options;
        let a = BitVector::random(13);
        let bytes = bincode::options().serialize(&a).unwrap();
        let b: BitVector = bincode::options().deserialize(&bytes).unwrap();
        assert_eq!(a, b);
    }
}
