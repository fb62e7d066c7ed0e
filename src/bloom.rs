//! The interest filter: a fixed 256-bit Bloom vector used to decide whether a
//! node cares about an entity identifier, for both local execution and
//! gossip routing. The hash is pinned to FNV-1a-32 so every implementation
//! in the cluster agrees on bit positions (`spec.md` §9 leaves this an open
//! question; this crate resolves it).

const WIDTH_BITS: usize = 256;
const WIDTH_BYTES: usize = WIDTH_BITS / 8;
const VERSION_BYTE: u8 = 0x01;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn bit_index(key: &str) -> usize {
    (fnv1a_32(key.as_bytes()) as usize) % WIDTH_BITS
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BloomFilter {
    bits: [u8; WIDTH_BYTES],
}

impl BloomFilter {
    pub fn new() -> Self {
        Self { bits: [0u8; WIDTH_BYTES] }
    }

    pub fn set(&mut self, key: &str) {
        let idx = bit_index(key);
        self.bits[idx / 8] |= 1 << (idx % 8);
    }

    pub fn clear(&mut self, key: &str) {
        let idx = bit_index(key);
        self.bits[idx / 8] &= !(1 << (idx % 8));
    }

    pub fn test(&self, key: &str) -> bool {
        let idx = bit_index(key);
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// True if any of `keys` is set. Used by the publish handler to decide
    /// local execution and dispatch intersection.
    pub fn test_any<'a, I: IntoIterator<Item = &'a str>>(&self, keys: I) -> bool {
        keys.into_iter().any(|k| self.test(k))
    }

    /// True if this filter's bit-set has any bit in common with `other`'s —
    /// used when the caller only has the peer's encoded filter, not the raw
    /// identifiers, e.g. deciding whether to dispatch to a peer at all.
    pub fn intersects(&self, other: &BloomFilter) -> bool {
        self.bits.iter().zip(other.bits.iter()).any(|(a, b)| a & b != 0)
    }

    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(WIDTH_BYTES + 1);
        buf.push(VERSION_BYTE);
        buf.extend_from_slice(&self.bits);
        bs58::encode(buf).into_string()
    }

    pub fn decode(encoded: &str) -> Result<Self, BloomDecodeError> {
        let raw = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| BloomDecodeError::Base58(e.to_string()))?;
        let (version, bits) = raw.split_first().ok_or(BloomDecodeError::Empty)?;
        if *version != VERSION_BYTE {
            return Err(BloomDecodeError::UnsupportedVersion(*version));
        }
        if bits.len() != WIDTH_BYTES {
            return Err(BloomDecodeError::WrongLength(bits.len()));
        }
        let mut out = [0u8; WIDTH_BYTES];
        out.copy_from_slice(bits);
        Ok(Self { bits: out })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BloomDecodeError {
    #[error("empty filter payload")]
    Empty,
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("unsupported filter version byte {0:#x}")]
    UnsupportedVersion(u8),
    #[error("expected {WIDTH_BYTES} filter bytes, found {0}")]
    WrongLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_test_is_true() {
        let mut f = BloomFilter::new();
        f.set("hello");
        assert!(f.test("hello"));
    }

    #[test]
    fn clear_then_test_is_false() {
        let mut f = BloomFilter::new();
        f.set("hello");
        f.clear("hello");
        assert!(!f.test("hello"));
    }

    #[test]
    fn round_trip_encode_decode() {
        let mut f = BloomFilter::new();
        f.set("hello");
        f.set("ipfs://xyz");
        let encoded = f.encode();
        let decoded = BloomFilter::decode(&encoded).unwrap();
        assert_eq!(f, decoded);
        assert!(decoded.test("hello"));
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let bad = bs58::encode([0xffu8; WIDTH_BYTES + 1]).into_string();
        assert!(matches!(
            BloomFilter::decode(&bad),
            Err(BloomDecodeError::UnsupportedVersion(0xff))
        ));
    }

    #[test]
    fn intersects_detects_shared_bit() {
        let mut a = BloomFilter::new();
        let mut b = BloomFilter::new();
        a.set("shared-key");
        b.set("shared-key");
        assert!(a.intersects(&b));

        let c = BloomFilter::new();
        assert!(!a.intersects(&c));
    }
}
