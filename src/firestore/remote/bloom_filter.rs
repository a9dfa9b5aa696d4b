use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Wire form of the bloom filter attached to an existence filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterSpec {
    pub bitmap: Vec<u8>,
    /// Unused bits at the end of the bitmap.
    pub padding: u8,
    pub hash_count: i32,
}

/// Probabilistic set of document paths the backend still has for a target.
/// False positives are possible, false negatives are not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u8, hash_count: i32) -> FirestoreResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            bit_count,
            hash_count: hash_count as u32,
        })
    }

    pub fn from_spec(spec: &BloomFilterSpec) -> FirestoreResult<Self> {
        Self::new(spec.bitmap.clone(), spec.padding, spec.hash_count)
    }

    /// Builds a filter holding `values`. Used by servers and tests.
    pub fn build<'a, I>(values: I, bit_count: u64, hash_count: u32) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let byte_len = bit_count.div_ceil(8) as usize;
        let mut filter = Self {
            bitmap: vec![0; byte_len],
            bit_count,
            hash_count,
        };
        if bit_count > 0 {
            for value in values {
                let (hash1, hash2) = hash_pair(value);
                for index in 0..hash_count {
                    let bit = filter.bit_index(hash1, hash2, index);
                    filter.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
                }
            }
        }
        filter
    }

    pub fn to_spec(&self) -> BloomFilterSpec {
        BloomFilterSpec {
            padding: (self.bitmap.len() as u64 * 8 - self.bit_count) as u8,
            bitmap: self.bitmap.clone(),
            hash_count: self.hash_count as i32,
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = hash_pair(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(hash1, hash2, index)))
    }

    fn bit_index(&self, hash1: u64, hash2: u64, index: u32) -> u64 {
        hash1
            .wrapping_add(hash2.wrapping_mul(u64::from(index)))
            % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

/// Two little-endian 64 bit words taken from the digest of `value`.
fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_specs() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![], 1, 1).is_err());
        assert!(BloomFilter::new(vec![0], 0, -1).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert!(!filter.might_contain("projects/p/databases/d/documents/c/a"));
    }

    #[test]
    fn built_filter_contains_its_values() {
        let values = ["c/a", "c/b", "c/c"];
        let filter = BloomFilter::build(values.iter().copied(), 1_000, 7);
        for value in values {
            assert!(filter.might_contain(value));
        }
        let restored = BloomFilter::from_spec(&filter.to_spec()).unwrap();
        assert_eq!(restored, filter);
        assert!(!restored.might_contain("c/zzz-not-inserted"));
    }
}
