//! SHA-256 digests over fixed-width inputs.
//!
//! Consensus objects in this workspace are identified by 32 byte digests of a
//! canonical field encoding rather than full SSZ Merkleization, which is
//! provided by an external library. The helpers here are the only place the
//! hash function is named.

use primitive_types::H256;
use sha2::{Digest as _, Sha256};

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> H256 {
    H256(Sha256::digest(bytes).into())
}

#[must_use]
pub fn hash_pair(left: H256, right: H256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    H256(hasher.finalize().into())
}

#[must_use]
pub fn hash_with_index(seed: H256, index: u64) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(index.to_le_bytes());
    H256(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn hash_bytes_matches_known_sha256_vector() {
        assert_eq!(
            hash_bytes(b"abc"),
            H256(hex!(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            )),
        );
    }

    #[test]
    fn hash_pair_is_order_sensitive() {
        let left = hash_bytes(b"left");
        let right = hash_bytes(b"right");

        assert_ne!(hash_pair(left, right), hash_pair(right, left));
    }
}
