// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives backing the SAS handshake: randomness, commitment hashing and the
//! X25519/HKDF key-agreement object.
mod ecdh;
mod hash;
mod rng;

pub use ecdh::SAS_BYTES_LEN;
pub(crate) use ecdh::{EcdhError, EcdhExchange};
pub(crate) use hash::{CommitmentError, start_commitment};
pub use rng::{Rng, RngError};

use subtle::ConstantTimeEq;

/// Constant-time equality for wire-format (base64) hashes and MACs.
pub(crate) fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::constant_time_str_eq;

    #[test]
    fn str_eq() {
        assert!(constant_time_str_eq("abc", "abc"));
        assert!(!constant_time_str_eq("abc", "abd"));
        assert!(!constant_time_str_eq("abc", "abcd"));
    }
}
