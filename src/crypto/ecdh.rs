// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ephemeral X25519 key agreement with HKDF-SHA256 derivation, the `curve25519-hkdf-sha256`
//! protocol of the SAS method.
use base64ct::{Base64Unpadded, Encoding};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{Rng, RngError};

/// Number of bytes the short authentication string is derived from.
pub const SAS_BYTES_LEN: usize = 6;

const MAC_KEY_LEN: usize = 32;

/// One ephemeral key agreement, owned by a single SAS engine.
///
/// The secret half is consumed by [`EcdhExchange::establish`] and the resulting shared secret is
/// zeroized on drop; [`EcdhExchange::release`] drops all secret material early without consuming
/// the exchange.
pub(crate) struct EcdhExchange {
    secret: Option<StaticSecret>,
    public: PublicKey,
    shared: Option<SharedBytes>,
}

#[derive(ZeroizeOnDrop)]
struct SharedBytes([u8; 32]);

impl EcdhExchange {
    pub fn new(rng: &Rng) -> Result<Self, EcdhError> {
        let secret = StaticSecret::from(rng.random_array::<32>()?);
        let public = PublicKey::from(&secret);
        Ok(Self {
            secret: Some(secret),
            public,
            shared: None,
        })
    }

    /// Our ephemeral public key, unpadded base64.
    pub fn public_key(&self) -> String {
        Base64Unpadded::encode_string(self.public.as_bytes())
    }

    /// Runs the Diffie-Hellman step against the peer's public key (unpadded base64), consuming
    /// our secret half.
    pub fn establish(&mut self, their_key: &str) -> Result<(), EcdhError> {
        let bytes: [u8; 32] = Base64Unpadded::decode_vec(their_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(EcdhError::MalformedPublicKey)?;
        let secret = self.secret.take().ok_or(EcdhError::Released)?;
        let shared = secret.diffie_hellman(&PublicKey::from(bytes));
        self.shared = Some(SharedBytes(*shared.as_bytes()));
        Ok(())
    }

    /// Derives `out.len()` bytes from the shared secret via HKDF-SHA256 (no salt) under the
    /// given info string.
    pub fn derive_bytes(&self, info: &str, out: &mut [u8]) -> Result<(), EcdhError> {
        let shared = self.shared.as_ref().ok_or(EcdhError::NotEstablished)?;
        let hkdf = Hkdf::<Sha256>::new(None, &shared.0);
        hkdf.expand(info.as_bytes(), out)
            .expect("output length is within hkdf bounds");
        Ok(())
    }

    /// HMAC-SHA256 of `input` under a 32-byte key derived from the shared secret and the info
    /// string; returned as unpadded base64.
    pub fn calculate_mac(&self, input: &str, info: &str) -> Result<String, EcdhError> {
        let mut key = [0u8; MAC_KEY_LEN];
        self.derive_bytes(info, &mut key)?;
        let mut hmac =
            Hmac::<Sha256>::new_from_slice(&key).expect("hmac accepts any key length");
        hmac.update(input.as_bytes());
        let mac = Base64Unpadded::encode_string(&hmac.finalize().into_bytes());
        key.zeroize();
        Ok(mac)
    }

    /// Drops all secret material. Idempotent.
    pub fn release(&mut self) {
        self.secret = None;
        self.shared = None;
    }
}

impl std::fmt::Debug for EcdhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhExchange")
            .field("public", &self.public_key())
            .field("established", &self.shared.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub(crate) enum EcdhError {
    #[error("peer public key is not a valid base64 curve25519 key")]
    MalformedPublicKey,

    #[error("key agreement has not been established yet")]
    NotEstablished,

    #[error("key agreement secret material was already released")]
    Released,

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (EcdhExchange, EcdhExchange) {
        let mut ours = EcdhExchange::new(&Rng::from_seed([1; 32])).unwrap();
        let mut theirs = EcdhExchange::new(&Rng::from_seed([2; 32])).unwrap();
        let our_key = ours.public_key();
        let their_key = theirs.public_key();
        ours.establish(&their_key).unwrap();
        theirs.establish(&our_key).unwrap();
        (ours, theirs)
    }

    #[test]
    fn both_sides_derive_identical_bytes() {
        let (ours, theirs) = established_pair();
        let mut a = [0u8; SAS_BYTES_LEN];
        let mut b = [0u8; SAS_BYTES_LEN];
        ours.derive_bytes("INFO", &mut a).unwrap();
        theirs.derive_bytes("INFO", &mut b).unwrap();
        assert_eq!(a, b);

        ours.derive_bytes("OTHER", &mut a).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mac_is_symmetric_for_fixed_info() {
        let (ours, theirs) = established_pair();
        let info = "MATRIX_KEY_VERIFICATION_MAC@alice:xDEVA@bob:xDEVBtxnKEY_IDS";
        let a = ours.calculate_mac("ed25519:DEVA", info).unwrap();
        let b = theirs.calculate_mac("ed25519:DEVA", info).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn release_drops_secret_material() {
        let (mut ours, _) = established_pair();
        ours.release();
        let mut out = [0u8; SAS_BYTES_LEN];
        assert!(matches!(
            ours.derive_bytes("INFO", &mut out),
            Err(EcdhError::NotEstablished)
        ));
        assert!(matches!(
            ours.establish("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            Err(EcdhError::Released)
        ));
    }

    #[test]
    fn malformed_peer_key_is_rejected() {
        let mut ours = EcdhExchange::new(&Rng::from_seed([3; 32])).unwrap();
        assert!(matches!(
            ours.establish("not base64!"),
            Err(EcdhError::MalformedPublicKey)
        ));
        // The secret must survive a rejected peer key.
        let mut theirs = EcdhExchange::new(&Rng::from_seed([4; 32])).unwrap();
        let their_key = theirs.public_key();
        theirs.establish(&ours.public_key()).unwrap();
        ours.establish(&their_key).unwrap();
    }
}
