// SPDX-License-Identifier: MIT OR Apache-2.0

//! SHA-256 commitment over a start payload.
use base64ct::{Base64Unpadded, Encoding};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::step::VerificationStep;

pub const SHA256_DIGEST_SIZE: usize = 32;

/// SHA2-256 hashing function.
pub(crate) fn sha2_256(messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message);
    }
    let result = hasher.finalize();
    result[..].try_into().expect("sha256 digest size")
}

/// Commitment binding a party to its ephemeral public key and the declared start parameters
/// before the counterparty reveals its own key.
///
/// Computed as `unpadded-base64(sha256(publicKey || canonicalJson(startStep)))` where the
/// canonical JSON is the start step with sorted keys, no whitespace and no event type tag.
pub(crate) fn start_commitment(
    public_key: &str,
    start: &VerificationStep,
) -> Result<String, CommitmentError> {
    let json = canonical_start_json(start)?;
    let digest = sha2_256(&[public_key.as_bytes(), json.as_bytes()]);
    Ok(Base64Unpadded::encode_string(&digest))
}

fn canonical_start_json(start: &VerificationStep) -> Result<String, CommitmentError> {
    let mut value = serde_json::to_value(start)?;
    let object = value.as_object_mut().ok_or(CommitmentError::NotAnObject)?;
    object.remove("type");
    // `serde_json::Map` is backed by a `BTreeMap`, so serializing the value again yields sorted
    // keys; `to_string` produces the compact form.
    Ok(value.to_string())
}

#[derive(Debug, Error)]
pub(crate) enum CommitmentError {
    #[error("start payload could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("start payload did not serialize to a json object")]
    NotAnObject,
}
