// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the embedding application.
//!
//! The attempt machine is transport- and storage-agnostic; the application supplies how steps
//! leave the device, where verified keys are recorded and where identity key material comes
//! from.
use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::identifiers::{DeviceId, UserId};
use crate::step::VerificationStep;

/// Puts outbound steps on the wire.
///
/// Every step sent through this sender must also be fed back into the attempt as a local echo
/// via [`Verification::submit_step`](crate::Verification::submit_step).
#[async_trait]
pub trait StepSender: Debug + Send + Sync {
    async fn send_step(&self, step: &VerificationStep) -> Result<(), SendError>;
}

#[derive(Debug, Error)]
#[error("step could not be sent: {0}")]
pub struct SendError(pub String);

/// Records the outcome of successful verifications.
#[async_trait]
pub trait TrustStore: Debug + Send + Sync {
    /// Marks one identity key of the peer device as verified.
    async fn mark_verified(
        &self,
        user: &UserId,
        device: &DeviceId,
        key_id: &str,
    ) -> Result<(), TrustStoreError>;
}

#[derive(Debug, Error)]
#[error("trust store rejected the update: {0}")]
pub struct TrustStoreError(pub String);

/// Source of identity key material, both our own and the locally known copy of the peer's.
#[async_trait]
pub trait DeviceKeyStore: Debug + Send + Sync {
    /// Identity keys of the given device, keyed by key id (`<algorithm>:<device id>`).
    ///
    /// An unknown device yields an empty map.
    async fn device_keys(
        &self,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<BTreeMap<String, String>, KeyStoreError>;
}

#[derive(Debug, Error)]
#[error("device key store failed: {0}")]
pub struct KeyStoreError(pub String);
