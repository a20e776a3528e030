// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory collaborator fakes for tests and examples.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::identifiers::{DeviceId, UserId};
use crate::step::VerificationStep;
use crate::traits::{DeviceKeyStore, KeyStoreError, SendError, StepSender, TrustStore};

/// Step sender that queues outbound steps instead of putting them on a wire.
///
/// Tests drain the outbox explicitly and relay the steps to both attempts themselves, which
/// keeps delivery order and interleaving under test control.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    outbox: Mutex<VecDeque<VerificationStep>>,
    fail_sending: Mutex<bool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All steps sent since the last drain, in send order.
    pub fn drain(&self) -> Vec<VerificationStep> {
        self.outbox
            .lock()
            .expect("transport outbox lock")
            .drain(..)
            .collect()
    }

    /// Makes every following send fail.
    pub fn fail_sending(&self) {
        *self.fail_sending.lock().expect("transport flag lock") = true;
    }
}

#[async_trait]
impl StepSender for MemoryTransport {
    async fn send_step(&self, step: &VerificationStep) -> Result<(), SendError> {
        if *self.fail_sending.lock().expect("transport flag lock") {
            return Err(SendError("simulated transport failure".to_owned()));
        }
        self.outbox
            .lock()
            .expect("transport outbox lock")
            .push_back(step.clone());
        Ok(())
    }
}

/// Trust store that records every mark-verified call.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    verified: Mutex<Vec<(UserId, DeviceId, String)>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verified(&self) -> Vec<(UserId, DeviceId, String)> {
        self.verified.lock().expect("trust store lock").clone()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn mark_verified(
        &self,
        user: &UserId,
        device: &DeviceId,
        key_id: &str,
    ) -> Result<(), crate::traits::TrustStoreError> {
        self.verified
            .lock()
            .expect("trust store lock")
            .push((user.clone(), device.clone(), key_id.to_owned()));
        Ok(())
    }
}

/// Device key store backed by a fixed map.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<(UserId, DeviceId), BTreeMap<String, String>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        user: impl Into<UserId>,
        device: impl Into<DeviceId>,
        key_id: impl Into<String>,
        key: impl Into<String>,
    ) {
        self.keys
            .lock()
            .expect("key store lock")
            .entry((user.into(), device.into()))
            .or_default()
            .insert(key_id.into(), key.into());
    }
}

#[async_trait]
impl DeviceKeyStore for MemoryKeyStore {
    async fn device_keys(
        &self,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<BTreeMap<String, String>, KeyStoreError> {
        Ok(self
            .keys
            .lock()
            .expect("key store lock")
            .get(&(user.clone(), device.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
