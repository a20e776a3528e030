// SPDX-License-Identifier: MIT OR Apache-2.0

//! State machine for one `m.sas.v1` run inside a verification attempt.
//!
//! The engine is synchronous and transport-free. It consumes accept, key and mac steps (both the
//! peer's and the local echoes of our own) plus the two user decisions, and emits the steps to
//! send next. Protocol violations come back as [`Refusal`]s; the owning attempt turns those into
//! an outbound cancel.
use std::collections::BTreeMap;

use tracing::debug;

use crate::crypto::{
    CommitmentError, EcdhError, EcdhExchange, Rng, SAS_BYTES_LEN, constant_time_str_eq,
    start_commitment,
};
use crate::identifiers::{DeviceId, UserId};
use crate::sas::SasCodes;
use crate::sas::emoji::SasEmoji;
use crate::step::{
    AcceptContent, CancelCode, DoneContent, HASH_ALGORITHM, KEY_AGREEMENT_PROTOCOL, KeyContent,
    MAC_ALGORITHM, MacContent, Refusal, ShortAuthenticationString, StepContent,
    VerificationMethod, VerificationStep,
};

/// Observable progress of the SAS sub-protocol.
///
/// `own` distinguishes whether it was our step or the peer's that moved the run into the state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SasState {
    /// Start has been exchanged; the accepting side has not answered yet.
    AwaitingAccept,
    /// Parameters are agreed and committed; ephemeral keys are outstanding.
    Accepted { own: bool },
    /// One of the two ephemeral public keys has been seen.
    AwaitingKeys { own: bool },
    /// Both short codes are derived and wait for the users' comparison.
    ComparisonReady {
        decimal: [u16; 3],
        emoji: [SasEmoji; 7],
    },
    /// At least one side confirmed a match; MACs are outstanding.
    AwaitingMacs { own: bool },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EngineState {
    AwaitingAccept,
    Accepted { own: bool },
    AwaitingKeys { own: bool },
    ComparisonReady,
    AwaitingMacs { own: bool },
    Finished,
}

impl EngineState {
    fn name(&self) -> &'static str {
        match self {
            Self::AwaitingAccept => "awaiting accept",
            Self::Accepted { .. } => "accepted",
            Self::AwaitingKeys { .. } => "awaiting keys",
            Self::ComparisonReady => "comparison ready",
            Self::AwaitingMacs { .. } => "awaiting macs",
            Self::Finished => "finished",
        }
    }
}

/// Steps to send and side-effects to apply after the engine consumed an input.
#[derive(Debug, Default)]
pub(crate) struct EngineOutput {
    pub outgoing: Vec<StepContent>,
    /// Peer key ids whose MACs checked out against locally known key material.
    pub verified_keys: Vec<String>,
    /// Set once the mutual MAC exchange completed successfully.
    pub finished: bool,
}

/// One run of the SAS method between a fixed pair of devices.
///
/// Constructed from the winning start step; released (all secret material dropped) when the run
/// finishes or the attempt terminates.
#[derive(Debug)]
pub(crate) struct SasEngine {
    we_started: bool,
    own_user: UserId,
    own_device: DeviceId,
    their_user: UserId,
    their_device: DeviceId,
    start: VerificationStep,
    state: EngineState,
    exchange: EcdhExchange,
    our_key_sent: bool,
    their_key: Option<String>,
    their_commitment: Option<String>,
    mac_algorithm: Option<String>,
    their_mac: Option<MacContent>,
    our_mac_sent: bool,
    codes: Option<SasCodes>,
}

impl SasEngine {
    /// Validates the start parameters and sets up the ephemeral key agreement. When we are the
    /// accepting side the output carries the accept step with our commitment.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start: VerificationStep,
        we_started: bool,
        own_user: UserId,
        own_device: DeviceId,
        their_user: UserId,
        their_device: DeviceId,
        rng: &Rng,
    ) -> Result<(Self, EngineOutput), Refusal> {
        let StepContent::Start(content) = &start.content else {
            return Err(Refusal::new(
                CancelCode::InternalError,
                "sas run constructed from a non-start step",
            ));
        };

        if content.method != VerificationMethod::Sas {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                format!("verification method \"{}\" is not supported", content.method),
            ));
        }
        if !content
            .key_agreement_protocols
            .iter()
            .any(|protocol| protocol == KEY_AGREEMENT_PROTOCOL)
        {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                format!("no common key agreement protocol, peer offers {:?}", content.key_agreement_protocols),
            ));
        }
        if !content.hashes.iter().any(|hash| hash == HASH_ALGORITHM) {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                "peer does not support sha256 commitments",
            ));
        }
        if !we_started
            && !content
                .message_authentication_codes
                .iter()
                .any(|mac| mac == MAC_ALGORITHM)
        {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                "peer does not support hkdf-hmac-sha256 key attestation",
            ));
        }
        let sas_modes: Vec<ShortAuthenticationString> = content
            .short_authentication_string
            .iter()
            .filter(|mode| {
                matches!(
                    mode,
                    ShortAuthenticationString::Decimal | ShortAuthenticationString::Emoji
                )
            })
            .cloned()
            .collect();
        if sas_modes.is_empty() {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                "no common short authentication string mode",
            ));
        }

        let exchange = EcdhExchange::new(rng)?;
        let mut output = EngineOutput::default();
        if !we_started {
            let commitment = start_commitment(&exchange.public_key(), &start)?;
            output.outgoing.push(StepContent::Accept(AcceptContent {
                method: VerificationMethod::Sas,
                key_agreement_protocol: KEY_AGREEMENT_PROTOCOL.to_owned(),
                hash: HASH_ALGORITHM.to_owned(),
                message_authentication_code: MAC_ALGORITHM.to_owned(),
                short_authentication_string: sas_modes,
                commitment,
            }));
        }

        Ok((
            Self {
                we_started,
                own_user,
                own_device,
                their_user,
                their_device,
                start,
                state: EngineState::AwaitingAccept,
                exchange,
                our_key_sent: false,
                their_key: None,
                their_commitment: None,
                mac_algorithm: None,
                their_mac: None,
                our_mac_sent: false,
                codes: None,
            },
            output,
        ))
    }

    /// Whether the user can currently decide on the comparison.
    pub fn can_confirm(&self) -> bool {
        !self.our_mac_sent
            && matches!(
                self.state,
                EngineState::ComparisonReady | EngineState::AwaitingMacs { own: false }
            )
    }

    pub fn public_state(&self) -> SasState {
        match self.state {
            EngineState::AwaitingAccept => SasState::AwaitingAccept,
            EngineState::Accepted { own } => SasState::Accepted { own },
            EngineState::AwaitingKeys { own } => SasState::AwaitingKeys { own },
            EngineState::ComparisonReady => {
                let codes = self
                    .codes
                    .as_ref()
                    .expect("codes are derived before entering comparison");
                SasState::ComparisonReady {
                    decimal: codes.decimal,
                    emoji: codes.emoji,
                }
            }
            EngineState::AwaitingMacs { own } => SasState::AwaitingMacs { own },
            EngineState::Finished => SasState::AwaitingMacs { own: true },
        }
    }

    /// Consumes an accept step. Our own echo only advances the state; the peer's accept fixes
    /// the negotiated parameters, stores the commitment and triggers sending our public key.
    pub fn on_accept(
        &mut self,
        content: &AcceptContent,
        own: bool,
    ) -> Result<EngineOutput, Refusal> {
        if self.state != EngineState::AwaitingAccept {
            return Err(Refusal::unexpected("accept", self.state.name()));
        }
        // Only the side that did not start sends an accept.
        if own == self.we_started {
            return Err(Refusal::unexpected("accept", self.state.name()));
        }

        if own {
            self.mac_algorithm = Some(content.message_authentication_code.clone());
            self.state = EngineState::Accepted { own: true };
            return Ok(EngineOutput::default());
        }

        if content.key_agreement_protocol != KEY_AGREEMENT_PROTOCOL {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                format!(
                    "accepted key agreement protocol \"{}\" is not supported",
                    content.key_agreement_protocol
                ),
            ));
        }
        if content.hash != HASH_ALGORITHM {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                format!("accepted hash \"{}\" is not supported", content.hash),
            ));
        }
        if !content.short_authentication_string.iter().any(|mode| {
            matches!(
                mode,
                ShortAuthenticationString::Decimal | ShortAuthenticationString::Emoji
            )
        }) {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                "no common short authentication string mode accepted",
            ));
        }

        self.their_commitment = Some(content.commitment.clone());
        self.mac_algorithm = Some(content.message_authentication_code.clone());
        self.state = EngineState::Accepted { own: false };

        Ok(EngineOutput {
            outgoing: vec![StepContent::Key(KeyContent {
                key: self.exchange.public_key(),
            })],
            ..EngineOutput::default()
        })
    }

    /// Consumes a key step. The peer's key is checked against the commitment (when we started)
    /// and completes the key agreement; once both keys have been seen the short codes are
    /// derived.
    pub fn on_key(&mut self, content: &KeyContent, own: bool) -> Result<EngineOutput, Refusal> {
        match self.state {
            EngineState::Accepted { .. } | EngineState::AwaitingKeys { .. } => {}
            other => return Err(Refusal::unexpected("key", other.name())),
        }

        let mut output = EngineOutput::default();
        if own {
            if self.our_key_sent {
                return Err(Refusal::unexpected("key", self.state.name()));
            }
            self.our_key_sent = true;
        } else {
            if self.their_key.is_some() {
                return Err(Refusal::unexpected("key", self.state.name()));
            }
            if self.we_started {
                let commitment = self
                    .their_commitment
                    .as_ref()
                    .ok_or_else(|| {
                        Refusal::new(CancelCode::InternalError, "accept commitment missing")
                    })?
                    .clone();
                let computed = start_commitment(&content.key, &self.start)?;
                if !constant_time_str_eq(&computed, &commitment) {
                    return Err(Refusal::new(
                        CancelCode::MismatchedCommitment,
                        "peer public key does not match its earlier commitment",
                    ));
                }
            }
            self.exchange.establish(&content.key).map_err(|err| match err {
                EcdhError::MalformedPublicKey => Refusal::new(
                    CancelCode::UnexpectedMessage,
                    "peer sent a malformed ephemeral public key",
                ),
                other => other.into(),
            })?;
            self.their_key = Some(content.key.clone());
            if !self.our_key_sent {
                output.outgoing.push(StepContent::Key(KeyContent {
                    key: self.exchange.public_key(),
                }));
            }
        }

        if self.our_key_sent && self.their_key.is_some() {
            self.derive_codes()?;
        } else {
            self.state = EngineState::AwaitingKeys { own };
        }
        Ok(output)
    }

    /// The local user confirmed the codes match. Emits our mac step attesting the given own
    /// identity keys.
    pub fn confirm_match(
        &mut self,
        own_keys: &BTreeMap<String, String>,
    ) -> Result<EngineOutput, Refusal> {
        if !self.can_confirm() {
            return Err(Refusal::unexpected("confirmation", self.state.name()));
        }
        let algorithm = self
            .mac_algorithm
            .as_deref()
            .ok_or_else(|| Refusal::new(CancelCode::InternalError, "mac algorithm not agreed"))?;
        if algorithm != MAC_ALGORITHM {
            return Err(Refusal::new(
                CancelCode::UnknownMethod,
                format!("mac algorithm \"{algorithm}\" is not supported"),
            ));
        }
        if own_keys.is_empty() {
            return Err(Refusal::new(
                CancelCode::InternalError,
                "no own identity keys available to attest",
            ));
        }

        let info = self.mac_info(
            &self.own_user,
            &self.own_device,
            &self.their_user,
            &self.their_device,
        );
        let mut mac = BTreeMap::new();
        for (key_id, key) in own_keys {
            mac.insert(
                key_id.clone(),
                self.exchange.calculate_mac(key, &format!("{info}{key_id}"))?,
            );
        }
        // `BTreeMap` iterates in sorted key order.
        let key_ids = own_keys.keys().cloned().collect::<Vec<_>>().join(",");
        let keys = self
            .exchange
            .calculate_mac(&key_ids, &format!("{info}KEY_IDS"))?;

        Ok(EngineOutput {
            outgoing: vec![StepContent::Mac(MacContent { keys, mac })],
            ..EngineOutput::default()
        })
    }

    /// The local user declared the codes different.
    pub fn reject_match(&mut self) -> Result<Refusal, Refusal> {
        if !self.can_confirm() {
            return Err(Refusal::unexpected("rejection", self.state.name()));
        }
        self.release();
        Ok(Refusal::new(
            CancelCode::MismatchedSas,
            "the short authentication strings do not match",
        ))
    }

    /// Consumes a mac step. Once both our echo and the peer's mac have been seen the peer's
    /// attestation is cross-checked against `their_known_keys` and the run finishes.
    pub fn on_mac(
        &mut self,
        content: &MacContent,
        own: bool,
        their_known_keys: &BTreeMap<String, String>,
    ) -> Result<EngineOutput, Refusal> {
        match self.state {
            EngineState::ComparisonReady | EngineState::AwaitingMacs { .. } => {}
            other => return Err(Refusal::unexpected("mac", other.name())),
        }

        if own {
            if self.our_mac_sent {
                return Err(Refusal::unexpected("mac", self.state.name()));
            }
            self.our_mac_sent = true;
            self.state = EngineState::AwaitingMacs { own: true };
        } else {
            if self.their_mac.is_some() {
                return Err(Refusal::unexpected("mac", self.state.name()));
            }
            self.their_mac = Some(content.clone());
            if !self.our_mac_sent {
                self.state = EngineState::AwaitingMacs { own: false };
            }
        }

        if self.our_mac_sent && self.their_mac.is_some() {
            return self.finish(their_known_keys);
        }
        Ok(EngineOutput::default())
    }

    /// Drops all secret material held by this run. Idempotent.
    pub fn release(&mut self) {
        self.exchange.release();
    }

    fn derive_codes(&mut self) -> Result<(), Refusal> {
        let info = self.sas_info()?;
        let mut bytes = [0u8; SAS_BYTES_LEN];
        self.exchange.derive_bytes(&info, &mut bytes)?;
        self.codes = Some(SasCodes::from_bytes(&bytes));
        self.state = EngineState::ComparisonReady;
        debug!("short authentication codes derived");
        Ok(())
    }

    /// Info string for deriving the short code bytes; the starting party comes first.
    fn sas_info(&self) -> Result<String, Refusal> {
        let our_key = self.exchange.public_key();
        let their_key = self
            .their_key
            .as_deref()
            .ok_or_else(|| Refusal::new(CancelCode::InternalError, "peer public key missing"))?;
        let ours = (&self.own_user, &self.own_device, our_key.as_str());
        let theirs = (&self.their_user, &self.their_device, their_key);
        let (first, second) = if self.we_started {
            (ours, theirs)
        } else {
            (theirs, ours)
        };
        Ok(format!(
            "MATRIX_KEY_VERIFICATION_SAS|{}|{}|{}|{}|{}|{}|{}",
            first.0,
            first.1,
            first.2,
            second.0,
            second.1,
            second.2,
            self.start.transaction.id_str(),
        ))
    }

    /// Base info string for MAC calculation, from the attesting party's point of view.
    fn mac_info(
        &self,
        sender_user: &UserId,
        sender_device: &DeviceId,
        receiver_user: &UserId,
        receiver_device: &DeviceId,
    ) -> String {
        format!(
            "MATRIX_KEY_VERIFICATION_MAC{sender_user}{sender_device}{receiver_user}{receiver_device}{transaction}",
            transaction = self.start.transaction.id_str(),
        )
    }

    fn finish(
        &mut self,
        their_known_keys: &BTreeMap<String, String>,
    ) -> Result<EngineOutput, Refusal> {
        let their_mac = self
            .their_mac
            .take()
            .ok_or_else(|| Refusal::new(CancelCode::InternalError, "peer mac missing"))?;
        let info = self.mac_info(
            &self.their_user,
            &self.their_device,
            &self.own_user,
            &self.own_device,
        );

        let key_ids = their_mac.mac.keys().cloned().collect::<Vec<_>>().join(",");
        let expected = self
            .exchange
            .calculate_mac(&key_ids, &format!("{info}KEY_IDS"))?;
        if !constant_time_str_eq(&expected, &their_mac.keys) {
            return Err(Refusal::new(
                CancelCode::KeyMismatch,
                "mac over the attested key ids does not match",
            ));
        }

        let mut verified_keys = Vec::new();
        for (key_id, claimed) in &their_mac.mac {
            // Keys we cannot resolve locally cannot be cross-checked; they are skipped rather
            // than failed.
            let Some(known) = their_known_keys.get(key_id) else {
                debug!(%key_id, "skipping attested key without local key material");
                continue;
            };
            let computed = self
                .exchange
                .calculate_mac(known, &format!("{info}{key_id}"))?;
            if !constant_time_str_eq(&computed, claimed) {
                return Err(Refusal::new(
                    CancelCode::KeyMismatch,
                    format!("mac for key \"{key_id}\" does not match"),
                ));
            }
            verified_keys.push(key_id.clone());
        }

        self.state = EngineState::Finished;
        self.release();
        debug!("sas run finished, key attestation verified");

        Ok(EngineOutput {
            outgoing: vec![StepContent::Done(DoneContent {})],
            verified_keys,
            finished: true,
        })
    }
}

impl From<EcdhError> for Refusal {
    fn from(err: EcdhError) -> Self {
        Self::new(CancelCode::InternalError, err.to_string())
    }
}

impl From<CommitmentError> for Refusal {
    fn from(err: CommitmentError) -> Self {
        Self::new(CancelCode::InternalError, err.to_string())
    }
}
