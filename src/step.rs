// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire model of verification steps.
//!
//! A step is one protocol message of a verification attempt. The set of steps is a closed tagged
//! union; adding a new step kind means extending [`StepContent`] and updating every match site.
//! Field names and type identifiers follow the Matrix `m.key.verification.*` event family so that
//! transport adapters can put steps on the wire without translation.
use std::collections::BTreeMap;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::identifiers::{DeviceId, Timestamp, TransactionId};

/// The only key agreement protocol this implementation supports.
pub const KEY_AGREEMENT_PROTOCOL: &str = "curve25519-hkdf-sha256";

/// Hash algorithm used for the start-payload commitment.
pub const HASH_ALGORITHM: &str = "sha256";

/// MAC algorithm used for the final key attestation.
pub const MAC_ALGORITHM: &str = "hkdf-hmac-sha256";

/// One protocol message of a verification attempt.
///
/// Immutable; constructed once and never mutated. Every step carries the transaction identifier
/// of the attempt it belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VerificationStep {
    #[serde(flatten)]
    pub transaction: TransactionId,
    #[serde(flatten)]
    pub content: StepContent,
}

impl VerificationStep {
    pub fn new(transaction: TransactionId, content: StepContent) -> Self {
        Self {
            transaction,
            content,
        }
    }
}

/// Step payloads, tagged with their wire event type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepContent {
    #[serde(rename = "m.key.verification.request")]
    Request(RequestContent),
    #[serde(rename = "m.key.verification.ready")]
    Ready(ReadyContent),
    #[serde(rename = "m.key.verification.start")]
    Start(StartContent),
    #[serde(rename = "m.key.verification.accept")]
    Accept(AcceptContent),
    #[serde(rename = "m.key.verification.key")]
    Key(KeyContent),
    #[serde(rename = "m.key.verification.mac")]
    Mac(MacContent),
    #[serde(rename = "m.key.verification.done")]
    Done(DoneContent),
    #[serde(rename = "m.key.verification.cancel")]
    Cancel(CancelContent),
}

impl StepContent {
    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Ready(_) => "ready",
            Self::Start(_) => "start",
            Self::Accept(_) => "accept",
            Self::Key(_) => "key",
            Self::Mac(_) => "mac",
            Self::Done(_) => "done",
            Self::Cancel(_) => "cancel",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: DeviceId,
    pub methods: Vec<VerificationMethod>,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: DeviceId,
    pub methods: Vec<VerificationMethod>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: DeviceId,
    pub method: VerificationMethod,
    pub key_agreement_protocols: Vec<String>,
    pub hashes: Vec<String>,
    pub message_authentication_codes: Vec<String>,
    pub short_authentication_string: Vec<ShortAuthenticationString>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AcceptContent {
    pub method: VerificationMethod,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    pub commitment: String,
}

/// Carries the sender's ephemeral public key (unpadded base64).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyContent {
    pub key: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MacContent {
    /// MAC over the sorted, comma-joined list of attested key ids.
    pub keys: String,
    /// Per-key MACs, keyed by key id (`ed25519:<device id>`).
    pub mac: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DoneContent {}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CancelContent {
    pub code: CancelCode,
    pub reason: String,
}

/// Verification methods negotiated between the two parties.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum VerificationMethod {
    /// Short Authentication String comparison (`m.sas.v1`).
    Sas,
    /// A method this implementation does not know. Kept so foreign methods survive a
    /// deserialize/serialize round-trip instead of being dropped.
    Unknown(String),
}

impl VerificationMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sas => "m.sas.v1",
            Self::Unknown(other) => other,
        }
    }
}

impl From<&str> for VerificationMethod {
    fn from(value: &str) -> Self {
        match value {
            "m.sas.v1" => Self::Sas,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for VerificationMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VerificationMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

/// Presentation forms of the derived short authentication string.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShortAuthenticationString {
    Decimal,
    Emoji,
    Unknown(String),
}

impl ShortAuthenticationString {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Decimal => "decimal",
            Self::Emoji => "emoji",
            Self::Unknown(other) => other,
        }
    }
}

impl From<&str> for ShortAuthenticationString {
    fn from(value: &str) -> Self {
        match value {
            "decimal" => Self::Decimal,
            "emoji" => Self::Emoji,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl Serialize for ShortAuthenticationString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ShortAuthenticationString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

/// Reasons a verification attempt terminates without success.
///
/// Protocol violations always terminate the attempt with one of these codes; they are never
/// silently ignored and never retried.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The attempt ran out the clock.
    Timeout,
    /// A step referenced a transaction this attempt does not know.
    UnknownTransaction,
    /// A step arrived that is not valid for the current state.
    UnexpectedMessage,
    /// A step arrived from a party that is neither us nor the expected peer.
    UserMismatch,
    /// The peer requested a method, algorithm or protocol we do not support.
    UnknownMethod,
    /// The peer's revealed public key does not match its earlier commitment.
    MismatchedCommitment,
    /// The users decided the short authentication strings do not match.
    MismatchedSas,
    /// A MAC cross-check over the attested identity keys failed.
    KeyMismatch,
    /// A local failure (transport, crypto) forced the attempt to terminate.
    InternalError,
    /// The request was accepted by a different device of the same user.
    Accepted,
    /// A code this implementation does not know.
    Other(String),
}

impl CancelCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "m.user",
            Self::Timeout => "m.timeout",
            Self::UnknownTransaction => "m.unknown_transaction",
            Self::UnexpectedMessage => "m.unexpected_message",
            Self::UserMismatch => "m.user_mismatch",
            Self::UnknownMethod => "m.unknown_method",
            Self::MismatchedCommitment => "m.mismatched_commitment",
            Self::MismatchedSas => "m.mismatched_sas",
            Self::KeyMismatch => "m.key_mismatch",
            Self::InternalError => "m.internal_error",
            Self::Accepted => "m.accepted",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for CancelCode {
    fn from(value: &str) -> Self {
        match value {
            "m.user" => Self::User,
            "m.timeout" => Self::Timeout,
            "m.unknown_transaction" => Self::UnknownTransaction,
            "m.unexpected_message" => Self::UnexpectedMessage,
            "m.user_mismatch" => Self::UserMismatch,
            "m.unknown_method" => Self::UnknownMethod,
            "m.mismatched_commitment" => Self::MismatchedCommitment,
            "m.mismatched_sas" => Self::MismatchedSas,
            "m.key_mismatch" => Self::KeyMismatch,
            "m.internal_error" => Self::InternalError,
            "m.accepted" => Self::Accepted,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for CancelCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CancelCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

/// Internal outcome of a rejected step: the attempt is to be cancelled with this code.
///
/// Protocol violations are not Rust errors; they travel as refusals up to the step pipeline which
/// turns them into an outbound `Cancel` step and a terminal state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Refusal {
    pub code: CancelCode,
    pub reason: String,
}

impl Refusal {
    pub fn new(code: CancelCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Step is not valid for the current (sub-)state; names the state for diagnostics.
    pub fn unexpected(step: &str, state: &str) -> Self {
        Self::new(
            CancelCode::UnexpectedMessage,
            format!("\"{step}\" step not expected in state \"{state}\""),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::TransactionId;

    #[test]
    fn start_step_wire_shape() {
        let step = VerificationStep::new(
            TransactionId::opaque("txn"),
            StepContent::Start(StartContent {
                from_device: "ALICEDEVICE".into(),
                method: VerificationMethod::Sas,
                key_agreement_protocols: vec![KEY_AGREEMENT_PROTOCOL.to_owned()],
                hashes: vec![HASH_ALGORITHM.to_owned()],
                message_authentication_codes: vec![MAC_ALGORITHM.to_owned()],
                short_authentication_string: vec![
                    ShortAuthenticationString::Decimal,
                    ShortAuthenticationString::Emoji,
                ],
            }),
        );

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "m.key.verification.start");
        assert_eq!(json["transaction_id"], "txn");
        assert_eq!(json["method"], "m.sas.v1");
        assert_eq!(json["key_agreement_protocols"][0], "curve25519-hkdf-sha256");

        let decoded: VerificationStep = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, step);
    }

    #[test]
    fn cancel_codes_round_trip() {
        for code in [
            CancelCode::User,
            CancelCode::Timeout,
            CancelCode::UnknownTransaction,
            CancelCode::UnexpectedMessage,
            CancelCode::UserMismatch,
            CancelCode::UnknownMethod,
            CancelCode::MismatchedCommitment,
            CancelCode::MismatchedSas,
            CancelCode::KeyMismatch,
            CancelCode::InternalError,
            CancelCode::Accepted,
        ] {
            assert_eq!(CancelCode::from(code.as_str()), code);
        }
        assert_eq!(
            CancelCode::from("m.shiny_new_code"),
            CancelCode::Other("m.shiny_new_code".to_owned())
        );
    }

    #[test]
    fn unknown_method_survives_round_trip() {
        let method = VerificationMethod::from("m.qr_code.show.v1");
        let json = serde_json::to_string(&method).unwrap();
        let back: VerificationMethod = serde_json::from_str(&json).unwrap();
        assert_eq!(back, method);
    }
}
