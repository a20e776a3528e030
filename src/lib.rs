// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interactive out-of-band verification of cryptographic identities for end-to-end-encrypted
//! messaging.
//!
//! Two parties confirm, without trusting the server between them, that the identity keys they
//! hold for each other are authentic: a request/ready negotiation picks a method, an ephemeral
//! X25519 key agreement with a hash commitment produces a Short Authentication String (emoji or
//! decimal codes) both users compare out-of-band, and a mutual MAC exchange attests the long-term
//! identity keys that are then marked as verified.
//!
//! The crate is transport-agnostic. An attempt is driven entirely through
//! [`Verification::submit_step`]: the embedding application feeds in the peer's steps from
//! whatever transport it uses, sends outbound steps through an injected [`StepSender`] and loops
//! every sent step back in as a local echo. Progress is observed through a watch channel of
//! [`VerificationState`] values.
//!
//! ## Example flow
//!
//! 1. The requester constructs a [`Verification`] with [`Role::Requester`] after sending a
//!    request step; the recipient constructs one with [`Role::Recipient`] from the received
//!    request.
//! 2. The recipient calls [`Verification::accept_request`], either side calls
//!    [`Verification::start_sas`].
//! 3. Both sides observe [`SasState::ComparisonReady`] inside
//!    [`VerificationState::Started`], show the codes and call
//!    [`Verification::confirm_sas_match`] or [`Verification::reject_sas_match`].
//! 4. On success both attempts end in [`VerificationState::Done`] and every cross-checked peer
//!    key was reported to the [`TrustStore`].
//!
//! Attempts are purely in-memory; one that outlives its ten-minute window is cancelled with a
//! timeout by the background task started via [`Verification::start_lifecycle`].
pub mod crypto;
pub mod identifiers;
pub mod liveness;
pub mod sas;
mod state;
mod step;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
mod verification;

pub use state::VerificationState;
pub use step::{
    AcceptContent, CancelCode, CancelContent, DoneContent, HASH_ALGORITHM,
    KEY_AGREEMENT_PROTOCOL, KeyContent, MAC_ALGORITHM, MacContent, ReadyContent, RequestContent,
    ShortAuthenticationString, StartContent, StepContent, VerificationMethod, VerificationStep,
};
pub use verification::{AttemptInfo, Role, Verification, VerificationError};

#[doc(inline)]
pub use sas::SasState;
#[doc(inline)]
pub use traits::{DeviceKeyStore, StepSender, TrustStore};
