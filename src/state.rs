// SPDX-License-Identifier: MIT OR Apache-2.0

//! Observable lifecycle of a verification attempt.
use crate::identifiers::{DeviceId, UserId};
use crate::sas::SasState;
use crate::step::CancelCode;

/// State of one verification attempt, published through a watch channel.
///
/// Transitions are driven exclusively by steps entering the attempt (both the peer's and local
/// echoes of our own) and by the liveness clock. Terminal states are never left.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerificationState {
    /// We sent the request and wait for the peer to signal readiness.
    OwnRequest,
    /// The peer sent the request; the local user has not answered yet.
    TheirRequest,
    /// Both sides agreed to verify; the common methods are known.
    Ready { methods: Vec<crate::step::VerificationMethod> },
    /// A SAS run is in progress, started by the given party.
    Started {
        sender: UserId,
        device: DeviceId,
        sas: SasState,
    },
    /// One side has sent its done step; `by_us` records whether it was ours.
    PartlyDone { by_us: bool },
    /// Both sides completed the attempt successfully.
    Done,
    /// Another of our devices answered the request; this attempt only still follows done and
    /// cancel steps and ignores everything else.
    AcceptedByOtherDevice,
    /// The attempt terminated without success.
    Cancelled {
        code: CancelCode,
        reason: String,
        by_us: bool,
    },
}

impl VerificationState {
    /// Terminal states accept no further steps.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled { .. })
    }

    /// Short name used in diagnostics and refusal reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OwnRequest => "own request",
            Self::TheirRequest => "their request",
            Self::Ready { .. } => "ready",
            Self::Started { .. } => "started",
            Self::PartlyDone { .. } => "partly done",
            Self::Done => "done",
            Self::AcceptedByOtherDevice => "accepted by other device",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
