// SPDX-License-Identifier: MIT OR Apache-2.0

//! The SAS (Short Authentication String) sub-protocol: key-agreement handshake, commitment
//! hashing, short-code derivation and MAC exchange.
mod bytes;
mod emoji;
mod engine;

pub use bytes::SasCodes;
pub use emoji::{SAS_EMOJI_TABLE, SasEmoji, sas_emoji};
pub use engine::SasState;
pub(crate) use engine::{EngineOutput, SasEngine};
