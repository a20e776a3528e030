// SPDX-License-Identifier: MIT OR Apache-2.0

//! The generic verification state machine.
//!
//! One [`Verification`] exists per transaction. All step processing is serialized behind a single
//! async mutex: inbound steps from the transport, local echoes of steps we sent, user actions and
//! the timeout poll all take the same lock, so at most one state transition executes at a time.
//!
//! Every step we send re-enters the pipeline as a local echo, as if we had received our own step.
//! This keeps both sides of the exchange flowing through identical validation and makes the state
//! audit trail symmetric.
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::Rng;
use crate::identifiers::{DeviceId, Timestamp, TransactionId, UserId};
use crate::liveness::{self, LivenessConfig};
use crate::sas::SasEngine;
use crate::state::VerificationState;
use crate::step::{
    CancelCode, CancelContent, HASH_ALGORITHM, KEY_AGREEMENT_PROTOCOL, MAC_ALGORITHM, ReadyContent,
    Refusal, ShortAuthenticationString, StartContent, StepContent, VerificationMethod,
    VerificationStep,
};
use crate::traits::{DeviceKeyStore, StepSender, TrustStore};

/// Whether we sent the originating request or the peer did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Requester,
    Recipient,
}

/// Static identity of one verification attempt.
#[derive(Clone, Debug)]
pub struct AttemptInfo {
    pub own_user: UserId,
    pub own_device: DeviceId,
    pub their_user: UserId,
    /// Unknown until the peer replies when we sent the request to all of their devices.
    pub their_device: Option<DeviceId>,
    pub transaction: TransactionId,
    /// Origin timestamp of the request, unix milliseconds.
    pub created_at: Timestamp,
    /// Methods carried by the request step.
    pub methods: Vec<VerificationMethod>,
}

/// A user action was invoked in a state that does not allow it.
///
/// Protocol problems never surface here; those cancel the attempt and show up in the observed
/// state instead.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("cannot {action} in state \"{state}\"")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
}

/// One verification attempt between this device and one peer.
///
/// Constructed per transaction, driven by [`Verification::submit_step`] and the user-action
/// methods, observed through [`Verification::state`]. Dropped by the embedding router once the
/// state is terminal.
#[derive(Debug)]
pub struct Verification {
    info: AttemptInfo,
    sender: Arc<dyn StepSender>,
    trust_store: Arc<dyn TrustStore>,
    key_store: Arc<dyn DeviceKeyStore>,
    config: LivenessConfig,
    rng: Rng,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<VerificationState>,
    lifecycle_started: AtomicBool,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    state: VerificationState,
    /// Write-once: set from the first peer step that names a device.
    their_device: Option<DeviceId>,
    engine: Option<SasEngine>,
}

/// Work queued inside one drive of the step pipeline.
#[derive(Debug)]
enum Item {
    Inbound {
        sender: UserId,
        step: VerificationStep,
        own: bool,
    },
    Outbound(StepContent),
}

impl Verification {
    pub fn new(
        info: AttemptInfo,
        role: Role,
        sender: Arc<dyn StepSender>,
        trust_store: Arc<dyn TrustStore>,
        key_store: Arc<dyn DeviceKeyStore>,
        config: LivenessConfig,
    ) -> Arc<Self> {
        let state = match role {
            Role::Requester => VerificationState::OwnRequest,
            Role::Recipient => VerificationState::TheirRequest,
        };
        let (state_tx, _) = watch::channel(state.clone());
        let their_device = info.their_device.clone();

        Arc::new(Self {
            info,
            sender,
            trust_store,
            key_store,
            config,
            rng: Rng::default(),
            inner: Mutex::new(Inner {
                state,
                their_device,
                engine: None,
            }),
            state_tx,
            lifecycle_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// The transaction this attempt belongs to.
    pub fn transaction(&self) -> &TransactionId {
        &self.info.transaction
    }

    /// Subscribes to state changes. The receiver immediately holds the current state.
    pub fn state(&self) -> watch::Receiver<VerificationState> {
        self.state_tx.subscribe()
    }

    /// Spawns the background timeout watch. Idempotent; the task ends as soon as the attempt
    /// reaches a terminal state.
    pub fn start_lifecycle(self: &Arc<Self>) {
        if self.lifecycle_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let attempt = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(attempt.config.poll_interval);
            loop {
                tokio::select! {
                    _ = attempt.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if attempt.check_timeout().await {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Processes one step: a peer's message from the transport or the local echo of a step we
    /// sent ourselves (`is_local`). Steps for terminated attempts are logged and ignored.
    pub async fn submit_step(&self, sender: &UserId, step: VerificationStep, is_local: bool) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            debug!(
                step = step.content.name(),
                state = inner.state.name(),
                "step for terminated attempt ignored"
            );
            return;
        }
        let queue = VecDeque::from([Item::Inbound {
            sender: sender.clone(),
            step,
            own: is_local,
        }]);
        self.drive(&mut inner, queue).await;
    }

    /// User-initiated cancellation.
    pub async fn cancel(&self, reason: &str) -> Result<(), VerificationError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return Err(VerificationError::InvalidState {
                action: "cancel",
                state: inner.state.name(),
            });
        }
        self.cancel_locked(&mut inner, CancelCode::User, reason).await;
        Ok(())
    }

    /// Answers the peer's request with a ready step naming the methods we support.
    pub async fn accept_request(&self) -> Result<(), VerificationError> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, VerificationState::TheirRequest) {
            return Err(VerificationError::InvalidState {
                action: "accept the request",
                state: inner.state.name(),
            });
        }
        let content = StepContent::Ready(ReadyContent {
            from_device: self.info.own_device.clone(),
            methods: vec![VerificationMethod::Sas],
        });
        self.drive(&mut inner, VecDeque::from([Item::Outbound(content)]))
            .await;
        Ok(())
    }

    /// Starts the SAS method once both sides are ready.
    pub async fn start_sas(&self) -> Result<(), VerificationError> {
        let mut inner = self.inner.lock().await;
        match &inner.state {
            VerificationState::Ready { methods } if methods.contains(&VerificationMethod::Sas) => {
            }
            other => {
                return Err(VerificationError::InvalidState {
                    action: "start the sas method",
                    state: other.name(),
                });
            }
        }
        let content = StepContent::Start(StartContent {
            from_device: self.info.own_device.clone(),
            method: VerificationMethod::Sas,
            key_agreement_protocols: vec![KEY_AGREEMENT_PROTOCOL.to_owned()],
            hashes: vec![HASH_ALGORITHM.to_owned()],
            message_authentication_codes: vec![MAC_ALGORITHM.to_owned()],
            short_authentication_string: vec![
                ShortAuthenticationString::Decimal,
                ShortAuthenticationString::Emoji,
            ],
        });
        self.drive(&mut inner, VecDeque::from([Item::Outbound(content)]))
            .await;
        Ok(())
    }

    /// The local user decided the displayed codes match the peer's.
    pub async fn confirm_sas_match(&self) -> Result<(), VerificationError> {
        let mut inner = self.inner.lock().await;
        if !inner.engine.as_ref().is_some_and(SasEngine::can_confirm) {
            return Err(VerificationError::InvalidState {
                action: "confirm the comparison",
                state: inner.state.name(),
            });
        }
        let own_keys = self
            .key_store
            .device_keys(&self.info.own_user, &self.info.own_device)
            .await;
        let result = match (own_keys, inner.engine.as_mut()) {
            (Ok(keys), Some(engine)) => engine.confirm_match(&keys),
            (Err(err), _) => Err(Refusal::new(CancelCode::InternalError, err.to_string())),
            (_, None) => Err(Refusal::new(
                CancelCode::InternalError,
                "sas run disappeared while confirming",
            )),
        };
        match result {
            Ok(output) => {
                let queue = output.outgoing.into_iter().map(Item::Outbound).collect();
                self.drive(&mut inner, queue).await;
            }
            Err(refusal) => {
                self.cancel_locked(&mut inner, refusal.code, &refusal.reason)
                    .await;
            }
        }
        Ok(())
    }

    /// The local user decided the displayed codes do not match.
    pub async fn reject_sas_match(&self) -> Result<(), VerificationError> {
        let mut inner = self.inner.lock().await;
        if !inner.engine.as_ref().is_some_and(SasEngine::can_confirm) {
            return Err(VerificationError::InvalidState {
                action: "reject the comparison",
                state: inner.state.name(),
            });
        }
        let refusal = match inner.engine.as_mut() {
            Some(engine) => match engine.reject_match() {
                Ok(refusal) | Err(refusal) => refusal,
            },
            None => Refusal::new(
                CancelCode::InternalError,
                "sas run disappeared while rejecting",
            ),
        };
        self.cancel_locked(&mut inner, refusal.code, &refusal.reason)
            .await;
        Ok(())
    }

    /// One poll of the timeout watch; returns true once the task can stop.
    async fn check_timeout(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return true;
        }
        if liveness::is_timed_out(
            self.info.created_at,
            liveness::now_millis(),
            &inner.state,
            &self.config,
        ) {
            self.cancel_locked(&mut inner, CancelCode::Timeout, "the verification timed out")
                .await;
            return true;
        }
        false
    }

    /// Works the queue of pending steps until it drains or the attempt terminates. Sending a
    /// step enqueues its local echo; a refused step converts into an outbound cancel.
    async fn drive(&self, inner: &mut Inner, mut queue: VecDeque<Item>) {
        while let Some(item) = queue.pop_front() {
            match item {
                Item::Outbound(content) => {
                    let step = VerificationStep::new(self.info.transaction.clone(), content);
                    match self.sender.send_step(&step).await {
                        Ok(()) => queue.push_back(Item::Inbound {
                            sender: self.info.own_user.clone(),
                            step,
                            own: true,
                        }),
                        Err(err) => {
                            warn!(step = step.content.name(), %err, "failed to send step");
                            self.cancel_locked(
                                inner,
                                CancelCode::InternalError,
                                "there was a problem sending a step",
                            )
                            .await;
                            return;
                        }
                    }
                }
                Item::Inbound { sender, step, own } => {
                    match self.handle_step(inner, &sender, &step, own).await {
                        Ok(outgoing) => {
                            queue.extend(outgoing.into_iter().map(Item::Outbound));
                        }
                        Err(refusal) => {
                            self.cancel_locked(inner, refusal.code, &refusal.reason).await;
                            return;
                        }
                    }
                }
            }
            if inner.state.is_terminal() {
                return;
            }
        }
    }

    /// Validates and applies one step; returns the steps to send in response.
    async fn handle_step(
        &self,
        inner: &mut Inner,
        sender: &UserId,
        step: &VerificationStep,
        own: bool,
    ) -> Result<Vec<StepContent>, Refusal> {
        if step.transaction != self.info.transaction {
            return Err(Refusal::new(
                CancelCode::UnknownTransaction,
                format!(
                    "step for transaction \"{}\" does not belong to \"{}\"",
                    step.transaction, self.info.transaction
                ),
            ));
        }
        if sender != &self.info.own_user && sender != &self.info.their_user {
            return Err(Refusal::new(
                CancelCode::UserMismatch,
                format!("step from unexpected user \"{sender}\""),
            ));
        }

        debug!(
            step = step.content.name(),
            state = inner.state.name(),
            own,
            "processing verification step"
        );
        let state = inner.state.clone();

        // After another of our devices accepted the request only done and cancel still matter;
        // everything else is stale and dropped without cancelling.
        if matches!(state, VerificationState::AcceptedByOtherDevice)
            && !matches!(
                step.content,
                StepContent::Done(_) | StepContent::Cancel(_)
            )
        {
            warn!(
                step = step.content.name(),
                "step ignored after another device accepted the request"
            );
            return Ok(vec![]);
        }

        match &step.content {
            StepContent::Request(content) => match state {
                VerificationState::OwnRequest if own => Ok(vec![]),
                VerificationState::TheirRequest if !own => {
                    if !liveness::is_request_active(
                        content.timestamp,
                        liveness::now_millis(),
                        &self.config,
                    ) {
                        return Err(Refusal::new(
                            CancelCode::Timeout,
                            "the request is no longer active",
                        ));
                    }
                    Ok(vec![])
                }
                other => Err(Refusal::unexpected("request", other.name())),
            },

            StepContent::Ready(content) => {
                // A non-local ready from our own user means another of our devices answered the
                // peer's request; this attempt is out of the race. Does not apply when we sent
                // the request ourselves (then a same-user ready is the peer in a
                // self-verification).
                if !own
                    && sender == &self.info.own_user
                    && !matches!(state, VerificationState::OwnRequest)
                {
                    if matches!(state, VerificationState::TheirRequest)
                        && content.from_device != self.info.own_device
                    {
                        debug!(
                            device = %content.from_device,
                            "request was accepted by another of our devices"
                        );
                        self.set_state(inner, VerificationState::AcceptedByOtherDevice);
                        return Ok(vec![]);
                    }
                    return Err(Refusal::unexpected("ready", state.name()));
                }

                match state {
                    VerificationState::OwnRequest if !own => {
                        self.record_their_device(inner, &content.from_device)?;
                        let methods = common_methods(&self.info.methods, &content.methods);
                        if methods.is_empty() {
                            return Err(Refusal::new(
                                CancelCode::UnknownMethod,
                                "no verification method in common",
                            ));
                        }
                        self.set_state(inner, VerificationState::Ready { methods });
                        Ok(vec![])
                    }
                    VerificationState::TheirRequest if own => {
                        let methods = common_methods(&self.info.methods, &content.methods);
                        if methods.is_empty() {
                            return Err(Refusal::new(
                                CancelCode::UnknownMethod,
                                "no verification method in common",
                            ));
                        }
                        self.set_state(inner, VerificationState::Ready { methods });
                        Ok(vec![])
                    }
                    other => Err(Refusal::unexpected("ready", other.name())),
                }
            }

            StepContent::Start(content) => match state {
                VerificationState::Ready { methods } => {
                    if !methods.contains(&VerificationMethod::Sas)
                        || content.method != VerificationMethod::Sas
                    {
                        return Err(Refusal::new(
                            CancelCode::UnknownMethod,
                            format!("method \"{}\" was not agreed on", content.method),
                        ));
                    }
                    if !own {
                        self.record_their_device(inner, &content.from_device)?;
                    }
                    self.install_engine(inner, sender, step, content, own)
                }
                VerificationState::Started {
                    sender: current_user,
                    device: current_device,
                    ..
                } => {
                    let (new_user, new_device) = if own {
                        (&self.info.own_user, &self.info.own_device)
                    } else {
                        (sender, &content.from_device)
                    };
                    if (new_user, new_device) == (&current_user, &current_device) {
                        return Err(Refusal::unexpected("start", "started"));
                    }
                    if content.method != VerificationMethod::Sas {
                        return Err(Refusal::new(
                            CancelCode::UnknownMethod,
                            "simultaneous starts name different methods",
                        ));
                    }
                    // Tie-break: the lexicographically greater (user, device) pair wins.
                    if (new_user, new_device) > (&current_user, &current_device) {
                        debug!(
                            winner = %new_user,
                            "simultaneous start resolved, replacing current sas run"
                        );
                        if let Some(engine) = inner.engine.as_mut() {
                            engine.release();
                        }
                        inner.engine = None;
                        self.install_engine(inner, sender, step, content, own)
                    } else {
                        debug!(loser = %new_user, "losing simultaneous start ignored");
                        Ok(vec![])
                    }
                }
                other => Err(Refusal::unexpected("start", other.name())),
            },

            StepContent::Accept(content) => {
                let state_name = state.name();
                let engine = inner
                    .engine
                    .as_mut()
                    .ok_or_else(|| Refusal::unexpected("accept", state_name))?;
                let output = engine.on_accept(content, own)?;
                self.refresh_sas_state(inner);
                Ok(output.outgoing)
            }

            StepContent::Key(content) => {
                let state_name = state.name();
                let engine = inner
                    .engine
                    .as_mut()
                    .ok_or_else(|| Refusal::unexpected("key", state_name))?;
                let output = engine.on_key(content, own)?;
                self.refresh_sas_state(inner);
                Ok(output.outgoing)
            }

            StepContent::Mac(content) => {
                let state_name = state.name();
                if inner.engine.is_none() {
                    return Err(Refusal::unexpected("mac", state_name));
                }
                let their_device = inner.their_device.clone().ok_or_else(|| {
                    Refusal::new(CancelCode::InternalError, "peer device is not known")
                })?;
                let peer_keys = self
                    .key_store
                    .device_keys(&self.info.their_user, &their_device)
                    .await
                    .map_err(|err| Refusal::new(CancelCode::InternalError, err.to_string()))?;
                let output = match inner.engine.as_mut() {
                    Some(engine) => engine.on_mac(content, own, &peer_keys)?,
                    None => return Err(Refusal::unexpected("mac", state_name)),
                };
                if output.finished {
                    for key_id in &output.verified_keys {
                        self.trust_store
                            .mark_verified(&self.info.their_user, &their_device, key_id)
                            .await
                            .map_err(|err| {
                                Refusal::new(CancelCode::InternalError, err.to_string())
                            })?;
                    }
                }
                self.refresh_sas_state(inner);
                Ok(output.outgoing)
            }

            StepContent::Done(_) => match state {
                VerificationState::Started { .. } if own => {
                    self.set_state(inner, VerificationState::PartlyDone { by_us: true });
                    Ok(vec![])
                }
                VerificationState::Started { .. } => {
                    self.set_state(inner, VerificationState::PartlyDone { by_us: false });
                    Ok(vec![])
                }
                VerificationState::PartlyDone { by_us } if by_us != own => {
                    if let Some(engine) = inner.engine.as_mut() {
                        engine.release();
                    }
                    inner.engine = None;
                    self.set_state(inner, VerificationState::Done);
                    Ok(vec![])
                }
                VerificationState::AcceptedByOtherDevice if !own => {
                    self.set_state(inner, VerificationState::Done);
                    Ok(vec![])
                }
                other => Err(Refusal::unexpected("done", other.name())),
            },

            StepContent::Cancel(content) => {
                debug!(
                    code = %content.code,
                    reason = %content.reason,
                    own,
                    "verification cancelled by step"
                );
                self.apply_terminal(
                    inner,
                    VerificationState::Cancelled {
                        code: content.code.clone(),
                        reason: content.reason.clone(),
                        by_us: own,
                    },
                );
                Ok(vec![])
            }
        }
    }

    /// Builds the SAS engine from the winning start step.
    fn install_engine(
        &self,
        inner: &mut Inner,
        sender: &UserId,
        step: &VerificationStep,
        content: &StartContent,
        own: bool,
    ) -> Result<Vec<StepContent>, Refusal> {
        let their_device = inner.their_device.clone().ok_or_else(|| {
            Refusal::new(CancelCode::InternalError, "peer device is not known")
        })?;
        let (engine, output) = SasEngine::new(
            step.clone(),
            own,
            self.info.own_user.clone(),
            self.info.own_device.clone(),
            self.info.their_user.clone(),
            their_device,
            &self.rng,
        )?;
        let (starter, starter_device) = if own {
            (self.info.own_user.clone(), self.info.own_device.clone())
        } else {
            (sender.clone(), content.from_device.clone())
        };
        let sas = engine.public_state();
        inner.engine = Some(engine);
        self.set_state(
            inner,
            VerificationState::Started {
                sender: starter,
                device: starter_device,
                sas,
            },
        );
        Ok(output.outgoing)
    }

    /// Write-once peer device tracking; a second, different device is a violation.
    fn record_their_device(&self, inner: &mut Inner, device: &DeviceId) -> Result<(), Refusal> {
        match &inner.their_device {
            Some(expected) if expected != device => Err(Refusal::new(
                CancelCode::UserMismatch,
                format!("step from unexpected device \"{device}\""),
            )),
            Some(_) => Ok(()),
            None => {
                inner.their_device = Some(device.clone());
                Ok(())
            }
        }
    }

    /// Mirrors the engine's sub-state into the observable attempt state.
    fn refresh_sas_state(&self, inner: &mut Inner) {
        let next = match (&inner.state, inner.engine.as_ref()) {
            (VerificationState::Started { sender, device, .. }, Some(engine)) => {
                VerificationState::Started {
                    sender: sender.clone(),
                    device: device.clone(),
                    sas: engine.public_state(),
                }
            }
            _ => return,
        };
        if next != inner.state {
            self.set_state(inner, next);
        }
    }

    /// Sends a cancel step (best-effort; a failed cancel send is swallowed) and terminates.
    async fn cancel_locked(&self, inner: &mut Inner, code: CancelCode, reason: &str) {
        let step = VerificationStep::new(
            self.info.transaction.clone(),
            StepContent::Cancel(CancelContent {
                code: code.clone(),
                reason: reason.to_owned(),
            }),
        );
        if let Err(err) = self.sender.send_step(&step).await {
            warn!(%err, "failed to send cancel step");
        }
        self.apply_terminal(
            inner,
            VerificationState::Cancelled {
                code,
                reason: reason.to_owned(),
                by_us: true,
            },
        );
    }

    fn apply_terminal(&self, inner: &mut Inner, state: VerificationState) {
        if let Some(engine) = inner.engine.as_mut() {
            engine.release();
        }
        inner.engine = None;
        self.set_state(inner, state);
        self.shutdown.cancel();
    }

    fn set_state(&self, inner: &mut Inner, state: VerificationState) {
        debug!(
            transaction = %self.info.transaction,
            state = state.name(),
            "verification state changed"
        );
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }
}

impl Drop for Verification {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn common_methods(
    ours: &[VerificationMethod],
    theirs: &[VerificationMethod],
) -> Vec<VerificationMethod> {
    ours.iter()
        .filter(|method| theirs.contains(method))
        .cloned()
        .collect()
}
