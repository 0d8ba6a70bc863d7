// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Protocol-version/epoch transition state machine: prepare → ready →
//! execute, key-package/proposal/commit/welcome exchange, and the downgrade path.

use std::sync::Arc;

use crate::dave::control::ControlFrame;
use crate::dave::frame::DaveNonce;
use crate::dave::key_schedule::KeySchedule;
use crate::dave::mls::GroupStore;
use crate::errors::DaveError;

/// The three states a voice connection's DAVE overlay can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaveStateKind {
    Disabled,
    Negotiating,
    Active { epoch: u64 },
}

struct PendingTransition {
    id: u64,
    downgrade: bool,
    /// Set once the matching `MlsWelcome`/`AnnounceCommitTransition` has been
    /// processed. A downgrade needs no MLS exchange, so it starts ready.
    ready: bool,
}

/// Drives one `Session`'s DAVE overlay: tracks the single pending transition, applies
/// MLS control messages to a [`GroupStore`], and reconfigures the [`KeySchedule`] on
/// every successful epoch change.
pub struct DaveStateMachine<G: GroupStore> {
    state: DaveStateKind,
    pending: Option<PendingTransition>,
    group: G,
    key_schedule: Arc<KeySchedule>,
    generation: u8,
    frame_counter: u32,
    /// The package from the most recent `MlsExternalSender` frame, consumed by the
    /// next `PrepareEpoch{epoch_id: 1}` to bootstrap the initial group.
    external_sender_package: Option<Vec<u8>>,
    /// The epoch a `PrepareEpoch{epoch_id > 1}` announced, tracked so the commit that
    /// follows can be checked against it.
    expected_epoch: u64,
}

impl<G: GroupStore> DaveStateMachine<G> {
    pub fn new(group: G, key_schedule: Arc<KeySchedule>) -> Self {
        Self {
            state: DaveStateKind::Disabled,
            pending: None,
            group,
            key_schedule,
            generation: 0,
            frame_counter: 0,
            external_sender_package: None,
            expected_epoch: 0,
        }
    }

    pub fn state(&self) -> DaveStateKind {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, DaveStateKind::Active { .. })
    }

    /// The epoch the most recent `PrepareEpoch{epoch_id > 1}` announced as coming
    /// next.
    pub fn expected_epoch(&self) -> u64 {
        self.expected_epoch
    }

    /// Returns the next `(generation, counter)` nonce to use for an outgoing DAVE
    /// frame, rolling to the next generation when the 24-bit per-generation counter
    /// would wrap.
    pub fn next_nonce(&mut self) -> DaveNonce {
        if self.frame_counter >= (1 << 24) - 1 {
            self.frame_counter = 0;
            self.generation = self.generation.wrapping_add(1);
        } else {
            self.frame_counter += 1;
        }
        DaveNonce::new(self.generation, self.frame_counter)
    }

    /// Applies one incoming DAVE control frame, returning zero or more frames to send
    /// back (e.g. a `MlsKeyPackage` in response to `PrepareTransition`).
    pub async fn handle(&mut self, frame: ControlFrame) -> Result<Vec<ControlFrame>, DaveError> {
        match frame {
            ControlFrame::PrepareTransition { transition_id, protocol_version } => {
                // A second PrepareTransition before the first executes supersedes it;
                // the earlier id's state is simply discarded.
                self.pending = None;

                if protocol_version == 0 {
                    self.pending = Some(PendingTransition { id: transition_id, downgrade: true, ready: true });
                    return Ok(vec![]);
                }

                self.state = DaveStateKind::Negotiating;
                let package = self.group.generate_key_package().await?;
                self.pending = Some(PendingTransition { id: transition_id, downgrade: false, ready: false });
                Ok(vec![ControlFrame::MlsKeyPackage { package }])
            }

            ControlFrame::PrepareEpoch { transition_id, epoch_id, protocol_version: _ } => {
                self.state = DaveStateKind::Negotiating;

                if epoch_id == 1 {
                    let package = self.external_sender_package.take().ok_or_else(|| {
                        DaveError::InvalidCommitOrWelcome {
                            error: "PrepareEpoch{epoch_id: 1} arrived before MlsExternalSender".into(),
                        }
                    })?;
                    self.group.process_external_sender(&package).await?;
                } else {
                    self.expected_epoch = epoch_id;
                }

                self.pending = Some(PendingTransition { id: transition_id, downgrade: false, ready: false });
                Ok(vec![])
            }

            ControlFrame::MlsExternalSender { package } => {
                self.external_sender_package = Some(package);
                Ok(vec![])
            }

            ControlFrame::MlsProposals { append, revoke } => {
                self.group.process_proposals(&append, &revoke).await?;
                Ok(vec![])
            }

            ControlFrame::MlsWelcome { transition_id, welcome } => {
                self.expect_pending(transition_id)?;
                let epoch_secret = self.group.process_welcome(&welcome).await?;
                self.key_schedule.set_exporter_secret(epoch_secret.epoch, epoch_secret.exporter_secret);
                if let Some(pending) = &mut self.pending {
                    pending.ready = true;
                }
                Ok(vec![ControlFrame::TransitionReady { transition_id }])
            }

            ControlFrame::AnnounceCommitTransition { transition_id, commit } => {
                self.expect_pending(transition_id)?;
                let epoch_secret = self.group.process_commit(&commit).await?;
                self.key_schedule.set_exporter_secret(epoch_secret.epoch, epoch_secret.exporter_secret);
                if let Some(pending) = &mut self.pending {
                    pending.ready = true;
                }
                Ok(vec![ControlFrame::TransitionReady { transition_id }])
            }

            ControlFrame::ExecuteTransition { transition_id } => {
                let Some(pending) = &self.pending else {
                    // "An ExecuteTransition with an unknown id is ignored."
                    return Ok(vec![]);
                };
                if pending.id != transition_id {
                    return Ok(vec![]);
                }
                if !pending.ready {
                    // Ordering guarantee (ii): buffer by rejecting and leaving the
                    // pending transition in place for the caller to retry once the
                    // matching Welcome/Commit arrives.
                    return Err(DaveError::OutOfOrderExecute);
                }
                let pending = self.pending.take().unwrap();

                self.generation = 0;
                self.frame_counter = 0;

                if pending.downgrade {
                    self.key_schedule.clear();
                    self.state = DaveStateKind::Disabled;
                } else {
                    let epoch = self.group.state().map(|s| s.epoch).unwrap_or(0);
                    self.state = DaveStateKind::Active { epoch };
                }
                Ok(vec![])
            }

            ControlFrame::MlsInvalidCommitWelcome { .. } => {
                // Outbound-only in normal operation; if ever observed inbound, local
                // state is kept untouched until the server re-adds us via a new Welcome.
                Ok(vec![])
            }

            ControlFrame::TransitionReady { .. } | ControlFrame::MlsKeyPackage { .. } => {
                // Server does not send these to the client; ignore defensively.
                Ok(vec![])
            }
        }
    }

    fn expect_pending(&self, transition_id: u64) -> Result<(), DaveError> {
        match &self.pending {
            Some(p) if p.id == transition_id => Ok(()),
            _ => Err(DaveError::UnknownTransitionId { id: transition_id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::mls::{EpochSecret, GroupState};
    use async_trait::async_trait;

    struct FakeGroup {
        epoch: u64,
        external_sender_calls: u32,
    }

    #[async_trait]
    impl GroupStore for FakeGroup {
        async fn process_external_sender(&mut self, _package: &[u8]) -> Result<(), DaveError> {
            self.external_sender_calls += 1;
            Ok(())
        }

        async fn generate_key_package(&mut self) -> Result<Vec<u8>, DaveError> {
            Ok(vec![0xAB])
        }

        async fn process_proposals(&mut self, _append: &[Vec<u8>], _revoke: &[Vec<u8>]) -> Result<(), DaveError> {
            Ok(())
        }

        async fn process_commit(&mut self, _commit: &[u8]) -> Result<EpochSecret, DaveError> {
            self.epoch += 1;
            Ok(EpochSecret { epoch: self.epoch, exporter_secret: vec![0x99; 32] })
        }

        async fn process_welcome(&mut self, _welcome: &[u8]) -> Result<EpochSecret, DaveError> {
            self.epoch = 1;
            Ok(EpochSecret { epoch: self.epoch, exporter_secret: vec![0x88; 32] })
        }

        async fn export_secret(&self, _label: &str, length: usize) -> Result<Vec<u8>, DaveError> {
            Ok(vec![0u8; length])
        }

        fn state(&self) -> Option<GroupState> {
            Some(GroupState { epoch: self.epoch, protocol_version: 1, roster: vec![] })
        }
    }

    fn machine() -> DaveStateMachine<FakeGroup> {
        DaveStateMachine::new(FakeGroup { epoch: 0, external_sender_calls: 0 }, Arc::new(KeySchedule::new()))
    }

    #[tokio::test]
    async fn prepare_transition_moves_to_negotiating() {
        let mut m = machine();
        let out = m
            .handle(ControlFrame::PrepareTransition { transition_id: 1, protocol_version: 1 })
            .await
            .unwrap();
        assert_eq!(m.state(), DaveStateKind::Negotiating);
        assert_eq!(out, vec![ControlFrame::MlsKeyPackage { package: vec![0xAB] }]);
    }

    #[tokio::test]
    async fn welcome_then_execute_reaches_active() {
        let mut m = machine();
        m.handle(ControlFrame::PrepareTransition { transition_id: 5, protocol_version: 1 }).await.unwrap();
        m.handle(ControlFrame::MlsWelcome { transition_id: 5, welcome: vec![] }).await.unwrap();
        m.handle(ControlFrame::ExecuteTransition { transition_id: 5 }).await.unwrap();

        assert_eq!(m.state(), DaveStateKind::Active { epoch: 1 });
    }

    #[tokio::test]
    async fn second_prepare_supersedes_first() {
        let mut m = machine();
        m.handle(ControlFrame::PrepareTransition { transition_id: 1, protocol_version: 1 }).await.unwrap();
        m.handle(ControlFrame::PrepareTransition { transition_id: 2, protocol_version: 1 }).await.unwrap();

        // Execute against the now-superseded id 1 is ignored.
        m.handle(ControlFrame::ExecuteTransition { transition_id: 1 }).await.unwrap();
        assert_eq!(m.state(), DaveStateKind::Negotiating);
    }

    #[tokio::test]
    async fn downgrade_transition_disables_dave() {
        let mut m = machine();
        m.handle(ControlFrame::PrepareTransition { transition_id: 9, protocol_version: 1 }).await.unwrap();
        m.handle(ControlFrame::MlsWelcome { transition_id: 9, welcome: vec![] }).await.unwrap();
        m.handle(ControlFrame::ExecuteTransition { transition_id: 9 }).await.unwrap();
        assert!(m.is_active());

        m.handle(ControlFrame::PrepareTransition { transition_id: 10, protocol_version: 0 }).await.unwrap();
        m.handle(ControlFrame::ExecuteTransition { transition_id: 10 }).await.unwrap();
        assert_eq!(m.state(), DaveStateKind::Disabled);
    }

    #[tokio::test]
    async fn welcome_for_unknown_transition_errors() {
        let mut m = machine();
        let err = m
            .handle(ControlFrame::MlsWelcome { transition_id: 404, welcome: vec![] })
            .await
            .unwrap_err();
        assert_eq!(err, DaveError::UnknownTransitionId { id: 404 });
    }

    #[test]
    fn nonce_rolls_generation_on_counter_wrap() {
        let mut m = machine();
        m.frame_counter = (1 << 24) - 1;
        m.generation = 3;
        let nonce = m.next_nonce();
        assert_eq!(nonce.generation, 4);
        assert_eq!(nonce.counter, 0);
    }

    #[tokio::test]
    async fn prepare_epoch_one_bootstraps_group_from_external_sender() {
        let mut m = machine();
        m.handle(ControlFrame::MlsExternalSender { package: vec![0xEE] }).await.unwrap();
        m.handle(ControlFrame::PrepareEpoch { transition_id: 1, epoch_id: 1, protocol_version: 1 }).await.unwrap();

        assert_eq!(m.group.external_sender_calls, 1);
        assert_eq!(m.state(), DaveStateKind::Negotiating);
    }

    #[tokio::test]
    async fn prepare_epoch_one_without_external_sender_errors() {
        let mut m = machine();
        let err = m
            .handle(ControlFrame::PrepareEpoch { transition_id: 1, epoch_id: 1, protocol_version: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, DaveError::InvalidCommitOrWelcome { .. }));
        assert_eq!(m.group.external_sender_calls, 0);
    }

    #[tokio::test]
    async fn prepare_epoch_beyond_one_tracks_expected_epoch() {
        let mut m = machine();
        m.handle(ControlFrame::PrepareEpoch { transition_id: 2, epoch_id: 7, protocol_version: 1 }).await.unwrap();

        assert_eq!(m.expected_epoch(), 7);
        assert_eq!(m.group.external_sender_calls, 0);
    }

    #[tokio::test]
    async fn execute_before_welcome_is_rejected_and_left_pending() {
        let mut m = machine();
        m.handle(ControlFrame::PrepareTransition { transition_id: 7, protocol_version: 1 }).await.unwrap();

        let err = m.handle(ControlFrame::ExecuteTransition { transition_id: 7 }).await.unwrap_err();
        assert_eq!(err, DaveError::OutOfOrderExecute);
        assert_eq!(m.state(), DaveStateKind::Negotiating);

        // The pending transition survives the rejection, so the matching Welcome can
        // still land and a retried Execute then succeeds.
        m.handle(ControlFrame::MlsWelcome { transition_id: 7, welcome: vec![] }).await.unwrap();
        m.handle(ControlFrame::ExecuteTransition { transition_id: 7 }).await.unwrap();
        assert_eq!(m.state(), DaveStateKind::Active { epoch: 1 });
    }
}
