//! Conference sequencer
//!
//! Strictly sequential call-merge workflow triggered by an offer on the
//! route point: drop the route point leg, create a conference-enabled call,
//! connect the first party toward the destination, wait for the destination
//! to join with a bounded poll, then merge the second party's existing call
//! or connect that party directly as a fallback.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MergeRule;
use crate::cti::{CallControlProvider, ConnectionState, CtiCall, CtiError};

/// How a sequence run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The second party's existing call was merged into the new call.
    Merged,
    /// The second party was connected directly (no existing call, or the
    /// merge failed).
    ConnectedDirect,
    /// The destination never joined within the poll ceiling; the sequence
    /// aborted before touching the second party.
    JoinTimedOut,
}

impl fmt::Display for SequenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceOutcome::Merged => write!(f, "merged"),
            SequenceOutcome::ConnectedDirect => write!(f, "connected-direct"),
            SequenceOutcome::JoinTimedOut => write!(f, "join-timed-out"),
        }
    }
}

pub struct ConferenceSequencer {
    provider: Arc<dyn CallControlProvider>,
    rule: MergeRule,
}

impl ConferenceSequencer {
    pub fn new(provider: Arc<dyn CallControlProvider>, rule: MergeRule) -> Self {
        Self { provider, rule }
    }

    /// Run the full sequence for one triggering call. Command errors abort
    /// the sequence; the caller is expected to log them. The partially
    /// created call is not cleaned up on abort.
    pub async fn run(
        &self,
        trigger: Arc<dyn CtiCall>,
        cancel: &CancellationToken,
    ) -> Result<SequenceOutcome, CtiError> {
        info!(call = trigger.id(), "starting conference sequence");

        self.disconnect_route_point_leg(trigger.as_ref()).await?;

        let new_call = self.provider.create_call().await?;
        new_call.set_conference_enabled(true).await?;
        info!(call = new_call.id(), "conference-enabled call created");

        new_call
            .connect(
                &self.rule.first_terminal,
                &self.rule.first_address,
                &self.rule.destination,
            )
            .await?;
        info!(
            call = new_call.id(),
            destination = %self.rule.destination,
            "first party connected, awaiting destination join"
        );

        if !self.await_destination_join(new_call.as_ref(), cancel).await? {
            warn!(
                call = new_call.id(),
                destination = %self.rule.destination,
                attempts = self.rule.join_poll_attempts,
                "destination did not join in time, aborting merge"
            );
            return Ok(SequenceOutcome::JoinTimedOut);
        }

        self.merge_or_connect_second(new_call.as_ref()).await
    }

    /// Drop the triggering call's route point leg. A call with no such leg
    /// is not an error.
    async fn disconnect_route_point_leg(&self, trigger: &dyn CtiCall) -> Result<(), CtiError> {
        for connection in trigger.connections().await? {
            if connection.address_name() == self.rule.route_point_dn {
                connection.disconnect().await?;
                info!(
                    call = trigger.id(),
                    dn = %self.rule.route_point_dn,
                    "disconnected route point leg"
                );
                return Ok(());
            }
        }
        debug!(call = trigger.id(), "no route point leg to disconnect");
        Ok(())
    }

    /// Poll the new call's legs until the destination reaches connected, up
    /// to the configured attempt ceiling. Returns false on timeout.
    async fn await_destination_join(
        &self,
        call: &dyn CtiCall,
        cancel: &CancellationToken,
    ) -> Result<bool, CtiError> {
        for attempt in 1..=self.rule.join_poll_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CtiError::Cancelled),
                _ = tokio::time::sleep(self.rule.join_poll_interval) => {}
            }

            let joined = call.connections().await?.iter().any(|connection| {
                connection.address_name() == self.rule.destination
                    && connection.state() == ConnectionState::Connected
            });
            if joined {
                info!(call = call.id(), attempt, "destination joined the call");
                return Ok(true);
            }
            debug!(call = call.id(), attempt, "destination not joined yet");
        }
        Ok(false)
    }

    /// Merge the second party's existing call into the new call, or connect
    /// the second party directly when there is nothing to merge or the merge
    /// fails. Direct-connect failures are logged and swallowed.
    async fn merge_or_connect_second(
        &self,
        new_call: &dyn CtiCall,
    ) -> Result<SequenceOutcome, CtiError> {
        let second = self.provider.address(&self.rule.second_address).await?;
        let existing_leg = second.connections().await?.into_iter().next();

        let Some(leg) = existing_leg else {
            info!(
                address = %self.rule.second_address,
                "no existing call for second party, connecting directly"
            );
            self.connect_second_directly(new_call).await;
            return Ok(SequenceOutcome::ConnectedDirect);
        };

        let existing_call = leg.call().await?;
        info!(
            call = new_call.id(),
            existing = existing_call.id(),
            "merging second party's call"
        );
        match new_call.conference(existing_call.as_ref()).await {
            Ok(()) => {
                info!(call = new_call.id(), "merge complete");
                Ok(SequenceOutcome::Merged)
            }
            Err(e) => {
                warn!(
                    call = new_call.id(),
                    error = %e,
                    "merge failed, connecting second party directly"
                );
                self.connect_second_directly(new_call).await;
                Ok(SequenceOutcome::ConnectedDirect)
            }
        }
    }

    async fn connect_second_directly(&self, new_call: &dyn CtiCall) {
        match new_call
            .connect(
                &self.rule.second_terminal,
                &self.rule.second_address,
                &self.rule.destination,
            )
            .await
        {
            Ok(()) => info!(
                call = new_call.id(),
                address = %self.rule.second_address,
                "second party added directly"
            ),
            Err(e) => warn!(
                call = new_call.id(),
                address = %self.rule.second_address,
                error = %e,
                "failed to connect second party"
            ),
        }
    }
}
