//! Recurring expiration pass.

use std::time::Duration;

use db::{DbError, ExpirationSweeper};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio_util::sync::CancellationToken;

use crate::messages::SweeperMessage;

pub struct SweeperArgs {
    pub sweeper: ExpirationSweeper,
    pub cancel: CancellationToken,
}

pub struct SweeperActorState {
    pub sweeper: ExpirationSweeper,
    pub cancel: CancellationToken,
    pub passes: u64,
}

impl SweeperActorState {
    /// Queue the next pass after the check interval, unless cancelled first.
    fn schedule_next(&self, myself: &ActorRef<SweeperMessage>, after: Duration) {
        let myself = myself.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = myself.send_message(SweeperMessage::Sweep);
                }
            }
        });
    }
}

/// Runs the expiration sweeper on its check interval.
pub struct SweeperActor;

impl Actor for SweeperActor {
    type Msg = SweeperMessage;
    type State = SweeperActorState;
    type Arguments = SweeperArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting expiration sweeper (every {:?})",
            args.sweeper.check_interval()
        );

        Ok(SweeperActorState {
            sweeper: args.sweeper,
            cancel: args.cancel,
            passes: 0,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_message(SweeperMessage::Sweep)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SweeperMessage::Sweep => {
                match state.sweeper.run_once(&state.cancel).await {
                    Ok(report) => {
                        state.passes += 1;
                        if report.total_deleted() > 0 {
                            tracing::info!(
                                "Expiration pass {} removed {} records",
                                state.passes,
                                report.total_deleted()
                            );
                        }
                    }
                    Err(DbError::Cancelled) => {
                        myself.stop(None);
                        return Ok(());
                    }
                    Err(DbError::DistributedLockTimeout { .. }) => {
                        tracing::debug!("Expiration pass skipped: another process holds the lock");
                    }
                    Err(e) => {
                        tracing::warn!("Expiration pass failed, retrying next interval: {}", e);
                    }
                }

                state.schedule_next(&myself, state.sweeper.check_interval());
            }
        }

        Ok(())
    }
}
