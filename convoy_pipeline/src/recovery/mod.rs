//! Work that failed and is retried in the background.
//!
//! - [`storage`]: commits, notifications and state table updates waiting for
//!   their storage account to come back.
//! - [`notification`]: notifications waiting for the endpoint to come back.
//! - [`side_queue`]: notifications rejected for their key or schema.
//! - [`startup`]: blobs left unfinished by a previous run.

pub mod notification;
pub mod side_queue;
pub mod startup;
pub mod storage;

use tracing::warn;

use crate::{
    context::{BlobContext, LogState},
    recovery::storage::RecoveryAction,
    services::PipelineServices,
};

/// Release the counters held by a blob the pipeline stops tracking.
///
/// The blob's state row stays in the table, so the next run picks it up.
pub(crate) fn give_up(services: &PipelineServices, ctx: &BlobContext, action: RecoveryAction) {
    match (action, ctx.log_state) {
        (RecoveryAction::Commit, _) => services.state.dec_pending_commits(),
        (RecoveryAction::Notify, _) => services.state.dec_pending_notifications(),
        (RecoveryAction::StateTableUpdate, LogState::Committed) => {
            services.state.dec_pending_commits()
        }
        (RecoveryAction::StateTableUpdate, LogState::Notified) => {
            services.state.dec_pending_notifications()
        }
        (RecoveryAction::StateTableUpdate, LogState::Uploading) => {}
    }

    services.metrics.recovery_abandoned(action.name());
    warn!(
        action = action.name(),
        blob = %ctx,
        "pipeline is stopping, leaving blob for the next run"
    );
}
