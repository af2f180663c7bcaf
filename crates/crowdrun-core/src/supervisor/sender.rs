//! Background task draining the supervisor's outbox.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::SupervisorInner;

/// Flush on every push and on every tick, queueing status polls as they
/// come due, until the supervisor is cancelled.
pub(super) async fn run(sup: Arc<SupervisorInner>) {
    let mut tick = tokio::time::interval(sup.config.sender_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sup.cancel.cancelled() => break,
            _ = tick.tick() => {}
            _ = sup.outbox.notified() => {}
        }
        sup.poll_agent_statuses();
        sup.flush().await;
    }
    debug!(task_run_id = %sup.task_run_id(), "sender stopped");
}
