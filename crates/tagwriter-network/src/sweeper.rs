//! Periodic expiry of commands no agent claimed.

use std::time::Duration;

use tagwriter_storage::{CommandQueue, SqliteCommandQueue, StorageResult};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::fanout::FanoutHub;

/// Fail pending commands older than `ttl` and publish each of them.
///
/// Returns the number of expired commands.
pub async fn sweep_once(
    queue: &SqliteCommandQueue,
    fanout: &FanoutHub,
    ttl: Duration,
) -> StorageResult<usize> {
    let expired = queue.expire_pending(ttl).await?;
    for command in &expired {
        debug!(id = %command.id, "Publishing expired command");
        fanout.publish_command(command);
    }
    Ok(expired.len())
}

/// Run [`sweep_once`] every `every` until `shutdown` fires.
pub fn spawn_expiry_sweeper(
    queue: SqliteCommandQueue,
    fanout: FanoutHub,
    ttl: Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(ttl_secs = ttl.as_secs(), every_secs = every.as_secs(), "Expiry sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&queue, &fanout, ttl).await {
                        error!(error = %e, "Expiry sweep failed");
                    }
                }
            }
        }
        debug!("Expiry sweeper stopped");
    })
}
