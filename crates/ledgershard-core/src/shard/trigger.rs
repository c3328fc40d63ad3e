//! Decides when to start a shard migration and runs it in the background.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::ShardingError;
use super::executor::ShardMigrationExecutor;
use super::state::MigrateState;
use crate::config::HeightConfig;

/// Chain facts the trigger needs from block processing.
pub trait ChainView: Send + Sync {
    /// Height below which blocks can no longer be rolled back.
    fn min_rollback_height(&self) -> u64;

    /// Chain parameters in effect at the current height.
    fn height_config(&self) -> HeightConfig;
}

/// Something that can run a migration to completion.
pub trait MigrationRunner: Send + Sync + 'static {
    /// Archive everything below `target_height` into a new shard.
    fn run_migration(&self, target_height: u64) -> Result<MigrateState, ShardingError>;
}

impl MigrationRunner for ShardMigrationExecutor {
    fn run_migration(&self, target_height: u64) -> Result<MigrateState, ShardingError> {
        self.migrate(target_height)
    }
}

/// Starts a migration whenever the rollback horizon crosses a sharding
/// boundary.
pub struct ShardObserver<R: MigrationRunner> {
    runner: Arc<R>,
    chain: Arc<dyn ChainView>,
}

impl<R: MigrationRunner> ShardObserver<R> {
    /// Create an observer.
    pub fn new(runner: Arc<R>, chain: Arc<dyn ChainView>) -> Self {
        Self { runner, chain }
    }

    /// Height a migration would archive up to right now, if one is due.
    pub fn due_height(&self) -> Option<u64> {
        let config = self.chain.height_config();
        if !config.sharding_enabled {
            debug!("sharding disabled at current height");
            return None;
        }
        let height = self.chain.min_rollback_height();
        if height == 0 || config.sharding_frequency == 0 || height % config.sharding_frequency != 0 {
            return None;
        }
        Some(height)
    }

    /// Start a migration in the background when one is due.
    ///
    /// Returns `None` when no migration is due or no tokio runtime is
    /// available. The handle resolves to `true` when the shard completed;
    /// failures are logged and resolve to `false`.
    pub fn try_create_shard_async(&self) -> Option<JoinHandle<bool>> {
        let height = self.due_height()?;
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "no runtime to run shard migration on");
                return None;
            }
        };

        info!(height, "starting shard migration");
        let runner = Arc::clone(&self.runner);
        Some(handle.spawn_blocking(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| runner.run_migration(height))) {
                Ok(Ok(MigrateState::Completed)) => {
                    info!(height, "shard migration completed");
                    true
                }
                Ok(Ok(state)) => {
                    warn!(height, %state, "shard migration stopped before completion");
                    false
                }
                Ok(Err(e)) => {
                    error!(
                        height,
                        error = %e,
                        retryable = e.is_retryable(),
                        "shard migration failed"
                    );
                    false
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(height, panic = message, "shard migration panicked");
                    false
                }
            }
        }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
