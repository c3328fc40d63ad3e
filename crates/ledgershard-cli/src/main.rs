//! Ledgershard operator tool.

mod args;

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgershard_core::shard::{
    InterruptedMigration, MigrateState, ShardHashCalculator, ShardRecord, ShardRegistry,
    ShardingError,
};
use ledgershard_core::storage::{CsvExporter, ExportStats};
use ledgershard_core::{MigrationContext, ShardMigrationExecutor};

use args::{Args, Command};

#[derive(Serialize)]
struct Status {
    state: MigrateState,
    shards: Vec<ShardRecord>,
    interrupted: Option<InterruptedMigration>,
}

#[derive(Serialize)]
struct Verification {
    shard_id: u64,
    stored: Option<String>,
    computed: String,
    matches: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgershard=info,ledgershard_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.to_config()?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        db_name = %config.db_name,
        page_size = config.page_size,
        "configuration loaded"
    );

    let ctx = Arc::new(MigrationContext::open(config)?);
    let executor = Arc::new(ShardMigrationExecutor::new(ctx));

    match args.command {
        Command::Status => print_json(&status(&executor)?)?,
        Command::Migrate { height } => {
            let runner = Arc::clone(&executor);
            let state = tokio::task::spawn_blocking(move || runner.migrate(height)).await??;
            tracing::info!(%state, "migration finished");
            print_json(&status(&executor)?)?;
        }
        Command::Verify { shard } => {
            let verification = verify(&executor, shard)?;
            print_json(&verification)?;
            if !verification.matches {
                tracing::error!(shard_id = shard, "shard hash mismatch");
                std::process::exit(2);
            }
        }
        Command::Export { height, out } => {
            let out = out.unwrap_or_else(|| executor.context().config().data_dir.join("export"));
            let stats = export(&executor, height, out)?;
            print_json(&stats)?;
        }
        Command::Reset { state } => {
            let state: MigrateState = state.parse()?;
            executor.reset_checkpoint(state)?;
            tracing::warn!(%state, "recovery checkpoint overwritten");
        }
    }

    Ok(())
}

fn status(executor: &ShardMigrationExecutor) -> Result<Status, ShardingError> {
    let interrupted = executor.recover()?;
    let main = executor.context().databases().main();
    Ok(Status {
        state: interrupted
            .as_ref()
            .map(|i| i.checkpoint.state)
            .unwrap_or(MigrateState::Init),
        shards: ShardRegistry::new(&main).list_shards()?,
        interrupted,
    })
}

fn verify(executor: &ShardMigrationExecutor, shard_id: u64) -> Result<Verification, ShardingError> {
    let ctx = executor.context();
    let record = {
        let main = ctx.databases().main();
        ShardRegistry::new(&main)
            .get_shard(shard_id)?
            .ok_or(ShardingError::ShardNotFound { shard_id })?
    };

    let shard = ctx.databases().open_shard_read_only(shard_id)?;
    let computed = ShardHashCalculator::new(&shard, ctx.config().height.digest).calculate()?;
    Ok(Verification {
        shard_id,
        matches: record.content_hash.as_deref() == Some(computed.as_slice()),
        stored: record.content_hash.map(hex::encode),
        computed: hex::encode(computed),
    })
}

fn export(
    executor: &ShardMigrationExecutor,
    height: u64,
    out: std::path::PathBuf,
) -> Result<Vec<Exported>, ledgershard_core::Error> {
    let ctx = executor.context();
    let exporter = CsvExporter::new(out, ctx.config().page_size);
    let main = ctx.databases().open_main()?;
    let stats = exporter.export_all(&main, ctx.derived_tables(), height as i64)?;
    Ok(stats.into_iter().map(Exported::from).collect())
}

#[derive(Serialize)]
struct Exported {
    table: String,
    rows: u64,
    path: Option<String>,
}

impl From<ExportStats> for Exported {
    fn from(stats: ExportStats) -> Self {
        Self {
            table: stats.table,
            rows: stats.rows,
            path: stats.path.map(|p| p.display().to_string()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
