//! SSTable Backup - Main entry point
//!
//! Runs one backup or restore operation against the local node and exits.

use anyhow::Context;
use clap::{Parser, Subcommand};
use sstable_backup::daemon::shutdown::wait_for_signal;
use sstable_backup::executor::predicates::Subset;
use sstable_backup::executor::restore::RestoreRequest;
use sstable_backup::node::Nodetool;
use sstable_backup::ops::backup::BackupRequest;
use sstable_backup::ops::commitlog::parse_timestamp;
use sstable_backup::ops::{self, OperationContext};
use sstable_backup::storage::{open_backend, StorageLocation};
use sstable_backup::transfer::LogProgressSink;
use sstable_backup::{utils, BackupError, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Remote location, e.g. s3://bucket/cluster/node (overrides config)
    #[arg(long, global = true)]
    location: Option<String>,

    /// Database data directory (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Concurrent transfers (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Bandwidth cap per second, e.g. 50MB (overrides config)
    #[arg(long, global = true)]
    bandwidth: Option<String>,

    /// Target transfer duration in seconds (overrides config)
    #[arg(long, global = true)]
    duration_secs: Option<u64>,

    /// Wait for a running operation to release the lock
    #[arg(long, global = true)]
    wait_for_lock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot the node and upload the snapshot
    Backup {
        /// Snapshot tag
        #[arg(short, long)]
        tag: String,

        /// Keyspaces to back up (all when omitted)
        #[arg(short, long = "keyspace", value_delimiter = ',')]
        keyspaces: Vec<String>,

        /// Single table within the keyspaces
        #[arg(long)]
        table: Option<String>,
    },

    /// Restore a snapshot into the data directory
    Restore {
        /// Snapshot tag
        #[arg(short, long)]
        tag: String,

        /// Keyspaces and tables to restore, e.g. `ks1,ks2.users`
        #[arg(long)]
        subset: Option<Subset>,

        /// Also restore the system keyspace
        #[arg(long)]
        restore_system_keyspace: bool,

        /// Restore into a node that already belongs to a cluster
        #[arg(long)]
        existing_cluster: bool,
    },

    /// Upload the live commit-log segments
    CommitlogBackup {
        /// Drain the node first
        #[arg(long)]
        drain: bool,
    },

    /// Fetch commit-log segments for a point-in-time restore
    CommitlogRestore {
        /// Window start: RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or epoch millis
        #[arg(long, value_parser = parse_timestamp)]
        start: u64,

        /// Window end, in the same formats
        #[arg(long, value_parser = parse_timestamp)]
        end: u64,
    },
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(location) = &self.location {
            config.storage.location = Some(location.clone());
        }
        if let Some(data_dir) = &self.data_dir {
            config.node.data_dir = data_dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.transfer.concurrency = concurrency;
        }
        if let Some(bandwidth) = &self.bandwidth {
            config.transfer.bandwidth = Some(bandwidth.clone());
        }
        if let Some(duration) = self.duration_secs {
            config.transfer.duration_secs = Some(duration);
        }
        if self.wait_for_lock {
            config.lock.wait = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<BackupError>()
                .map_or(1, BackupError::exit_code);
            error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::from(code as u8)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    utils::logger::init(&config.log.level)?;
    info!("Starting sstable-backup v{}", env!("CARGO_PKG_VERSION"));

    let location = config.storage.location.as_deref().ok_or_else(|| {
        BackupError::Config("no storage location; pass --location or set [storage] location".to_string())
    })?;
    let backend = open_backend(&StorageLocation::parse(location)?)?;
    info!(
        "Using {} storage at {}",
        backend.location().provider,
        backend.location()
    );

    let node = Nodetool::new(config.node.nodetool.clone())
        .with_endpoint(config.node.jmx_host.clone(), config.node.jmx_port);
    let ctx = OperationContext {
        config,
        backend,
        node: Arc::new(node),
        sink: Arc::new(LogProgressSink),
    };

    // Dropping the operation future releases its lock and snapshot guards.
    tokio::select! {
        result = execute(&ctx, args.command) => result,
        signal = wait_for_signal() => {
            signal?;
            Err(BackupError::Interrupted.into())
        }
    }
}

async fn execute(ctx: &OperationContext, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Backup {
            tag,
            keyspaces,
            table,
        } => {
            let request = BackupRequest {
                snapshot_tag: tag,
                keyspaces,
                table,
            };
            let summary = ops::backup::backup(ctx, &request).await?;
            info!(
                "Backed up {} tables ({} data files): {} uploaded, {} already present",
                summary.tables,
                summary.data_files,
                summary.upload.uploaded_files,
                summary.upload.freshened_files
            );
        }
        Command::Restore {
            tag,
            subset,
            restore_system_keyspace,
            existing_cluster,
        } => {
            let subset = subset.unwrap_or_default();
            if !subset.is_empty() {
                info!("Restoring keyspaces {}", subset.keyspaces().join(", "));
            }
            let request = RestoreRequest {
                snapshot_tag: tag,
                subset,
                restore_system_keyspace,
                is_existing_cluster: existing_cluster,
            };
            ops::restore::restore(ctx, &request).await?;
        }
        Command::CommitlogBackup { drain } => {
            let summary = ops::commitlog::commitlog_backup(ctx, drain).await?;
            info!(
                "Backed up {} commit-log segments ({} bytes uploaded)",
                summary.segments, summary.upload.uploaded_bytes
            );
        }
        Command::CommitlogRestore { start, end } => {
            let summary = ops::commitlog::commitlog_restore(ctx, start, end).await?;
            info!(
                "Restored {} commit-log segments ({} bytes)",
                summary.segments, summary.bytes
            );
        }
    }
    Ok(())
}
