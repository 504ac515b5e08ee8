//! Chunksync CLI - parallel chunked copy and delta sync.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chunksync::{
    parse_rate, parse_size, CheckpointStore, Delta, DeltaEngine, FileOutcome, JobStatus, LocalTransport,
    OrderingStrategy, ProgressSnapshot, RelPath, Schedule, Scanner, SignatureTable, SyncBuilder, SyncConfig, SyncEngine,
};

/// Chunksync - parallel chunked copy, delta sync and resume
#[derive(Parser)]
#[command(name = "chunksync")]
#[command(version)]
#[command(about = "Parallel chunked copy and delta sync with throttling and resume")]
#[command(long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize a source tree into a destination directory
    Sync(SyncArgs),

    /// Inspect or prune checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommand,
    },

    /// Validate a bandwidth schedule and print the limit in force now
    Schedule {
        /// Schedule file (JSON)
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Generate a block signature for a file
    Signature {
        /// File to sign
        #[arg(required = true)]
        file: PathBuf,

        /// Output signature file (default: <file>.sig)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Block size (power of 2)
        #[arg(short, long, default_value = "65536")]
        block_size: usize,
    },

    /// Compute a delta between a source and a signature
    Delta {
        /// Source file (new version)
        #[arg(required = true)]
        source: PathBuf,

        /// Signature file (of old version)
        #[arg(required = true)]
        signature: PathBuf,

        /// Output delta file (default: <source>.delta)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Apply a delta to a basis file
    Patch {
        /// Basis file (old version)
        #[arg(required = true)]
        basis: PathBuf,

        /// Delta file
        #[arg(required = true)]
        delta: PathBuf,

        /// Output file (default: <basis>.patched)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Source directory
    #[arg(required = true)]
    source: PathBuf,

    /// Destination directory
    #[arg(required = true)]
    dest: PathBuf,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads (0 = available parallelism)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Files at or above this size are chunked (e.g. 1G)
    #[arg(long, value_parser = size_arg)]
    chunk_threshold: Option<u64>,

    /// Chunk size (e.g. 64M)
    #[arg(long, value_parser = size_arg)]
    chunk_size: Option<u64>,

    /// Bandwidth limit in bytes per second (e.g. 100M)
    #[arg(long, value_parser = rate_arg)]
    bwlimit: Option<u64>,

    /// Time-of-day bandwidth schedule (JSON); overrides --bwlimit
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// Manifest file for incremental runs
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Checkpoint directory for resumable transfers
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Always copy whole files
    #[arg(long)]
    no_delta: bool,

    /// Skip destination hash verification
    #[arg(long)]
    no_verify: bool,

    /// Ignore the manifest and resend unchanged files
    #[arg(long)]
    full: bool,

    /// Show what would be transferred or deleted without writing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Delete destination files that no longer exist at the source
    #[arg(long)]
    delete: bool,

    /// Do not copy modification times
    #[arg(long)]
    no_times: bool,

    /// File order: none, smallest-first, largest-first, newest-first, oldest-first
    #[arg(long, value_parser = order_arg)]
    order: Option<OrderingStrategy>,

    /// Print the job report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// List checkpoints
    List {
        /// Checkpoint directory
        #[arg(long, required = true)]
        dir: PathBuf,
    },

    /// Remove checkpoints older than the given age
    Cleanup {
        /// Checkpoint directory
        #[arg(long, required = true)]
        dir: PathBuf,

        /// Maximum age in hours
        #[arg(long, default_value = "168")]
        max_age_hours: u64,
    },
}

fn size_arg(s: &str) -> Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

fn rate_arg(s: &str) -> Result<u64, String> {
    parse_rate(s).map_err(|e| e.to_string())
}

fn order_arg(s: &str) -> Result<OrderingStrategy, String> {
    s.parse::<OrderingStrategy>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Sync(args) => run_sync(args),
        Commands::Checkpoints { command } => run_checkpoints(command).map(|()| ExitCode::SUCCESS),
        Commands::Schedule { file } => run_schedule(&file).map(|()| ExitCode::SUCCESS),
        Commands::Signature {
            file,
            output,
            block_size,
        } => run_signature(&file, output, block_size).map(|()| ExitCode::SUCCESS),
        Commands::Delta {
            source,
            signature,
            output,
        } => run_delta(&source, &signature, output).map(|()| ExitCode::SUCCESS),
        Commands::Patch { basis, delta, output } => run_patch(&basis, &delta, output).map(|()| ExitCode::SUCCESS),
    }
}

fn sync_config(args: &SyncArgs) -> chunksync::Result<SyncConfig> {
    let base = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    let interval = base.checkpoint_interval;
    let mut builder = SyncBuilder::from_config(base);
    if let Some(threads) = args.threads {
        builder = builder.threads(threads);
    }
    if let Some(bytes) = args.chunk_threshold {
        builder = builder.chunk_threshold(bytes);
    }
    if let Some(bytes) = args.chunk_size {
        builder = builder.chunk_size(bytes);
    }
    if let Some(rate) = args.bwlimit {
        builder = builder.bandwidth_limit(rate);
    }
    if let Some(path) = &args.schedule {
        builder = builder.schedule(path);
    }
    if let Some(path) = &args.manifest {
        builder = builder.manifest(path);
    }
    if let Some(dir) = &args.checkpoint_dir {
        builder = builder.checkpoints(dir, interval);
    }
    if args.no_delta {
        builder = builder.delta(false);
    }
    if args.no_verify {
        builder = builder.verify(false);
    }
    if args.full {
        builder = builder.incremental(false);
    }
    if let Some(order) = args.order {
        builder = builder.ordering(order);
    }
    if args.dry_run {
        builder = builder.dry_run(true);
    }
    if args.delete {
        builder = builder.delete_extra(true);
    }
    if args.no_times {
        builder = builder.preserve_times(false);
    }
    builder.build()
}

fn run_sync(args: SyncArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = sync_config(&args)?;
    let scanner = Scanner::new(&args.source, config.scan.clone())?;
    let engine = SyncEngine::new(
        LocalTransport::new(&args.source),
        LocalTransport::new(&args.dest),
        config,
    )?
    .with_observer(Arc::new(
        |path: &RelPath, outcome: &FileOutcome, snapshot: &ProgressSnapshot| match outcome {
            FileOutcome::Failed { error } => eprintln!("failed  {path}: {error}"),
            other => tracing::debug!(path = %path, outcome = ?other, progress = %snapshot, "file done"),
        },
    ));

    let report = engine.run(scanner.iter())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.dry_run {
        for file in &report.files {
            println!("{:<5} {} ({} bytes)", file.action, file.path, file.size);
        }
        for path in &report.deleted {
            println!("delete {path}");
        }
        for error in &report.scan_errors {
            eprintln!("scan error: {error}");
        }
    } else {
        println!("{}", report.progress);
        for error in &report.scan_errors {
            eprintln!("scan error: {error}");
        }
        for path in &report.deleted {
            println!("deleted {path}");
        }
        for error in &report.delete_errors {
            eprintln!("delete failed: {error}");
        }
        println!(
            "{:?}: {} transferred, {} skipped, {} failed in {:.1}s",
            report.status,
            report.progress.files_transferred,
            report.progress.files_skipped,
            report.progress.files_failed,
            report.elapsed_secs
        );
    }

    Ok(match report.status {
        JobStatus::Completed => ExitCode::SUCCESS,
        JobStatus::CompletedWithFailures => ExitCode::from(23),
        JobStatus::Cancelled => ExitCode::from(20),
    })
}

fn run_checkpoints(command: CheckpointCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CheckpointCommand::List { dir } => {
            let store = CheckpointStore::open(&dir)?;
            for (file, checkpoint) in store.list()? {
                match checkpoint {
                    Ok(cp) => println!(
                        "{} {} offset={} chunks={} size={}",
                        cp.transfer_id,
                        cp.path,
                        cp.confirmed_offset,
                        cp.completed_chunks.len(),
                        cp.size
                    ),
                    Err(e) => eprintln!("{}: {e}", file.display()),
                }
            }
        }
        CheckpointCommand::Cleanup { dir, max_age_hours } => {
            let store = CheckpointStore::open(&dir)?;
            let removed = store.cleanup(Duration::from_secs(max_age_hours * 3600))?;
            println!("Removed {removed} checkpoint(s)");
        }
    }
    Ok(())
}

fn run_schedule(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let schedule = Schedule::load(file)?;
    let now = chrono::Local::now();
    let rule = schedule.active_rule(now.weekday(), now.time());
    println!("{} rule(s), default {} B/s", schedule.rules.len(), schedule.default_limit);
    match rule {
        Some(rule) => println!("Active: {} at {} B/s", rule.name, rule.limit),
        None if schedule.enabled => println!("Active: default at {} B/s", schedule.resolve_now()),
        None => println!("Disabled: unlimited"),
    }
    Ok(())
}

fn run_signature(file: &Path, output: Option<PathBuf>, block_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let engine = DeltaEngine::new(block_size)?;
    let table = engine.signature(&mut BufReader::new(File::open(file)?))?;
    let output = output.unwrap_or_else(|| file.with_extension("sig"));
    bincode::serialize_into(BufWriter::new(File::create(&output)?), &table)?;
    println!(
        "Wrote {} ({} blocks of {} bytes)",
        output.display(),
        table.block_count(),
        table.block_size()
    );
    Ok(())
}

fn run_delta(source: &Path, signature: &Path, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let table: SignatureTable = bincode::deserialize_from(BufReader::new(File::open(signature)?))?;
    let engine = DeltaEngine::new(table.block_size())?;
    let delta = engine.delta(&mut BufReader::new(File::open(source)?), &table)?;
    let output = output.unwrap_or_else(|| source.with_extension("delta"));
    bincode::serialize_into(BufWriter::new(File::create(&output)?), &delta)?;
    println!(
        "Wrote {} ({} bytes matched, {} bytes literal, {:.1}% reused)",
        output.display(),
        delta.bytes_matched(),
        delta.bytes_literal(),
        delta.compression_ratio() * 100.0
    );
    Ok(())
}

fn run_patch(basis: &Path, delta: &Path, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let delta: Delta = bincode::deserialize_from(BufReader::new(File::open(delta)?))?;
    let output = output.unwrap_or_else(|| basis.with_extension("patched"));
    let mut writer = BufWriter::new(File::create(&output)?);
    delta.apply(&mut BufReader::new(File::open(basis)?), &mut writer)?;
    writer.flush()?;
    println!("Wrote {} ({} bytes)", output.display(), delta.source_size);
    Ok(())
}
