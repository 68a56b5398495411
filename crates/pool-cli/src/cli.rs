use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "pool",
    about = "Deduplicating chunk pool: reference counts, reclaim and fsck",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: ./pool.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Pool directory, overrides the config file
    #[arg(long, global = true)]
    pub pool: Option<PathBuf>,

    /// Hosts directory, overrides the config file
    #[arg(long, global = true)]
    pub hosts: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check (and optionally repair) pool consistency
    #[command(subcommand)]
    Fsck(FsckCommand),
    /// Fold a backup into, or out of, the host and pool ledgers
    #[command(subcommand)]
    Refcnt(RefcntCommand),
    /// Delete or archive chunks of the unused set
    Reclaim(ReclaimArgs),
    /// Show ledger statistics
    Stats(StatsArgs),
    /// Store or print a single chunk
    #[command(subcommand)]
    Chunk(ChunkCommand),
}

#[derive(Subcommand)]
pub enum FsckCommand {
    /// Compare ledgers with what they are derived from
    Refcnt(FsckRefcntArgs),
    /// Reconcile chunk files with the pool ledger and unused set
    Unused(RepairArgs),
    /// Re-hash every chunk
    Chunks,
    /// Compare content and on-disk sizes
    Compression(CompressionArgs),
}

#[derive(Args)]
pub struct FsckRefcntArgs {
    /// Restrict to one host
    #[arg(long)]
    pub host: Option<String>,
    /// Restrict to one backup of --host
    #[arg(long, requires = "host")]
    pub backup: Option<u32>,
    #[command(flatten)]
    pub repair: RepairArgs,
}

#[derive(Args)]
pub struct RepairArgs {
    /// Rewrite inconsistent ledgers instead of only reporting
    #[arg(long)]
    pub repair: bool,
}

#[derive(Args)]
pub struct CompressionArgs {
    /// Walk every chunk file instead of the pool ledger
    #[arg(long)]
    pub all: bool,
}

#[derive(Subcommand)]
pub enum RefcntCommand {
    /// Write the backup ledger from its manifests and add it upwards
    Add(BackupRef),
    /// Subtract a backup ledger from the host and pool ledgers
    Remove(BackupRef),
}

#[derive(Args)]
pub struct BackupRef {
    pub host: String,
    pub backup: u32,
}

#[derive(Args)]
pub struct ReclaimArgs {
    /// Move chunks here instead of deleting them
    #[arg(long)]
    pub archive: Option<PathBuf>,
}

#[derive(Args)]
pub struct StatsArgs {
    /// Host ledger instead of the pool ledger
    #[arg(long)]
    pub host: Option<String>,
    /// Print the whole history
    #[arg(long)]
    pub history: bool,
}

#[derive(Subcommand)]
pub enum ChunkCommand {
    /// Store a file as one chunk and print its hash
    Put { file: PathBuf },
    /// Write a chunk's content to stdout
    Cat { sha256: String },
}
