use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use pool_fsck::{
    BackupCatalog, ChunkReport, CompressionReport, ConsistencyChecker, FsckReport, FsckResult,
    IntegrityReport, JsonlCatalog, UnusedReport,
};
use pool_ledger::{latest_statistics, read_statistics, PoolLayout};
use pool_lock::FileLockService;
use pool_refcnt::{ReclaimReport, ReclaimTarget, RefcntCoordinator, TracingReporter};
use pool_store::{ChunkStore, FsChunkStore};
use pool_types::{ChunkHash, PoolStatistics};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cli::*;
use crate::config::PoolConfig;

/// Mismatches listed per level before the output is cut short.
const MAX_LISTED: usize = 20;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let ctx = Session::open(&cli)?;
    match cli.command {
        Command::Fsck(FsckCommand::Refcnt(args)) => cmd_fsck_refcnt(&ctx, args),
        Command::Fsck(FsckCommand::Unused(args)) => cmd_fsck_unused(&ctx, args),
        Command::Fsck(FsckCommand::Chunks) => cmd_fsck_chunks(&ctx),
        Command::Fsck(FsckCommand::Compression(args)) => cmd_fsck_compression(&ctx, args),
        Command::Refcnt(RefcntCommand::Add(args)) => cmd_refcnt_add(&ctx, args),
        Command::Refcnt(RefcntCommand::Remove(args)) => cmd_refcnt_remove(&ctx, args),
        Command::Reclaim(args) => cmd_reclaim(&ctx, args),
        Command::Stats(args) => cmd_stats(&ctx, args),
        Command::Chunk(ChunkCommand::Put { file }) => cmd_chunk_put(&ctx, file),
        Command::Chunk(ChunkCommand::Cat { sha256 }) => cmd_chunk_cat(&ctx, &sha256),
    }
}

/// Everything a command needs, built from the config file and flags.
struct Session {
    config: PoolConfig,
    layout: PoolLayout,
    store: Arc<FsChunkStore>,
    format: OutputFormat,
}

impl Session {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = PoolConfig::load(cli.config.as_deref())?;
        if let Some(pool) = &cli.pool {
            config.pool_dir = pool.clone();
        }
        if let Some(hosts) = &cli.hosts {
            config.hosts_dir = hosts.clone();
        }
        debug!(pool = ?config.pool_dir, hosts = ?config.hosts_dir, "configuration loaded");

        let store = FsChunkStore::open(&config.pool_dir, config.store_config())
            .with_context(|| format!("cannot open pool {}", config.pool_dir.display()))?;
        Ok(Self {
            layout: PoolLayout::new(&config.pool_dir, &config.hosts_dir),
            store: Arc::new(store),
            format: cli.format,
            config,
        })
    }

    fn coordinator(&self) -> RefcntCoordinator {
        let locks = FileLockService::for_pool(&self.config.pool_dir, self.config.lock_config());
        RefcntCoordinator::new(Arc::new(locks)).with_lock_timeout(self.config.lock_timeout())
    }

    fn catalog(&self) -> JsonlCatalog {
        JsonlCatalog::new(self.layout.clone())
    }

    fn checker(&self) -> ConsistencyChecker {
        ConsistencyChecker::new(
            self.layout.clone(),
            self.store.clone(),
            Arc::new(self.catalog()),
            self.coordinator(),
        )
    }

    fn reporter(&self) -> TracingReporter {
        TracingReporter::default()
    }

    /// Print `value` as JSON when asked to; returns whether it did.
    fn emit_json<T: Serialize>(&self, value: &T) -> anyhow::Result<bool> {
        if self.format != OutputFormat::Json {
            return Ok(false);
        }
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(true)
    }
}

// ── fsck ────────────────────────────────────────────────────────────────

fn cmd_fsck_refcnt(ctx: &Session, args: FsckRefcntArgs) -> anyhow::Result<()> {
    let checker = ctx.checker();
    let reporter = ctx.reporter();
    let dry_run = !args.repair.repair;

    let report = match (args.host, args.backup) {
        (Some(host), Some(number)) => FsckReport {
            levels: vec![checker.check_backup_integrity(&host, number, &reporter, dry_run)?],
            aborted: false,
        },
        (Some(host), None) => {
            let mut levels = Vec::new();
            for number in ctx.catalog().backups(&host)? {
                levels.push(checker.check_backup_integrity(&host, number, &reporter, dry_run)?);
            }
            levels.push(checker.check_host_integrity(&host, &reporter, dry_run)?);
            FsckReport { levels, aborted: false }
        }
        (None, _) => checker.check_all_integrity(&reporter, dry_run)?,
    };

    if !ctx.emit_json(&report)? {
        for level in &report.levels {
            print_level(level);
        }
    }

    let mismatches = report.mismatch_count();
    if dry_run && mismatches > 0 {
        bail!("{mismatches} reference count mismatches (run with --repair to fix)");
    }
    Ok(())
}

fn print_level(level: &IntegrityReport) {
    let scope = level.scope.to_string();
    if level.is_consistent() {
        println!("{} {}: {} chunks", "✓".green(), scope.bold(), level.checked);
        return;
    }
    let status = if level.fixed { "repaired".yellow() } else { "inconsistent".red() };
    println!(
        "{} {}: {} of {} chunks {}",
        "✗".red().bold(),
        scope.bold(),
        level.mismatches.len(),
        level.checked,
        status
    );
    for mismatch in level.mismatches.iter().take(MAX_LISTED) {
        println!(
            "    {} {} → {}",
            mismatch.sha256.to_string().dimmed(),
            mismatch.original_refcnt,
            mismatch.new_refcnt.to_string().bold()
        );
        for file in &mismatch.filenames {
            println!("      {}", file.cyan());
        }
    }
    if level.mismatches.len() > MAX_LISTED {
        println!("    … {} more", level.mismatches.len() - MAX_LISTED);
    }
}

fn cmd_fsck_unused(ctx: &Session, args: RepairArgs) -> anyhow::Result<()> {
    let report = ctx.checker().process_unused(&ctx.reporter(), !args.repair)?;
    if !ctx.emit_json(&report)? {
        print_unused(&report);
    }
    // Missing chunks survive a repair.
    let outstanding = if report.repaired { report.missing } else { report.error_count() };
    if outstanding > 0 {
        bail!("{outstanding} unused set errors");
    }
    Ok(())
}

fn print_unused(report: &UnusedReport) {
    println!("{}", "Chunks on disk".bold());
    println!("  referenced:        {}", report.in_refcnt);
    println!("  unused:            {}", report.in_unused);
    println!("  untracked:         {}", count(report.in_nothing));
    println!("  referenced+unused: {}", count(report.in_both));
    println!("{}", "Without a file".bold());
    println!("  referenced:        {}", count(report.missing));
    println!("  unused:            {}", report.stale_unused);
    if report.aborted {
        println!("{} scan aborted", "!".yellow().bold());
    } else if report.repaired {
        println!("{} unused set repaired", "✓".green());
    }
}

fn count(n: u64) -> colored::ColoredString {
    if n == 0 {
        n.to_string().normal()
    } else {
        n.to_string().red().bold()
    }
}

fn cmd_fsck_chunks(ctx: &Session) -> anyhow::Result<()> {
    let report = ctx.checker().process_verify_chunk(&ctx.reporter())?;
    if !ctx.emit_json(&report)? {
        print_chunks(&report);
    }
    if !report.corrupted.is_empty() {
        bail!("{} corrupted chunks", report.corrupted.len());
    }
    Ok(())
}

fn print_chunks(report: &ChunkReport) {
    println!("{} {} chunks verified", "✓".green(), report.ok);
    for sha256 in &report.corrupted {
        println!("{} {}", "corrupt".red().bold(), sha256);
    }
    if report.aborted {
        println!("{} scan aborted", "!".yellow().bold());
    }
}

fn cmd_fsck_compression(ctx: &Session, args: CompressionArgs) -> anyhow::Result<()> {
    let report = ctx.checker().check_compression(&ctx.reporter(), args.all)?;
    if !ctx.emit_json(&report)? {
        print_compression(&report);
    }
    Ok(())
}

fn print_compression(report: &CompressionReport) {
    println!("Chunks:          {}", report.chunks);
    println!("Size:            {}", report.size);
    println!("Compressed size: {}", report.compressed_size);
    match report.ratio() {
        Some(ratio) => println!("Ratio:           {:.3}", ratio),
        None => println!("Ratio:           -"),
    }
    println!("Expanded chunks: {}", report.expanded_chunks);
    for anomaly in &report.anomalies {
        println!(
            "  {} {} {} → {} ({})",
            "anomaly".yellow(),
            anomaly.sha256.to_string().dimmed(),
            anomaly.size,
            anomaly.compressed_size,
            anomaly.content_type.unwrap_or("unknown")
        );
    }
}

// ── refcnt ──────────────────────────────────────────────────────────────

fn cmd_refcnt_add(ctx: &Session, args: BackupRef) -> anyhow::Result<()> {
    let paths = ctx.layout.reference_count(&args.host, args.backup);
    let coordinator = ctx.coordinator();

    let chunks = ctx
        .catalog()
        .list_chunks(&args.host, args.backup)?
        .collect::<FsckResult<Vec<_>>>()?;
    if chunks.is_empty() {
        warn!(host = %args.host, backup = args.backup, "backup has no manifest export");
    }
    coordinator.create_backup_refcnt(ctx.store.as_ref(), &paths.backup_path, chunks)?;
    coordinator.add_backup_refcnt_to(&paths.host_path, Some(&paths.backup_path), None, None)?;
    let stats = coordinator.add_backup_refcnt_to(
        &paths.pool_path,
        Some(&paths.backup_path),
        Some(&paths.unused_pool_path),
        None,
    )?;

    if !ctx.emit_json(&stats)? {
        println!(
            "{} Added {}/{}",
            "✓".green().bold(),
            args.host.yellow(),
            args.backup
        );
        print_statistics(&stats);
    }
    Ok(())
}

fn cmd_refcnt_remove(ctx: &Session, args: BackupRef) -> anyhow::Result<()> {
    let stats = ctx
        .coordinator()
        .remove_backup(&ctx.layout, &args.host, args.backup)
        .with_context(|| format!("cannot remove backup {}/{}", args.host, args.backup))?;

    if !ctx.emit_json(&stats)? {
        println!(
            "{} Removed {}/{}",
            "✓".green().bold(),
            args.host.yellow(),
            args.backup
        );
        print_statistics(&stats);
    }
    Ok(())
}

// ── reclaim ─────────────────────────────────────────────────────────────

fn cmd_reclaim(ctx: &Session, args: ReclaimArgs) -> anyhow::Result<()> {
    let target = match args.archive {
        Some(dir) => ReclaimTarget::Archive(dir),
        None => ReclaimTarget::Delete,
    };
    let report = ctx.coordinator().remove_unused_files(
        ctx.store.as_ref(),
        &ctx.layout.pool_ledger_path(),
        &ctx.layout.unused_path(),
        &target,
        &ctx.reporter(),
    )?;
    if !ctx.emit_json(&report)? {
        print_reclaim(&report, &target);
    }
    if report.failed > 0 {
        bail!("{} chunks could not be reclaimed", report.failed);
    }
    Ok(())
}

fn print_reclaim(report: &ReclaimReport, target: &ReclaimTarget) {
    let verb = match target {
        ReclaimTarget::Delete => "Deleted".to_string(),
        ReclaimTarget::Archive(dir) => format!("Archived to {}", dir.display()),
    };
    println!(
        "{} {} {} chunks ({} bytes)",
        "✓".green().bold(),
        verb,
        report.reclaimed.to_string().bold(),
        report.reclaimed_size
    );
    if report.still_referenced > 0 {
        println!("  {} still referenced, kept", report.still_referenced.to_string().yellow());
    }
    if report.missing > 0 {
        println!("  {} already gone", report.missing);
    }
    if report.failed > 0 {
        println!("  {} failed", report.failed.to_string().red().bold());
    }
}

// ── stats ───────────────────────────────────────────────────────────────

fn cmd_stats(ctx: &Session, args: StatsArgs) -> anyhow::Result<()> {
    let ledger = match &args.host {
        Some(host) => ctx.layout.host_ledger_path(host),
        None => ctx.layout.pool_ledger_path(),
    };

    if args.history {
        let history = read_statistics(&ledger);
        if ctx.emit_json(&history)? {
            return Ok(());
        }
        for entry in &history {
            println!(
                "{}  refs {:>10}  chunks {:>10}  size {:>14}  compressed {:>14}",
                entry.timestamp.to_rfc3339().dimmed(),
                entry.statistics.nb_ref,
                entry.statistics.nb_chunk,
                entry.statistics.size,
                entry.statistics.compressed_size
            );
        }
        return Ok(());
    }

    match latest_statistics(&ledger) {
        Some(entry) => {
            if !ctx.emit_json(&entry)? {
                println!("As of {}", entry.timestamp.to_rfc3339().cyan());
                print_statistics(&entry.statistics);
            }
        }
        None => println!("No statistics recorded for {}", ledger.display()),
    }
    Ok(())
}

fn print_statistics(stats: &PoolStatistics) {
    println!("  References:    {}", stats.nb_ref);
    println!("  Chunks:        {}", stats.nb_chunk);
    println!("  Longest chain: {}", stats.longest_chain);
    println!("  Size:          {}", stats.size);
    println!("  Compressed:    {}", stats.compressed_size);
    if let Some(ratio) = stats.compression_ratio() {
        println!("  Ratio:         {:.3}", ratio);
    }
    println!("  Unused:        {}", stats.unused_size);
}

// ── chunk ───────────────────────────────────────────────────────────────

fn cmd_chunk_put(ctx: &Session, file: PathBuf) -> anyhow::Result<()> {
    let mut input =
        File::open(&file).with_context(|| format!("cannot open {}", file.display()))?;
    let info = ctx.store.write(&mut input, None)?;
    if !ctx.emit_json(&ChunkSummary::from(info))? {
        println!(
            "{} {} ({} → {} bytes)",
            "✓".green().bold(),
            info.sha256.to_string().yellow(),
            info.size,
            info.compressed_size
        );
    }
    Ok(())
}

fn cmd_chunk_cat(ctx: &Session, sha256: &str) -> anyhow::Result<()> {
    let sha256: ChunkHash = sha256.parse()?;
    let mut reader = ctx.store.get_chunk(sha256).read()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut reader, &mut out).with_context(|| format!("chunk {sha256} is corrupt"))?;
    out.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ChunkSummary {
    sha256: String,
    size: u64,
    compressed_size: u64,
}

impl From<pool_store::ChunkInfo> for ChunkSummary {
    fn from(info: pool_store::ChunkInfo) -> Self {
        Self {
            sha256: info.sha256.to_string(),
            size: info.size,
            compressed_size: info.compressed_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pool_ledger::read_refcnt;
    use std::fs;

    fn cli(dir: &std::path::Path, args: &[&str]) -> Cli {
        let pool = dir.join("pool");
        let hosts = dir.join("hosts");
        let mut argv = vec![
            "pool".to_string(),
            "--config".into(),
            dir.join("absent.toml").display().to_string(),
            "--pool".into(),
            pool.display().to_string(),
            "--hosts".into(),
            hosts.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::parse_from(argv)
    }

    fn export(dir: &std::path::Path, host: &str, number: u32, hashes: &[ChunkHash]) {
        let manifests = dir.join("hosts").join(host).join(number.to_string()).join("manifests");
        fs::create_dir_all(&manifests).unwrap();
        let chunks: Vec<_> = hashes.iter().map(|h| format!("\"{h}\"")).collect();
        fs::write(
            manifests.join("share.jsonl"),
            format!("{{\"path\":\"/f\",\"chunks\":[{}]}}\n", chunks.join(",")),
        )
        .unwrap();
    }

    #[test]
    fn flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Session::open(&cli(dir.path(), &["stats"])).unwrap();
        assert_eq!(ctx.layout.pool_dir, dir.path().join("pool"));
        assert_eq!(ctx.layout.hosts_dir, dir.path().join("hosts"));
        assert!(dir.path().join("pool").is_dir());
    }

    #[test]
    fn add_check_remove_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Session::open(&cli(dir.path(), &["stats"])).unwrap();
        let a = ctx.store.write_bytes(b"alpha").unwrap().sha256;
        let b = ctx.store.write_bytes(b"beta").unwrap().sha256;
        export(dir.path(), "web", 1, &[a, b, a]);

        let backup = || BackupRef { host: "web".into(), backup: 1 };
        cmd_refcnt_add(&ctx, backup()).unwrap();
        let stats = latest_statistics(&ctx.layout.pool_ledger_path()).unwrap().statistics;
        assert_eq!((stats.nb_ref, stats.nb_chunk), (3, 2));

        let fsck = FsckRefcntArgs { host: None, backup: None, repair: RepairArgs { repair: false } };
        cmd_fsck_refcnt(&ctx, fsck).unwrap();
        cmd_fsck_unused(&ctx, RepairArgs { repair: false }).unwrap();
        cmd_fsck_chunks(&ctx).unwrap();

        cmd_refcnt_remove(&ctx, backup()).unwrap();
        assert!(ctx.catalog().backups("web").unwrap().is_empty());
        cmd_reclaim(&ctx, ReclaimArgs { archive: None }).unwrap();
        assert!(!ctx.store.exists(&a).unwrap());
        assert!(!ctx.store.exists(&b).unwrap());

        // The removed backup no longer counts as truth for its host.
        let fsck = |repair| FsckRefcntArgs { host: None, backup: None, repair: RepairArgs { repair } };
        cmd_fsck_refcnt(&ctx, fsck(false)).unwrap();
        cmd_fsck_refcnt(&ctx, fsck(true)).unwrap();
        assert_eq!(read_refcnt(&ctx.layout.pool_ledger_path()).count(), 0);
        cmd_fsck_unused(&ctx, RepairArgs { repair: false }).unwrap();
    }

    #[test]
    fn adding_a_backup_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Session::open(&cli(dir.path(), &["stats"])).unwrap();
        let a = ctx.store.write_bytes(b"alpha").unwrap().sha256;
        export(dir.path(), "web", 1, &[a]);

        let backup = || BackupRef { host: "web".into(), backup: 1 };
        cmd_refcnt_add(&ctx, backup()).unwrap();
        assert!(cmd_refcnt_add(&ctx, backup()).is_err());
        let stats = latest_statistics(&ctx.layout.pool_ledger_path()).unwrap().statistics;
        assert_eq!(stats.nb_ref, 1);
        assert_eq!(stats.size, 5);
    }

    #[test]
    fn dry_run_fsck_fails_on_drift() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Session::open(&cli(dir.path(), &["stats"])).unwrap();
        let a = ctx.store.write_bytes(b"alpha").unwrap().sha256;
        export(dir.path(), "web", 1, &[a]);
        cmd_refcnt_add(&ctx, BackupRef { host: "web".into(), backup: 1 }).unwrap();
        export(dir.path(), "web", 1, &[a, a]);

        let args = |repair| FsckRefcntArgs {
            host: Some("web".into()),
            backup: Some(1),
            repair: RepairArgs { repair },
        };
        assert!(cmd_fsck_refcnt(&ctx, args(false)).is_err());
        cmd_fsck_refcnt(&ctx, args(true)).unwrap();
        cmd_fsck_refcnt(&ctx, args(false)).unwrap();
    }

    #[test]
    fn remove_unknown_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Session::open(&cli(dir.path(), &["stats"])).unwrap();
        assert!(cmd_refcnt_remove(&ctx, BackupRef { host: "web".into(), backup: 4 }).is_err());
    }

    #[test]
    fn chunk_put_stores_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Session::open(&cli(dir.path(), &["stats"])).unwrap();
        let file = dir.path().join("payload");
        fs::write(&file, b"payload").unwrap();
        cmd_chunk_put(&ctx, file).unwrap();
        assert!(ctx.store.exists(&ChunkHash::of(b"payload")).unwrap());
        assert!(cmd_chunk_cat(&ctx, "not-a-hash").is_err());
    }
}
