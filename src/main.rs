use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;

use media_reconcile::config::{load_config, ReconcileConfig};
use media_reconcile::coordinator::{ExportRun, Reconciler};
use media_reconcile::hashing::HashAlgorithm;
use media_reconcile::ledger::write_json_atomic;
use media_reconcile::progress::{create_spinner, format_bytes, format_duration, is_log_only, set_log_only};
use media_reconcile::safety::validate_output_path;
use media_reconcile::scan::BannedFilter;
use media_reconcile::sink::{write_associations, write_manifest, SidecarTagWriter};

/// Prints only in log-only mode, for tail-friendly background runs.
macro_rules! log_only {
    ($($arg:tt)*) => {
        if is_log_only() {
            eprintln!($($arg)*);
        }
    };
}

#[derive(Parser)]
#[command(name = "media-reconcile")]
#[command(about = "Reconcile exported chat media with their messages and collapse duplicates")]
struct Args {
    /// Export directories, processed in order
    #[arg(required = true)]
    exports: Vec<PathBuf>,

    /// Output directory for unique media, manifest and reports
    #[arg(short, long)]
    output: PathBuf,

    /// TOML config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    /// Content hash: fx (fast) or sha256
    #[arg(long)]
    hash: Option<HashAlgorithm>,

    /// Record canonical locations without copying any bytes
    #[arg(long)]
    dry_run: bool,

    /// Write a JSON tag sidecar next to every canonical file
    #[arg(long)]
    sidecars: bool,

    /// Don't copy ambiguity groups into needs-matching/
    #[arg(long)]
    no_review_dirs: bool,

    /// Hide progress bars and log plain lines (for tail -f)
    #[arg(long)]
    log_only: bool,
}

fn resolve_config(args: &Args) -> Result<ReconcileConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ReconcileConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(hash) = args.hash {
        config.hash_algorithm = hash;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if args.no_review_dirs {
        config.materialize_ambiguous = false;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    set_log_only(args.log_only);
    let config = resolve_config(&args)?;

    if config.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    let sources: Vec<&std::path::Path> = args.exports.iter().map(|p| p.as_path()).collect();
    validate_output_path(&args.output, &sources)?;
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create output directory {}", args.output.display()))?;

    let start = Instant::now();
    let filter = BannedFilter::new(&config.extra_banned);
    let mut reconciler = Reconciler::new(config.clone(), Some(args.output.clone()));

    for export in &args.exports {
        let phase_start = Instant::now();
        let spinner = create_spinner(&format!("Reading {}", export.display()));
        log_only!("[SCAN] {}", export.display());
        let run = ExportRun::load(export, &filter, &[args.output.as_path()])
            .with_context(|| format!("Failed to load export {}", export.display()))?;
        spinner.finish_with_message(format!(
            "{}: {} messages, {} media, {} overlays",
            run.run_id,
            run.messages.len(),
            run.media.len(),
            run.overlays.len()
        ));

        let summary = reconciler.process_run(run)?;
        println!(
            "  {}: {} records, {} overlays, {} orphaned, {} ambiguous, {} new, {} duplicates ({})",
            summary.run,
            summary.records,
            summary.overlays_paired,
            summary.orphaned_media,
            summary.ambiguous_media,
            summary.new_copies,
            summary.duplicates,
            format_duration(phase_start.elapsed())
        );
        reconciler.stats().log_phase(&summary.run);
    }

    let mut output = reconciler.finish();

    let manifest = write_manifest(&args.output, &output.records)?;
    println!("Wrote {} association records to {}", output.records.len(), manifest.display());

    write_json_atomic(&args.output.join("duplicates.json"), &output.duplicates)?;

    if args.sidecars && !config.dry_run {
        let mut writer = SidecarTagWriter::new();
        let written = write_associations(&output.records, &mut writer, &mut output.ledger);
        log_only!("[TAGS] {} sidecars written", written);
    }

    let mut review_dirs = 0;
    if config.materialize_ambiguous && !output.ledger.ambiguity_groups().is_empty() {
        review_dirs = output.ledger.materialize_ambiguity_groups(&args.output)?;
    }
    let mut orphan_copies = 0;
    if config.copy_orphans && !config.dry_run {
        orphan_copies = output.ledger.copy_orphaned_media(&args.output)?;
    }
    let report = output.ledger.write_report(&args.output)?;

    output.stats.log_phase("final");
    output.stats.write_to_file(&args.output.join("stats.json"))?;

    let failures = output.ledger.summary();
    let balanced = output.summaries.iter().all(|s| s.is_balanced());

    println!("\n{:=<60}", "");
    println!("Reconciliation complete!");
    println!("  Exports: {}", output.stats.runs);
    println!("  Messages: {} ({} decode failures)", output.stats.messages, output.stats.decode_failures);
    println!(
        "  Associations: {} explicit, {} by timestamp, {} without context",
        output.stats.explicit_associations, output.stats.fuzzy_associations, output.stats.context_free_records
    );
    println!("  Overlays paired: {}", output.stats.overlays_paired);
    println!(
        "  Unique files: {} ({} copied, {})",
        output.duplicates.total_unique_files,
        output.stats.files_copied,
        format_bytes(output.stats.bytes_copied)
    );
    println!(
        "  Duplicates: {} files seen {} extra times, {} saved",
        output.duplicates.total_files_with_duplicates,
        output.duplicates.total_duplicate_instances,
        format_bytes(output.duplicates.wasted_space_bytes)
    );
    println!(
        "  Needs review: {} orphaned media, {} orphaned messages, {} ambiguity groups",
        failures.orphaned_media, failures.orphaned_messages, failures.ambiguity_groups
    );
    if review_dirs > 0 {
        println!("  Review directories: {}", review_dirs);
    }
    if orphan_copies > 0 {
        println!("  Orphaned media copied: {}", orphan_copies);
    }
    println!("  Failure report: {}", report.display());
    if !balanced {
        println!("  WARNING: media accounting did not balance, see stderr");
    }
    println!("  Elapsed: {}", format_duration(start.elapsed()));
    println!("{:=<60}", "");

    Ok(())
}
