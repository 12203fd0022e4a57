//! Summarize a failure report written by media-reconcile
//!
//! Usage: analyze-report <output-dir | failure-report.json> [--top N]

use anyhow::{bail, Context, Result};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use media_reconcile::ledger::{ISSUES_DIR, REPORT_FILE};

fn pct(n: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * n as f64 / total as f64
    }
}

fn len_of(run: &Value, key: &str) -> usize {
    run.get(key).and_then(Value::as_array).map(Vec::len).unwrap_or(0)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: analyze-report <output-dir | failure-report.json> [--top N]");
        std::process::exit(1);
    }

    let mut path = PathBuf::from(&args[1]);
    if path.is_dir() {
        path = path.join(ISSUES_DIR).join(REPORT_FILE);
    }
    let top: usize = args
        .iter()
        .position(|a| a == "--top")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let content = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let report: Value = serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    let Some(runs) = report.get("runs").and_then(Value::as_object) else {
        bail!("{} has no runs section", path.display());
    };

    println!(
        "Report generated {} by {}",
        report["generated_at"].as_str().unwrap_or("?"),
        report["processor"].as_str().unwrap_or("?")
    );

    // Per-run table
    println!("\n=== PER RUN ===");
    println!();
    println!("Run                          Orphans  Ambig.  Decode  Process");
    println!("─────────────────────────────────────────────────────────────");
    let mut totals = [0usize; 4];
    for (name, run) in runs {
        let row = [
            len_of(run, "orphans"),
            len_of(run, "ambiguity_groups"),
            len_of(run, "decode_failures"),
            len_of(run, "processing_failures"),
        ];
        for (t, v) in totals.iter_mut().zip(row) {
            *t += v;
        }
        let shown: String = name.chars().take(28).collect();
        println!(
            "{:<28} {:>7}  {:>6}  {:>6}  {:>7}",
            shown, row[0], row[1], row[2], row[3]
        );
    }
    println!("─────────────────────────────────────────────────────────────");
    println!(
        "{:<28} {:>7}  {:>6}  {:>6}  {:>7}",
        "TOTAL", totals[0], totals[1], totals[2], totals[3]
    );

    // Orphans by kind and most common reasons
    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    let mut reasons: FxHashMap<String, usize> = FxHashMap::default();
    let mut group_sizes: BTreeMap<usize, usize> = BTreeMap::new();
    let mut decode_errors: FxHashMap<String, usize> = FxHashMap::default();
    for run in runs.values() {
        for orphan in run.get("orphans").and_then(Value::as_array).into_iter().flatten() {
            let kind = orphan["kind"].as_str().unwrap_or("unknown").to_string();
            *by_kind.entry(kind.clone()).or_insert(0) += 1;
            let reason = orphan["reason"].as_str().unwrap_or("").to_string();
            *reasons.entry(format!("{}: {}", kind, reason)).or_insert(0) += 1;
        }
        for group in run.get("ambiguity_groups").and_then(Value::as_array).into_iter().flatten() {
            let size = len_of(group, "a_items") + len_of(group, "b_items");
            *group_sizes.entry(size).or_insert(0) += 1;
        }
        for failure in run.get("decode_failures").and_then(Value::as_array).into_iter().flatten() {
            // Offsets make every message unique; group by the message prefix
            let error = failure["error"].as_str().unwrap_or("");
            let head = error.split(':').next().unwrap_or(error).to_string();
            *decode_errors.entry(head).or_insert(0) += 1;
        }
    }

    let orphan_total = totals[0];
    println!("\n=== ORPHANS BY KIND ({}) ===", orphan_total);
    println!();
    for (kind, count) in &by_kind {
        println!("{:<22} {:>6}  {:>5.1}%", kind, count, pct(*count, orphan_total));
    }

    let mut reasons: Vec<(String, usize)> = reasons.into_iter().collect();
    reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    println!("\n=== TOP {} ORPHAN REASONS ===", top);
    println!();
    for (reason, count) in reasons.iter().take(top) {
        println!("{:>6}  {}", count, reason);
    }

    if !group_sizes.is_empty() {
        println!("\n=== AMBIGUITY GROUP SIZES ===");
        println!();
        println!("Items   Groups");
        for (size, count) in &group_sizes {
            println!("{:>5}   {:>6}", size, count);
        }
    }

    if !decode_errors.is_empty() {
        let mut errors: Vec<(String, usize)> = decode_errors.into_iter().collect();
        errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        println!("\n=== DECODE FAILURES ===");
        println!();
        for (error, count) in errors.iter().take(top) {
            println!("{:>6}  {}", count, error);
        }
    }

    Ok(())
}
