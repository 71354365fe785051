//! Cache command - inspect and maintain the layer cache

use crate::cache::{self, format_bytes, sum_bytes, CacheEntry, CacheStore, EvictionPolicy};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::StrataResult;
use crate::ui::{self, TaskSpinner, UiContext};
use console::style;
use serde::Serialize;
use std::path::Path;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> StrataResult<()> {
    let path = ConfigManager::cache_path(config);

    match args.action {
        CacheAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
        CacheAction::List { format } => list_layers(&path, format).await,
        CacheAction::Inspect { fingerprint } => inspect_layer(&path, &fingerprint).await,
        CacheAction::Prune {
            max_entries,
            max_mb,
            days,
            dry_run,
        } => {
            let policy = EvictionPolicy::from(&config.cache.eviction)
                .with_overrides(max_entries, max_mb, days);
            prune_layers(&path, &policy, dry_run).await
        }
        CacheAction::Verify => verify_cache(&path).await,
        CacheAction::Clear { yes } => clear_cache(&path, yes).await,
    }
}

async fn list_layers(path: &Path, format: OutputFormat) -> StrataResult<()> {
    let (store, _) = cache::load(path).await?;
    let entries = store.entries().await;

    match format {
        OutputFormat::Table => print_layer_table(&entries),
        OutputFormat::Json => print_layer_json(&entries)?,
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.layer.fingerprint);
            }
        }
    }
    Ok(())
}

fn print_layer_table(entries: &[CacheEntry]) {
    if entries.is_empty() {
        println!("No cached layers.");
        return;
    }

    println!(
        "{:<14} {:<12} {:<14} {:>10}  {:<16}",
        "LAYER", "KIND", "PARENT", "SIZE", "LAST USED"
    );
    println!("{}", "-".repeat(72));

    let total = sum_bytes(entries.iter().map(|e| e.layer.size_bytes));
    for entry in entries {
        let layer = &entry.layer;
        println!(
            "{:<14} {:<12} {:<14} {:>10}  {:<16}",
            layer.fingerprint.short(),
            layer.kind.as_str(),
            layer.parent.as_ref().map(|p| p.short()).unwrap_or("-"),
            format_bytes(layer.size_bytes),
            entry.last_used_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!(
        "Total: {} layer(s), {}",
        entries.len(),
        format_bytes(total)
    );
}

fn print_layer_json(entries: &[CacheEntry]) -> StrataResult<()> {
    #[derive(Serialize)]
    struct LayerJson<'a> {
        fingerprint: &'a str,
        kind: &'a str,
        parent: Option<&'a str>,
        size_bytes: u64,
        created_at: String,
        last_used_at: String,
    }

    let layers: Vec<LayerJson> = entries
        .iter()
        .map(|e| LayerJson {
            fingerprint: e.layer.fingerprint.as_str(),
            kind: e.layer.kind.as_str(),
            parent: e.layer.parent.as_ref().map(|p| p.as_str()),
            size_bytes: e.layer.size_bytes,
            created_at: e.created_at.to_rfc3339(),
            last_used_at: e.last_used_at.to_rfc3339(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&layers)?);
    Ok(())
}

/// Show a layer's recipe and the chain below it
async fn inspect_layer(path: &Path, prefix: &str) -> StrataResult<()> {
    let (store, _) = cache::load(path).await?;
    let layer = store.find_prefix(prefix).await?;

    println!("Layer:  {}", layer.fingerprint);
    println!("Kind:   {}", layer.kind);
    println!("Size:   {}", format_bytes(layer.size_bytes));
    println!("Inputs:");
    for input in &layer.inputs {
        println!("  {} {}", style("•").blue(), serde_json::to_string(input)?);
    }

    let chain = store.chain(&layer.fingerprint).await;
    println!();
    println!("Chain ({} layer(s), top first):", chain.len());
    for link in &chain {
        println!(
            "  {} {:<12} {}",
            link.fingerprint.short(),
            link.kind.as_str(),
            format_bytes(link.size_bytes)
        );
    }
    if chain.last().and_then(|l| l.parent.as_ref()).is_some() {
        println!("  {}", style("(parent evicted)").dim());
    }
    Ok(())
}

async fn prune_layers(path: &Path, policy: &EvictionPolicy, dry_run: bool) -> StrataResult<()> {
    let ctx = UiContext::detect();

    if policy.is_unbounded() {
        ui::step_warn_hint(
            &ctx,
            "No eviction bounds configured",
            "Pass --max-entries, --max-mb or --days",
        );
        return Ok(());
    }

    let (store, _) = cache::load(path).await?;
    let report = store.prune(policy, dry_run).await;

    if report.removed.is_empty() {
        ui::step_ok(&ctx, &format!("Nothing to prune ({} layer(s) kept)", report.remaining));
        return Ok(());
    }

    for fp in &report.removed {
        println!("  {} {}", style("•").red(), fp.short());
    }

    if dry_run {
        ui::remark(
            &ctx,
            &format!(
                "Dry run - would remove {} layer(s), freeing {}",
                report.removed.len(),
                format_bytes(report.freed_bytes)
            ),
        );
        return Ok(());
    }

    cache::flush(&store, path).await?;
    ui::step_ok_detail(
        &ctx,
        &format!("Removed {} layer(s)", report.removed.len()),
        &format!("freed {}, {} kept", format_bytes(report.freed_bytes), report.remaining),
    );
    Ok(())
}

/// Load the cache and rewrite it without corrupt entries
async fn verify_cache(path: &Path) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Verifying cached layers...");

    let (store, report) = cache::load(path).await?;
    let dangling = dangling_parents(&store).await;

    if report.discarded.is_empty() && !report.unreadable {
        spinner.stop(&format!("{} layer(s) verified", report.loaded));
    } else {
        spinner.stop_error(&format!(
            "{} corrupt layer(s) discarded",
            report.discarded.len()
        ));
        for err in &report.discarded {
            ui::step_error_detail(&ctx, "corrupt", &err.to_string());
        }
        cache::flush(&store, path).await?;
    }

    if dangling > 0 {
        ui::step_info(
            &ctx,
            &format!("{} layer(s) have an evicted parent", dangling),
        );
    }
    Ok(())
}

/// Layers whose parent is no longer cached (harmless; they still hit)
async fn dangling_parents(store: &CacheStore) -> usize {
    let mut count = 0;
    for entry in store.entries().await {
        if let Some(ref parent) = entry.layer.parent {
            if !store.contains(parent).await {
                count += 1;
            }
        }
    }
    count
}

async fn clear_cache(path: &Path, yes: bool) -> StrataResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let (store, _) = cache::load(path).await?;

    if store.is_empty().await {
        ui::step_info(&ctx, "Cache is already empty");
        return Ok(());
    }

    let prompt = format!(
        "Remove {} cached layer(s) ({})?",
        store.len().await,
        format_bytes(store.total_size().await)
    );
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::remark(&ctx, "Aborted (pass --yes to skip the prompt)");
        return Ok(());
    }

    let removed = store.clear().await;
    cache::flush(&store, path).await?;
    ui::step_ok(&ctx, &format!("Cleared {} layer(s)", removed));
    Ok(())
}
