//! Build command - run a build file against the layer cache

use crate::build::engine::{BuildOptions, CancelToken, CostModel, Engine};
use crate::build::report::{BuildReport, CacheStatus, StepRecord};
use crate::build::BuildFile;
use crate::cache::{self, format_bytes, EvictionPolicy};
use crate::cli::args::{BuildArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{StrataError, StrataResult};
use crate::hash::FsHasher;
use crate::history::BuildHistory;
use crate::ui::{self, BuildProgress, UiContext};
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> StrataResult<()> {
    let ctx = UiContext::detect().for_machine_output(args.format.is_machine());
    let table = args.format == OutputFormat::Table;

    let path = args.buildfile();
    let mut file = BuildFile::from_file(&path).await?;
    if let Some(ref target) = args.target {
        file.target = Some(target.clone());
    }
    let plan = file.into_plan(&path)?;
    debug!(
        "Loaded {} stage(s), {} step(s) from {}",
        plan.stages().len(),
        plan.step_count(),
        path.display()
    );

    let cache_path = ConfigManager::cache_path(config);
    let (store, loaded) = cache::load(&cache_path).await?;
    if table {
        if loaded.unreadable {
            ui::step_warn_hint(
                &ctx,
                "Cache file was unreadable and has been reset",
                &cache_path.display().to_string(),
            );
        }
        for discarded in &loaded.discarded {
            ui::step_warn(&ctx, &discarded.to_string());
        }
    }
    let store = Arc::new(store);

    let mut options = BuildOptions::from(&config.build);
    options.parallel_stages &= !args.sequential;
    options.fail_fast |= args.fail_fast;
    options.dry_run = args.dry_run;

    let (events, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let engine = Engine::new(Arc::clone(&store), Arc::new(FsHasher::new(args.context.clone())))
        .with_cost(CostModel::from(&config.cost))
        .with_events(events);

    let cancel = CancelToken::new();
    let timeout = args
        .timeout
        .or((config.build.timeout_secs > 0).then_some(config.build.timeout_secs));
    let timer = timeout.map(|secs| cancel.cancel_after(Duration::from_secs(secs)));
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling after the current step");
                cancel.cancel();
            }
        })
    };

    if table {
        ui::intro(&ctx, &format!("strata build {}", path.display()));
    }

    let progress = BuildProgress::new(&ctx, plan.step_count());
    let progress_task = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            progress.on_event(&event);
        }
        progress
    });

    let report = engine.build(&plan, &options, &cancel).await;

    // Closing the last sender ends the progress task
    drop(engine);
    let progress = progress_task
        .await
        .map_err(|e| StrataError::Internal(format!("progress task failed: {}", e)))?;
    progress.finish();

    interrupt.abort();
    if let Some(timer) = timer {
        timer.abort();
    }

    if !options.dry_run {
        if config.cache.auto_prune {
            let policy = EvictionPolicy::from(&config.cache.eviction);
            let pruned = store.prune(&policy, false).await;
            if table && !pruned.removed.is_empty() {
                ui::step_info(
                    &ctx,
                    &format!(
                        "Pruned {} layer(s), freed {}",
                        pruned.removed.len(),
                        format_bytes(pruned.freed_bytes)
                    ),
                );
            }
        }
        cache::flush(&store, &cache_path).await?;
        BuildHistory::new(config).record(&report).await;
    }

    match args.format {
        OutputFormat::Table => print_report_table(&ctx, &report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            if let Some(ref image) = report.image {
                println!("{}", image.fingerprint);
            }
        }
    }

    match report.error {
        Some(failure) => Err(StrataError::BuildFailed(failure.to_string())),
        None => Ok(()),
    }
}

fn print_report_table(ctx: &UiContext, report: &BuildReport) {
    for stage in &report.stages {
        let title = if stage.in_image {
            format!("Stage {}", stage.name)
        } else {
            format!("Stage {} (not in image)", stage.name)
        };
        ui::section(ctx, &title);

        for step in &stage.steps {
            println!("  {}", step_line(step));
        }
        if let Some(ref failure) = stage.failure {
            ui::step_error_detail(
                ctx,
                &format!("step {}", failure.index),
                &failure.message,
            );
        }
    }

    let summary = &report.summary;
    ui::section(ctx, "Summary");
    ui::key_value(ctx, "steps", &summary.steps.to_string());
    ui::key_value(ctx, "hits", &summary.hits.to_string());
    ui::key_value(ctx, "misses", &summary.misses.to_string());
    ui::key_value(
        ctx,
        "layers",
        &format!("{} ({})", summary.layers, format_bytes(summary.size_bytes)),
    );
    ui::key_value(ctx, "duration", &format!("{} ms", report.duration_ms));

    match (&report.image, &report.error) {
        (Some(image), _) if report.dry_run => ui::outro_warn(
            ctx,
            &format!("Dry run: image would be {}", image.fingerprint.short()),
        ),
        (Some(image), _) => ui::outro_success(
            ctx,
            &format!(
                "Image {} ({}, {} layers)",
                image.fingerprint.short(),
                format_bytes(image.size_bytes),
                image.layers.len()
            ),
        ),
        (None, Some(failure)) => ui::outro_error(ctx, &format!("Build failed: {}", failure)),
        (None, None) => ui::outro_error(ctx, "Build produced no image"),
    }
}

/// `#idx  KIND  HIT|MISS  fingerprint  size  description`
fn step_line(step: &StepRecord) -> String {
    let status = match step.status {
        CacheStatus::Hit => style(format!("{:<4}", step.status.to_string())).green(),
        CacheStatus::Miss => style(format!("{:<4}", step.status.to_string())).yellow(),
    };
    format!(
        "#{:<3} {:<12} {} {}  {:>9}  {}",
        step.index,
        step.kind.as_str(),
        status,
        step.fingerprint.short(),
        format_bytes(step.size_bytes),
        style(&step.description).dim()
    )
}
