//! Scribe — template rendering agent.
//!
//! # Usage
//!
//! ```text
//! scribe --config scribe.yaml [--catalog catalog.yaml] [--dry] [--once]
//! ```
//!
//! The agent renders the configured templates from coordination-service
//! data, re-renders when that data changes, runs post-render commands, and
//! optionally supervises a child process. `--catalog` points at a local YAML
//! stand-in for the coordination services; edits to it are picked up live.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use scribe_core::Config;
use scribe_runner::Runner;
use scribe_watch::{Catalog, DependencySource, MemorySource};

/// Successive catalog-file events inside this window collapse into one
/// reload.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "scribe",
    version,
    about = "Render templates from coordination-service data and keep them fresh",
    long_about = None,
)]
struct Cli {
    /// Agent configuration file (YAML).
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Local catalog file backing the dependency data; reloaded on change.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Print would-be output instead of writing destinations.
    #[arg(long)]
    dry: bool,

    /// Render each template once, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_path(&cli.config)?;

    let source = Arc::new(MemorySource::new());
    if let Some(catalog_path) = &cli.catalog {
        let catalog = Catalog::from_path(catalog_path)?;
        source.apply_catalog(&catalog);
    }

    let dyn_source: Arc<dyn DependencySource> = Arc::clone(&source) as Arc<dyn DependencySource>;
    let mut runner = Runner::new(config, dyn_source, cli.dry, cli.once)?;
    let mut errors = runner
        .error_ch()
        .ok_or_else(|| anyhow!("runner error channel already taken"))?;
    let handle = runner.handle();

    // Keep the notify handle alive for the life of the agent.
    let _catalog_watcher = match &cli.catalog {
        Some(path) => Some(watch_catalog(path.clone(), Arc::clone(&source))?),
        None => None,
    };

    let runner_task = tokio::spawn(runner.start());

    let outcome = tokio::select! {
        maybe_err = errors.recv() => match maybe_err {
            Some(err) => Err(anyhow!(err)),
            // channel closed: the runner finished on its own (once mode)
            None => Ok(()),
        },
        signal = tokio::signal::ctrl_c() => {
            signal.context("ctrl-c handler failed")?;
            tracing::info!("received ctrl-c, shutting down");
            Ok(())
        }
    };

    handle.stop();
    handle.done().await;
    let _ = runner_task.await;
    outcome
}

// ---------------------------------------------------------------------------
// Catalog reloading
// ---------------------------------------------------------------------------

/// Watch the catalog file's directory and re-apply the catalog when the file
/// changes. Burst saves are debounced; parse failures keep the old data.
fn watch_catalog(path: PathBuf, source: Arc<MemorySource>) -> Result<RecommendedWatcher> {
    let (event_tx, mut event_rx) =
        tokio::sync::mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    // Watch the parent directory: editors replace files rather than
    // modifying them in place.
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %path.display(), "watching catalog file");

    tokio::spawn(async move {
        let mut last_reload: Option<Instant> = None;
        while let Some(event) = event_rx.recv().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "catalog watch error");
                    continue;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == path.file_name())
            {
                continue;
            }
            if last_reload.is_some_and(|at| at.elapsed() < DEBOUNCE_WINDOW) {
                continue;
            }
            last_reload = Some(Instant::now());

            match Catalog::from_path(&path) {
                Ok(catalog) => {
                    tracing::info!(path = %path.display(), "reloading catalog");
                    source.apply_catalog(&catalog);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to reload catalog, keeping old data");
                }
            }
        }
    });

    Ok(watcher)
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
