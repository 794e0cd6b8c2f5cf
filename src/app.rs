//! Process wiring for the `sweep` and `watch` commands.
//!
//! [`App::open`] connects the database, applies migrations and builds the
//! shared components once: the catalog store, the thumbnail service, the
//! event broadcaster and the ingestion pipeline. Every component receives
//! the store handle explicitly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcast::EventBroadcaster;
use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::pipeline::IngestPipeline;
use crate::reconcile::{Reconciler, SweepReport};
use crate::store::{CatalogStore, SqliteCatalog};
use crate::thumbnail::ThumbnailService;
use crate::watcher::FsWatcher;

pub struct App {
    pub pool: SqlitePool,
    pub store: Arc<dyn CatalogStore>,
    pub events: EventBroadcaster,
    pub pipeline: Arc<IngestPipeline>,
}

impl App {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let store: Arc<dyn CatalogStore> = Arc::new(SqliteCatalog::new(pool.clone()));
        let thumbnails = Arc::new(ThumbnailService::new(store.clone(), &config.thumbnails));
        let events = EventBroadcaster::new();
        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            thumbnails,
            events.clone(),
        ));

        Ok(Self {
            pool,
            store,
            events,
            pipeline,
        })
    }

    pub fn reconciler(&self, config: &Config) -> Result<Reconciler> {
        Reconciler::new(&config.watch, self.pipeline.clone())
    }

    pub async fn close(self) {
        self.events.close();
        self.pool.close().await;
    }
}

/// `docwatch sweep`: one reconciliation pass, then a printed report.
pub async fn run_sweep(config: &Config) -> Result<()> {
    let app = App::open(config).await?;
    let report = app.reconciler(config)?.startup().await;
    app.close().await;
    let report = report?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!("Sweep complete:");
    println!("  checked:      {}", report.checked);
    println!("  removed:      {}", report.removed);
    println!("  regenerated:  {}", report.thumbnails_regenerated);
    println!("  indexed:      {}", report.indexed);
    println!("  failures:     {}", report.failures);
}

/// `docwatch watch`: startup reconciliation, optional periodic sweeps, then
/// live watching until Ctrl-C or a fatal watch failure.
pub async fn run_watch(config: &Config, print_events: bool) -> Result<()> {
    let app = App::open(config).await?;

    let printer = print_events.then(|| {
        let mut subscription = app.events.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "failed to serialize event"),
                }
            }
        })
    });

    // Subscribe to the OS first so changes made during the startup pass are
    // queued rather than lost; they are processed once it finishes.
    let active = FsWatcher::new(&config.watch, app.pipeline.clone())?.start()?;

    let reconciler = Arc::new(app.reconciler(config)?);
    let report = reconciler.startup().await?;
    info!(
        removed = report.removed,
        regenerated = report.thumbnails_regenerated,
        indexed = report.indexed,
        failures = report.failures,
        "startup reconciliation finished"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let periodic = config.reconcile.interval_secs.map(|secs| {
        let reconciler = reconciler.clone();
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            reconciler
                .run_periodic(Duration::from_secs(secs), async move {
                    let _ = stop_rx.changed().await;
                })
                .await;
        })
    });

    let result = active
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C; stopping");
            }
        })
        .await;

    let _ = stop_tx.send(true);
    if let Some(handle) = periodic {
        let _ = handle.await;
    }
    app.close().await;
    if let Some(handle) = printer {
        let _ = handle.await;
    }

    result?;
    info!("stopped");
    Ok(())
}
