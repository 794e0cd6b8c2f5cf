//! Filesystem watcher.
//!
//! Subscribes to OS notifications for one flat directory, normalizes raw
//! `notify` events into [`FsAction`]s, and hands them to the ingestion
//! pipeline through a sharded [`Dispatcher`].
//!
//! # Ordering
//!
//! Actions for the same filename are hashed onto the same shard and run in
//! arrival order. Different filenames proceed in parallel. The notification
//! loop only enqueues, so slow renders never stall event intake.
//!
//! A shard only commits catalog changes. Rendering and publishing run in a
//! follow-up task chained behind the previous one for the same filename, so
//! events per file keep their order while a slow render leaves the rest of
//! its shard moving.
//!
//! # Failure model
//!
//! A single bad event is logged and skipped. Losing the notification source
//! itself (watch limit reached, watched directory removed, channel closed)
//! ends [`ActiveWatcher::run`] with [`IngestError::WatchChannel`].

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::error::IngestError;
use crate::pipeline::{IngestPipeline, Staged};

/// Filenames that are never tracked, on top of `watch.exclude_globs`.
const DEFAULT_EXCLUDES: &[&str] = &[".*", "~$*", "*.tmp", "*.swp", "*.part", "*.crdownload"];

/// A normalized filesystem change for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsAction {
    Appeared(PathBuf),
    Changed(PathBuf),
    Vanished(PathBuf),
}

impl FsAction {
    pub fn path(&self) -> &Path {
        match self {
            FsAction::Appeared(p) | FsAction::Changed(p) | FsAction::Vanished(p) => p,
        }
    }
}

/// Include/exclude globs matched against base filenames.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl FileFilter {
    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self { include, exclude })
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.include.is_match(name) && !self.exclude.is_match(name)
    }

    /// True when `path` sits directly in `root` and its name passes the globs.
    pub fn is_tracked(&self, path: &Path, root: &Path) -> bool {
        if path.parent() != Some(root) {
            return false;
        }
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.matches_name(name))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// Translate one raw notification into pipeline actions.
///
/// Paths outside `root` (or filtered out) are dropped, so a move out of the
/// directory yields only `Vanished` and a move in yields only `Appeared`.
pub fn normalize(event: &Event, root: &Path, filter: &FileFilter) -> Vec<FsAction> {
    let tracked = |p: &PathBuf| filter.is_tracked(p, root);
    let mut actions = Vec::new();

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => {}
        EventKind::Create(_) => {
            for path in event.paths.iter().filter(|p| tracked(p) && !p.is_dir()) {
                actions.push(FsAction::Appeared(path.clone()));
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => {
                if let [from, to, ..] = event.paths.as_slice() {
                    if tracked(from) {
                        actions.push(FsAction::Vanished(from.clone()));
                    }
                    if tracked(to) && !to.is_dir() {
                        actions.push(FsAction::Appeared(to.clone()));
                    }
                }
            }
            RenameMode::From => {
                for path in event.paths.iter().filter(|p| tracked(p)) {
                    actions.push(FsAction::Vanished(path.clone()));
                }
            }
            RenameMode::To => {
                for path in event.paths.iter().filter(|p| tracked(p) && !p.is_dir()) {
                    actions.push(FsAction::Appeared(path.clone()));
                }
            }
            // Backends that cannot tell which side of a rename they saw.
            _ => {
                for path in event.paths.iter().filter(|p| tracked(p)) {
                    if path.is_file() {
                        actions.push(FsAction::Appeared(path.clone()));
                    } else if !path.exists() {
                        actions.push(FsAction::Vanished(path.clone()));
                    }
                }
            }
        },
        // The polling backend reports content changes as a write-time change.
        EventKind::Modify(
            ModifyKind::Data(_)
            | ModifyKind::Metadata(MetadataKind::WriteTime)
            | ModifyKind::Any
            | ModifyKind::Other,
        ) => {
            for path in event.paths.iter().filter(|p| tracked(p) && p.is_file()) {
                actions.push(FsAction::Changed(path.clone()));
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Remove(RemoveKind::Folder) => {}
        EventKind::Remove(_) => {
            for path in event.paths.iter().filter(|p| tracked(p)) {
                actions.push(FsAction::Vanished(path.clone()));
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }

    actions
}

/// Drops the combined rename event a backend sends after it already reported
/// both halves.
///
/// inotify reports one rename as `From`, `To` and then `Both`, all carrying
/// the same tracker. The halves are applied as they arrive (a move out of the
/// directory never gets a `Both`), so the `Both` would apply the rename twice.
#[derive(Debug, Default)]
pub struct RenamePairs {
    halves: VecDeque<usize>,
}

impl RenamePairs {
    const REMEMBERED: usize = 64;

    /// [`normalize`], minus renames whose halves were already seen.
    pub fn normalize(&mut self, event: &Event, root: &Path, filter: &FileFilter) -> Vec<FsAction> {
        if let (EventKind::Modify(ModifyKind::Name(mode)), Some(tracker)) =
            (&event.kind, event.tracker())
        {
            match mode {
                RenameMode::From | RenameMode::To => self.remember(tracker),
                RenameMode::Both if self.take(tracker) => {
                    debug!(tracker, "rename already applied from its halves");
                    return Vec::new();
                }
                _ => {}
            }
        }
        normalize(event, root, filter)
    }

    fn remember(&mut self, tracker: usize) {
        if self.halves.contains(&tracker) {
            return;
        }
        if self.halves.len() == Self::REMEMBERED {
            self.halves.pop_front();
        }
        self.halves.push_back(tracker);
    }

    fn take(&mut self, tracker: usize) -> bool {
        let before = self.halves.len();
        self.halves.retain(|t| *t != tracker);
        self.halves.len() != before
    }
}

/// Fans actions out to per-filename ordered worker tasks.
pub struct Dispatcher {
    shards: Vec<mpsc::UnboundedSender<FsAction>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<IngestPipeline>, workers: usize) -> Self {
        let count = workers.max(1);
        let mut shards = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for shard in 0..count {
            let (tx, rx) = mpsc::unbounded_channel::<FsAction>();
            handles.push(tokio::spawn(run_shard(shard, pipeline.clone(), rx)));
            shards.push(tx);
        }

        Self {
            shards,
            workers: handles,
        }
    }

    fn shard_for(&self, path: &Path) -> usize {
        let mut hasher = DefaultHasher::new();
        path.file_name().unwrap_or(path.as_os_str()).hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue an action. Never waits on the pipeline.
    pub fn dispatch(&self, action: FsAction) {
        let shard = self.shard_for(action.path());
        if let Err(e) = self.shards[shard].send(action) {
            error!(shard, path = %e.0.path().display(), "dispatch worker is gone; action dropped");
        }
    }

    /// Stop accepting actions and wait until every queued one has run,
    /// including its render and event.
    pub async fn shutdown(self) {
        drop(self.shards);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatch worker panicked");
            }
        }
    }
}

/// Commit each action's catalog change in order, then complete it in a task
/// that first waits for the previous completion of the same filename.
async fn run_shard(
    shard: usize,
    pipeline: Arc<IngestPipeline>,
    mut rx: mpsc::UnboundedReceiver<FsAction>,
) {
    let mut completions: HashMap<OsString, JoinHandle<()>> = HashMap::new();

    while let Some(action) = rx.recv().await {
        debug!(shard, ?action, "dispatching");
        completions.retain(|_, task| !task.is_finished());

        let staged = match pipeline.stage(&action).await {
            Ok(Staged::NotTracked) => continue,
            Ok(staged) => staged,
            Err(e) => {
                error!(shard, path = %action.path().display(), error = %e, "ingest failed");
                continue;
            }
        };

        let key = action
            .path()
            .file_name()
            .unwrap_or(action.path().as_os_str())
            .to_os_string();
        let previous = completions.remove(&key);
        let pipeline = pipeline.clone();
        completions.insert(
            key,
            tokio::spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                pipeline.complete(staged).await;
            }),
        );
    }

    for (name, task) in completions {
        if let Err(e) = task.await {
            error!(shard, file = ?name, error = %e, "completion task panicked");
        }
    }
}

/// Configured, not yet running watcher.
pub struct FsWatcher {
    root: PathBuf,
    filter: FileFilter,
    poll_interval: Option<Duration>,
    workers: usize,
    pipeline: Arc<IngestPipeline>,
}

impl FsWatcher {
    pub fn new(config: &WatchConfig, pipeline: Arc<IngestPipeline>) -> Result<Self> {
        Ok(Self {
            root: config.root.clone(),
            filter: FileFilter::from_config(config)?,
            poll_interval: config.poll_interval_ms.map(Duration::from_millis),
            workers: config.dispatch_workers,
            pipeline,
        })
    }

    /// Register the OS subscription. Changes made after this returns are
    /// observed by [`ActiveWatcher::run`].
    pub fn start(self) -> Result<ActiveWatcher, IngestError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                IngestError::WatchChannel(format!(
                    "cannot create watched directory {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
            info!(root = %self.root.display(), "created watched directory");
        }
        let root = self.root.canonicalize().map_err(|e| {
            IngestError::WatchChannel(format!("cannot resolve {}: {}", self.root.display(), e))
        })?;

        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let handler = move |res: notify::Result<Event>| {
            // The receiver only goes away during shutdown.
            let _ = tx.send(res);
        };

        let mut watcher: Box<dyn Watcher + Send> = match self.poll_interval {
            Some(interval) => Box::new(PollWatcher::new(
                handler,
                notify::Config::default().with_poll_interval(interval),
            )?),
            None => Box::new(RecommendedWatcher::new(handler, notify::Config::default())?),
        };
        watcher.watch(&root, RecursiveMode::NonRecursive)?;

        info!(
            root = %root.display(),
            backend = if self.poll_interval.is_some() { "poll" } else { "native" },
            workers = self.workers,
            "watching"
        );

        Ok(ActiveWatcher {
            watcher,
            rx,
            root,
            filter: self.filter,
            dispatcher: Dispatcher::new(self.pipeline, self.workers),
        })
    }

    /// [`start`](Self::start) then [`ActiveWatcher::run`].
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), IngestError> {
        self.start()?.run(shutdown).await
    }
}

/// A watcher with a live OS subscription.
pub struct ActiveWatcher {
    watcher: Box<dyn Watcher + Send>,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    root: PathBuf,
    filter: FileFilter,
    dispatcher: Dispatcher,
}

impl ActiveWatcher {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process notifications until `shutdown` resolves or the source fails,
    /// then drain every queued action.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), IngestError> {
        let ActiveWatcher {
            watcher,
            mut rx,
            root,
            filter,
            dispatcher,
        } = self;
        let mut renames = RenamePairs::default();
        let mut shutdown = std::pin::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("watcher shutting down");
                    break Ok(());
                }
                message = rx.recv() => match message {
                    None => break Err(IngestError::WatchChannel("notification channel closed".into())),
                    Some(Ok(event)) => {
                        if root_removed(&event, &root) {
                            break Err(IngestError::WatchChannel(format!(
                                "watched directory {} was removed",
                                root.display()
                            )));
                        }
                        for action in renames.normalize(&event, &root, &filter) {
                            dispatcher.dispatch(action);
                        }
                    }
                    Some(Err(e)) if is_fatal(&e) => break Err(e.into()),
                    Some(Err(e)) => warn!(error = %e, paths = ?e.paths, "watch error; skipping"),
                }
            }
        };

        drop(watcher);
        dispatcher.shutdown().await;
        if let Err(e) = &result {
            error!(error = %e, "watcher stopped");
        }
        result
    }
}

fn root_removed(event: &Event, root: &Path) -> bool {
    matches!(event.kind, EventKind::Remove(_)) && event.paths.iter().any(|p| p == root)
}

fn is_fatal(err: &notify::Error) -> bool {
    matches!(
        err.kind,
        notify::ErrorKind::MaxFilesWatch
            | notify::ErrorKind::InvalidConfig(_)
            | notify::ErrorKind::WatchNotFound
    )
}
