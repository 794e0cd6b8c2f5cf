use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub watch: WatchConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Use the polling backend with this interval instead of native notifications.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
}

fn default_include_globs() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_dispatch_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnail_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
    #[serde(default = "default_max_concurrent_renders")]
    pub max_concurrent_renders: usize,
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            dir: default_thumbnail_dir(),
            url_prefix: default_url_prefix(),
            max_concurrent_renders: default_max_concurrent_renders(),
            render_timeout_secs: default_render_timeout_secs(),
        }
    }
}

fn default_thumbnail_dir() -> PathBuf {
    PathBuf::from("./static/thumbnails")
}
fn default_url_prefix() -> String {
    "/static/thumbnails".to_string()
}
fn default_max_concurrent_renders() -> usize {
    2
}
fn default_render_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReconcileConfig {
    /// Re-run the sweep on this cadence while watching. Disabled when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl Config {
    /// Config with default settings for the given locations. Used by tests
    /// and by embedders that do not read a TOML file.
    pub fn with_paths(db_path: &Path, watch_root: &Path, thumbnail_dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: db_path.to_path_buf(),
            },
            watch: WatchConfig {
                root: watch_root.to_path_buf(),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                poll_interval_ms: None,
                dispatch_workers: default_dispatch_workers(),
            },
            thumbnails: ThumbnailConfig {
                dir: thumbnail_dir.to_path_buf(),
                ..ThumbnailConfig::default()
            },
            reconcile: ReconcileConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.watch.dispatch_workers == 0 {
        anyhow::bail!("watch.dispatch_workers must be >= 1");
    }
    if config.watch.poll_interval_ms == Some(0) {
        anyhow::bail!("watch.poll_interval_ms must be > 0");
    }
    if config.thumbnails.max_concurrent_renders == 0 {
        anyhow::bail!("thumbnails.max_concurrent_renders must be >= 1");
    }
    if config.thumbnails.render_timeout_secs == 0 {
        anyhow::bail!("thumbnails.render_timeout_secs must be >= 1");
    }
    if config.reconcile.interval_secs == Some(0) {
        anyhow::bail!("reconcile.interval_secs must be >= 1");
    }

    // Surface bad globs at load time rather than when the watcher starts.
    crate::watcher::FileFilter::from_config(&config.watch)
        .with_context(|| "Invalid watch.include_globs / watch.exclude_globs")?;

    Ok(())
}
