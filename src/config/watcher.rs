//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Follow one pipeline TOML file on disk and publish every edit that yields
//! a new, valid [`PipelineConfig`].
//!
//! ## Guarantees
//! - The file must load and validate once at start; later edits that fail
//!   either step are logged and dropped.
//! - A burst of filesystem events (multi-write editors, atomic rename saves)
//!   collapses into one reload after a quiet period.
//! - A reload whose result equals the last published config is not
//!   rebroadcast.
//! - Dropping the [`ConfigWatcher`] stops the background task.
//!
//! ## NOT Responsible For
//! - Installing the config (see `SubmissionCoordinator::follow`)
//! - Deciding defaults (that belongs to the config types)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::PipelineConfig;

/// Quiet period used by [`ConfigWatcher::spawn`].
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

const UPDATE_CAPACITY: usize = 8;

/// Publishes validated edits of a pipeline config file.
pub struct ConfigWatcher {
    path: PathBuf,
    tx: broadcast::Sender<PipelineConfig>,
    current: Arc<ArcSwap<PipelineConfig>>,
    task: JoinHandle<()>,
    // Dropping the notify handle closes the event channel.
    _fs: RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .field("pipeline", &self.current.load().pipeline.name)
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// Load `path` and start following it with [`DEFAULT_DEBOUNCE`].
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from the initial load, or [`ConfigError::Io`] when
    /// the parent directory cannot be watched.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use nutriwealth_pipeline::config::watcher::ConfigWatcher;
    ///
    /// let (watcher, updates) = ConfigWatcher::spawn("pipeline.toml")?;
    /// let coordinator = Arc::new(SubmissionCoordinator::new(worker, store, watcher.current())?);
    /// let _follow = coordinator.follow(updates);
    /// ```
    pub fn spawn(
        path: impl Into<PathBuf>,
    ) -> Result<(Self, broadcast::Receiver<PipelineConfig>), ConfigError> {
        Self::with_debounce(path, DEFAULT_DEBOUNCE)
    }

    /// Like [`ConfigWatcher::spawn`] with an explicit quiet period.
    ///
    /// # Errors
    ///
    /// See [`ConfigWatcher::spawn`].
    pub fn with_debounce(
        path: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Result<(Self, broadcast::Receiver<PipelineConfig>), ConfigError> {
        let path = path.into();
        let initial = load_from_file(&path)?;
        let current = Arc::new(ArcSwap::from_pointee(initial));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut fs = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => warn!(error = %e, "config file watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| watch_error(&path, e))?;

        // The directory, not the file: rename-over saves replace the inode.
        let dir = watch_dir(&path);
        fs.watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(&dir, e))?;

        let (tx, rx) = broadcast::channel(UPDATE_CAPACITY);
        let task = tokio::spawn(follow_file(
            path.clone(),
            debounce,
            event_rx,
            tx.clone(),
            Arc::clone(&current),
        ));
        info!(path = %path.display(), "watching config file");

        Ok((
            Self {
                path,
                tx,
                current,
                task,
                _fs: fs,
            },
            rx,
        ))
    }

    /// The last config that loaded and validated.
    pub fn current(&self) -> PipelineConfig {
        PipelineConfig::clone(&self.current.load())
    }

    /// Another receiver for future updates.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineConfig> {
        self.tx.subscribe()
    }

    /// File being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn watch_error(path: &Path, e: notify::Error) -> ConfigError {
    ConfigError::Io {
        file: path.display().to_string(),
        source: std::io::Error::other(e.to_string()),
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

async fn follow_file(
    path: PathBuf,
    debounce: Duration,
    mut events: mpsc::UnboundedReceiver<Event>,
    tx: broadcast::Sender<PipelineConfig>,
    current: Arc<ArcSwap<PipelineConfig>>,
) {
    while let Some(event) = events.recv().await {
        if !touches(&event, &path) {
            continue;
        }
        // Swallow the rest of the burst.
        loop {
            match tokio::time::timeout(debounce, events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        match load_from_file(&path) {
            Ok(config) if config == **current.load() => {
                debug!(path = %path.display(), "config file rewritten without changes");
            }
            Ok(config) => {
                info!(
                    path = %path.display(),
                    pipeline = %config.pipeline.name,
                    threshold = config.routing.low_confidence_threshold,
                    models = config.models.len(),
                    "config reloaded"
                );
                current.store(Arc::new(config.clone()));
                // No subscribers is fine; `current` still advances.
                let _ = tx.send(config);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload rejected");
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::worker::ScriptedWorker;
    use crate::SubmissionCoordinator;

    const VALID_TOML: &str = r#"
[pipeline]
name = "watcher-test"

[routing]
low_confidence_threshold = 0.5
"#;

    const QUIET: Duration = Duration::from_millis(50);

    fn config_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, contents).expect("test: write");
        (dir, path)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    async fn next_update(rx: &mut broadcast::Receiver<PipelineConfig>) -> Option<PipelineConfig> {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .ok()
            .and_then(Result::ok)
    }

    #[tokio::test]
    async fn initial_config_is_loaded_at_start() {
        let (_dir, path) = config_file(VALID_TOML);
        let (watcher, _rx) = ConfigWatcher::with_debounce(&path, QUIET).expect("test: watcher");

        assert_eq!(watcher.current().pipeline.name, "watcher-test");
        assert_eq!(watcher.path(), path.as_path());
    }

    #[tokio::test]
    async fn invalid_initial_config_is_an_error() {
        let (_dir, path) = config_file("[routing]\nlow_confidence_threshold = 4.0\n");
        let err = ConfigWatcher::spawn(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = ConfigWatcher::spawn("/definitely/nonexistent/dir/pipeline.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[tokio::test]
    async fn edit_is_published_and_becomes_current() {
        let (_dir, path) = config_file(VALID_TOML);
        let (watcher, mut rx) = ConfigWatcher::with_debounce(&path, QUIET).expect("test: watcher");
        let mut second = watcher.subscribe();
        settle().await;

        let updated = VALID_TOML
            .replace("watcher-test", "updated-name")
            .replace("0.5", "0.7");
        std::fs::write(&path, updated).expect("test: write");

        let config = next_update(&mut rx).await.expect("test: update within 3s");
        assert_eq!(config.pipeline.name, "updated-name");
        assert!((config.routing.low_confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(next_update(&mut second).await, Some(config.clone()));
        assert_eq!(watcher.current(), config);
    }

    #[tokio::test]
    async fn unchanged_rewrite_is_not_published() {
        let (_dir, path) = config_file(VALID_TOML);
        let (_watcher, mut rx) = ConfigWatcher::with_debounce(&path, QUIET).expect("test: watcher");
        settle().await;

        // Same values, different formatting.
        std::fs::write(&path, format!("# touched\n{VALID_TOML}")).expect("test: write");
        assert!(next_update(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn unparseable_edit_keeps_current_config() {
        let (_dir, path) = config_file(VALID_TOML);
        let (watcher, mut rx) = ConfigWatcher::with_debounce(&path, QUIET).expect("test: watcher");
        settle().await;

        std::fs::write(&path, "invalid [[[").expect("test: write");
        assert!(next_update(&mut rx).await.is_none());
        assert_eq!(watcher.current().pipeline.name, "watcher-test");
    }

    #[tokio::test]
    async fn edit_routing_to_unknown_model_is_rejected() {
        let (_dir, path) = config_file(VALID_TOML);
        let (_watcher, mut rx) = ConfigWatcher::with_debounce(&path, QUIET).expect("test: watcher");
        settle().await;

        let bad = VALID_TOML.replace("[routing]", "[routing]\ncheap_model = \"missing-model\"");
        std::fs::write(&path, bad).expect("test: write");
        assert!(next_update(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn coordinator_follows_file_edits() {
        let (_dir, path) = config_file(VALID_TOML);
        let (watcher, rx) = ConfigWatcher::with_debounce(&path, QUIET).expect("test: watcher");
        let coordinator = Arc::new(
            SubmissionCoordinator::new(
                Arc::new(ScriptedWorker::new()),
                Arc::new(InMemoryStore::new()),
                watcher.current(),
            )
            .expect("test: coordinator"),
        );
        let _follow = coordinator.follow(rx);
        settle().await;

        std::fs::write(&path, VALID_TOML.replace("0.5", "0.8")).expect("test: write");

        for _ in 0..60 {
            if (coordinator.snapshot().config.routing.low_confidence_threshold - 0.8).abs()
                < f64::EPSILON
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("coordinator never picked up the edited threshold");
    }
}
