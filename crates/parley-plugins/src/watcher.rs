//! Directory watching for hot reload.
//!
//! Filesystem events for `*.json` files push a debounce deadline forward;
//! when it passes the registry is rediscovered once.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::PluginError;
use crate::registry::PluginRegistry;

/// Watch `registry`'s directory and reload it after `debounce` of quiet.
///
/// The directory is created if missing. The task ends when `cancel` fires.
pub fn spawn_watcher(
    registry: Arc<PluginRegistry>,
    debounce: Duration,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, PluginError> {
    let dir = registry.dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => warn!(error = %e, "plugin watcher error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(kind = %registry.kind(), dir = %dir.display(), "watching plugin directory");

    Ok(tokio::spawn(async move {
        // dropped with the task
        let _watcher = watcher;
        let mut deadline: Option<Instant> = None;

        loop {
            let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if is_relevant(&event) {
                        debug!(kind = %registry.kind(), paths = ?event.paths, "plugin file changed");
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                () = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    deadline = None;
                    let registry = Arc::clone(&registry);
                    match tokio::task::spawn_blocking(move || registry.discover()).await {
                        Ok(count) => debug!(count, "plugin directory reloaded"),
                        Err(e) => warn!(error = %e, "plugin reload task failed"),
                    }
                }
            }
        }
        debug!(kind = %registry.kind(), "plugin watcher stopped");
    }))
}

fn is_relevant(event: &Event) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event.paths.iter().any(|p| is_json(p))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerCatalog;
    use crate::types::PluginKind;
    use notify::event::{AccessKind, CreateKind};
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn only_json_changes_count() {
        let create = |p: &str| Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from(p));
        assert!(is_relevant(&create("/p/a.json")));
        assert!(!is_relevant(&create("/p/a.json.swp")));
        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path(PathBuf::from("/p/a.json"));
        assert!(!is_relevant(&access));
    }

    #[tokio::test]
    async fn new_manifest_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PluginRegistry::new(
            PluginKind::UiState,
            dir.path(),
            Arc::new(HandlerCatalog::new()),
        ));
        let _ = registry.discover();
        let cancel = CancellationToken::new();
        let handle =
            spawn_watcher(Arc::clone(&registry), Duration::from_millis(50), cancel.clone()).unwrap();

        std::fs::write(
            dir.path().join("prices.json"),
            json!({"config": {"id": "prices", "name": "Prices", "initialState": {}}}).to_string(),
        )
        .unwrap();

        let start = std::time::Instant::now();
        while registry.snapshot().is_empty() && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(registry.get_template("prices").is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
