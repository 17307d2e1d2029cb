//! Bridges filesystem notifications on the descriptor into [`ConfigEvent`]s.

use crate::configuration::ConfigEvent;
use crate::error::ConfigError;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

/// Map a raw notification to the event the configuration store cares about.
#[must_use]
pub fn classify(event: &Event) -> Option<ConfigEvent> {
    match event.kind {
        EventKind::Remove(_) => Some(ConfigEvent::Removed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) | EventKind::Create(_) => Some(ConfigEvent::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Keeps a notify watcher alive; dropping it stops the event stream.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path` and return the receiving end of the event stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Watch`] if the platform watcher cannot be
    /// created or the path cannot be watched.
    pub fn spawn(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<ConfigEvent>), ConfigError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                tracing::debug!(?event, "config file event");
                if let Some(change) = classify(&event) {
                    // receiver gone means the watch loop already ended
                    let _ = tx.send(change);
                }
            }
            Err(e) => tracing::error!("config watcher error: {}", e),
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "watching configuration file");
        Ok((Self { _watcher: watcher }, rx))
    }
}
