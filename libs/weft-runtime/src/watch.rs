//! Source change detection.
//!
//! Polls each watched service directory and posts `ChangeDetected` when the
//! fingerprint of its files (path, size, modification time) changes. The
//! reload coordinator's debounce coalesces whatever bursts this produces.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use crate::descriptor::{DescriptorStore, ServiceId};
use crate::events::ControlEvent;

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub interval: Duration,
    /// Directory names skipped at any depth.
    pub ignore: Vec<String>,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            ignore: ["node_modules", ".git", "dist", "build", "target", ".next"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// A watched service and the directory its sources live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub service_id: ServiceId,
    pub root: PathBuf,
}

/// Every service of `store` with watching enabled.
#[must_use]
pub fn watch_targets(store: &DescriptorStore) -> Vec<WatchTarget> {
    store
        .iter()
        .filter(|d| d.watch_enabled)
        .map(|d| WatchTarget {
            service_id: d.id.clone(),
            root: d.path.clone(),
        })
        .collect()
}

fn is_ignored(entry: &DirEntry, ignore: &[String]) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| ignore.iter().any(|skip| skip == name))
}

/// Fingerprint of every regular file under `root`. A missing root hashes to a
/// stable value so that its appearance counts as a change.
#[must_use]
pub fn fingerprint(root: &Path, ignore: &[String]) -> u64 {
    let mut files: Vec<(PathBuf, u64, u128)> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored(entry, ignore))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_nanos());
            Some((entry.into_path(), meta.len(), modified))
        })
        .collect();
    files.sort();

    let mut hasher = DefaultHasher::new();
    files.hash(&mut hasher);
    hasher.finish()
}

/// Poll `targets` until `cancel` fires. The first pass only records a baseline.
pub fn spawn_watcher(
    targets: Vec<WatchTarget>,
    settings: WatchSettings,
    control: mpsc::UnboundedSender<ControlEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if targets.is_empty() {
            return;
        }
        tracing::info!(services = targets.len(), interval = ?settings.interval, "Watching service sources");

        let mut known: HashMap<ServiceId, u64> = HashMap::new();
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let scan = targets.clone();
            let ignore = settings.ignore.clone();
            let prints = tokio::task::spawn_blocking(move || {
                scan.into_iter()
                    .map(|t| {
                        let print = fingerprint(&t.root, &ignore);
                        (t.service_id, print)
                    })
                    .collect::<Vec<_>>()
            })
            .await;
            let prints = match prints {
                Ok(prints) => prints,
                Err(e) => {
                    tracing::warn!(error = %e, "Source scan task failed");
                    continue;
                }
            };

            for (service_id, print) in prints {
                let previous = known.insert(service_id.clone(), print);
                if previous.is_some_and(|p| p != print) {
                    tracing::debug!(service = %service_id, "Source change observed");
                    if control.send(ControlEvent::ChangeDetected { service_id }).is_err() {
                        return;
                    }
                }
            }
        }
        tracing::debug!("Source watcher stopped");
    })
}
