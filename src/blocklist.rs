//! Blocked-host storage and reloading.
//!
//! The store keeps the current [`BlockedSet`] behind an [`ArcSwap`], so a
//! session reading it never waits on a reload and always sees one complete
//! generation. The loader re-reads the source file wholesale on a fixed
//! interval and, optionally, whenever the file changes on disk.

use crate::error::{ProxyError, Result};
use arc_swap::ArcSwap;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Quiet period after a file event before the reload runs.
const WATCH_SETTLE: Duration = Duration::from_millis(500);

/// An immutable set of blocked host substrings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedSet {
    entries: BTreeSet<String>,
}

impl BlockedSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from line-oriented text, one entry per non-empty line.
    pub fn parse(contents: &str) -> Self {
        contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Returns true if any entry occurs anywhere inside `host_or_url`.
    pub fn matches(&self, host_or_url: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| host_or_url.contains(entry.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

impl FromIterator<String> for BlockedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Shared holder of the current blocklist generation.
#[derive(Debug, Default)]
pub struct BlocklistStore {
    current: ArcSwap<BlockedSet>,
}

impl BlocklistStore {
    /// Creates a store holding an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `set`.
    pub fn with_set(set: BlockedSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(set),
        }
    }

    /// Atomically installs a new generation.
    pub fn replace(&self, set: BlockedSet) {
        self.current.store(Arc::new(set));
    }

    /// Returns the current generation.
    pub fn snapshot(&self) -> Arc<BlockedSet> {
        self.current.load_full()
    }

    /// Checks `host_or_url` against the current generation.
    pub fn is_blocked(&self, host_or_url: &str) -> bool {
        self.current.load().matches(host_or_url)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

/// Reads a blocklist file into a fresh set.
pub async fn load(path: &Path) -> Result<BlockedSet> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProxyError::BlocklistUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(BlockedSet::parse(&contents))
}

/// Reloads a [`BlocklistStore`] from a file.
#[derive(Debug, Clone)]
pub struct BlocklistLoader {
    path: PathBuf,
    store: Arc<BlocklistStore>,
}

impl BlocklistLoader {
    pub fn new(path: impl Into<PathBuf>, store: Arc<BlocklistStore>) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    /// Re-reads the file and swaps it into the store.
    ///
    /// On failure the store is left untouched and the error is logged.
    /// Returns the number of entries now installed.
    pub async fn reload(&self) -> Result<usize> {
        match load(&self.path).await {
            Ok(set) => {
                let total = set.len();
                self.store.replace(set);
                info!(path = %self.path.display(), total, "Blocked sites reloaded");
                Ok(total)
            }
            Err(e) => {
                error!(error = %e, "Keeping previous blocklist");
                Err(e)
            }
        }
    }

    /// Reloads every `every` until `cancel` fires.
    ///
    /// The first tick happens one full interval after the call; the startup
    /// load is the caller's job.
    pub fn spawn_periodic(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let loader = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = loader.reload().await;
                    }
                }
            }
            debug!("Periodic blocklist reload stopped");
        })
    }

    /// Reloads whenever the file is created or modified, until `cancel` fires.
    ///
    /// Watches the parent directory so editors that replace the file by
    /// rename are still noticed.
    pub fn spawn_watcher(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::channel(1);
        let file_name: Option<OsString> = self.path.file_name().map(OsString::from);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let Ok(event) = res else { return };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(OsString::from) == file_name);
                if ours {
                    // a pending signal already covers this event
                    let _ = tx.try_send(());
                }
            },
            NotifyConfig::default(),
        )?;

        let watch_path = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(watch_path, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), "Watching blocklist file for changes");

        let loader = self.clone();
        Ok(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = rx.recv() => {
                        if signal.is_none() {
                            warn!("Blocklist watcher channel closed");
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(WATCH_SETTLE) => {}
                        }
                        while rx.try_recv().is_ok() {}
                        let _ = loader.reload().await;
                    }
                }
            }
            debug!("Blocklist watcher stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn set(entries: &[&str]) -> BlockedSet {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_substring_matching() {
        let blocked = set(&["ads", "tracker.net"]);

        assert!(blocked.matches("ads.example.com"));
        assert!(blocked.matches("myads.example.com"));
        assert!(blocked.matches("cdn.tracker.net:443"));
        assert!(!blocked.matches("example.com"));
        assert!(!blocked.matches("tracker.org"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let blocked = set(&["Example"]);
        assert!(blocked.matches("www.Example.com"));
        assert!(!blocked.matches("www.example.com"));
    }

    #[test]
    fn test_matching_sees_port_suffix() {
        let blocked = set(&["8443"]);
        assert!(blocked.matches("example.com:8443"));
        assert!(!blocked.matches("example.com"));
    }

    #[test]
    fn test_parse_skips_empty_lines_and_dedups() {
        let blocked = BlockedSet::parse("ads\n\nads\r\ntracker.net\n\n");
        assert_eq!(blocked.len(), 2);
        assert!(blocked.contains("ads"));
        assert!(blocked.contains("tracker.net"));
    }

    #[test]
    fn test_empty_set_blocks_nothing() {
        let store = BlocklistStore::new();
        assert!(store.is_empty());
        assert!(!store.is_blocked("anything.example.com"));
    }

    #[test]
    fn test_replace_is_wholesale() {
        let store = BlocklistStore::with_set(set(&["old.com", "both.com"]));
        let before = store.snapshot();

        store.replace(set(&["new.com", "both.com"]));

        assert!(!store.is_blocked("old.com"));
        assert!(store.is_blocked("new.com"));
        assert!(store.is_blocked("both.com"));
        // earlier snapshots stay intact
        assert!(before.contains("old.com"));
        assert!(!before.contains("new.com"));
    }

    #[test]
    fn test_readers_never_see_mixed_generations() {
        let store = Arc::new(BlocklistStore::with_set(
            (0..50).map(|i| format!("gen0-{i}")).collect(),
        ));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for generation in 1..200 {
                    store.replace((0..50).map(|i| format!("gen{generation}-{i}")).collect());
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let snapshot = store.snapshot();
                        assert_eq!(snapshot.len(), 50);
                        let prefixes: BTreeSet<&str> = snapshot
                            .iter()
                            .map(|e| e.split('-').next().unwrap())
                            .collect();
                        assert_eq!(prefixes.len(), 1, "mixed generations: {prefixes:?}");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ads\nbadsite.org\n\nads").unwrap();
        file.flush().unwrap();

        let store = Arc::new(BlocklistStore::new());
        let loader = BlocklistLoader::new(file.path(), store.clone());

        assert_eq!(loader.reload().await.unwrap(), 2);
        assert!(store.is_blocked("www.badsite.org"));
    }

    #[tokio::test]
    async fn test_watcher_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blackList.txt");
        std::fs::write(&path, "first.com\n").unwrap();

        let store = Arc::new(BlocklistStore::new());
        let loader = BlocklistLoader::new(&path, store.clone());
        loader.reload().await.unwrap();
        assert!(store.is_blocked("first.com"));

        let cancel = CancellationToken::new();
        let handle = loader.spawn_watcher(cancel.clone()).unwrap();

        std::fs::write(&path, "second.com\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_blocked("second.com") {
            assert!(Instant::now() < deadline, "watcher never reloaded");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!store.is_blocked("first.com"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_watcher_cancel_interrupts_settle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blackList.txt");
        std::fs::write(&path, "first.com\n").unwrap();

        let store = Arc::new(BlocklistStore::new());
        let loader = BlocklistLoader::new(&path, store.clone());
        loader.reload().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = loader.spawn_watcher(cancel.clone()).unwrap();

        std::fs::write(&path, "second.com\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // well inside the settle window
        cancel.cancel();
        tokio::time::timeout(WATCH_SETTLE / 2, handle)
            .await
            .expect("cancel waited out the settle period")
            .unwrap();
        assert!(store.is_blocked("first.com"));
        assert!(!store.is_blocked("second.com"));
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_set() {
        let store = Arc::new(BlocklistStore::with_set(set(&["kept.com"])));
        let loader = BlocklistLoader::new("/no/such/dir/blackList.txt", store.clone());

        let result = loader.reload().await;
        assert!(matches!(result, Err(ProxyError::BlocklistUnreadable { .. })));
        assert!(store.is_blocked("kept.com"));
        assert_eq!(store.len(), 1);
    }
}
