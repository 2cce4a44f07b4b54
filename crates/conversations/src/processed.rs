//! Processed-event cache: answers "has this project already handled
//! event `e`?" and records the answer idempotently.
//!
//! Bounded at 10 000 ids per project (oldest insertions evicted) and
//! persisted with a debounced write. Persistence is best-effort:
//! duplicate processing after a crash is acceptable because every
//! downstream handler is idempotent on event id.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tenex_domain::{Error, Result};

/// Maximum ids retained per project.
const CACHE_CAP: usize = 10_000;

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    ids: Vec<String>,
    updated_at: i64,
}

struct Inner {
    order: VecDeque<String>,
    set: HashSet<String>,
    dirty: bool,
    flush_scheduled: bool,
}

impl Inner {
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > CACHE_CAP {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.dirty = true;
        true
    }
}

/// One project's dedup cache.
#[derive(Clone)]
pub struct EventRouter {
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
    debounce: Duration,
}

impl EventRouter {
    /// Load the cache from `<project_dir>/processed-events.json`; a
    /// missing file is an empty cache.
    pub fn load(project_dir: &Path, debounce: Duration) -> Result<Self> {
        std::fs::create_dir_all(project_dir).map_err(Error::Io)?;
        let path = project_dir.join("processed-events.json");

        let mut order = VecDeque::new();
        let mut set = HashSet::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            match serde_json::from_str::<CacheFile>(&raw) {
                Ok(file) => {
                    for id in file.ids.into_iter() {
                        if set.insert(id.clone()) {
                            order.push_back(id);
                        }
                    }
                    while order.len() > CACHE_CAP {
                        if let Some(old) = order.pop_front() {
                            set.remove(&old);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "processed-event cache unreadable, starting empty");
                }
            }
        }

        tracing::debug!(ids = order.len(), path = %path.display(), "processed-event cache loaded");
        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(Inner {
                order,
                set,
                dirty: false,
                flush_scheduled: false,
            })),
            debounce,
        })
    }

    /// O(1) membership test.
    pub fn seen(&self, event_id: &str) -> bool {
        self.inner.lock().set.contains(event_id)
    }

    /// Record an event as processed and schedule a debounced flush.
    /// Idempotent.
    pub fn mark_processed(&self, event_id: &str) {
        let schedule = {
            let mut inner = self.inner.lock();
            if !inner.insert(event_id) {
                return;
            }
            if inner.flush_scheduled {
                false
            } else {
                inner.flush_scheduled = true;
                true
            }
        };
        if schedule {
            let router = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(router.debounce).await;
                router.flush();
            });
        }
    }

    /// Write the cache out now. Best-effort; called by the debounce task
    /// and on project shutdown.
    pub fn flush(&self) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.flush_scheduled = false;
            if !inner.dirty {
                return;
            }
            inner.dirty = false;
            inner.order.iter().cloned().collect::<Vec<_>>()
        };
        let file = CacheFile {
            ids: snapshot,
            updated_at: chrono::Utc::now().timestamp(),
        };
        let tmp = self.path.with_extension("json.tmp");
        let result = serde_json::to_vec(&file)
            .map_err(Error::Json)
            .and_then(|raw| std::fs::write(&tmp, raw).map_err(Error::Io))
            .and_then(|_| std::fs::rename(&tmp, &self.path).map_err(Error::Io));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "processed-event cache flush failed");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(dir: &Path) -> EventRouter {
        EventRouter::load(dir, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn mark_then_seen() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let router = router(dir.path());
        assert!(!router.seen("e1"));
        router.mark_processed("e1");
        assert!(router.seen("e1"));
        router.mark_processed("e1");
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn eviction_at_capacity_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let router = router(dir.path());
        for i in 0..CACHE_CAP {
            router.mark_processed(&format!("e{i}"));
        }
        assert!(router.seen("e0"));
        assert_eq!(router.len(), CACHE_CAP);

        // One past the cap evicts the oldest insertion.
        router.mark_processed("overflow");
        assert_eq!(router.len(), CACHE_CAP);
        assert!(!router.seen("e0"));
        assert!(router.seen("e1"));
        assert!(router.seen("overflow"));
    }

    #[tokio::test]
    async fn flush_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let router = router(dir.path());
            router.mark_processed("e1");
            router.mark_processed("e2");
            router.flush();
        }
        let reloaded = router(dir.path());
        assert!(reloaded.seen("e1"));
        assert!(reloaded.seen("e2"));
        assert!(!reloaded.seen("e3"));
    }

    #[tokio::test]
    async fn debounced_flush_lands_without_explicit_call() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        router.mark_processed("e1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reloaded = EventRouter::load(dir.path(), Duration::from_millis(10)).unwrap();
        assert!(reloaded.seen("e1"));
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        assert!(router.is_empty());
    }
}
