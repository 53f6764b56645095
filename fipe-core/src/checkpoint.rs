use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to write checkpoint {path}: {source}")]
    Write { source: io::Error, path: PathBuf },
    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        source: serde_json::Error,
        path: PathBuf,
    },
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Top-level label -> ordered list of completed mid-level labels.
/// Insertion order is completion order; the resume point is derived from
/// the last element, re-matched by label against a fresh enumeration.
pub type ProgressMap = BTreeMap<String, Vec<String>>;

/// Top-level labels whose entries are fully done. Coarse fast-skip only;
/// fine-grained resume lives in [`ProgressMap`].
pub type CompletedSet = BTreeSet<String>;

#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    pub progress: ProgressMap,
    pub completed: CompletedSet,
}

impl CheckpointSnapshot {
    pub fn is_entry_done(&self, top: &str) -> bool {
        self.completed.contains(top)
    }

    pub fn completed_mids(&self, top: &str) -> &[String] {
        self.progress.get(top).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Where traversal should resume within a freshly enumerated mid-level
/// list. `drifted` is set when the checkpointed label no longer appears in
/// the fresh enumeration and the whole level must be walked again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub index: usize,
    pub drifted: bool,
}

pub fn resume_point(last_done: Option<&str>, fresh: &[String]) -> ResumePoint {
    match last_done {
        None => ResumePoint {
            index: 0,
            drifted: false,
        },
        Some(label) => match fresh.iter().position(|candidate| candidate == label) {
            Some(position) => ResumePoint {
                index: position + 1,
                drifted: false,
            },
            None => ResumePoint {
                index: 0,
                drifted: true,
            },
        },
    }
}

/// Durable crawl progress over two whole-document JSON files, one per
/// concern. Every mutation is a read-merge-write cycle under one async
/// mutex so concurrent traversal engines cannot clobber each other's
/// updates, and every write replaces the document atomically.
#[derive(Debug)]
pub struct JsonCheckpointStore {
    progress_path: PathBuf,
    completed_path: PathBuf,
    guard: Mutex<()>,
}

impl JsonCheckpointStore {
    pub fn new(progress_path: impl AsRef<Path>, completed_path: impl AsRef<Path>) -> Self {
        Self {
            progress_path: progress_path.as_ref().to_path_buf(),
            completed_path: completed_path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    pub fn completed_path(&self) -> &Path {
        &self.completed_path
    }

    /// Reads both documents. Missing files are empty state, not errors.
    pub async fn load(&self) -> CheckpointResult<CheckpointSnapshot> {
        let _guard = self.guard.lock().await;
        Ok(CheckpointSnapshot {
            progress: read_document(&self.progress_path)?,
            completed: read_document(&self.completed_path)?,
        })
    }

    /// Appends `mid` to the progress record of `top`. Idempotent: a label
    /// already present is left where it is.
    pub async fn record_leaf_done(&self, top: &str, mid: &str) -> CheckpointResult<()> {
        let _guard = self.guard.lock().await;
        let mut progress: ProgressMap = read_document(&self.progress_path)?;
        let mids = progress.entry(top.to_string()).or_default();
        if mids.iter().any(|done| done == mid) {
            return Ok(());
        }
        mids.push(mid.to_string());
        write_document(&self.progress_path, &progress)
    }

    /// Marks `top` fully done. Idempotent.
    pub async fn record_entry_done(&self, top: &str) -> CheckpointResult<()> {
        let _guard = self.guard.lock().await;
        let mut completed: CompletedSet = read_document(&self.completed_path)?;
        if !completed.insert(top.to_string()) {
            return Ok(());
        }
        write_document(&self.completed_path, &completed)
    }

    pub async fn is_entry_done(&self, top: &str) -> CheckpointResult<bool> {
        let _guard = self.guard.lock().await;
        let completed: CompletedSet = read_document(&self.completed_path)?;
        Ok(completed.contains(top))
    }

    pub async fn completed_mids(&self, top: &str) -> CheckpointResult<Vec<String>> {
        let _guard = self.guard.lock().await;
        let progress: ProgressMap = read_document(&self.progress_path)?;
        Ok(progress.get(top).cloned().unwrap_or_default())
    }

    /// Deletes both documents. Used by operator tooling, never by a crawl.
    pub async fn clear(&self) -> CheckpointResult<()> {
        let _guard = self.guard.lock().await;
        for path in [&self.progress_path, &self.completed_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CheckpointError::Write {
                        source,
                        path: path.clone(),
                    })
                }
            }
        }
        Ok(())
    }
}

fn read_document<T>(path: &Path) -> CheckpointResult<T>
where
    T: DeserializeOwned + Default,
{
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(CheckpointError::Read {
                source,
                path: path.to_path_buf(),
            })
        }
    };
    serde_json::from_str(&content).map_err(|source| CheckpointError::Decode {
        source,
        path: path.to_path_buf(),
    })
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> CheckpointResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Write {
        source,
        path: path.to_path_buf(),
    })?;
    let json = serde_json::to_string_pretty(value).map_err(|source| CheckpointError::Decode {
        source,
        path: path.to_path_buf(),
    })?;
    // Write-then-rename keeps the previous document intact if the process
    // dies mid-write.
    let temp = tempfile::NamedTempFile::new_in(parent).map_err(|source| {
        CheckpointError::Write {
            source,
            path: path.to_path_buf(),
        }
    })?;
    std::fs::write(temp.path(), json).map_err(|source| CheckpointError::Write {
        source,
        path: path.to_path_buf(),
    })?;
    temp.persist(path).map_err(|source| CheckpointError::Write {
        source: source.error,
        path: path.to_path_buf(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> JsonCheckpointStore {
        JsonCheckpointStore::new(dir.join("progress.json"), dir.join("completed.json"))
    }

    #[tokio::test]
    async fn empty_store_loads_empty_snapshot() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let snapshot = store.load().await.unwrap();
        assert!(snapshot.progress.is_empty());
        assert!(snapshot.completed.is_empty());
    }

    #[tokio::test]
    async fn leaf_and_entry_records_survive_reload() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.record_leaf_done("Honda", "CG 160").await.unwrap();
        store.record_leaf_done("Honda", "Biz 125").await.unwrap();
        store.record_entry_done("Yamaha").await.unwrap();

        // A second store over the same files sees everything persisted.
        let reopened = store_in(dir.path());
        let snapshot = reopened.load().await.unwrap();
        assert_eq!(snapshot.completed_mids("Honda"), ["CG 160", "Biz 125"]);
        assert!(snapshot.is_entry_done("Yamaha"));
        assert!(!snapshot.is_entry_done("Honda"));
    }

    #[tokio::test]
    async fn leaf_record_is_idempotent_and_keeps_order() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.record_leaf_done("Honda", "CG 160").await.unwrap();
        store.record_leaf_done("Honda", "Biz 125").await.unwrap();
        store.record_leaf_done("Honda", "CG 160").await.unwrap();
        assert_eq!(
            store.completed_mids("Honda").await.unwrap(),
            ["CG 160", "Biz 125"]
        );
    }

    #[tokio::test]
    async fn concurrent_mutators_do_not_clobber_each_other() {
        let dir = tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));
        let mut handles = Vec::new();
        for brand in ["A", "B", "C", "D"] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for model in 0..5 {
                    store
                        .record_leaf_done(brand, &format!("M{model}"))
                        .await
                        .unwrap();
                }
                store.record_entry_done(brand).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.completed.len(), 4);
        for brand in ["A", "B", "C", "D"] {
            assert_eq!(snapshot.completed_mids(brand).len(), 5);
        }
    }

    #[test]
    fn resume_point_follows_last_completed_label() {
        let fresh = vec!["M1".to_string(), "M2".to_string(), "M3".to_string()];
        assert_eq!(
            resume_point(None, &fresh),
            ResumePoint {
                index: 0,
                drifted: false
            }
        );
        assert_eq!(
            resume_point(Some("M2"), &fresh),
            ResumePoint {
                index: 2,
                drifted: false
            }
        );
        assert_eq!(
            resume_point(Some("M3"), &fresh),
            ResumePoint {
                index: 3,
                drifted: false
            }
        );
    }

    #[test]
    fn resume_point_resets_on_catalog_drift() {
        let fresh = vec!["M1".to_string(), "M2".to_string()];
        assert_eq!(
            resume_point(Some("gone"), &fresh),
            ResumePoint {
                index: 0,
                drifted: true
            }
        );
    }
}
