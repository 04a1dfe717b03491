//! Run registry - persisted run records keyed by run id

use async_trait::async_trait;
use dashmap::DashMap;
use popgen_core::{Error, Result, Run, RunId};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Storage for run records. Listing methods return newest runs first.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn find_by_owner(&self, owner: &str) -> Result<Vec<Run>>;

    async fn find_all(&self) -> Result<Vec<Run>>;

    async fn find_by_id(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Insert or replace the record for `run.run_id`.
    async fn save(&self, run: Run) -> Result<()>;

    /// Returns false if there was no such record.
    async fn delete_by_id(&self, run_id: &RunId) -> Result<bool>;
}

/// In-memory registry, optionally mirrored to a JSON file.
///
/// The file is rewritten in full after every mutation (temp file + rename);
/// a mutation whose write fails is rolled back in memory.
pub struct JsonRunRegistry {
    runs: DashMap<RunId, Run>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl Default for JsonRunRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl JsonRunRegistry {
    pub fn in_memory() -> Self {
        Self {
            runs: DashMap::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Open a file-backed registry, loading existing records if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let runs = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                let records: Vec<Run> = serde_json::from_str(&content).map_err(|e| {
                    Error::registry(format!("corrupt registry {}: {}", path.display(), e))
                })?;
                for run in records {
                    runs.insert(run.run_id.clone(), run);
                }
                info!("Loaded {} runs from {}", runs.len(), path.display());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No registry at {} - starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            runs,
            path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn snapshot(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.iter().map(|r| r.value().clone()).collect();
        sort_newest_first(&mut runs);
        runs
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn sort_newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.run_id.cmp(&a.run_id))
    });
}

#[async_trait]
impl RunRegistry for JsonRunRegistry {
    async fn find_by_owner(&self, owner: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.owner == owner)
            .map(|r| r.value().clone())
            .collect();
        sort_newest_first(&mut runs);
        Ok(runs)
    }

    async fn find_all(&self) -> Result<Vec<Run>> {
        Ok(self.snapshot())
    }

    async fn find_by_id(&self, run_id: &RunId) -> Result<Option<Run>> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn save(&self, run: Run) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let id = run.run_id.clone();
        let previous = self.runs.insert(id.clone(), run);

        if let Err(e) = self.persist().await {
            warn!("Failed to persist run {}: {}", id, e);
            match previous {
                Some(prev) => {
                    self.runs.insert(id.clone(), prev);
                }
                None => {
                    self.runs.remove(&id);
                }
            }
            return Err(Error::registry(format!("save {}: {}", id, e)));
        }
        Ok(())
    }

    async fn delete_by_id(&self, run_id: &RunId) -> Result<bool> {
        let _write = self.write_lock.lock().await;
        let Some((id, removed)) = self.runs.remove(run_id) else {
            return Ok(false);
        };

        if let Err(e) = self.persist().await {
            warn!("Failed to persist deletion of run {}: {}", id, e);
            self.runs.insert(id.clone(), removed);
            return Err(Error::registry(format!("delete {}: {}", id, e)));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use popgen_core::GenerationParameters;

    fn run(id: &str, owner: &str, minutes_ago: i64) -> Run {
        let mut run = Run::new(RunId::parse(id).unwrap(), owner, GenerationParameters::default());
        run.created_at = Utc::now() - Duration::minutes(minutes_ago);
        run
    }

    #[tokio::test]
    async fn save_find_delete() {
        let reg = JsonRunRegistry::in_memory();
        reg.save(run("r1", "alice", 5)).await.unwrap();
        reg.save(run("r2", "bob", 1)).await.unwrap();
        reg.save(run("r3", "alice", 0)).await.unwrap();

        let alice: Vec<String> = reg
            .find_by_owner("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id.to_string())
            .collect();
        assert_eq!(alice, ["r3", "r1"]);
        assert_eq!(reg.find_all().await.unwrap().len(), 3);

        let id = RunId::parse("r2").unwrap();
        assert!(reg.find_by_id(&id).await.unwrap().is_some());
        assert!(reg.delete_by_id(&id).await.unwrap());
        assert!(!reg.delete_by_id(&id).await.unwrap());
        assert!(reg.find_by_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_registry_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runs.json");

        let reg = JsonRunRegistry::open(&path).unwrap();
        assert!(reg.is_empty());
        reg.save(run("r1", "alice", 2)).await.unwrap();
        reg.save(run("r2", "alice", 1)).await.unwrap();
        reg.delete_by_id(&RunId::parse("r1").unwrap()).await.unwrap();
        drop(reg);

        let reopened = JsonRunRegistry::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        let only = reopened.find_all().await.unwrap();
        assert_eq!(only[0].run_id.as_str(), "r2");
        assert_eq!(only[0].owner, "alice");
    }

    #[tokio::test]
    async fn failed_write_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing-dir").join("runs.json");
        let reg = JsonRunRegistry::open(&path).unwrap();

        let err = reg.save(run("r1", "alice", 0)).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn failed_overwrite_restores_previous_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runs.json");
        let reg = JsonRunRegistry::open(&path).unwrap();
        reg.save(run("r1", "alice", 5)).await.unwrap();

        // A directory where the temp file goes makes the next write fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let err = reg.save(run("r1", "bob", 0)).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
        assert!(err.to_string().contains("r1"));

        let kept = reg.find_by_id(&RunId::parse("r1").unwrap()).await.unwrap().unwrap();
        assert_eq!(kept.owner, "alice");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runs.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonRunRegistry::open(&path), Err(Error::Registry(_))));
    }
}
