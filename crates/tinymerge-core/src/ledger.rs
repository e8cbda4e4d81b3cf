use crate::copier::copy_file;
use crate::error::{FailedUndo, MergeError, Result, RollbackFailure};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::Mutex;

/// A compensating operation that puts one destination path back the way it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    /// Delete a file the merge created.
    RemoveFile(PathBuf),
    /// Delete a directory subtree the merge created.
    RemoveDirAll(PathBuf),
    /// Replace `dest` with the copy saved at `backup` and put back the
    /// modification time `dest` had before the merge, so a later merge
    /// judges staleness against the original.
    Restore {
        backup: PathBuf,
        dest: PathBuf,
        modified: SystemTime,
    },
}

impl Undo {
    /// Apply the action. A target that is already gone counts as undone.
    pub async fn apply(&self) -> Result<()> {
        match self {
            Undo::RemoveFile(path) => match fs::remove_file(path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    Err(MergeError::io("remove", path, e))
                }
                _ => Ok(()),
            },
            Undo::RemoveDirAll(path) => match fs::remove_dir_all(path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    Err(MergeError::io("rmdir", path, e))
                }
                _ => Ok(()),
            },
            Undo::Restore {
                backup,
                dest,
                modified,
            } => {
                let backup_meta = fs::metadata(backup)
                    .await
                    .map_err(MergeError::with("stat", backup))?;
                if backup_meta.is_dir() {
                    return Err(MergeError::IsADirectory {
                        path: backup.clone(),
                    });
                }

                match fs::symlink_metadata(dest).await {
                    Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest)
                        .await
                        .map_err(MergeError::with("rmdir", dest))?,
                    Ok(_) => fs::remove_file(dest)
                        .await
                        .map_err(MergeError::with("remove", dest))?,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(MergeError::io("stat", dest, e)),
                }

                copy_file(backup, dest).await?;
                set_modified(dest, *modified).await
            }
        }
    }
}

/// Setting times on a descriptor only needs ownership, so a read-only
/// handle works for read-only files too.
async fn set_modified(path: &Path, modified: SystemTime) -> Result<()> {
    let file = fs::File::open(path)
        .await
        .map_err(MergeError::with("open", path))?
        .into_std()
        .await;
    tokio::task::spawn_blocking(move || file.set_modified(modified))
        .await
        .map_err(|e| MergeError::TaskFailed(e.to_string()))?
        .map_err(MergeError::with("set mtime", path))
}

impl fmt::Display for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Undo::RemoveFile(path) => write!(f, "remove {}", path.display()),
            Undo::RemoveDirAll(path) => write!(f, "remove directory {}", path.display()),
            Undo::Restore { backup, dest, .. } => {
                write!(f, "restore {} from {}", dest.display(), backup.display())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackAction {
    pub description: String,
    pub undo: Undo,
}

/// Append-only record of the mutations made by one merge.
///
/// Workers append concurrently; replay runs only after every worker joined.
#[derive(Debug, Default)]
pub struct RollbackLedger {
    actions: Mutex<Vec<RollbackAction>>,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, description: impl Into<String>, undo: Undo) {
        self.actions.lock().await.push(RollbackAction {
            description: description.into(),
            undo,
        });
    }

    /// Append with the action's own description.
    pub async fn record(&self, undo: Undo) {
        let description = undo.to_string();
        self.append(description, undo).await;
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    /// Undo every recorded action in the order it was appended.
    ///
    /// Keeps going after a failed action and reports all of them together.
    /// The ledger is empty afterwards. Returns how many actions succeeded.
    pub async fn replay(&self) -> std::result::Result<usize, RollbackFailure> {
        let mut actions = self.actions.lock().await;
        let mut failure = RollbackFailure::default();
        let mut applied = 0;

        for action in actions.drain(..) {
            match action.undo.apply().await {
                Ok(()) => {
                    applied += 1;
                    tracing::info!(action = %action.description, "Rolled back");
                }
                Err(error) => {
                    tracing::error!(
                        action = %action.description,
                        error = %error,
                        "Rollback action failed"
                    );
                    failure.failures.push(FailedUndo {
                        description: action.description,
                        error,
                    });
                }
            }
        }

        if failure.is_empty() {
            Ok(applied)
        } else {
            Err(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_replays_in_append_order() {
        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join("first.bak");
        let second = tmp.path().join("second.bak");
        let dest = tmp.path().join("page.html");
        std::fs::write(&first, b"first").unwrap();
        std::fs::write(&second, b"second").unwrap();
        std::fs::write(&dest, b"current").unwrap();

        let ledger = RollbackLedger::new();
        ledger
            .record(Undo::Restore {
                backup: first,
                dest: dest.clone(),
                modified: SystemTime::now(),
            })
            .await;
        ledger
            .record(Undo::Restore {
                backup: second,
                dest: dest.clone(),
                modified: SystemTime::now(),
            })
            .await;

        assert_eq!(ledger.replay().await.unwrap(), 2);
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_continues_past_failures() {
        let tmp = TempDir::new().unwrap();
        let created = tmp.path().join("new.html");
        let created_dir = tmp.path().join("posts");
        std::fs::write(&created, b"x").unwrap();
        std::fs::create_dir_all(created_dir.join("2024")).unwrap();

        let ledger = RollbackLedger::new();
        ledger
            .append(
                "restore from missing backup",
                Undo::Restore {
                    backup: tmp.path().join("missing.bak"),
                    dest: tmp.path().join("index.html"),
                    modified: SystemTime::now(),
                },
            )
            .await;
        ledger.record(Undo::RemoveFile(created.clone())).await;
        ledger.record(Undo::RemoveDirAll(created_dir.clone())).await;

        let failure = ledger.replay().await.unwrap_err();

        assert_eq!(failure.len(), 1);
        assert_eq!(failure.failures[0].description, "restore from missing backup");
        assert!(!created.exists());
        assert!(!created_dir.exists());
    }

    #[tokio::test]
    async fn test_restore_puts_back_original_mtime() {
        let tmp = TempDir::new().unwrap();
        let backup = tmp.path().join("a.txt.bak");
        let dest = tmp.path().join("a.txt");
        std::fs::write(&backup, b"OLD").unwrap();
        std::fs::write(&dest, b"NEW").unwrap();
        let original = SystemTime::now() - Duration::from_secs(7200);

        let ledger = RollbackLedger::new();
        ledger
            .record(Undo::Restore {
                backup,
                dest: dest.clone(),
                modified: original,
            })
            .await;
        ledger.replay().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"OLD");
        let restored = std::fs::metadata(&dest).unwrap().modified().unwrap();
        let drift = restored
            .duration_since(original)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1), "mtime off by {drift:?}");
    }

    #[tokio::test]
    async fn test_replay_clears_ledger() {
        let tmp = TempDir::new().unwrap();
        let ledger = RollbackLedger::new();
        ledger
            .record(Undo::RemoveFile(tmp.path().join("gone.txt")))
            .await;
        assert_eq!(ledger.len().await, 1);

        assert_eq!(ledger.replay().await.unwrap(), 1);
        assert!(ledger.is_empty().await);
        assert_eq!(ledger.replay().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends() {
        let ledger = Arc::new(RollbackLedger::new());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..64 {
            let ledger = ledger.clone();
            tasks.spawn(async move {
                ledger
                    .record(Undo::RemoveFile(PathBuf::from(format!("/tmp/f{i}"))))
                    .await;
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        assert_eq!(ledger.len().await, 64);
    }
}
