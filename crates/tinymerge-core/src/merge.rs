//! Public entry point: publish a staging tree into an output directory.
//!
//! A merge either lands completely or is rolled back. Every mutation the
//! tree walk makes is recorded in a [`RollbackLedger`]; if the walk fails the
//! ledger is replayed before the error reaches the caller. Overwritten files
//! are backed up into a per-call directory that is removed when the call
//! ends, whatever the outcome.

use crate::cancel::CancelToken;
use crate::config::MergeSettings;
use crate::copier::{FileCopier, FsCopier};
use crate::error::{MergeError, Result};
use crate::ledger::{RollbackLedger, Undo};
use crate::tree::{merge_dir, MergeRequest, MergeSummary};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;

/// Outcome of a merge that committed.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub summary: MergeSummary,
    pub elapsed: Duration,
}

/// Merge `src` into `dest` with the default settings.
pub async fn merge(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<MergeReport> {
    Merger::default().merge(src, dest).await
}

pub struct Merger {
    settings: MergeSettings,
    copier: Arc<dyn FileCopier>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new(MergeSettings::default())
    }
}

impl Merger {
    pub fn new(settings: MergeSettings) -> Self {
        Self {
            settings,
            copier: Arc::new(FsCopier),
        }
    }

    /// Replace the copier used for forward copies. Rollback always uses the
    /// filesystem directly.
    pub fn with_copier(mut self, copier: Arc<dyn FileCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    pub async fn merge(
        &self,
        src: impl AsRef<Path>,
        dest: impl AsRef<Path>,
    ) -> Result<MergeReport> {
        self.merge_with_cancel(src, dest, CancelToken::new()).await
    }

    /// Like [`Merger::merge`], but stops early when `cancel` fires. An early
    /// stop is a failure like any other and is rolled back.
    pub async fn merge_with_cancel(
        &self,
        src: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        cancel: CancelToken,
    ) -> Result<MergeReport> {
        let (src, dest) = (src.as_ref(), dest.as_ref());
        let started = Instant::now();

        tracing::debug!(
            source = %src.display(),
            dest = %dest.display(),
            state = "validating",
            "Merge state"
        );
        if src == dest {
            tracing::info!(
                path = %src.display(),
                "Source and destination are the same, nothing to do"
            );
            return Ok(MergeReport::default());
        }
        let backup_parent = self.settings.backup_parent();
        let dest_exists = match validate(src, dest, &backup_parent).await? {
            Target::SameDir => {
                tracing::info!(
                    path = %src.display(),
                    "Source and destination resolve to the same directory, nothing to do"
                );
                return Ok(MergeReport::default());
            }
            Target::Existing => true,
            Target::Missing => false,
        };

        let cancel = match self.settings.timeout() {
            Some(timeout) => cancel.with_timeout(timeout),
            None => cancel,
        };
        cancel.check()?;

        let backup_root = create_backup_dir(&backup_parent).await?;
        let ledger = Arc::new(RollbackLedger::new());

        tracing::debug!(backup = %backup_root.display(), state = "merging", "Merge state");
        let req = Arc::new(MergeRequest::new(
            src.to_path_buf(),
            dest.to_path_buf(),
            backup_root.clone(),
            self.copier.clone(),
            self.settings.max_concurrency,
        ));

        let walk = match create_dest_root(dest, dest_exists, &ledger).await {
            Ok(()) => {
                merge_dir(
                    req.clone(),
                    ledger.clone(),
                    cancel,
                    src.to_path_buf(),
                    dest.to_path_buf(),
                )
                .await
            }
            Err(e) => Err(e),
        };

        let outcome = match walk {
            Ok(()) => {
                tracing::debug!(state = "committing", "Merge state");
                let report = MergeReport {
                    summary: req.summary(),
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    source = %src.display(),
                    dest = %dest.display(),
                    dirs_created = report.summary.dirs_created,
                    files_created = report.summary.files_created,
                    files_overwritten = report.summary.files_overwritten,
                    files_skipped = report.summary.files_skipped,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Merge committed"
                );
                Ok(report)
            }
            Err(cause) => {
                tracing::debug!(state = "rolling_back", "Merge state");
                tracing::warn!(error = %cause, "Merge failed, rolling back");
                match ledger.replay().await {
                    Ok(undone) => {
                        tracing::info!(undone, "Rollback complete");
                        Err(cause)
                    }
                    Err(failures) => {
                        tracing::error!(
                            failed = failures.len(),
                            dest = %dest.display(),
                            "Rollback incomplete, destination may be inconsistent"
                        );
                        Err(MergeError::RollbackFailure {
                            cause: Box::new(cause),
                            failures,
                        })
                    }
                }
            }
        };

        if let Err(e) = fs::remove_dir_all(&backup_root).await {
            tracing::warn!(
                path = %backup_root.display(),
                error = %e,
                "Failed to remove backup directory"
            );
        }
        tracing::debug!(state = "done", "Merge state");

        outcome
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Target {
    SameDir,
    Existing,
    Missing,
}

/// Check both roots, and where backups will go, before touching anything.
async fn validate(src: &Path, dest: &Path, backup_parent: &Path) -> Result<Target> {
    if src.as_os_str().is_empty() {
        return Err(MergeError::InvalidInput("source directory not set".into()));
    }
    if dest.as_os_str().is_empty() {
        return Err(MergeError::InvalidInput(
            "destination directory not set".into(),
        ));
    }

    let src_meta = fs::metadata(src)
        .await
        .map_err(MergeError::with("stat", src))?;
    if !src_meta.is_dir() {
        return Err(MergeError::NotADirectory {
            path: src.to_path_buf(),
        });
    }

    let dest_exists = match fs::metadata(dest).await {
        Ok(meta) if meta.is_dir() => true,
        Ok(_) => {
            return Err(MergeError::NotADirectory {
                path: dest.to_path_buf(),
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(MergeError::io("stat", dest, e)),
    };

    let src_abs = fs::canonicalize(src)
        .await
        .map_err(MergeError::with("canonicalize", src))?;
    let dest_abs = resolve(dest).await?;
    if src_abs == dest_abs {
        return Ok(Target::SameDir);
    }
    if dest_abs.starts_with(&src_abs) {
        return Err(MergeError::InvalidInput(format!(
            "destination {} is inside source {}",
            dest.display(),
            src.display()
        )));
    }
    // The walk would pick up the backups it is writing.
    if resolve(backup_parent).await?.starts_with(&src_abs) {
        return Err(MergeError::InvalidInput(format!(
            "backup directory {} is inside source {}",
            backup_parent.display(),
            src.display()
        )));
    }

    Ok(if dest_exists {
        Target::Existing
    } else {
        Target::Missing
    })
}

/// Canonical form of `path`, or its absolute form if it does not exist yet.
async fn resolve(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path).await {
        Ok(abs) => Ok(abs),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            std::path::absolute(path).map_err(MergeError::with("canonicalize", path))
        }
        Err(e) => Err(MergeError::io("canonicalize", path, e)),
    }
}

/// Create the destination root if missing. The topmost directory created is
/// recorded so rollback leaves no trace of it.
async fn create_dest_root(dest: &Path, exists: bool, ledger: &RollbackLedger) -> Result<()> {
    if exists {
        return Ok(());
    }

    let mut topmost = dest.to_path_buf();
    while let Some(parent) = topmost.parent() {
        if parent.as_os_str().is_empty() || fs::try_exists(parent).await.unwrap_or(true) {
            break;
        }
        topmost = parent.to_path_buf();
    }

    fs::create_dir_all(dest)
        .await
        .map_err(MergeError::with("mkdir", dest))?;
    ledger.record(Undo::RemoveDirAll(topmost)).await;
    tracing::debug!(path = %dest.display(), "Created destination root");
    Ok(())
}

async fn create_backup_dir(parent: &Path) -> Result<PathBuf> {
    fs::create_dir_all(parent)
        .await
        .map_err(MergeError::with("mkdir", parent))?;
    let path = parent.join(backup_dir_name());
    fs::create_dir(&path)
        .await
        .map_err(MergeError::with("mkdir", &path))?;
    Ok(path)
}

/// Unique per call: `<millis>_<random>-tinymerge-bak`.
fn backup_dir_name() -> String {
    let ts = chrono::Utc::now().timestamp_millis();
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}-tinymerge-bak", ts, &rand[..12])
}
