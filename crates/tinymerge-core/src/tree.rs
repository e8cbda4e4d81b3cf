use crate::cancel::CancelToken;
use crate::copier::FileCopier;
use crate::error::{MergeError, Result};
use crate::ledger::{RollbackLedger, Undo};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::Metadata;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinSet;

/// Per-invocation context shared by every task of one merge.
pub struct MergeRequest {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub backup_root: PathBuf,
    copier: Arc<dyn FileCopier>,
    limiter: Semaphore,
    stats: MergeStats,
}

impl MergeRequest {
    /// `max_concurrency` caps in-flight filesystem work across the whole tree.
    pub fn new(
        source_root: PathBuf,
        dest_root: PathBuf,
        backup_root: PathBuf,
        copier: Arc<dyn FileCopier>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            source_root,
            dest_root,
            backup_root,
            copier,
            limiter: Semaphore::new(max_concurrency.max(1)),
            stats: MergeStats::default(),
        }
    }

    pub fn summary(&self) -> MergeSummary {
        self.stats.snapshot()
    }

    /// Backups mirror the destination layout so same-named files never collide.
    fn backup_path(&self, dest: &Path) -> Result<PathBuf> {
        let rel = dest.strip_prefix(&self.dest_root).map_err(|_| {
            MergeError::InvalidInput(format!(
                "{} is outside {}",
                dest.display(),
                self.dest_root.display()
            ))
        })?;
        Ok(self.backup_root.join(rel))
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.limiter
            .acquire()
            .await
            .map_err(|_| MergeError::TaskFailed("concurrency limiter closed".into()))
    }
}

#[derive(Debug, Default)]
struct MergeStats {
    dirs_created: AtomicUsize,
    files_created: AtomicUsize,
    files_overwritten: AtomicUsize,
    files_skipped: AtomicUsize,
}

impl MergeStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MergeSummary {
        MergeSummary {
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            files_overwritten: self.files_overwritten.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
        }
    }
}

/// What a merge did to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub dirs_created: usize,
    pub files_created: usize,
    pub files_overwritten: usize,
    pub files_skipped: usize,
}

type MergeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Merge the children of `src` into `dest`, one task per entry.
///
/// Every task is joined before this returns. The first failure cancels the
/// remaining siblings (and their subtrees); that failure is what gets
/// returned, not the cancellations it caused.
pub fn merge_dir(
    req: Arc<MergeRequest>,
    ledger: Arc<RollbackLedger>,
    cancel: CancelToken,
    src: PathBuf,
    dest: PathBuf,
) -> MergeFuture {
    Box::pin(async move {
        let names = list_dir(&req, &cancel, &src).await?;

        let group = cancel.child();
        let mut tasks = JoinSet::new();
        for name in names {
            tasks.spawn(merge_entry(
                req.clone(),
                ledger.clone(),
                group.clone(),
                src.join(&name),
                dest.join(&name),
            ));
        }

        let mut first_err: Option<MergeError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(MergeError::TaskFailed(e.to_string())));
            if let Err(e) = outcome {
                group.cancel();
                first_err = match first_err {
                    None => Some(e),
                    Some(prev) if prev.is_cancellation() && !e.is_cancellation() => Some(e),
                    keep => keep,
                };
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

/// The listing holds a permit and closes its handle before any child task
/// starts, so open descriptors stay bounded by the pool size.
async fn list_dir(
    req: &MergeRequest,
    cancel: &CancelToken,
    src: &Path,
) -> Result<Vec<OsString>> {
    let _permit = req.acquire().await?;
    cancel.check()?;

    let mut names = Vec::new();
    let mut dir = fs::read_dir(src)
        .await
        .map_err(MergeError::with("readdir", src))?;
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(MergeError::with("readdir", src))?
    {
        names.push(entry.file_name());
    }
    Ok(names)
}

async fn merge_entry(
    req: Arc<MergeRequest>,
    ledger: Arc<RollbackLedger>,
    cancel: CancelToken,
    src: PathBuf,
    dest: PathBuf,
) -> Result<()> {
    cancel.check()?;

    let descend = {
        let _permit = req.acquire().await?;
        // Siblings waiting on the permit must see the failure before they get it.
        visit_entry(&req, &ledger, &cancel, &src, &dest)
            .await
            .inspect_err(|_| cancel.cancel())?
    };

    if descend {
        merge_dir(req, ledger, cancel, src, dest).await
    } else {
        Ok(())
    }
}

/// Handle one entry under a permit. Returns whether `src` is a directory
/// still to be walked.
async fn visit_entry(
    req: &MergeRequest,
    ledger: &RollbackLedger,
    cancel: &CancelToken,
    src: &Path,
    dest: &Path,
) -> Result<bool> {
    cancel.check()?;
    let src_meta = fs::metadata(src)
        .await
        .map_err(MergeError::with("stat", src))?;

    if src_meta.is_dir() {
        ensure_dir(req, ledger, cancel, dest).await?;
        Ok(true)
    } else {
        merge_file(req, ledger, cancel, src, &src_meta, dest).await?;
        Ok(false)
    }
}

/// Create `dest` if missing. Only a directory created here gets a rollback
/// action, so pre-existing directories survive a rollback.
async fn ensure_dir(
    req: &MergeRequest,
    ledger: &RollbackLedger,
    cancel: &CancelToken,
    dest: &Path,
) -> Result<()> {
    cancel.check()?;
    match fs::metadata(dest).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(MergeError::NotADirectory {
            path: dest.to_path_buf(),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir(dest)
                .await
                .map_err(MergeError::with("mkdir", dest))?;
            ledger.record(Undo::RemoveDirAll(dest.to_path_buf())).await;
            MergeStats::bump(&req.stats.dirs_created);
            tracing::debug!(path = %dest.display(), "Created directory");
            Ok(())
        }
        Err(e) => Err(MergeError::io("stat", dest, e)),
    }
}

async fn merge_file(
    req: &MergeRequest,
    ledger: &RollbackLedger,
    cancel: &CancelToken,
    src: &Path,
    src_meta: &Metadata,
    dest: &Path,
) -> Result<()> {
    let dest_meta = match fs::metadata(dest).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            cancel.check()?;
            req.copier.copy_file(src, dest).await?;
            ledger.record(Undo::RemoveFile(dest.to_path_buf())).await;
            MergeStats::bump(&req.stats.files_created);
            tracing::debug!(path = %dest.display(), "Created file");
            return Ok(());
        }
        Err(e) => return Err(MergeError::io("stat", dest, e)),
    };

    if dest_meta.is_dir() {
        return Err(MergeError::IsADirectory {
            path: dest.to_path_buf(),
        });
    }

    let src_mtime = src_meta
        .modified()
        .map_err(MergeError::with("mtime", src))?;
    let dest_mtime = dest_meta
        .modified()
        .map_err(MergeError::with("mtime", dest))?;
    if src_mtime <= dest_mtime {
        MergeStats::bump(&req.stats.files_skipped);
        tracing::debug!(path = %dest.display(), "Destination is up to date, skipping");
        return Ok(());
    }

    let backup = req.backup_path(dest)?;
    cancel.check()?;
    req.copier.copy_file(dest, &backup).await?;
    ledger
        .record(Undo::Restore {
            backup,
            dest: dest.to_path_buf(),
            modified: dest_mtime,
        })
        .await;

    cancel.check()?;
    fs::remove_file(dest)
        .await
        .map_err(MergeError::with("remove", dest))?;
    req.copier.copy_file(src, dest).await?;
    MergeStats::bump(&req.stats.files_overwritten);
    tracing::debug!(path = %dest.display(), "Overwrote file");
    Ok(())
}
