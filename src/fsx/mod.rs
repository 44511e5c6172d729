//! Interception facade: filesystem-style calls that execute locally and
//! generate replication tasks.
//!
//! Every adapter runs the real local primitive first and forwards its
//! error unchanged; a task is built only on local success. Whether the
//! call then waits for propagation is the dispatcher's decision, not the
//! facade's.

mod write_stream;

pub use write_stream::SyncWriteStream;

use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};
use crate::task::{Directive, OperationKind, Task, TaskOptions, TaskPayload};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Options for [`SyncFs::copy_with`] and [`SyncFs::move_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Remove an existing destination first. Without it the local
    /// primitive's own conflict behavior applies.
    pub replace: bool,
}

/// Filesystem facade handle. Cheap to clone; all clones share the same
/// dispatcher.
#[derive(Clone)]
pub struct SyncFs {
    dispatcher: Arc<Dispatcher>,
    directive: Option<Directive>,
}

impl SyncFs {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            directive: None,
        }
    }

    /// Scope a directive onto a facade handle: operations invoked through
    /// the returned handle consume it instead of inferring a task.
    pub fn with(&self, directive: Directive) -> SyncFs {
        SyncFs {
            dispatcher: Arc::clone(&self.dispatcher),
            directive: Some(directive),
        }
    }

    /// Apply the scoped directive and hand the task to the dispatcher.
    async fn emit(&self, mut task: Task) -> Result<()> {
        match &self.directive {
            Some(Directive::Skip) => return Ok(()),
            Some(Directive::Override { op, description }) => {
                task.apply_override(*op, description.clone());
            }
            None => {}
        }
        self.dispatcher.dispatch(task).await
    }

    // -------------------------------------------------------------------
    // Content writes
    // -------------------------------------------------------------------

    /// Write `data` to `path`, replacing any existing content.
    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let data = Bytes::copy_from_slice(data.as_ref());
        fs::write(&path, &data).await?;
        self.emit(Task::new(
            OperationKind::Write,
            vec![path],
            TaskPayload::Inline(data),
        ))
        .await
    }

    /// Append `data` to `path`, creating the file if needed.
    pub async fn append_file(
        &self,
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let data = Bytes::copy_from_slice(data.as_ref());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        self.emit(Task::new(
            OperationKind::Append,
            vec![path],
            TaskPayload::Inline(data),
        ))
        .await
    }

    /// Open a write stream to `path`. The task is generated when the
    /// stream shuts down cleanly; an errored stream generates nothing.
    pub async fn create_write_stream(&self, path: impl AsRef<Path>) -> Result<SyncWriteStream> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(SyncWriteStream::new(
            file,
            path,
            Arc::clone(&self.dispatcher),
            self.directive.clone(),
        ))
    }

    // -------------------------------------------------------------------
    // Copy / move / rename
    // -------------------------------------------------------------------

    pub async fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        self.copy_with(src, dst, CopyOptions::default()).await
    }

    /// Copy a file or a directory tree.
    pub async fn copy_with(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        options: CopyOptions,
    ) -> Result<()> {
        let src = src.as_ref().to_path_buf();
        let dst = dst.as_ref().to_path_buf();

        let meta = fs::metadata(&src).await?;
        if options.replace {
            remove_existing(&dst).await;
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        let is_dir = meta.is_dir();
        if is_dir {
            copy_tree(&src, &dst).await?;
        } else {
            fs::copy(&src, &dst).await?;
        }

        self.emit(
            Task::new(
                OperationKind::Copy,
                vec![src, dst.clone()],
                TaskPayload::File(dst),
            )
            .with_options(TaskOptions {
                replace: options.replace,
                dir: is_dir,
                ..Default::default()
            }),
        )
        .await
    }

    /// Rename within a filesystem.
    pub async fn rename(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        let src = src.as_ref().to_path_buf();
        let dst = dst.as_ref().to_path_buf();
        let is_dir = fs::metadata(&src).await.map(|m| m.is_dir()).unwrap_or(false);
        fs::rename(&src, &dst).await?;
        self.emit(
            Task::new(
                OperationKind::Rename,
                vec![src, dst.clone()],
                TaskPayload::File(dst),
            )
            .with_options(TaskOptions {
                dir: is_dir,
                ..Default::default()
            }),
        )
        .await
    }

    pub async fn move_path(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        self.move_with(src, dst, CopyOptions::default()).await
    }

    /// Move a file or directory, falling back to copy-and-remove when the
    /// destination is on another filesystem.
    pub async fn move_with(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        options: CopyOptions,
    ) -> Result<()> {
        let src = src.as_ref().to_path_buf();
        let dst = dst.as_ref().to_path_buf();

        let meta = fs::metadata(&src).await?;
        let is_dir = meta.is_dir();
        if options.replace {
            remove_existing(&dst).await;
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::rename(&src, &dst).await {
            Ok(()) => {}
            Err(err) if is_cross_device(&err) => {
                if is_dir {
                    copy_tree(&src, &dst).await?;
                    fs::remove_dir_all(&src).await?;
                } else {
                    fs::copy(&src, &dst).await?;
                    fs::remove_file(&src).await?;
                }
            }
            Err(err) => return Err(err.into()),
        }

        self.emit(
            Task::new(
                OperationKind::Move,
                vec![src, dst.clone()],
                TaskPayload::File(dst),
            )
            .with_options(TaskOptions {
                replace: options.replace,
                dir: is_dir,
                ..Default::default()
            }),
        )
        .await
    }

    // -------------------------------------------------------------------
    // Structure
    // -------------------------------------------------------------------

    /// Create a directory and all missing parents.
    pub async fn mkdirp(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).await?;
        self.emit(Task::new(
            OperationKind::MkdirTree,
            vec![path],
            TaskPayload::None,
        ))
        .await
    }

    /// Create a symlink at `link` pointing to `target`.
    #[cfg(unix)]
    pub async fn symlink(
        &self,
        target: impl AsRef<Path>,
        link: impl AsRef<Path>,
    ) -> Result<()> {
        let target = target.as_ref().to_path_buf();
        let link = link.as_ref().to_path_buf();
        fs::symlink(&target, &link).await?;
        self.emit(Task::new(
            OperationKind::Symlink,
            vec![target, link],
            TaskPayload::None,
        ))
        .await
    }

    pub async fn unlink(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        fs::remove_file(&path).await?;
        self.emit(Task::new(
            OperationKind::Unlink,
            vec![path],
            TaskPayload::None,
        ))
        .await
    }

    // -------------------------------------------------------------------
    // Passthroughs (no task)
    // -------------------------------------------------------------------

    /// Open for reading. Reads are never replicated.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<File> {
        Ok(File::open(path.as_ref()).await?)
    }

    pub async fn create_read_stream(&self, path: impl AsRef<Path>) -> Result<File> {
        self.open(path).await
    }

    pub async fn access(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::metadata(path.as_ref()).await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Deprecated blocking variants
    // -------------------------------------------------------------------
    //
    // Always fail, never perform the action: a blocking call has no
    // completion hook to attach propagation to.

    pub fn open_sync(&self, _path: impl AsRef<Path>) -> Result<()> {
        Err(SyncError::DeprecatedOperation("open_sync"))
    }

    pub fn close_sync(&self) -> Result<()> {
        Err(SyncError::DeprecatedOperation("close_sync"))
    }

    pub fn write_file_sync(
        &self,
        _path: impl AsRef<Path>,
        _data: impl AsRef<[u8]>,
    ) -> Result<()> {
        Err(SyncError::DeprecatedOperation("write_file_sync"))
    }

    pub fn append_file_sync(
        &self,
        _path: impl AsRef<Path>,
        _data: impl AsRef<[u8]>,
    ) -> Result<()> {
        Err(SyncError::DeprecatedOperation("append_file_sync"))
    }

    pub fn copy_sync(&self, _src: impl AsRef<Path>, _dst: impl AsRef<Path>) -> Result<()> {
        Err(SyncError::DeprecatedOperation("copy_sync"))
    }

    pub fn rename_sync(&self, _src: impl AsRef<Path>, _dst: impl AsRef<Path>) -> Result<()> {
        Err(SyncError::DeprecatedOperation("rename_sync"))
    }

    pub fn mkdirp_sync(&self, _path: impl AsRef<Path>) -> Result<()> {
        Err(SyncError::DeprecatedOperation("mkdirp_sync"))
    }

    pub fn symlink_sync(
        &self,
        _target: impl AsRef<Path>,
        _link: impl AsRef<Path>,
    ) -> Result<()> {
        Err(SyncError::DeprecatedOperation("symlink_sync"))
    }

    pub fn unlink_sync(&self, _path: impl AsRef<Path>) -> Result<()> {
        Err(SyncError::DeprecatedOperation("unlink_sync"))
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    // EXDEV on unix.
    err.raw_os_error() == Some(18)
}

async fn remove_existing(path: &Path) {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir_all(path).await;
        }
        Ok(_) => {
            let _ = fs::remove_file(path).await;
        }
        Err(_) => {}
    }
}

/// Recursive local directory copy, overwriting existing files.
async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).await?;
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from_child = entry.path();
            let to_child = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                fs::create_dir_all(&to_child).await?;
                stack.push((from_child, to_child));
            } else if file_type.is_symlink() {
                #[cfg(unix)]
                {
                    let target = fs::read_link(&from_child).await?;
                    let _ = fs::remove_file(&to_child).await;
                    fs::symlink(&target, &to_child).await?;
                }
            } else {
                fs::copy(&from_child, &to_child).await?;
            }
        }
    }
    Ok(())
}
