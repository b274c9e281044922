use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use eyre::Context as _;
use tokio::io::{self, AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{
    Driver, FileInfo, FileWriter, Reader, StorageError, StorageErrorKind, WalkControl,
};

const ENGINE: &str = "filesystem";

fn classify(err: &std::io::Error) -> StorageErrorKind {
    match err.kind() {
        ErrorKind::NotFound => StorageErrorKind::NotFound,
        ErrorKind::Interrupted
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => StorageErrorKind::Transient,
        _ => StorageErrorKind::Permanent,
    }
}

fn fs_error(path: &Utf8Path, context: &str, err: std::io::Error) -> StorageError {
    StorageError::builder(ENGINE, classify(&err), err)
        .path(path.as_str())
        .context(context.to_string())
        .build()
}

/// Storage driver rooted at a local directory.
///
/// Renames are atomic within the root, which lives on one filesystem;
/// that is the property the blob commit path relies on.
#[derive(Debug)]
pub struct FilesystemDriver {
    root: Utf8PathBuf,
}

impl FilesystemDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn full(&self, path: &Utf8Path) -> Utf8PathBuf {
        match path.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(path),
        }
    }
}

struct FilesystemWriter {
    file: io::BufWriter<tokio::fs::File>,
    path: Utf8PathBuf,
    size: u64,
}

impl io::AsyncWrite for FilesystemWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.size += written as u64;
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl FileWriter for FilesystemWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.file
            .shutdown()
            .await
            .map_err(|err| fs_error(&self.path, "commit", err))
    }

    async fn cancel(mut self: Box<Self>) -> Result<(), StorageError> {
        let _ = self.file.shutdown().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(fs_error(&self.path, "cancel", err)),
        }
    }
}

#[async_trait::async_trait]
impl Driver for FilesystemDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.full(path))
            .await
            .map_err(|err| fs_error(path, "get_content", err))
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| fs_error(path, "put_content: create parents", err))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|err| fs_error(path, "put_content", err))
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader>, StorageError> {
        let mut file = tokio::fs::File::open(self.full(path))
            .await
            .map_err(|err| fs_error(path, "reader: open", err))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|err| fs_error(path, "reader: seek", err))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    async fn writer(
        &self,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| fs_error(path, "writer: create parents", err))?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = options
            .open(&full)
            .await
            .map_err(|err| fs_error(path, "writer: open", err))?;

        let size = if append {
            file.metadata()
                .await
                .map_err(|err| fs_error(path, "writer: metadata", err))?
                .len()
        } else {
            0
        };

        Ok(Box::new(FilesystemWriter {
            file: io::BufWriter::new(file),
            path: full,
            size,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        let metadata = tokio::fs::metadata(self.full(path))
            .await
            .map_err(|err| fs_error(path, "stat", err))?;
        let mod_time: DateTime<Utc> = metadata
            .modified()
            .map_err(|err| fs_error(path, "stat: modified", err))?
            .into();
        Ok(FileInfo {
            path: path.to_owned(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mod_time,
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let mut entries = tokio::fs::read_dir(self.full(path))
            .await
            .map_err(|err| fs_error(path, "list", err))?;

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| fs_error(path, "list: next entry", err))?
        {
            if let Some(name) = entry.file_name().to_str() {
                children.push(path.join(name));
            }
        }
        Ok(children)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let dst = self.full(to);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| fs_error(to, "rename: create parents", err))?;
        }
        tokio::fs::rename(self.full(from), dst)
            .await
            .map_err(|err| fs_error(from, "rename", err))
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let full = self.full(path);
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|err| fs_error(path, "delete", err))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full)
                .await
                .map_err(|err| fs_error(path, "delete: remove tree", err))
        } else {
            tokio::fs::remove_file(&full)
                .await
                .map_err(|err| fs_error(path, "delete: remove file", err))
        }
    }

    async fn walk(
        &self,
        root: &Utf8Path,
        f: &mut (dyn for<'a> FnMut(&'a FileInfo) -> WalkControl + Send),
    ) -> Result<(), StorageError> {
        let full_root = self.full(root);
        let namespace_root = root.to_owned();
        let driver_root = self.root.clone();

        let entries = tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            collect(&full_root, &driver_root, &mut entries)?;
            Ok::<_, eyre::Report>(entries)
        })
        .in_current_span()
        .await
        .wrap_err("walk task")
        .map_err(StorageError::with(ENGINE, StorageErrorKind::Permanent))?
        .map_err(StorageError::with(ENGINE, StorageErrorKind::Permanent))?;

        tracing::debug!(root = %namespace_root, entries = entries.len(), "walked filesystem tree");

        let mut skipping: Option<Utf8PathBuf> = None;
        for info in entries {
            if let Some(skip) = &skipping {
                if info.path.starts_with(skip) && info.path != *skip {
                    continue;
                }
                skipping = None;
            }
            match f(&info) {
                WalkControl::Continue => {}
                WalkControl::SkipDir if info.is_dir => skipping = Some(info.path.clone()),
                WalkControl::SkipDir => {}
                WalkControl::Stop => return Ok(()),
            }
        }
        Ok(())
    }
}

/// Depth-first, name-sorted traversal, emitting directories before their
/// children. Paths are reported relative to the driver root.
fn collect(
    dir: &Utf8Path,
    driver_root: &Utf8Path,
    entries: &mut Vec<FileInfo>,
) -> eyre::Result<()> {
    let mut children: Vec<_> = dir
        .read_dir_utf8()
        .wrap_err_with(|| format!("read_dir {dir}"))?
        .collect::<Result<_, _>>()?;
    children.sort_by(|a, b| a.file_name().cmp(b.file_name()));

    for child in children {
        let metadata = child.metadata()?;
        let mod_time: DateTime<Utc> = metadata.modified()?.into();
        let relative = child
            .path()
            .strip_prefix(driver_root)
            .unwrap_or(child.path())
            .to_owned();
        if metadata.is_dir() {
            entries.push(FileInfo {
                path: relative,
                size: 0,
                mod_time,
                is_dir: true,
            });
            collect(child.path(), driver_root, entries)?;
        } else {
            entries.push(FileInfo {
                path: relative,
                size: metadata.len(),
                mod_time,
                is_dir: false,
            });
        }
    }
    Ok(())
}
