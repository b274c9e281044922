use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io;
use tokio::sync::RwLock;

use storage_driver::{
    Driver, FileInfo, FileWriter, Reader, StorageError, StorageErrorKind, WalkControl,
};

fn not_found(path: &Utf8Path, context: &str) -> StorageError {
    StorageError::builder(
        "memory",
        StorageErrorKind::NotFound,
        format!("no object at {path}"),
    )
    .path(path.as_str())
    .context(context.to_string())
    .build()
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mod_time: DateTime<Utc>,
}

impl MemoryFile {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            mod_time: Utc::now(),
        }
    }
}

/// Storage driver that holds all objects in process memory.
///
/// The default backend for tests: fully deterministic, no filesystem
/// dependence, and a sorted keyspace so walks are reproducible.
#[derive(Debug, Default, Clone)]
pub struct MemoryDriver {
    files: Arc<RwLock<BTreeMap<Utf8PathBuf, MemoryFile>>>,
}

impl MemoryDriver {
    /// Create a new, empty `MemoryDriver`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored. Test helper.
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    /// Whether the store holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

/// True when `path` is a directory prefix of `candidate` (strictly above it).
fn is_under(path: &Utf8Path, candidate: &Utf8Path) -> bool {
    candidate != path && candidate.starts_with(path)
}

struct MemoryWriter {
    files: Arc<RwLock<BTreeMap<Utf8PathBuf, MemoryFile>>>,
    path: Utf8PathBuf,
    buf: Vec<u8>,
}

impl io::AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl FileWriter for MemoryWriter {
    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        files.insert(self.path, MemoryFile::new(self.buf));
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let files = self.files.read().await;
        files
            .get(path)
            .map(|file| file.data.clone())
            .ok_or_else(|| not_found(path, "get_content"))
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        files.insert(path.to_owned(), MemoryFile::new(content.to_vec()));
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader>, StorageError> {
        let files = self.files.read().await;
        let file = files.get(path).ok_or_else(|| not_found(path, "reader"))?;
        let data = file
            .data
            .get(offset.min(file.data.len() as u64) as usize..)
            .unwrap_or_default()
            .to_vec();
        Ok(Box::new(Cursor::new(data)))
    }

    async fn writer(
        &self,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        let buf = if append {
            let files = self.files.read().await;
            files.get(path).map(|f| f.data.clone()).unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Box::new(MemoryWriter {
            files: Arc::clone(&self.files),
            path: path.to_owned(),
            buf,
        }))
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        let files = self.files.read().await;
        if let Some(file) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_owned(),
                size: file.data.len() as u64,
                mod_time: file.mod_time,
                is_dir: false,
            });
        }

        // A directory exists exactly when something is stored beneath it.
        let newest = files
            .range(path.to_owned()..)
            .take_while(|(candidate, _)| candidate.starts_with(path))
            .filter(|(candidate, _)| is_under(path, candidate))
            .map(|(_, file)| file.mod_time)
            .max();

        match newest {
            Some(mod_time) => Ok(FileInfo {
                path: path.to_owned(),
                size: 0,
                mod_time,
                is_dir: true,
            }),
            None => Err(not_found(path, "stat")),
        }
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let files = self.files.read().await;
        let mut children = Vec::new();
        for candidate in files.keys() {
            if !is_under(path, candidate) {
                continue;
            }
            let relative = candidate
                .strip_prefix(path)
                .expect("candidate is under path");
            if let Some(first) = relative.components().next() {
                let child = path.join(first.as_str());
                if children.last() != Some(&child) {
                    children.push(child);
                }
            }
        }
        if children.is_empty() && !files.contains_key(path) {
            return Err(not_found(path, "list"));
        }
        children.dedup();
        Ok(children)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        let file = files.remove(from).ok_or_else(|| not_found(from, "rename"))?;
        files.insert(to.to_owned(), file);
        Ok(())
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        if files.remove(path).is_some() {
            return Ok(());
        }
        let doomed: Vec<Utf8PathBuf> = files
            .keys()
            .filter(|candidate| is_under(path, candidate))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Err(not_found(path, "delete"));
        }
        for key in doomed {
            files.remove(&key);
        }
        Ok(())
    }

    async fn walk(
        &self,
        root: &Utf8Path,
        f: &mut (dyn for<'a> FnMut(&'a FileInfo) -> WalkControl + Send),
    ) -> Result<(), StorageError> {
        // Snapshot the (sorted) keyspace, then synthesize directory entries
        // ahead of their children.
        let entries: Vec<(Utf8PathBuf, u64, DateTime<Utc>)> = {
            let files = self.files.read().await;
            files
                .iter()
                .filter(|(path, _)| path.starts_with(root))
                .map(|(path, file)| (path.clone(), file.data.len() as u64, file.mod_time))
                .collect()
        };

        let mut emitted_dirs: Vec<Utf8PathBuf> = Vec::new();
        let mut skipping: Option<Utf8PathBuf> = None;

        for (path, size, mod_time) in entries {
            if let Some(skip) = &skipping {
                if path.starts_with(skip) {
                    continue;
                }
                skipping = None;
            }

            let mut pending_dirs = Vec::new();
            let mut ancestor = path.parent();
            while let Some(dir) = ancestor {
                if !dir.starts_with(root) || dir == root {
                    break;
                }
                if emitted_dirs.iter().any(|seen| seen == dir) {
                    break;
                }
                pending_dirs.push(dir.to_owned());
                ancestor = dir.parent();
            }

            let mut skipped = false;
            for dir in pending_dirs.into_iter().rev() {
                let info = FileInfo {
                    path: dir.clone(),
                    size: 0,
                    mod_time,
                    is_dir: true,
                };
                emitted_dirs.push(dir.clone());
                match f(&info) {
                    WalkControl::Continue => {}
                    WalkControl::SkipDir => {
                        skipping = Some(dir);
                        skipped = true;
                        break;
                    }
                    WalkControl::Stop => return Ok(()),
                }
            }
            if skipped {
                continue;
            }

            let info = FileInfo {
                path,
                size,
                mod_time,
                is_dir: false,
            };
            match f(&info) {
                WalkControl::Continue | WalkControl::SkipDir => {}
                WalkControl::Stop => return Ok(()),
            }
        }

        Ok(())
    }
}
