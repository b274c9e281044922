use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::blob::linked::LinkedBlobStore;
use crate::cache::Scope;
use crate::descriptor::Descriptor;
use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{Error, Result};
use crate::paths::{path_for, PathSpec};
use crate::reference::RepositoryName;
use crate::Shared;

/// A resumable upload session.
///
/// Bytes accumulate under the session id; nothing is observable at a blob
/// digest until [`commit`] verifies the streaming hash against the digest
/// the client asserted. Appends are totally ordered by offset within one
/// session; concurrent appends to the same session are a client error.
///
/// [`commit`]: BlobWriter::commit
#[derive(Debug)]
pub struct BlobWriter {
    shared: Arc<Shared>,
    repository: RepositoryName,
    id: String,
    started_at: DateTime<Utc>,
    size: u64,
    digester: Digester,
    refuse_writes: bool,
}

impl BlobWriter {
    /// The session id, handed back to the client for resumption.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes accepted so far; the next append must start here.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn data_path(&self) -> Utf8PathBuf {
        path_for(PathSpec::UploadData {
            name: &self.repository,
            id: &self.id,
        })
    }

    fn session_path(&self) -> Utf8PathBuf {
        path_for(PathSpec::Upload {
            name: &self.repository,
            id: &self.id,
        })
    }

    /// Append bytes at the current end of the session.
    #[tracing::instrument(skip(self, bytes), fields(id = %self.id, len = bytes.len()))]
    pub async fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }
        if self.refuse_writes {
            return Err(Error::UploadReadOnly {
                id: self.id.clone(),
            });
        }

        let path = self.data_path();
        let mut writer = self.shared.driver.writer(&path, true).await?;
        writer.write_all(bytes).await.map_err(io_failure)?;
        writer.shutdown().await.map_err(io_failure)?;
        writer.commit().await?;

        self.digester.update(bytes);
        self.size += bytes.len() as u64;
        self.persist_hash_state().await;

        Ok(self.size)
    }

    /// Append bytes asserting their starting offset.
    ///
    /// Offsets are monotonically non-decreasing: anything other than the
    /// current end of the session is refused.
    pub async fn append_at(&mut self, offset: u64, bytes: &[u8]) -> Result<u64> {
        if offset != self.size {
            return Err(Error::RangeInvalid {
                offset,
                current: self.size,
            });
        }
        self.append(bytes).await
    }

    /// Record how far the rolling hash has progressed.
    ///
    /// The marker makes the resumption offset discoverable after a restart;
    /// failing to write it costs a re-hash on resume, not correctness, so
    /// it is logged and swallowed.
    async fn persist_hash_state(&self) {
        let path = path_for(PathSpec::UploadHashState {
            name: &self.repository,
            id: &self.id,
            algorithm: Algorithm::Sha256,
            offset: self.size,
        });
        let payload = self.size.to_string();
        if let Err(err) = self
            .shared
            .driver
            .put_content(&path, payload.as_bytes())
            .await
        {
            tracing::debug!(id = %self.id, error = %err, "hash state persistence failed");
        }
    }

    /// Verify and promote the session to a blob.
    ///
    /// The streaming hash must equal `expected`; when `expected_size` is
    /// asserted, the byte count must match first. On digest mismatch the
    /// session is destroyed and nothing becomes addressable.
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    pub async fn commit(
        self,
        expected: &Digest,
        expected_size: Option<u64>,
    ) -> Result<Descriptor> {
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }

        if let Some(asserted) = expected_size {
            if asserted != self.size {
                return Err(Error::BlobInvalidLength {
                    expected: asserted,
                    actual: self.size,
                });
            }
        }

        let data_path = self.data_path();
        let session_path = self.session_path();

        let computed = self.digester.finalize();
        if computed != *expected {
            // Partial or corrupt data must never become addressable.
            if let Err(err) = self.shared.driver.delete(&session_path).await {
                tracing::warn!(id = %self.id, error = %err, "failed to destroy mismatched upload");
            }
            return Err(Error::BlobInvalidDigest {
                expected: expected.clone(),
                computed,
            });
        }

        let blob_path = path_for(PathSpec::BlobData { digest: &computed });
        self.shared.driver.rename(&data_path, &blob_path).await?;

        if let Err(err) = self.shared.driver.delete(&session_path).await {
            tracing::debug!(id = %self.id, error = %err, "session cleanup failed");
        }

        let descriptor = Descriptor::octet_stream(computed.clone(), self.size);

        // Link the layer into the owning repository.
        let linked = LinkedBlobStore::new(
            Arc::clone(&self.shared),
            self.repository.clone(),
            super::LinkRole::Layer,
        );
        linked.link(&computed).await?;
        if let Some(cache) = &self.shared.cache {
            cache
                .set(Scope::Repository(&self.repository), descriptor.clone())
                .await;
            cache.set(Scope::Global, descriptor.clone()).await;
        }

        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "upload committed");
        Ok(descriptor)
    }

    /// Abandon the session and clean up best-effort.
    pub async fn cancel(self) -> Result<()> {
        match self.shared.driver.delete(&self.session_path()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn io_failure(err: std::io::Error) -> Error {
    Error::Storage(storage_driver::StorageError::new(
        "upload",
        storage_driver::StorageErrorKind::Permanent,
        err,
    ))
}

impl LinkedBlobStore {
    /// Start a new upload session in this repository.
    pub async fn create_upload(&self) -> Result<BlobWriter> {
        self.global().check_writable()?;

        let shared = Arc::clone(self.shared());
        let repository = self.repository().clone();
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let started_path = path_for(PathSpec::UploadStartedAt {
            name: &repository,
            id: &id,
        });
        shared
            .driver
            .put_content(&started_path, started_at.to_rfc3339().as_bytes())
            .await?;

        // Materialize the data file so a zero-byte commit has something to
        // promote.
        let data_path = path_for(PathSpec::UploadData {
            name: &repository,
            id: &id,
        });
        shared.driver.put_content(&data_path, b"").await?;

        tracing::debug!(repository = %repository, id = %id, "upload session created");
        Ok(BlobWriter {
            shared,
            repository,
            id,
            started_at,
            size: 0,
            digester: Algorithm::Sha256.digester(),
            refuse_writes: false,
        })
    }

    /// Resume an existing upload session.
    ///
    /// The rolling hash is rebuilt by replaying the session's bytes from the
    /// backend, so the committed digest is identical to a single-shot upload
    /// of the same content.
    pub async fn resume_upload(&self, id: &str) -> Result<BlobWriter> {
        let shared = Arc::clone(self.shared());
        let repository = self.repository().clone();

        let started_path = path_for(PathSpec::UploadStartedAt {
            name: &repository,
            id,
        });
        let raw = match shared.driver.get_content(&started_path).await {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() => {
                return Err(Error::UploadUnknown { id: id.to_string() })
            }
            Err(err) => return Err(err.into()),
        };
        let started_at = std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| DateTime::parse_from_rfc3339(text.trim()).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok_or_else(|| Error::UploadUnknown { id: id.to_string() })?;

        let refuse_writes = match chrono::Duration::from_std(shared.config.upload_read_only_age) {
            Ok(age) => Utc::now() - started_at > age,
            Err(_) => false,
        };

        let data_path = path_for(PathSpec::UploadData {
            name: &repository,
            id,
        });
        let size = match shared.driver.stat(&data_path).await {
            Ok(info) => info.size,
            Err(err) if err.is_not_found() => {
                return Err(Error::UploadUnknown { id: id.to_string() })
            }
            Err(err) => return Err(err.into()),
        };

        let mut digester = Algorithm::Sha256.digester();
        if size > 0 {
            let mut reader = shared.driver.reader(&data_path, 0).await?;
            let mut buf = vec![0u8; 64 * 1024];
            let mut replayed = 0u64;
            while replayed < size {
                let n = reader.read(&mut buf).await.map_err(io_failure)?;
                if n == 0 {
                    break;
                }
                digester.update(&buf[..n]);
                replayed += n as u64;
            }
        }

        tracing::debug!(repository = %repository, id, size, "upload session resumed");
        Ok(BlobWriter {
            shared,
            repository,
            id: id.to_string(),
            started_at,
            size,
            digester,
            refuse_writes,
        })
    }
}
