//! Step inputs: where an input's bits come from.
//!
//! An artifact either already lives in a volume (the output of an earlier
//! step) or has to be streamed as a tar archive into a fresh volume.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::error::VolumeError;
use crate::volume::{ArtifactStream, Volume, VolumeClient};

const CHUNK_BACKLOG: usize = 16;

/// Source of a step input.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// The volume holding this artifact on `worker_name`, if it is resident
    /// there.
    async fn volume_on(
        &self,
        worker_name: &str,
        client: &dyn VolumeClient,
    ) -> Result<Option<Volume>, VolumeError>;

    /// A tar stream of the artifact's contents.
    async fn open_stream(&self) -> Result<ArtifactStream, VolumeError>;

    /// Short human-readable description for logs.
    fn description(&self) -> String;
}

/// An artifact held in a volume produced by an earlier step.
#[derive(Debug, Clone)]
pub struct VolumeArtifactSource {
    volume: Volume,
}

impl VolumeArtifactSource {
    pub fn new(volume: Volume) -> Self {
        Self { volume }
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }
}

#[async_trait]
impl ArtifactSource for VolumeArtifactSource {
    async fn volume_on(
        &self,
        worker_name: &str,
        client: &dyn VolumeClient,
    ) -> Result<Option<Volume>, VolumeError> {
        if self.volume.worker_name != worker_name {
            return Ok(None);
        }
        client.lookup_volume(&self.volume.handle).await
    }

    async fn open_stream(&self) -> Result<ArtifactStream, VolumeError> {
        tar_directory(&self.volume.path)
    }

    fn description(&self) -> String {
        format!(
            "volume {} on {}",
            self.volume.handle, self.volume.worker_name
        )
    }
}

/// An artifact read from a directory on the host.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactSource {
    path: PathBuf,
}

impl DirectoryArtifactSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ArtifactSource for DirectoryArtifactSource {
    async fn volume_on(
        &self,
        _worker_name: &str,
        _client: &dyn VolumeClient,
    ) -> Result<Option<Volume>, VolumeError> {
        Ok(None)
    }

    async fn open_stream(&self) -> Result<ArtifactStream, VolumeError> {
        tar_directory(&self.path)
    }

    fn description(&self) -> String {
        format!("directory {}", self.path.display())
    }
}

/// Stream a directory as a tar archive.
///
/// The archive is built on a blocking thread and handed over in chunks. A
/// failure while archiving is delivered to the reader as an I/O error, so a
/// partial archive never unpacks cleanly.
pub(crate) fn tar_directory(dir: &Path) -> Result<ArtifactStream, VolumeError> {
    if !dir.is_dir() {
        return Err(VolumeError::NotFound {
            handle: dir.display().to_string(),
        });
    }

    let (tx, rx) = mpsc::channel(CHUNK_BACKLOG);
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(ChunkWriter { tx: tx.clone() });
        builder.follow_symlinks(false);
        let result = builder
            .append_dir_all(".", &dir)
            .and_then(|()| builder.finish());
        if let Err(e) = result {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to archive directory");
            // Queued ahead of anything the builder writes when dropped.
            let _ = tx.blocking_send(Err(e));
        }
    });

    Ok(Box::new(StreamReader::new(ReceiverStream::new(rx))))
}

/// Forwards archive bytes to the reading side of [`tar_directory`].
struct ChunkWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Unpack a tar stream into `dest`.
pub(crate) async fn unpack_into(
    stream: ArtifactStream,
    dest: &Path,
    handle: &str,
) -> Result<(), VolumeError> {
    let dest = dest.to_path_buf();
    let bridge = SyncIoBridge::new(stream);

    tokio::task::spawn_blocking(move || tar::Archive::new(bridge).unpack(&dest))
        .await
        .map_err(|e| VolumeError::StreamFailed {
            handle: handle.to_string(),
            reason: e.to_string(),
        })?
        .map_err(|e| VolumeError::StreamFailed {
            handle: handle.to_string(),
            reason: e.to_string(),
        })
}
