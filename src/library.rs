//! Lookup of stored audio files by identifier.
//!
//! Identifiers are opaque file names inside a single media root. They are
//! never interpreted as paths: anything with a directory component is
//! rejected before the filesystem is touched.

use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;

use crate::error::{Result, StreamError};
use crate::stream::CHUNK_SIZE;
use crate::KnownSize;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A media file resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub id: String,
    pub path: PathBuf,
    pub byte_size: u64,
    pub content_type: String,
}

/// A directory of stored media files. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    root: Arc<Path>,
    chunk_size: usize,
    default_content_type: Arc<str>,
}

impl MediaLibrary {
    pub fn new(root: impl AsRef<Path>) -> Self {
        MediaLibrary {
            root: Arc::from(root.as_ref()),
            chunk_size: CHUNK_SIZE,
            default_content_type: Arc::from(DEFAULT_CONTENT_TYPE),
        }
    }

    /// Read chunk size for bodies opened from this library.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Content type for files whose extension is not recognised.
    pub fn with_default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_content_type = Arc::from(content_type.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an identifier to its location under the media root.
    pub fn path_of(&self, id: &str) -> Result<PathBuf> {
        let invalid = || StreamError::InvalidIdentifier { id: id.to_owned() };

        if id.is_empty() || id.contains(['/', '\\', '\0']) {
            return Err(invalid());
        }

        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(invalid()),
        }
    }

    pub fn content_type_of(&self, id: &str) -> String {
        mime_guess::from_path(id)
            .first_raw()
            .map(str::to_owned)
            .unwrap_or_else(|| self.default_content_type.to_string())
    }

    /// Open a file for streaming.
    ///
    /// The length is taken from the opened handle, so it describes the file
    /// this body will read even if the name is replaced afterwards.
    pub async fn open(&self, id: &str) -> Result<(MediaFile, KnownSize<File>)> {
        let path = self.path_of(id)?;
        let not_found = || StreamError::NotFound { id: id.to_owned() };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(not_found());
        }

        let media = MediaFile {
            id: id.to_owned(),
            path,
            byte_size: metadata.len(),
            content_type: self.content_type_of(id),
        };
        tracing::debug!(id, byte_size = media.byte_size, content_type = %media.content_type, "opened media file");

        let body = KnownSize::sized(file, media.byte_size).with_chunk_size(self.chunk_size);
        Ok((media, body))
    }

    /// Identifiers of the regular files directly under the media root.
    pub async fn list(&self) -> Result<BTreeSet<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = BTreeSet::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(name) => tracing::debug!(?name, "skipping non UTF-8 file name"),
            }
        }

        Ok(ids)
    }

    /// Compare the identifiers a metadata store knows about with what is on
    /// disk. Meant to run on a schedule, outside of any request.
    pub async fn reconcile<I, S>(&self, known: I) -> Result<ReconcileReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known: BTreeSet<String> = known.into_iter().map(Into::into).collect();
        let on_disk = self.list().await?;

        let report = ReconcileReport {
            missing: known.difference(&on_disk).cloned().collect(),
            orphaned: on_disk.difference(&known).cloned().collect(),
        };

        tracing::info!(
            root = %self.root.display(),
            missing = report.missing.len(),
            orphaned = report.orphaned.len(),
            "reconciled media library",
        );
        Ok(report)
    }
}

/// Result of [`MediaLibrary::reconcile`], both lists sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Known identifiers with no file on disk.
    pub missing: Vec<String>,
    /// Files on disk no record refers to.
    pub orphaned: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty()
    }
}
