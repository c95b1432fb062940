//! Enrolled identities and their reference embeddings.
//!
//! The gallery lives in memory behind a copy-on-write snapshot: readers
//! take an `Arc<Gallery>` and never observe a half-applied mutation.
//! Mutations are serialized, written through to disk (temp file + rename)
//! and only then published, so a failed save changes nothing.
//!
//! A file-backed store holds an exclusive advisory lock on a `.lock` file
//! next to the gallery for its whole lifetime, so two processes never
//! write the same gallery.

use crate::types::{BoundingBox, Embedding, ValidationError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Version of the persisted gallery layout. Bump on incompatible changes.
pub const GALLERY_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid enrollment: {0}")]
    Validation(#[from] ValidationError),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("reference embedding {id} not found for identity {key}")]
    EmbeddingNotFound { key: String, id: Uuid },
    #[error("corrupt gallery file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("gallery {path} is in use by another process")]
    Locked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode gallery: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Provenance recorded with each reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollMetadata {
    pub enrolled_at: DateTime<Utc>,
    /// Free-form source reference (image path, "live", ...).
    #[serde(default)]
    pub source: Option<String>,
    /// Face box in the source frame, when enrolled from a live capture.
    #[serde(default)]
    pub source_box: Option<BoundingBox>,
}

impl EnrollMetadata {
    pub fn now() -> Self {
        Self {
            enrolled_at: Utc::now(),
            source: None,
            source_box: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_box(mut self, bbox: BoundingBox) -> Self {
        self.source_box = Some(bbox);
        self
    }
}

/// One enrolled pose/lighting sample of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    pub id: Uuid,
    /// Stored L2-normalized.
    pub embedding: Embedding,
    pub metadata: EnrollMetadata,
}

/// An enrolled person. Always owns at least one reference embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub key: String,
    pub references: Vec<ReferenceEmbedding>,
}

impl Identity {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.references.iter().map(|r| r.metadata.enrolled_at).min()
    }
}

/// Full mapping from identity key to identity, for one model version.
#[derive(Debug, Clone, PartialEq)]
pub struct Gallery {
    model_version: String,
    dimension: usize,
    identities: BTreeMap<String, Identity>,
}

impl Gallery {
    pub fn new(model_version: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_version: model_version.into(),
            dimension,
            identities: BTreeMap::new(),
        }
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.identities.values().map(|i| i.references.len()).sum()
    }

    pub fn get(&self, key: &str) -> Option<&Identity> {
        self.identities.get(key)
    }

    /// Identities in key order.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    /// Validate `embedding` against this gallery's model and dimensionality.
    pub fn check(&self, embedding: &Embedding) -> Result<(), ValidationError> {
        embedding.validate(&self.model_version, self.dimension)
    }

    fn add_reference(
        &mut self,
        key: &str,
        embedding: &Embedding,
        metadata: EnrollMetadata,
    ) -> Result<Uuid, GalleryError> {
        if key.trim().is_empty() {
            return Err(ValidationError::EmptyIdentityKey.into());
        }
        self.check(embedding)?;

        let id = Uuid::new_v4();
        let reference = ReferenceEmbedding {
            id,
            embedding: embedding.normalized(),
            metadata,
        };
        self.identities
            .entry(key.to_string())
            .or_insert_with(|| Identity {
                key: key.to_string(),
                references: Vec::new(),
            })
            .references
            .push(reference);
        Ok(id)
    }

    fn remove_identity(&mut self, key: &str) -> Result<Identity, GalleryError> {
        self.identities
            .remove(key)
            .ok_or_else(|| GalleryError::NotFound(key.to_string()))
    }

    /// Remove one reference; the identity goes with its last reference.
    fn remove_reference(&mut self, key: &str, id: Uuid) -> Result<bool, GalleryError> {
        let identity = self
            .identities
            .get_mut(key)
            .ok_or_else(|| GalleryError::NotFound(key.to_string()))?;
        let before = identity.references.len();
        identity.references.retain(|r| r.id != id);
        if identity.references.len() == before {
            return Err(GalleryError::EmbeddingNotFound {
                key: key.to_string(),
                id,
            });
        }
        let emptied = identity.references.is_empty();
        if emptied {
            self.identities.remove(key);
        }
        Ok(emptied)
    }
}

/// On-disk layout of the gallery file.
#[derive(Serialize, Deserialize)]
struct GalleryFile {
    schema_version: u32,
    model_version: String,
    dimension: usize,
    saved_at: DateTime<Utc>,
    identities: BTreeMap<String, Vec<ReferenceEmbedding>>,
}

/// Only the version field, read first so old or foreign files are rejected
/// before their body is interpreted.
#[derive(Deserialize)]
struct SchemaProbe {
    schema_version: Option<u32>,
}

/// Thread-safe owner of the gallery.
///
/// Many readers (the matcher, via [`snapshot`](Self::snapshot)), one writer
/// at a time. The read lock is held only long enough to clone an `Arc`.
pub struct GalleryStore {
    current: RwLock<Arc<Gallery>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
    /// The in-memory gallery differs from the backing file.
    unsaved: AtomicBool,
    /// Held for the lifetime of a file-backed store; released on drop.
    _lock: Option<File>,
}

impl GalleryStore {
    /// Empty, memory-only store. Mutations are not persisted until
    /// [`save`](Self::save) is called.
    pub fn in_memory(model_version: impl Into<String>, dimension: usize) -> Self {
        Self::from_parts(Gallery::new(model_version, dimension), None, None)
    }

    /// Open a write-through store backed by `path`.
    ///
    /// A missing file yields an empty gallery; an unreadable or incompatible
    /// file is a [`GalleryError::Corrupt`]. Fails with
    /// [`GalleryError::Locked`] while another store has `path` open.
    pub fn open(
        path: impl Into<PathBuf>,
        model_version: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, GalleryError> {
        let path = path.into();
        let model_version = model_version.into();
        let lock = lock_gallery(&path)?;

        let gallery = if path.exists() {
            read_gallery_file(&path, &model_version, dimension)?
        } else {
            tracing::info!(path = %path.display(), "no gallery file yet; starting empty");
            Gallery::new(model_version, dimension)
        };

        Ok(Self::from_parts(gallery, Some(path), Some(lock)))
    }

    /// Write-through store at `path` that starts empty, ignoring whatever is
    /// on disk. The file is left alone until the first mutation.
    pub fn open_empty(
        path: impl Into<PathBuf>,
        model_version: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, GalleryError> {
        let path = path.into();
        let lock = lock_gallery(&path)?;
        Ok(Self::from_parts(
            Gallery::new(model_version, dimension),
            Some(path),
            Some(lock),
        ))
    }

    fn from_parts(gallery: Gallery, path: Option<PathBuf>, lock: Option<File>) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
            writer: Mutex::new(()),
            path,
            unsaved: AtomicBool::new(false),
            _lock: lock,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Consistent point-in-time view of the gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy of every identity, in key order.
    pub fn all_identities(&self) -> Vec<Identity> {
        self.snapshot().identities().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Identity> {
        self.snapshot().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn model_version(&self) -> String {
        self.snapshot().model_version().to_string()
    }

    pub fn dimension(&self) -> usize {
        self.snapshot().dimension()
    }

    /// Add `embedding` to identity `key`, creating the identity if needed.
    /// Returns the id of the new reference embedding.
    pub fn enroll(
        &self,
        key: &str,
        embedding: &Embedding,
        metadata: EnrollMetadata,
    ) -> Result<Uuid, GalleryError> {
        let id = self.mutate(|g| g.add_reference(key, embedding, metadata))?;
        tracing::info!(key, %id, "reference embedding enrolled");
        Ok(id)
    }

    /// Remove identity `key` and all of its embeddings.
    pub fn remove(&self, key: &str) -> Result<Identity, GalleryError> {
        let removed = self.mutate(|g| g.remove_identity(key))?;
        tracing::info!(key, references = removed.references.len(), "identity removed");
        Ok(removed)
    }

    /// Remove a single reference embedding. Returns `true` when that was the
    /// identity's last one and the identity itself was removed.
    pub fn remove_embedding(&self, key: &str, id: Uuid) -> Result<bool, GalleryError> {
        let emptied = self.mutate(|g| g.remove_reference(key, id))?;
        tracing::info!(key, %id, identity_removed = emptied, "reference embedding removed");
        Ok(emptied)
    }

    /// Replace the in-memory gallery with the contents of `path`.
    ///
    /// On any error the current gallery is left untouched.
    pub fn load(&self, path: &Path) -> Result<(), GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        let loaded = read_gallery_file(path, current.model_version(), current.dimension())?;
        self.publish(loaded);
        if self.path.as_deref() != Some(path) {
            self.unsaved.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Atomically write the current gallery to `path`.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_gallery_file(path, &self.snapshot())?;
        if self.path.as_deref() == Some(path) {
            self.unsaved.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Whether the backing file is behind the in-memory gallery.
    pub fn has_unsaved_changes(&self) -> bool {
        self.path.is_some() && self.unsaved.load(Ordering::Acquire)
    }

    /// Save to the backing file if it is behind. Mutations are written
    /// through, so this only writes after a [`load`](Self::load) from
    /// another file.
    pub fn flush(&self) -> Result<(), GalleryError> {
        match &self.path {
            Some(path) if self.has_unsaved_changes() => self.save(path),
            Some(path) => {
                tracing::debug!(path = %path.display(), "gallery file up to date; nothing to flush");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Apply `op` to a private copy, persist it, then publish it.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut Gallery) -> Result<T, GalleryError>,
    ) -> Result<T, GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Gallery::clone(&self.snapshot());
        let out = op(&mut next)?;
        if let Some(path) = &self.path {
            write_gallery_file(path, &next)?;
            self.unsaved.store(false, Ordering::Release);
        }
        self.publish(next);
        Ok(out)
    }

    fn publish(&self, gallery: Gallery) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    }
}

/// Read a gallery file without opening a store on it; no lock is taken.
/// A missing file reads as an empty gallery.
pub fn read_gallery(
    path: &Path,
    model_version: &str,
    dimension: usize,
) -> Result<Gallery, GalleryError> {
    if path.exists() {
        read_gallery_file(path, model_version, dimension)
    } else {
        Ok(Gallery::new(model_version, dimension))
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Take the exclusive advisory lock guarding `path`.
///
/// The lock lives on a sidecar file because saves replace the gallery file
/// itself by rename.
fn lock_gallery(path: &Path) -> Result<File, GalleryError> {
    let lock_path = lock_path(path);
    if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| GalleryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|source| GalleryError::Io {
            path: lock_path.clone(),
            source,
        })?;
    file.try_lock_exclusive().map_err(|source| GalleryError::Locked {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(lock = %lock_path.display(), "gallery lock acquired");
    Ok(file)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> GalleryError {
    GalleryError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_gallery_file(
    path: &Path,
    model_version: &str,
    dimension: usize,
) -> Result<Gallery, GalleryError> {
    let bytes = std::fs::read(path).map_err(|e| corrupt(path, format!("unreadable: {e}")))?;

    let probe: SchemaProbe =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(path, format!("not a gallery: {e}")))?;
    match probe.schema_version {
        Some(GALLERY_SCHEMA_VERSION) => {}
        Some(v) => {
            return Err(corrupt(
                path,
                format!("schema version {v}, expected {GALLERY_SCHEMA_VERSION}"),
            ))
        }
        None => return Err(corrupt(path, "missing schema_version")),
    }

    let file: GalleryFile =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(path, format!("malformed: {e}")))?;

    if file.model_version != model_version {
        return Err(corrupt(
            path,
            format!("model version {}, expected {model_version}", file.model_version),
        ));
    }
    if file.dimension != dimension {
        return Err(corrupt(
            path,
            format!("dimension {}, expected {dimension}", file.dimension),
        ));
    }

    let mut gallery = Gallery::new(model_version, dimension);
    let mut ids = HashSet::new();
    for (key, mut references) in file.identities {
        if key.trim().is_empty() {
            return Err(corrupt(path, "identity with empty key"));
        }
        if references.is_empty() {
            return Err(corrupt(path, format!("identity {key} has no embeddings")));
        }
        for reference in &mut references {
            gallery
                .check(&reference.embedding)
                .map_err(|e| corrupt(path, format!("identity {key}: {e}")))?;
            if !ids.insert(reference.id) {
                return Err(corrupt(
                    path,
                    format!("identity {key}: duplicate reference id {}", reference.id),
                ));
            }
            // Matching scores by dot product against unit-length references.
            reference.embedding = reference.embedding.normalized();
        }
        gallery.identities.insert(key.clone(), Identity { key, references });
    }

    tracing::info!(
        path = %path.display(),
        identities = gallery.len(),
        references = gallery.reference_count(),
        "gallery loaded"
    );
    Ok(gallery)
}

fn write_gallery_file(path: &Path, gallery: &Gallery) -> Result<(), GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let file = GalleryFile {
        schema_version: GALLERY_SCHEMA_VERSION,
        model_version: gallery.model_version.clone(),
        dimension: gallery.dimension,
        saved_at: Utc::now(),
        identities: gallery
            .identities
            .iter()
            .map(|(k, i)| (k.clone(), i.references.clone()))
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&file)?;

    // Same directory as the target so the rename stays on one filesystem.
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    tracing::debug!(
        path = %path.display(),
        identities = gallery.len(),
        bytes = bytes.len(),
        "gallery saved"
    );
    Ok(())
}
