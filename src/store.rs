//! Schema Store: one atomically written JSON document per `document_id`.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   <document_id>/
//!     schema.json        the DocumentRecord
//!     media/             extracted image (PNG) and table (Markdown) blobs
//! ```
//!
//! ## Atomicity
//!
//! Every write goes to a [`tempfile::NamedTempFile`] in the destination
//! directory, is fsynced, then renamed over the target. A crash at any point
//! leaves either the old or the new file in place, never a torn one.
//!
//! [`SchemaStore::commit`] additionally serialises all writers of the same
//! document behind a per-document async lock and re-reads the record under
//! that lock, so concurrent stages of one document never overwrite each
//! other's fields.

use crate::error::Pdf2KbError;
use crate::schema::{DocumentRecord, Stage, StageState};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

const SCHEMA_FILE: &str = "schema.json";
const MEDIA_DIR: &str = "media";

/// File-backed store of [`DocumentRecord`]s.
#[derive(Debug)]
pub struct SchemaStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SchemaStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Pdf2KbError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Pdf2KbError::store_io(&root, e))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_dir(&self, document_id: &str) -> PathBuf {
        self.root.join(document_id)
    }

    pub fn schema_path(&self, document_id: &str) -> PathBuf {
        self.document_dir(document_id).join(SCHEMA_FILE)
    }

    pub fn media_dir(&self, document_id: &str) -> PathBuf {
        self.document_dir(document_id).join(MEDIA_DIR)
    }

    /// Absolute path of a media blob referenced from the schema.
    pub fn media_path(&self, document_id: &str, relative: &str) -> PathBuf {
        self.document_dir(document_id).join(relative)
    }

    pub fn exists(&self, document_id: &str) -> bool {
        self.schema_path(document_id).is_file()
    }

    /// Load the current record, or [`Pdf2KbError::SchemaNotFound`].
    pub async fn load(&self, document_id: &str) -> Result<DocumentRecord, Pdf2KbError> {
        let path = self.schema_path(document_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Pdf2KbError::SchemaNotFound {
                    document_id: document_id.to_string(),
                })
            }
            Err(e) => return Err(Pdf2KbError::store_io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| Pdf2KbError::SchemaCorrupt {
            document_id: document_id.to_string(),
            detail: e.to_string(),
        })
    }

    /// Write `record` as the document's schema, replacing any existing one.
    pub async fn save(&self, record: &DocumentRecord) -> Result<(), Pdf2KbError> {
        let lock = self.lock_for(&record.document_id);
        let _guard = lock.lock().await;
        self.write_record(record).await
    }

    /// Apply `mutation` to the stored record and persist it together with the
    /// stage state the mutation returns, as one atomic write.
    ///
    /// If the mutation returns `Err` (or panics) nothing is written and the
    /// previous record stays visible.
    pub async fn commit<F>(
        &self,
        document_id: &str,
        stage: Stage,
        mutation: F,
    ) -> Result<DocumentRecord, Pdf2KbError>
    where
        F: FnOnce(&mut DocumentRecord) -> Result<StageState, Pdf2KbError> + Send,
    {
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;

        let mut record = self.load(document_id).await?;
        let state = mutation(&mut record)?;
        debug!(
            "Commit {} / {}: {}{}",
            document_id,
            stage,
            state.status,
            if state.degraded { " (degraded)" } else { "" }
        );
        record.set_state(stage, state);
        self.write_record(&record).await?;
        Ok(record)
    }

    /// Record a stage state without touching any other field.
    pub async fn set_state(
        &self,
        document_id: &str,
        stage: Stage,
        state: StageState,
    ) -> Result<DocumentRecord, Pdf2KbError> {
        self.commit(document_id, stage, move |_| Ok(state)).await
    }

    /// Persist a media blob under `media/<name>` and return the path relative
    /// to the document directory, as stored in the schema.
    pub async fn write_media(
        &self,
        document_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, Pdf2KbError> {
        let dir = self.media_dir(document_id);
        let target = dir.join(name);
        write_atomic(dir, target, bytes).await?;
        Ok(format!("{MEDIA_DIR}/{name}"))
    }

    pub async fn read_media(&self, document_id: &str, relative: &str) -> Result<Vec<u8>, Pdf2KbError> {
        let path = self.media_path(document_id, relative);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Pdf2KbError::store_io(path, e))
    }

    /// Remove a document and all its media.
    pub async fn delete(&self, document_id: &str) -> Result<(), Pdf2KbError> {
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;
        let dir = self.document_dir(document_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Pdf2KbError::store_io(dir, e)),
        }
    }

    fn lock_for(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    async fn write_record(&self, record: &DocumentRecord) -> Result<(), Pdf2KbError> {
        let mut bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| Pdf2KbError::Internal(format!("serialise schema: {e}")))?;
        bytes.push(b'\n');
        let dir = self.document_dir(&record.document_id);
        let target = dir.join(SCHEMA_FILE);
        write_atomic(dir, target, bytes).await
    }
}

/// Temp file in the target directory, fsync, rename over the target.
async fn write_atomic(dir: PathBuf, target: PathBuf, bytes: Vec<u8>) -> Result<(), Pdf2KbError> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir).map_err(|e| Pdf2KbError::store_io(&dir, e))?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| Pdf2KbError::store_io(&dir, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| Pdf2KbError::store_io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Pdf2KbError::store_io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| Pdf2KbError::store_io(&target, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Pdf2KbError::Internal(format!("store writer panicked: {e}")))?
}
