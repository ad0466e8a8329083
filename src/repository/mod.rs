//! Device repository contract.
//!
//! Two narrow traits cover everything the pipeline persists:
//! - [`DocumentStore`]: the device registry plus the singleton Data and
//!   Settings documents, stored as JSON so that callers can deep-merge
//!   defaults over whatever fields are present.
//! - [`ContentBackend`]: append-only, date-ordered, paginated content
//!   collections.
//!
//! Backends ([`memory`], [`postgres`]) implement both and are selected once at
//! process start; [`Repositories`] hands out typed views over them.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    ContentBody, ContentKind, DeviceCapture, DeviceMessage, DeviceNote, Entry, Page, Paginated,
};

pub mod memory;
pub mod postgres;

// ---

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{kind} entry '{id}' not found")]
    EntryNotFound { kind: &'static str, id: String },
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Data,
    Settings,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Data => "data",
            DocumentKind::Settings => "settings",
        }
    }
}

/// Device registry plus per-device singleton documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn device_exists(&self, device_id: &str) -> RepoResult<bool>;

    async fn register_device(&self, device_id: &str) -> RepoResult<()>;

    /// Stored document, possibly partial; `None` if never written.
    async fn get(&self, device_id: &str, kind: DocumentKind) -> RepoResult<Option<Value>>;

    /// Shallow-merge `patch` into the stored document (creating it if absent).
    async fn update(&self, device_id: &str, kind: DocumentKind, patch: Value) -> RepoResult<()>;
}

/// Untyped content collections. Bodies are JSON objects.
#[async_trait]
pub trait ContentBackend: Send + Sync {
    async fn list(
        &self,
        device_id: &str,
        kind: ContentKind,
        page: Page,
    ) -> RepoResult<Paginated<Value>>;

    /// Insert a new entry dated now; when `prune_to` is set, drop the oldest
    /// entries so that at most `prune_to` remain.
    async fn add(
        &self,
        device_id: &str,
        kind: ContentKind,
        body: Value,
        prune_to: Option<usize>,
    ) -> RepoResult<Entry<Value>>;

    /// Shallow-merge `patch` into an entry's body; `None` if no such entry.
    async fn update(
        &self,
        device_id: &str,
        kind: ContentKind,
        id: &str,
        patch: Value,
    ) -> RepoResult<Option<Entry<Value>>>;

    async fn remove(&self, device_id: &str, kind: ContentKind, id: &str) -> RepoResult<()>;

    async fn clear(&self, device_id: &str, kind: ContentKind) -> RepoResult<()>;
}

/// `nextStartAfter` for a page: the last entry's date while the page was full.
pub(crate) fn next_cursor<T>(entries: &[Entry<T>], limit: usize) -> Option<chrono::DateTime<chrono::Utc>> {
    // ---
    if entries.len() < limit || limit == 0 {
        return None;
    }
    entries.last().map(|e| e.date)
}

/// Shallow JSON object merge, `patch` keys win.
pub(crate) fn merge_patch(target: &mut Value, patch: Value) {
    // ---
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

// ---

/// Typed view over one content collection.
pub struct ContentRepo<T> {
    backend: Arc<dyn ContentBackend>,
    _body: PhantomData<fn() -> T>,
}

impl<T> Clone for ContentRepo<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            _body: PhantomData,
        }
    }
}

impl<T: ContentBody> ContentRepo<T> {
    // ---
    pub fn new(backend: Arc<dyn ContentBackend>) -> Self {
        Self {
            backend,
            _body: PhantomData,
        }
    }

    pub async fn list(&self, device_id: &str, page: Page) -> RepoResult<Paginated<T>> {
        // ---
        let raw = self.backend.list(device_id, T::KIND, page).await?;
        let entries = raw
            .entries
            .into_iter()
            .map(typed_entry)
            .collect::<RepoResult<Vec<_>>>()?;

        Ok(Paginated {
            entries,
            next_start_after: raw.next_start_after,
        })
    }

    pub async fn add(&self, device_id: &str, body: &T, prune_to: Option<usize>) -> RepoResult<Entry<T>> {
        // ---
        let raw = self
            .backend
            .add(device_id, T::KIND, serde_json::to_value(body)?, prune_to)
            .await?;
        typed_entry(raw)
    }

    pub async fn update(&self, device_id: &str, id: &str, patch: Value) -> RepoResult<Entry<T>> {
        // ---
        match self.backend.update(device_id, T::KIND, id, patch).await? {
            Some(raw) => typed_entry(raw),
            None => Err(RepoError::EntryNotFound {
                kind: T::KIND.as_str(),
                id: id.to_string(),
            }),
        }
    }

    pub async fn remove(&self, device_id: &str, id: &str) -> RepoResult<()> {
        self.backend.remove(device_id, T::KIND, id).await
    }

    pub async fn clear(&self, device_id: &str) -> RepoResult<()> {
        self.backend.clear(device_id, T::KIND).await
    }
}

fn typed_entry<T: ContentBody>(raw: Entry<Value>) -> RepoResult<Entry<T>> {
    Ok(Entry {
        id: raw.id,
        date: raw.date,
        body: serde_json::from_value(raw.body)?,
    })
}

/// Handles to the selected backend.
#[derive(Clone)]
pub struct Repositories {
    pub documents: Arc<dyn DocumentStore>,
    pub content: Arc<dyn ContentBackend>,
    pub backend_name: &'static str,
}

impl Repositories {
    // ---
    pub fn in_memory() -> Self {
        let backend = Arc::new(memory::MemoryBackend::default());
        Self {
            documents: backend.clone(),
            content: backend,
            backend_name: "memory",
        }
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let backend = Arc::new(postgres::PgBackend::new(pool));
        Self {
            documents: backend.clone(),
            content: backend,
            backend_name: "postgres",
        }
    }

    pub fn messages(&self) -> ContentRepo<DeviceMessage> {
        ContentRepo::new(self.content.clone())
    }

    pub fn notes(&self) -> ContentRepo<DeviceNote> {
        ContentRepo::new(self.content.clone())
    }

    pub fn captures(&self) -> ContentRepo<DeviceCapture> {
        ContentRepo::new(self.content.clone())
    }
}
