//! In-process backend: used for local development and the test suite.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    merge_patch, next_cursor, ContentBackend, DocumentKind, DocumentStore, RepoResult,
};
use crate::models::{ContentKind, Entry, Page, Paginated};

// ---

#[derive(Default)]
pub struct MemoryBackend {
    devices: RwLock<HashSet<String>>,
    documents: RwLock<HashMap<(String, DocumentKind), Value>>,
    /// Newest first.
    content: RwLock<HashMap<(String, ContentKind), Vec<Entry<Value>>>>,
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn device_exists(&self, device_id: &str) -> RepoResult<bool> {
        Ok(self.devices.read().await.contains(device_id))
    }

    async fn register_device(&self, device_id: &str) -> RepoResult<()> {
        self.devices.write().await.insert(device_id.to_string());
        Ok(())
    }

    async fn get(&self, device_id: &str, kind: DocumentKind) -> RepoResult<Option<Value>> {
        // ---
        let documents = self.documents.read().await;
        Ok(documents.get(&(device_id.to_string(), kind)).cloned())
    }

    async fn update(&self, device_id: &str, kind: DocumentKind, patch: Value) -> RepoResult<()> {
        // ---
        let mut documents = self.documents.write().await;
        let doc = documents
            .entry((device_id.to_string(), kind))
            .or_insert_with(|| Value::Object(Default::default()));
        merge_patch(doc, patch);
        Ok(())
    }
}

#[async_trait]
impl ContentBackend for MemoryBackend {
    async fn list(
        &self,
        device_id: &str,
        kind: ContentKind,
        page: Page,
    ) -> RepoResult<Paginated<Value>> {
        // ---
        let content = self.content.read().await;
        let entries: Vec<Entry<Value>> = content
            .get(&(device_id.to_string(), kind))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| page.start_after.map_or(true, |cursor| e.date < cursor))
                    .take(page.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let next_start_after = next_cursor(&entries, page.limit);
        Ok(Paginated {
            entries,
            next_start_after,
        })
    }

    async fn add(
        &self,
        device_id: &str,
        kind: ContentKind,
        body: Value,
        prune_to: Option<usize>,
    ) -> RepoResult<Entry<Value>> {
        // ---
        let mut content = self.content.write().await;
        let entries = content.entry((device_id.to_string(), kind)).or_default();

        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            date: strictly_after(entries.first().map(|e| e.date), Utc::now()),
            body,
        };
        entries.insert(0, entry.clone());

        if let Some(cap) = prune_to {
            entries.truncate(cap);
        }

        Ok(entry)
    }

    async fn update(
        &self,
        device_id: &str,
        kind: ContentKind,
        id: &str,
        patch: Value,
    ) -> RepoResult<Option<Entry<Value>>> {
        // ---
        let mut content = self.content.write().await;
        let entry = content
            .get_mut(&(device_id.to_string(), kind))
            .and_then(|entries| entries.iter_mut().find(|e| e.id == id));

        Ok(entry.map(|entry| {
            merge_patch(&mut entry.body, patch);
            entry.clone()
        }))
    }

    async fn remove(&self, device_id: &str, kind: ContentKind, id: &str) -> RepoResult<()> {
        // ---
        let mut content = self.content.write().await;
        if let Some(entries) = content.get_mut(&(device_id.to_string(), kind)) {
            entries.retain(|e| e.id != id);
        }
        Ok(())
    }

    async fn clear(&self, device_id: &str, kind: ContentKind) -> RepoResult<()> {
        self.content.write().await.remove(&(device_id.to_string(), kind));
        Ok(())
    }
}

/// Keep dates strictly increasing so that date cursors never split a tie.
fn strictly_after(newest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match newest {
        Some(newest) if now <= newest => newest + Duration::microseconds(1),
        _ => now,
    }
}
