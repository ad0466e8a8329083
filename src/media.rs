//! Media collaborator: stores uploaded images and serves firmware files.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::Utc;
use uuid::Uuid;

// ---

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store `data` under `name`, returning the stored name.
    async fn save(&self, name: &str, data: Bytes) -> std::io::Result<String>;

    async fn load(&self, name: &str) -> std::io::Result<Bytes>;
}

/// Unique media name, e.g. `d1/1718000000000-<uuid>.jpeg`.
pub fn gen_file_name(device_id: &str, extension: &str) -> String {
    format!(
        "{}/{}-{}.{}",
        device_id,
        Utc::now().timestamp_millis(),
        Uuid::new_v4(),
        extension
    )
}

/// Media kept on the local filesystem under a root directory.
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    // ---
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> std::io::Result<PathBuf> {
        // ---
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("media name '{name}' is not a relative path"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn save(&self, name: &str, data: Bytes) -> std::io::Result<String> {
        // ---
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(name.to_string())
    }

    async fn load(&self, name: &str) -> std::io::Result<Bytes> {
        let path = self.resolve(name)?;
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }
}
