//! Target system persisted to a JSON file.

use super::memory::{InMemoryTarget, TargetSnapshot};
use crate::core::{Document, EntityType, Filter, TargetSystem};
use crate::error::Result;
use crate::state::write_json_atomic;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// [`InMemoryTarget`] whose contents are rewritten to disk after every
/// successful mutation.
#[derive(Debug)]
pub struct JsonFileTarget {
    path: PathBuf,
    inner: InMemoryTarget,
}

impl JsonFileTarget {
    /// Open the store at `path`, starting empty when the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot: TargetSnapshot = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            TargetSnapshot::default()
        };
        let total: usize = snapshot.records.values().map(|docs| docs.len()).sum();
        info!("Opened target store {} ({} records)", path.display(), total);
        Ok(Self {
            path,
            inner: InMemoryTarget::from_snapshot(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self, entity: EntityType) -> usize {
        self.inner.count(entity)
    }

    fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.inner.snapshot())
    }
}

#[async_trait]
impl TargetSystem for JsonFileTarget {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn create(&self, entity: EntityType, data: Document) -> Result<String> {
        let id = self.inner.create(entity, data).await?;
        self.persist()?;
        Ok(id)
    }

    async fn update(&self, entity: EntityType, id: &str, changes: Document) -> Result<()> {
        self.inner.update(entity, id, changes).await?;
        self.persist()
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<()> {
        self.inner.delete(entity, id).await?;
        self.persist()
    }

    async fn submit(&self, entity: EntityType, id: &str) -> Result<()> {
        self.inner.submit(entity, id).await?;
        self.persist()
    }

    async fn cancel(&self, entity: EntityType, id: &str) -> Result<()> {
        self.inner.cancel(entity, id).await?;
        self.persist()
    }

    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Document>> {
        self.inner.get(entity, id).await
    }

    async fn query(&self, entity: EntityType, filter: &Filter) -> Result<Vec<Document>> {
        self.inner.query(entity, filter).await
    }
}
