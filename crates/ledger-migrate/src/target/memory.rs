//! In-memory target system.

use crate::core::{
    doc_str, docstatus, Document, EntityType, Filter, TargetSystem, DOCSTATUS_CANCELLED,
    DOCSTATUS_DRAFT, DOCSTATUS_SUBMITTED,
};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Serializable contents of a target: documents per entity type and the
/// naming counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSnapshot {
    #[serde(default)]
    pub records: BTreeMap<EntityType, BTreeMap<String, Document>>,
    #[serde(default)]
    pub counters: HashMap<EntityType, u64>,
}

/// Target store held in memory.
///
/// Follows the document lifecycle of the target contract: records are
/// created as drafts, submitted records must be cancelled before they can
/// be deleted, and transactions must name their counterparty.
#[derive(Debug, Default)]
pub struct InMemoryTarget {
    state: Mutex<TargetSnapshot>,
}

fn name_prefix(entity: EntityType) -> &'static str {
    match entity {
        EntityType::SalesInvoice => "SINV",
        EntityType::PurchaseInvoice => "PINV",
        EntityType::PaymentEntry => "PE",
        EntityType::JournalEntry => "JV",
        EntityType::Customer => "CUST",
        EntityType::Supplier => "SUPP",
        EntityType::Account => "ACC",
    }
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: TargetSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        self.lock().clone()
    }

    /// Number of records of one entity type.
    pub fn count(&self, entity: EntityType) -> usize {
        self.lock().records.get(&entity).map_or(0, BTreeMap::len)
    }

    /// Insert a record directly, bypassing validation. Used to seed master data.
    pub fn insert(&self, entity: EntityType, name: &str, mut data: Document) {
        data.insert("name".to_string(), Value::String(name.to_string()));
        self.lock()
            .records
            .entry(entity)
            .or_default()
            .insert(name.to_string(), data);
    }

    fn lock(&self) -> MutexGuard<'_, TargetSnapshot> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_docstatus(&self, entity: EntityType, id: &str, from: i64, to: i64, action: &str) -> Result<()> {
        let mut state = self.lock();
        let doc = state
            .records
            .get_mut(&entity)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| MigrateError::not_found(entity.as_str(), id))?;
        let current = docstatus(doc);
        if current != from {
            return Err(MigrateError::target(
                entity.as_str(),
                format!("cannot {} {} with docstatus {}", action, id, current),
            ));
        }
        doc.insert("docstatus".to_string(), Value::from(to));
        debug!("{} {} {}", action, entity, id);
        Ok(())
    }
}

#[async_trait]
impl TargetSystem for InMemoryTarget {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, entity: EntityType, mut data: Document) -> Result<String> {
        if let Some(field) = entity.party_field() {
            if doc_str(&data, field).is_none() {
                return Err(MigrateError::validation(
                    entity.as_str(),
                    format!("missing required field '{}'", field),
                ));
            }
        }

        let mut state = self.lock();
        let name = match doc_str(&data, "name") {
            Some(name) => {
                if state
                    .records
                    .get(&entity)
                    .is_some_and(|docs| docs.contains_key(name))
                {
                    return Err(MigrateError::target(
                        entity.as_str(),
                        format!("record '{}' already exists", name),
                    ));
                }
                name.to_string()
            }
            None => {
                let counter = state.counters.entry(entity).or_insert(0);
                *counter += 1;
                format!("{}-{:05}", name_prefix(entity), counter)
            }
        };

        data.insert("name".to_string(), Value::String(name.clone()));
        data.entry("docstatus".to_string())
            .or_insert(Value::from(DOCSTATUS_DRAFT));
        data.entry("creation".to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        state
            .records
            .entry(entity)
            .or_default()
            .insert(name.clone(), data);
        debug!("created {} {}", entity, name);
        Ok(name)
    }

    async fn update(&self, entity: EntityType, id: &str, changes: Document) -> Result<()> {
        let mut state = self.lock();
        let doc = state
            .records
            .get_mut(&entity)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| MigrateError::not_found(entity.as_str(), id))?;
        for (key, value) in changes {
            if key != "name" {
                doc.insert(key, value);
            }
        }
        Ok(())
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<()> {
        let mut state = self.lock();
        let docs = state
            .records
            .get_mut(&entity)
            .ok_or_else(|| MigrateError::not_found(entity.as_str(), id))?;
        let status = docs
            .get(id)
            .map(docstatus)
            .ok_or_else(|| MigrateError::not_found(entity.as_str(), id))?;
        if status == DOCSTATUS_SUBMITTED {
            return Err(MigrateError::target(
                entity.as_str(),
                format!("cannot delete submitted record {}; cancel it first", id),
            ));
        }
        docs.remove(id);
        debug!("deleted {} {}", entity, id);
        Ok(())
    }

    async fn submit(&self, entity: EntityType, id: &str) -> Result<()> {
        self.set_docstatus(entity, id, DOCSTATUS_DRAFT, DOCSTATUS_SUBMITTED, "submit")
    }

    async fn cancel(&self, entity: EntityType, id: &str) -> Result<()> {
        self.set_docstatus(entity, id, DOCSTATUS_SUBMITTED, DOCSTATUS_CANCELLED, "cancel")
    }

    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Document>> {
        Ok(self
            .lock()
            .records
            .get(&entity)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(&self, entity: EntityType, filter: &Filter) -> Result<Vec<Document>> {
        Ok(self
            .lock()
            .records
            .get(&entity)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn invoice() -> Document {
        doc(json!({"customer": "C-1", "grand_total": "100", "posting_date": "2024-01-05"}))
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_names() {
        let target = InMemoryTarget::new();
        let a = target.create(EntityType::SalesInvoice, invoice()).await.unwrap();
        let b = target.create(EntityType::SalesInvoice, invoice()).await.unwrap();
        assert_eq!(a, "SINV-00001");
        assert_eq!(b, "SINV-00002");

        let stored = target.get(EntityType::SalesInvoice, &a).await.unwrap().unwrap();
        assert_eq!(docstatus(&stored), DOCSTATUS_DRAFT);
        assert!(stored.contains_key("creation"));
    }

    #[tokio::test]
    async fn test_create_honors_preset_name() {
        let target = InMemoryTarget::new();
        let mut d = invoice();
        d.insert("name".into(), json!("SINV-00042"));
        let id = target.create(EntityType::SalesInvoice, d.clone()).await.unwrap();
        assert_eq!(id, "SINV-00042");
        assert!(target.create(EntityType::SalesInvoice, d).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_party_is_validation_error() {
        let target = InMemoryTarget::new();
        let err = target
            .create(EntityType::SalesInvoice, doc(json!({"grand_total": "1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Validation { .. }));
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
    }

    #[tokio::test]
    async fn test_submitted_records_must_be_cancelled_before_delete() {
        let target = InMemoryTarget::new();
        let id = target.create(EntityType::SalesInvoice, invoice()).await.unwrap();
        target.submit(EntityType::SalesInvoice, &id).await.unwrap();

        assert!(target.delete(EntityType::SalesInvoice, &id).await.is_err());
        assert!(target.submit(EntityType::SalesInvoice, &id).await.is_err());

        target.cancel(EntityType::SalesInvoice, &id).await.unwrap();
        target.delete(EntityType::SalesInvoice, &id).await.unwrap();
        assert!(target.get(EntityType::SalesInvoice, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_query() {
        let target = InMemoryTarget::new();
        let id = target.create(EntityType::SalesInvoice, invoice()).await.unwrap();
        target
            .update(EntityType::SalesInvoice, &id, doc(json!({"remarks": "fixed"})))
            .await
            .unwrap();

        let found = target
            .query(EntityType::SalesInvoice, &Filter::new().eq("remarks", "fixed"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(target
            .exists(EntityType::SalesInvoice, &Filter::new().eq("customer", "C-1"))
            .await
            .unwrap());
        assert!(target
            .update(EntityType::SalesInvoice, "SINV-99999", Document::new())
            .await
            .is_err());
    }
}
