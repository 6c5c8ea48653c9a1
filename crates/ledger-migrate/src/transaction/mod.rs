//! Checkpoints and rollback around mutating operations.
//!
//! Every mutation performed inside an atomic operation is tracked on the
//! innermost open checkpoint with enough state to undo it. Checkpoints nest
//! strictly: only the innermost open checkpoint may be committed, and
//! committing hands its tracked mutations to its parent.

mod integrity;

pub use integrity::{
    verify_data_integrity, IntegrityCheck, IntegrityIssue, IntegrityReport, IntegrityStatus,
};

use crate::audit::AuditTrail;
use crate::core::{docstatus, Document, EntityType, Filter, TargetSystem, DOCSTATUS_CANCELLED, DOCSTATUS_SUBMITTED};
use crate::error::{MigrateError, Result};
use crate::state::{read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Open,
    Committed,
    RolledBack,
}

/// A record created under a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub entity: EntityType,
    pub id: String,
    pub data: Document,
    pub tracked_at: DateTime<Utc>,
}

/// A record changed under a checkpoint, with the values it had before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedRecord {
    pub entity: EntityType,
    pub id: String,
    pub old_data: Document,
    pub new_data: Document,
    pub tracked_at: DateTime<Utc>,
}

/// A record deleted under a checkpoint, as a full snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub entity: EntityType,
    pub id: String,
    pub data: Document,
    pub tracked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub operation: String,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_records: Vec<CreatedRecord>,
    pub modified_records: Vec<ModifiedRecord>,
    pub deleted_records: Vec<DeletedRecord>,
}

impl Checkpoint {
    fn new(id: String, operation: &str, parent: Option<String>) -> Self {
        Self {
            id,
            operation: operation.to_string(),
            parent,
            created_at: Utc::now(),
            status: CheckpointStatus::Open,
            closed_at: None,
            created_records: Vec::new(),
            modified_records: Vec::new(),
            deleted_records: Vec::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.created_records.len() + self.modified_records.len() + self.deleted_records.len()
    }

    fn absorb(&mut self, child: &Checkpoint) {
        self.created_records.extend(child.created_records.iter().cloned());
        self.modified_records.extend(child.modified_records.iter().cloned());
        self.deleted_records.extend(child.deleted_records.iter().cloned());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoAction {
    Deleted,
    DeleteFailed,
    Restored,
    RestoreFailed,
    Recreated,
    RecreateFailed,
    /// The record was already gone (or never persisted).
    Absent,
}

impl UndoAction {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UndoAction::DeleteFailed | UndoAction::RestoreFailed | UndoAction::RecreateFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoStep {
    pub action: UndoAction,
    pub entity: EntityType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a rollback did, one step per tracked mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub checkpoint_id: String,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub steps: Vec<UndoStep>,
    /// Checkpoints whose rollback could not be persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// True when every step succeeded and was persisted.
    pub success: bool,
}

impl RollbackReport {
    pub fn count(&self, action: UndoAction) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &UndoStep> {
        self.steps.iter().filter(|s| s.action.is_failure())
    }
}

/// Undo every mutation tracked on `checkpoint`: delete created records
/// (cancelling submitted ones first), restore modified records, then
/// recreate deleted ones. Each group is undone newest first. A failing
/// step is recorded and the remaining steps still run.
pub async fn undo_checkpoint(target: &dyn TargetSystem, checkpoint: &Checkpoint, reason: &str) -> RollbackReport {
    let started_at = Utc::now();
    let mut steps = Vec::with_capacity(checkpoint.tracked());

    for record in checkpoint.created_records.iter().rev() {
        steps.push(step(record.entity, &record.id, delete_created(target, record).await, UndoAction::DeleteFailed));
    }
    for record in checkpoint.modified_records.iter().rev() {
        steps.push(step(record.entity, &record.id, restore_modified(target, record).await, UndoAction::RestoreFailed));
    }
    for record in checkpoint.deleted_records.iter().rev() {
        steps.push(step(record.entity, &record.id, recreate_deleted(target, record).await, UndoAction::RecreateFailed));
    }

    let success = !steps.iter().any(|s| s.action.is_failure());
    for failed in steps.iter().filter(|s| s.action.is_failure()) {
        error!(
            "Rollback of {}: {:?} {} {}: {}",
            checkpoint.id,
            failed.action,
            failed.entity,
            failed.id,
            failed.error.as_deref().unwrap_or_default()
        );
    }
    RollbackReport {
        checkpoint_id: checkpoint.id.clone(),
        reason: reason.to_string(),
        started_at,
        completed_at: Utc::now(),
        steps,
        errors: Vec::new(),
        success,
    }
}

fn step(entity: EntityType, id: &str, outcome: Result<UndoAction>, failed: UndoAction) -> UndoStep {
    match outcome {
        Ok(action) => UndoStep {
            action,
            entity,
            id: id.to_string(),
            error: None,
        },
        Err(e) => UndoStep {
            action: failed,
            entity,
            id: id.to_string(),
            error: Some(e.to_string()),
        },
    }
}

async fn delete_created(target: &dyn TargetSystem, record: &CreatedRecord) -> Result<UndoAction> {
    let Some(current) = target.get(record.entity, &record.id).await? else {
        return Ok(UndoAction::Absent);
    };
    if docstatus(&current) == DOCSTATUS_SUBMITTED {
        target.cancel(record.entity, &record.id).await?;
    }
    target.delete(record.entity, &record.id).await?;
    Ok(UndoAction::Deleted)
}

async fn restore_modified(target: &dyn TargetSystem, record: &ModifiedRecord) -> Result<UndoAction> {
    if target.get(record.entity, &record.id).await?.is_none() {
        return Ok(UndoAction::Absent);
    }
    target
        .update(record.entity, &record.id, record.old_data.clone())
        .await?;
    Ok(UndoAction::Restored)
}

async fn recreate_deleted(target: &dyn TargetSystem, record: &DeletedRecord) -> Result<UndoAction> {
    let status = docstatus(&record.data);
    let mut data = record.data.clone();
    data.remove("docstatus");
    data.insert("name".to_string(), Value::String(record.id.clone()));
    let id = target.create(record.entity, data).await?;
    if status >= DOCSTATUS_SUBMITTED {
        target.submit(record.entity, &id).await?;
    }
    if status == DOCSTATUS_CANCELLED {
        target.cancel(record.entity, &id).await?;
    }
    Ok(UndoAction::Recreated)
}

/// Read a persisted checkpoint file.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    read_json(path)
}

/// Per-entity contents of the pre-migration backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSection {
    pub count: usize,
    /// More records matched than the backup limit allows.
    pub truncated: bool,
    pub records: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub migration_id: String,
    pub created_at: DateTime<Utc>,
    pub entities: BTreeMap<EntityType, BackupSection>,
}

/// Where a backup was written and how much it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub path: Option<PathBuf>,
    pub counts: BTreeMap<EntityType, usize>,
    pub total_records: usize,
}

#[derive(Default)]
struct Inner {
    open: HashMap<String, Checkpoint>,
    stack: Vec<String>,
    last_committed: Option<String>,
    sequence: u64,
}

/// Owns all checkpoints of one run.
pub struct TransactionManager {
    migration_id: String,
    target: Arc<dyn TargetSystem>,
    audit: Option<Arc<AuditTrail>>,
    dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl TransactionManager {
    pub fn new(migration_id: impl Into<String>, target: Arc<dyn TargetSystem>) -> Self {
        Self {
            migration_id: migration_id.into(),
            target,
            audit: None,
            dir: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Persist checkpoints and the backup under `dir`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn target(&self) -> &Arc<dyn TargetSystem> {
        &self.target
    }

    /// Open a checkpoint nested in the innermost open one.
    pub fn create_checkpoint(&self, operation: &str) -> String {
        let mut inner = self.lock();
        inner.sequence += 1;
        let id = format!(
            "{}_{}_{:04}",
            operation,
            Utc::now().format("%Y%m%d_%H%M%S"),
            inner.sequence
        );
        let parent = inner.stack.last().cloned();
        inner
            .open
            .insert(id.clone(), Checkpoint::new(id.clone(), operation, parent.clone()));
        inner.stack.push(id.clone());
        debug!("Opened checkpoint {} (parent {:?})", id, parent);
        id
    }

    fn with_checkpoint(&self, checkpoint_id: &str, f: impl FnOnce(&mut Checkpoint)) {
        let mut inner = self.lock();
        match inner.open.get_mut(checkpoint_id) {
            Some(checkpoint) => f(checkpoint),
            None => warn!("Mutation tracked on unknown checkpoint {}", checkpoint_id),
        }
    }

    pub fn track_record_creation(&self, checkpoint_id: &str, entity: EntityType, id: &str, data: &Document) {
        self.with_checkpoint(checkpoint_id, |cp| {
            cp.created_records.push(CreatedRecord {
                entity,
                id: id.to_string(),
                data: data.clone(),
                tracked_at: Utc::now(),
            })
        });
    }

    /// Forget a creation that was undone in place.
    pub fn untrack_record_creation(&self, checkpoint_id: &str, entity: EntityType, id: &str) {
        self.with_checkpoint(checkpoint_id, |cp| {
            cp.created_records.retain(|r| !(r.entity == entity && r.id == id))
        });
    }

    pub fn track_record_modification(
        &self,
        checkpoint_id: &str,
        entity: EntityType,
        id: &str,
        old_data: &Document,
        new_data: &Document,
    ) {
        self.with_checkpoint(checkpoint_id, |cp| {
            cp.modified_records.push(ModifiedRecord {
                entity,
                id: id.to_string(),
                old_data: old_data.clone(),
                new_data: new_data.clone(),
                tracked_at: Utc::now(),
            })
        });
    }

    pub fn track_record_deletion(&self, checkpoint_id: &str, entity: EntityType, id: &str, data: &Document) {
        self.with_checkpoint(checkpoint_id, |cp| {
            cp.deleted_records.push(DeletedRecord {
                entity,
                id: id.to_string(),
                data: data.clone(),
                tracked_at: Utc::now(),
            })
        });
    }

    /// Commit the innermost open checkpoint.
    pub fn commit_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.stack.last().map(String::as_str) != Some(checkpoint_id) {
            return Err(MigrateError::State(format!(
                "checkpoint {} is not the innermost open checkpoint",
                checkpoint_id
            )));
        }
        inner.stack.pop();
        let Some(mut checkpoint) = inner.open.remove(checkpoint_id) else {
            return Err(MigrateError::State(format!("unknown checkpoint {}", checkpoint_id)));
        };
        checkpoint.status = CheckpointStatus::Committed;
        checkpoint.closed_at = Some(Utc::now());

        if let Some(parent) = checkpoint.parent.as_ref().and_then(|p| inner.open.get_mut(p)) {
            parent.absorb(&checkpoint);
        }
        inner.last_committed = Some(checkpoint.id.clone());
        drop(inner);
        debug!("Committed checkpoint {} ({} tracked mutations)", checkpoint.id, checkpoint.tracked());

        self.save_checkpoint(&checkpoint)
    }

    /// Undo a checkpoint and every checkpoint opened inside it, innermost
    /// first. The report covers all of them. Failing to persist the outcome
    /// of one checkpoint does not stop the others from being undone.
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: &str, reason: &str) -> Result<RollbackReport> {
        let checkpoints = {
            let mut inner = self.lock();
            let Some(position) = inner.stack.iter().position(|id| id == checkpoint_id) else {
                return Err(MigrateError::State(format!(
                    "checkpoint {} is not open",
                    checkpoint_id
                )));
            };
            let ids: Vec<String> = inner.stack.drain(position..).rev().collect();
            ids.iter()
                .filter_map(|id| inner.open.remove(id))
                .collect::<Vec<_>>()
        };

        let started_at = Utc::now();
        let mut steps = Vec::new();
        let mut errors = Vec::new();
        for mut checkpoint in checkpoints {
            warn!(
                "Rolling back checkpoint {} ({} tracked mutations): {}",
                checkpoint.id,
                checkpoint.tracked(),
                reason
            );
            let report = undo_checkpoint(self.target.as_ref(), &checkpoint, reason).await;
            checkpoint.status = CheckpointStatus::RolledBack;
            checkpoint.closed_at = Some(Utc::now());
            if let Err(e) = self.record_rollback(&checkpoint, reason, &report) {
                error!("Failed to record rollback of {}: {}", checkpoint.id, e);
                errors.push(format!("{}: {}", checkpoint.id, e));
            }
            steps.extend(report.steps);
        }

        let success = errors.is_empty() && !steps.iter().any(|s| s.action.is_failure());
        Ok(RollbackReport {
            checkpoint_id: checkpoint_id.to_string(),
            reason: reason.to_string(),
            started_at,
            completed_at: Utc::now(),
            steps,
            errors,
            success,
        })
    }

    fn record_rollback(&self, checkpoint: &Checkpoint, reason: &str, report: &RollbackReport) -> Result<()> {
        if let Some(audit) = &self.audit {
            audit.log_rollback(&checkpoint.id, reason, serde_json::to_value(report)?);
        }
        self.save_checkpoint(checkpoint)
    }

    /// Roll back every open checkpoint, innermost first.
    pub async fn rollback_open(&self, reason: &str) -> Result<Option<RollbackReport>> {
        let outermost = self.lock().stack.first().cloned();
        match outermost {
            Some(id) => Ok(Some(self.rollback_to_checkpoint(&id, reason).await?)),
            None => Ok(None),
        }
    }

    pub fn last_committed(&self) -> Option<String> {
        self.lock().last_committed.clone()
    }

    pub fn open_checkpoints(&self) -> Vec<String> {
        self.lock().stack.clone()
    }

    /// Run `f` inside a new checkpoint: committed when it returns `Ok`,
    /// rolled back when it returns `Err`. The original error is returned
    /// after the rollback.
    pub async fn atomic_operation<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let checkpoint_id = self.create_checkpoint(operation);
        match f(checkpoint_id.clone()).await {
            Ok(value) => {
                self.commit_checkpoint(&checkpoint_id)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = self
                    .rollback_to_checkpoint(&checkpoint_id, &e.to_string())
                    .await
                {
                    error!("Rollback of {} failed: {}", checkpoint_id, rollback_error);
                }
                Err(e)
            }
        }
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        match &self.dir {
            Some(dir) => write_json_atomic(
                dir.join("checkpoints")
                    .join(format!("checkpoint_{}.json", checkpoint.id)),
                checkpoint,
            ),
            None => Ok(()),
        }
    }

    /// Snapshot existing records of `entities` matching `scope`, at most
    /// `limit` per entity type, before anything is mutated.
    pub async fn create_pre_migration_backup(
        &self,
        entities: &[EntityType],
        scope: &Filter,
        limit: usize,
    ) -> Result<BackupSummary> {
        let mut backup = Backup {
            migration_id: self.migration_id.clone(),
            created_at: Utc::now(),
            entities: BTreeMap::new(),
        };
        for &entity in entities {
            let filter = if entity.date_field().is_some() {
                scope.clone()
            } else {
                Filter::new()
            };
            let mut records = self.target.query(entity, &filter).await?;
            let truncated = records.len() > limit;
            records.truncate(limit);
            if truncated {
                warn!("Backup of {} truncated at {} records", entity, limit);
            }
            backup.entities.insert(
                entity,
                BackupSection {
                    count: records.len(),
                    truncated,
                    records,
                },
            );
        }

        let counts: BTreeMap<EntityType, usize> =
            backup.entities.iter().map(|(e, s)| (*e, s.count)).collect();
        let total_records = counts.values().sum();
        let path = match &self.dir {
            Some(dir) => {
                let path = dir.join(format!(
                    "backup_{}.json",
                    backup.created_at.format("%Y%m%d_%H%M%S")
                ));
                write_json_atomic(&path, &backup)?;
                Some(path)
            }
            None => None,
        };
        info!("Pre-migration backup: {} records", total_records);

        Ok(BackupSummary {
            path,
            counts,
            total_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::InMemoryTarget;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn invoice(total: &str) -> Document {
        doc(json!({"customer": "CUST-1", "posting_date": "2024-01-05", "grand_total": total}))
    }

    async fn create(tm: &TransactionManager, cp: &str, submit: bool) -> String {
        let data = invoice("10");
        let id = tm.target().create(EntityType::SalesInvoice, data.clone()).await.unwrap();
        if submit {
            tm.target().submit(EntityType::SalesInvoice, &id).await.unwrap();
        }
        tm.track_record_creation(cp, EntityType::SalesInvoice, &id, &data);
        id
    }

    #[tokio::test]
    async fn test_atomic_operation_commits() {
        let target = Arc::new(InMemoryTarget::new());
        let tm = TransactionManager::new("run", target.clone());
        let tm_ref = &tm;
        let id = tm
            .atomic_operation("import", |cp| async move { Ok(create(tm_ref, &cp, true).await) })
            .await
            .unwrap();
        assert_eq!(target.count(EntityType::SalesInvoice), 1);
        assert!(tm.last_committed().unwrap().starts_with("import_"));
        assert!(tm.open_checkpoints().is_empty());
        assert_eq!(id, "SINV-00001");
    }

    #[tokio::test]
    async fn test_failure_rolls_back_every_creation() {
        let target = Arc::new(InMemoryTarget::new());
        let (audit, store) = AuditTrail::in_memory("run");
        let tm = TransactionManager::new("run", target.clone()).with_audit(Arc::new(audit));
        let tm_ref = &tm;
        let result: Result<()> = tm
            .atomic_operation("batch", |cp| async move {
                create(tm_ref, &cp, true).await;
                create(tm_ref, &cp, false).await;
                create(tm_ref, &cp, true).await;
                Err(MigrateError::critical("import", "target went away"))
            })
            .await;
        assert!(matches!(result, Err(MigrateError::Critical { .. })));
        assert_eq!(target.count(EntityType::SalesInvoice), 0);

        let entries = store.entries();
        let rolled_back = entries.iter().find(|e| e.event_type == "rollback_performed").unwrap();
        let report: RollbackReport = serde_json::from_value(rolled_back.data["report"].clone()).unwrap();
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.count(UndoAction::Deleted), 3);
        assert!(report.success);
    }

    #[tokio::test]
    async fn test_rollback_restores_and_recreates() {
        let target = Arc::new(InMemoryTarget::new());
        target.insert(EntityType::Customer, "CUST-1", doc(json!({"customer_name": "Old"})));
        let submitted = target.create(EntityType::SalesInvoice, invoice("99")).await.unwrap();
        target.submit(EntityType::SalesInvoice, &submitted).await.unwrap();
        let snapshot = target.get(EntityType::SalesInvoice, &submitted).await.unwrap().unwrap();

        let tm = TransactionManager::new("run", target.clone());
        let cp = tm.create_checkpoint("fixup");

        let old = doc(json!({"customer_name": "Old"}));
        let new = doc(json!({"customer_name": "New"}));
        target.update(EntityType::Customer, "CUST-1", new.clone()).await.unwrap();
        tm.track_record_modification(&cp, EntityType::Customer, "CUST-1", &old, &new);

        target.cancel(EntityType::SalesInvoice, &submitted).await.unwrap();
        target.delete(EntityType::SalesInvoice, &submitted).await.unwrap();
        tm.track_record_deletion(&cp, EntityType::SalesInvoice, &submitted, &snapshot);

        let report = tm.rollback_to_checkpoint(&cp, "manual").await.unwrap();
        assert!(report.success);
        assert_eq!(report.count(UndoAction::Restored), 1);
        assert_eq!(report.count(UndoAction::Recreated), 1);

        let customer = target.get(EntityType::Customer, "CUST-1").await.unwrap().unwrap();
        assert_eq!(customer["customer_name"], "Old");
        let restored = target.get(EntityType::SalesInvoice, &submitted).await.unwrap().unwrap();
        assert_eq!(docstatus(&restored), DOCSTATUS_SUBMITTED);
    }

    #[tokio::test]
    async fn test_rollback_continues_after_failed_step() {
        let target = Arc::new(InMemoryTarget::new());
        let existing = target.create(EntityType::SalesInvoice, invoice("1")).await.unwrap();
        let tm = TransactionManager::new("run", target.clone());
        let cp = tm.create_checkpoint("cleanup");
        tm.track_record_deletion(&cp, EntityType::SalesInvoice, "SINV-00077", &invoice("5"));
        // Recreating a record whose name is taken fails
        tm.track_record_deletion(&cp, EntityType::SalesInvoice, &existing, &invoice("1"));

        let report = tm.rollback_to_checkpoint(&cp, "test").await.unwrap();
        assert!(!report.success);
        assert_eq!(report.steps[0].action, UndoAction::RecreateFailed);
        assert_eq!(report.steps[0].id, existing);
        assert_eq!(report.steps[1].action, UndoAction::Recreated);
        assert_eq!(report.failures().count(), 1);
        assert!(target
            .get(EntityType::SalesInvoice, "SINV-00077")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_nested_commit_propagates_to_parent() {
        let target = Arc::new(InMemoryTarget::new());
        let tm = TransactionManager::new("run", target.clone());
        let outer = tm.create_checkpoint("import");
        for _ in 0..2 {
            let inner = tm.create_checkpoint("batch");
            create(&tm, &inner, true).await;
            tm.commit_checkpoint(&inner).unwrap();
        }
        assert!(tm.commit_checkpoint("unknown").is_err());
        assert_eq!(target.count(EntityType::SalesInvoice), 2);

        let report = tm.rollback_open("phase failed").await.unwrap().unwrap();
        assert_eq!(report.checkpoint_id, outer);
        assert_eq!(report.count(UndoAction::Deleted), 2);
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
        assert!(tm.rollback_open("nothing open").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_survives_unwritable_checkpoint_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoints"), "not a directory").unwrap();
        let target = Arc::new(InMemoryTarget::new());
        let tm = TransactionManager::new("run", target.clone()).with_output_dir(dir.path());
        let outer = tm.create_checkpoint("import");
        create(&tm, &outer, true).await;
        let inner = tm.create_checkpoint("batch");
        create(&tm, &inner, false).await;
        create(&tm, &inner, true).await;

        let report = tm.rollback_to_checkpoint(&outer, "target failed").await.unwrap();
        assert_eq!(report.checkpoint_id, outer);
        assert_eq!(report.count(UndoAction::Deleted), 3);
        assert_eq!(report.errors.len(), 2);
        assert!(!report.success);
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
        assert!(tm.open_checkpoints().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_files_and_offline_replay() {
        let dir = tempdir().unwrap();
        let target = Arc::new(InMemoryTarget::new());
        let tm = TransactionManager::new("run", target.clone()).with_output_dir(dir.path());
        let cp = tm.create_checkpoint("batch");
        create(&tm, &cp, true).await;
        tm.commit_checkpoint(&cp).unwrap();

        let path = dir.path().join("checkpoints").join(format!("checkpoint_{}.json", cp));
        let checkpoint = load_checkpoint(&path).unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Committed);
        assert_eq!(checkpoint.created_records.len(), 1);

        let report = undo_checkpoint(target.as_ref(), &checkpoint, "offline").await;
        assert_eq!(report.count(UndoAction::Deleted), 1);
        let again = undo_checkpoint(target.as_ref(), &checkpoint, "offline").await;
        assert_eq!(again.count(UndoAction::Absent), 1);
    }

    #[tokio::test]
    async fn test_backup_respects_scope_and_limit() {
        let dir = tempdir().unwrap();
        let target = Arc::new(InMemoryTarget::new());
        for day in ["2024-01-05", "2024-01-06", "2024-02-01"] {
            target
                .create(
                    EntityType::SalesInvoice,
                    doc(json!({"customer": "C", "posting_date": day, "grand_total": "1"})),
                )
                .await
                .unwrap();
        }
        target.insert(EntityType::Account, "Bank", doc(json!({"account_name": "Bank"})));

        let tm = TransactionManager::new("run", target).with_output_dir(dir.path());
        let scope = Filter::new().between("posting_date", "2024-01-01", "2024-01-31");
        let summary = tm
            .create_pre_migration_backup(&[EntityType::SalesInvoice, EntityType::Account], &scope, 1)
            .await
            .unwrap();
        assert_eq!(summary.counts[&EntityType::SalesInvoice], 1);
        assert_eq!(summary.counts[&EntityType::Account], 1);

        let backup: Backup = read_json(summary.path.unwrap()).unwrap();
        assert!(backup.entities[&EntityType::SalesInvoice].truncated);
        assert!(!backup.entities[&EntityType::Account].truncated);
    }
}
