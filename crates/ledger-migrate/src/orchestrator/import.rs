//! Record import: building target documents and writing them in batches.

use crate::audit::AuditTrail;
use crate::batch::{BatchHandler, BatchProcessor, BatchResult, BatchStats, RecordOutcome};
use crate::chunking::{Chunk, ChunkWorker};
use crate::config::{AccountMapping, RetryConfig};
use crate::core::{
    decimal_value, Direction, Document, EntityType, ExternalRecord, Filter, Mutation, Severity,
    TargetSystem,
};
use crate::dry_run::DryRunSimulator;
use crate::duplicate::DuplicateDetector;
use crate::error::{MigrateError, Result};
use crate::source::ResilientSource;
use crate::target::create_with_retry;
use crate::transaction::TransactionManager;
use crate::validation::{PreImportValidator, ValidationIssue};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Skip reason for records of an unrecognised type.
pub const UNKNOWN_RECORD_TYPE: &str = "unknown_record_type";

/// Skip reason for records matching an existing one.
pub const DUPLICATE: &str = "duplicate";

/// A source record ready for import.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub record_type: String,
    pub external_id: String,
    /// None for unknown record types.
    pub entity: Option<EntityType>,
    pub doc: Document,
    /// Why no document could be built.
    pub problem: Option<String>,
}

/// Builds target documents from classified source records.
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    accounts: AccountMapping,
}

impl DocumentBuilder {
    pub fn new(accounts: AccountMapping) -> Self {
        Self { accounts }
    }

    /// Account roles a mutation needs mapped.
    pub fn required_accounts(mutation: &Mutation) -> &'static [&'static str] {
        match mutation {
            Mutation::Invoice {
                direction: Direction::Incoming,
                ..
            } => &["receivable", "income"],
            Mutation::Invoice {
                direction: Direction::Outgoing,
                ..
            } => &["payable", "expense"],
            Mutation::Payment {
                direction: Direction::Incoming,
                ..
            } => &["receivable", "bank"],
            Mutation::Payment {
                direction: Direction::Outgoing,
                ..
            } => &["payable", "bank"],
            Mutation::JournalEntry { .. } | Mutation::Unknown { .. } => &[],
        }
    }

    /// Roles needed by `mutations` that have no account configured, sorted.
    pub fn missing_accounts(&self, mutations: &[Mutation]) -> Vec<&'static str> {
        let mut missing: Vec<&'static str> = mutations
            .iter()
            .flat_map(|m| Self::required_accounts(m).iter().copied())
            .filter(|role| self.account(role).is_err())
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    fn account(&self, role: &str) -> Result<&str> {
        let configured = self
            .accounts
            .entries()
            .into_iter()
            .find(|(name, _)| *name == role)
            .and_then(|(_, account)| account);
        configured.ok_or_else(|| MigrateError::Config(format!("no '{}' account is mapped", role)))
    }

    /// Build the target document of a mutation.
    pub fn prepare(&self, mutation: Mutation) -> PreparedRecord {
        let entity = mutation.entity_type();
        let (doc, problem) = match self.build(&mutation) {
            Ok(doc) => (doc, None),
            Err(e) => (base_document(mutation.record()), Some(e.to_string())),
        };
        let record = mutation.record();
        PreparedRecord {
            record_type: record.record_type.clone(),
            external_id: record.external_id.clone(),
            entity,
            doc,
            problem,
        }
    }

    fn build(&self, mutation: &Mutation) -> Result<Document> {
        let mut doc = base_document(mutation.record());
        match mutation {
            Mutation::Invoice { direction, record } => {
                let (party, ledger_field, ledger, line_account) = match direction {
                    Direction::Incoming => ("customer", "debit_to", "receivable", "income"),
                    Direction::Outgoing => ("supplier", "credit_to", "payable", "expense"),
                };
                let amount = decimal_value(record.amount.abs());
                if let Some(p) = &record.party_reference {
                    doc.insert(party.into(), json!(p));
                }
                doc.insert(ledger_field.into(), json!(self.account(ledger)?));
                doc.insert("grand_total".into(), amount.clone());
                doc.insert(
                    "items".into(),
                    json!([{
                        "account": self.account(line_account)?,
                        "amount": amount,
                        "description": record.description,
                    }]),
                );
            }
            Mutation::Payment { direction, record } => {
                let receivable = *direction == Direction::Incoming;
                let (payment_type, party_type, counter, invoice_type) = if receivable {
                    ("receive", EntityType::Customer, "receivable", EntityType::SalesInvoice)
                } else {
                    ("pay", EntityType::Supplier, "payable", EntityType::PurchaseInvoice)
                };
                let bank = self.account("bank")?;
                let counter = self.account(counter)?;
                let (paid_from, paid_to) = if receivable { (counter, bank) } else { (bank, counter) };
                doc.insert("payment_type".into(), json!(payment_type));
                doc.insert("party_type".into(), json!(party_type));
                if let Some(p) = &record.party_reference {
                    doc.insert("party".into(), json!(p));
                }
                doc.insert("paid_amount".into(), decimal_value(record.amount.abs()));
                doc.insert("paid_from".into(), json!(paid_from));
                doc.insert("paid_to".into(), json!(paid_to));
                if let Some(invoice) = &record.invoice_reference {
                    doc.insert(
                        "references".into(),
                        json!([{ "reference_type": invoice_type, "reference_external_id": invoice }]),
                    );
                }
            }
            Mutation::JournalEntry { record } => {
                let total_debit: Decimal = record.lines.iter().map(|l| l.debit).sum();
                let accounts: Vec<Value> = record
                    .lines
                    .iter()
                    .map(|l| {
                        json!({
                            "account": l.account,
                            "debit": decimal_value(l.debit),
                            "credit": decimal_value(l.credit),
                            "description": l.description,
                        })
                    })
                    .collect();
                doc.insert("accounts".into(), Value::Array(accounts));
                doc.insert("total_debit".into(), decimal_value(total_debit));
            }
            Mutation::Unknown { .. } => {}
        }
        Ok(doc)
    }
}

fn base_document(record: &ExternalRecord) -> Document {
    let mut doc = Map::new();
    doc.insert("external_id".into(), json!(record.external_id));
    doc.insert("posting_date".into(), json!(record.posting_date.to_string()));
    if let Some(reference) = &record.reference_no {
        doc.insert("reference_no".into(), json!(reference));
    }
    if let Some(description) = &record.description {
        doc.insert("description".into(), json!(description));
    }
    if let Some(created) = &record.created_at {
        doc.insert("source_created_at".into(), json!(created.to_rfc3339()));
    }
    doc
}

/// Where accepted records go.
pub enum ImportMode {
    /// Create and submit in the target, tracked on a checkpoint per batch.
    Live {
        transactions: Arc<TransactionManager>,
        validator: PreImportValidator,
        attempts: u32,
        retry: RetryConfig,
    },
    /// Simulate only.
    DryRun(Arc<DryRunSimulator>),
}

/// Imports one record at a time; shared by all workers of a batch.
pub struct ImportHandler {
    target: Arc<dyn TargetSystem>,
    detector: DuplicateDetector,
    audit: Arc<AuditTrail>,
    mode: ImportMode,
    skip_existing: bool,
    checkpoint: Mutex<Option<String>>,
    invoices: Mutex<HashMap<String, Option<String>>>,
}

impl ImportHandler {
    pub fn new(
        target: Arc<dyn TargetSystem>,
        detector: DuplicateDetector,
        audit: Arc<AuditTrail>,
        mode: ImportMode,
        skip_existing: bool,
    ) -> Self {
        Self {
            target,
            detector,
            audit,
            mode,
            skip_existing,
            checkpoint: Mutex::new(None),
            invoices: Mutex::new(HashMap::new()),
        }
    }

    fn current_checkpoint(&self) -> MutexGuard<'_, Option<String>> {
        self.checkpoint.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn invoice_cache(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.invoices.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Target name of the invoice imported from `external_id`.
    async fn resolve_invoice(&self, entity: EntityType, external_id: &str) -> Result<Option<String>> {
        let key = format!("{}:{}", entity, external_id);
        if let Some(cached) = self.invoice_cache().get(&key) {
            return Ok(cached.clone());
        }
        let found = self
            .target
            .query(entity, &Filter::new().eq("external_id", external_id))
            .await?
            .into_iter()
            .find_map(|d| d.get("name").and_then(Value::as_str).map(str::to_string));
        // Misses are not cached; the invoice may still be imported later in the run
        if found.is_some() {
            self.invoice_cache().insert(key, found.clone());
        }
        Ok(found)
    }

    /// Replace invoice external ids on payment references by target names.
    /// Unresolved references are dropped and noted in the trail.
    async fn link_references(&self, doc: &mut Document) -> Result<()> {
        let Some(Value::Array(rows)) = doc.get("references").cloned() else {
            return Ok(());
        };
        let mut linked = Vec::with_capacity(rows.len());
        for mut row in rows {
            let kind = row.get("reference_type").and_then(Value::as_str).and_then(|t| t.parse::<EntityType>().ok());
            let external = row.get("reference_external_id").and_then(Value::as_str).map(str::to_string);
            let (Some(kind), Some(external)) = (kind, external) else {
                continue;
            };
            match self.resolve_invoice(kind, &external).await? {
                Some(name) => {
                    if let Some(obj) = row.as_object_mut() {
                        obj.insert("reference_name".into(), json!(name));
                    }
                    linked.push(row);
                }
                None => self.audit.log_event(
                    "unresolved_reference",
                    json!({
                        "external_id": doc.get("external_id"),
                        "reference_type": kind,
                        "reference_external_id": external,
                    }),
                    Severity::Warning,
                ),
            }
        }
        if linked.is_empty() {
            doc.remove("references");
        } else {
            doc.insert("references".into(), Value::Array(linked));
        }
        Ok(())
    }

    async fn import(&self, item: PreparedRecord) -> Result<RecordOutcome> {
        let PreparedRecord {
            entity,
            mut doc,
            problem,
            external_id,
            ..
        } = item;
        let Some(entity) = entity else {
            self.audit.log_record_skipped(None, UNKNOWN_RECORD_TYPE, &doc);
            return Ok(RecordOutcome::Skipped(UNKNOWN_RECORD_TYPE.into()));
        };
        if let Some(problem) = problem {
            self.audit.log_record_failed(Some(entity), &problem, &doc);
            if let ImportMode::DryRun(simulator) = &self.mode {
                let issue = ValidationIssue::new("accounts", "missing_account_mapping", problem.clone(), Severity::Error);
                simulator.record_failure(entity, &external_id, issue);
            }
            return Ok(RecordOutcome::Failed(problem));
        }
        self.link_references(&mut doc).await?;

        let check = self.detector.check_duplicate(entity, &doc, None).await?;
        if let Some(best) = check.best() {
            self.audit.log_duplicate_detected(
                entity,
                &check.candidate_key,
                &best.matched_id,
                best.strategy.as_str(),
                check.confidence,
            );
            if self.skip_existing && check.is_confirmed() {
                self.audit.log_record_skipped(Some(entity), DUPLICATE, &doc);
                if let ImportMode::DryRun(simulator) = &self.mode {
                    simulator.record_skip(entity);
                }
                return Ok(RecordOutcome::Skipped(DUPLICATE.into()));
            }
            doc.insert("possible_duplicate_of".into(), json!(best.matched_id));
        }

        match &self.mode {
            ImportMode::DryRun(simulator) => {
                let outcome = simulator.simulate_record_creation(entity, &doc).await?;
                if outcome.success {
                    Ok(RecordOutcome::Succeeded)
                } else {
                    self.audit
                        .log_validation_error(entity, serde_json::to_value(&outcome.errors)?, &doc);
                    Ok(RecordOutcome::Failed(summarize(&outcome.errors)))
                }
            }
            ImportMode::Live {
                transactions,
                validator,
                attempts,
                retry,
            } => {
                let validation = validator.validate_record(entity, &doc).await?;
                if !validation.is_valid() {
                    self.audit.log_validation_error(entity, serde_json::to_value(&validation.issues)?, &doc);
                    return Ok(RecordOutcome::Failed(validation.error_message()));
                }
                let checkpoint = self.current_checkpoint().clone().ok_or_else(|| MigrateError::critical(
                    "import",
                    "record written outside a batch checkpoint",
                ))?;

                let name = match create_with_retry(self.target.as_ref(), entity, doc.clone(), *attempts, retry).await {
                    Ok(name) => name,
                    Err(e) => {
                        self.audit.log_record_failed(Some(entity), &e.to_string(), &doc);
                        return Ok(RecordOutcome::Failed(e.to_string()));
                    }
                };
                transactions.track_record_creation(&checkpoint, entity, &name, &doc);
                if entity.is_submittable() {
                    if let Err(e) = self.target.submit(entity, &name).await {
                        // A leftover draft would match this record on the next run
                        match self.target.delete(entity, &name).await {
                            Ok(()) => transactions.untrack_record_creation(&checkpoint, entity, &name),
                            Err(delete_error) => {
                                warn!("Draft {} {} left for rollback: {}", entity, name, delete_error)
                            }
                        }
                        self.audit.log_record_failed(Some(entity), &e.to_string(), &doc);
                        return Ok(RecordOutcome::Failed(format!("submit of {} failed: {}", name, e)));
                    }
                }
                self.audit.log_record_created(entity, &name, &doc);
                Ok(RecordOutcome::Succeeded)
            }
        }
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl BatchHandler<PreparedRecord> for ImportHandler {
    async fn begin_batch(&self, batch_number: usize) -> Result<()> {
        if let ImportMode::Live { transactions, .. } = &self.mode {
            let id = transactions.create_checkpoint(&format!("batch_{:04}", batch_number));
            *self.current_checkpoint() = Some(id);
        }
        Ok(())
    }

    async fn process(&self, item: PreparedRecord) -> RecordOutcome {
        let external_id = item.external_id.clone();
        match self.import(item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Record {} failed: {}", external_id, e);
                RecordOutcome::Failed(e.to_string())
            }
        }
    }

    async fn commit_batch(&self, batch: &BatchResult) -> Result<()> {
        if let ImportMode::Live { transactions, .. } = &self.mode {
            let id = self.current_checkpoint().take();
            if let Some(id) = id {
                transactions.commit_checkpoint(&id)?;
            }
        }
        self.audit
            .log_batch_processed(batch.batch_number, batch.size, serde_json::to_value(batch)?);
        Ok(())
    }

    fn clear_caches(&self) {
        self.invoice_cache().clear();
    }
}

/// Fetches a chunk through the resilient source and imports its records.
pub struct ChunkImporter {
    source: Arc<ResilientSource>,
    builder: DocumentBuilder,
    handler: Arc<ImportHandler>,
    processor: BatchProcessor,
    audit: Arc<AuditTrail>,
    cancel: CancellationToken,
}

impl ChunkImporter {
    pub fn new(
        source: Arc<ResilientSource>,
        builder: DocumentBuilder,
        handler: Arc<ImportHandler>,
        processor: BatchProcessor,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            source,
            builder,
            handler,
            processor,
            audit,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Classify and build every record, auditing each transformation.
    pub fn prepare(&self, records: Vec<ExternalRecord>) -> Vec<PreparedRecord> {
        records
            .into_iter()
            .map(|record| {
                let original = serde_json::to_value(&record).unwrap_or(Value::Null);
                let prepared = self.builder.prepare(Mutation::classify(record));
                let kind = match prepared.entity {
                    Some(entity) => format!("{}->{}", prepared.record_type, entity),
                    None => format!("{}->unknown", prepared.record_type),
                };
                self.audit
                    .log_data_transformation(&kind, &original, &Value::Object(prepared.doc.clone()));
                prepared
            })
            .collect()
    }
}

#[async_trait]
impl ChunkWorker for ChunkImporter {
    type Output = BatchStats;

    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ExternalRecord>> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        self.source.fetch(from, to).await
    }

    async fn process(&self, chunk: &Chunk, records: Vec<ExternalRecord>) -> Result<BatchStats> {
        debug!("Importing {} records of chunk {}", records.len(), chunk);
        let prepared = self.prepare(records);
        self.processor
            .process_in_batches(prepared, self.handler.clone())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicateConfig;
    use crate::core::{docstatus, RecordLine, DOCSTATUS_SUBMITTED};
    use crate::target::InMemoryTarget;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn accounts() -> AccountMapping {
        AccountMapping {
            receivable: Some("1300 Debtors".into()),
            payable: Some("1600 Creditors".into()),
            bank: Some("1100 Bank".into()),
            income: Some("8000 Revenue".into()),
            expense: Some("4000 Costs".into()),
        }
    }

    fn record(record_type: &str, external_id: &str, amount: &str) -> ExternalRecord {
        ExternalRecord {
            record_type: record_type.into(),
            external_id: external_id.into(),
            posting_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            amount: dec(amount),
            party_reference: Some("CUST-1".into()),
            reference_no: None,
            description: Some("February".into()),
            lines: vec![],
            invoice_reference: None,
            created_at: None,
        }
    }

    async fn seeded() -> Arc<InMemoryTarget> {
        let target = Arc::new(InMemoryTarget::new());
        target.insert(EntityType::Customer, "CUST-1", json!({"customer_name": "Jansen"}).as_object().cloned().unwrap());
        for account in ["1300 Debtors", "1100 Bank", "8000 Revenue"] {
            target.insert(
                EntityType::Account,
                account,
                json!({ "account_name": account }).as_object().cloned().unwrap(),
            );
        }
        target
    }

    fn live_handler(target: Arc<dyn TargetSystem>) -> (Arc<ImportHandler>, Arc<TransactionManager>) {
        let (audit, _) = AuditTrail::in_memory("run-1");
        let transactions = Arc::new(TransactionManager::new("run-1", target.clone()));
        let handler = ImportHandler::new(
            target.clone(),
            DuplicateDetector::new(target.clone(), DuplicateConfig::default()),
            Arc::new(audit),
            ImportMode::Live {
                transactions: transactions.clone(),
                validator: PreImportValidator::for_target(target),
                attempts: 1,
                retry: RetryConfig::default(),
            },
            true,
        );
        (Arc::new(handler), transactions)
    }

    #[test]
    fn test_builds_sales_invoice() {
        let builder = DocumentBuilder::new(accounts());
        let prepared = builder.prepare(Mutation::classify(record("FactuurVerstuurd", "F-1", "-121.00")));
        assert_eq!(prepared.entity, Some(EntityType::SalesInvoice));
        assert!(prepared.problem.is_none());
        assert_eq!(prepared.doc["customer"], "CUST-1");
        assert_eq!(prepared.doc["debit_to"], "1300 Debtors");
        assert_eq!(prepared.doc["grand_total"], "121");
        assert_eq!(prepared.doc["items"][0]["account"], "8000 Revenue");
        assert_eq!(prepared.doc["posting_date"], "2024-02-01");
    }

    #[test]
    fn test_builds_balanced_journal_entry() {
        let mut journal = record("memoriaal", "M-1", "0");
        journal.lines = vec![
            RecordLine {
                account: "1100 Bank".into(),
                debit: dec("50.00"),
                credit: Decimal::ZERO,
                description: None,
            },
            RecordLine {
                account: "8000 Revenue".into(),
                debit: Decimal::ZERO,
                credit: dec("50.00"),
                description: None,
            },
        ];
        let prepared = DocumentBuilder::new(accounts()).prepare(Mutation::classify(journal));
        assert_eq!(prepared.entity, Some(EntityType::JournalEntry));
        assert_eq!(prepared.doc["total_debit"], "50");
        assert_eq!(prepared.doc["accounts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_mapping_is_reported_not_guessed() {
        let mut mapping = accounts();
        mapping.bank = None;
        let builder = DocumentBuilder::new(mapping);
        let payment = Mutation::classify(record("payment_received", "P-1", "10"));
        assert_eq!(builder.missing_accounts(std::slice::from_ref(&payment)), vec!["bank"]);

        let prepared = builder.prepare(payment);
        assert!(prepared.problem.unwrap().contains("'bank'"));
        assert!(!prepared.doc.contains_key("paid_to"));
    }

    #[tokio::test]
    async fn test_live_import_creates_submits_and_tracks() {
        let target = seeded().await;
        let (handler, transactions) = live_handler(target.clone());
        let prepared = DocumentBuilder::new(accounts()).prepare(Mutation::classify(record("sales_invoice", "F-1", "100")));

        handler.begin_batch(1).await.unwrap();
        assert_eq!(handler.process(prepared.clone()).await, RecordOutcome::Succeeded);
        // Same external id again
        assert_eq!(handler.process(prepared).await, RecordOutcome::Skipped(DUPLICATE.into()));
        let checkpoint = handler.current_checkpoint().clone().unwrap();
        assert_eq!(transactions.open_checkpoints(), vec![checkpoint]);
        handler
            .commit_batch(&BatchResult {
                batch_number: 1,
                size: 2,
                succeeded: 1,
                skipped: 1,
                failed: 0,
            })
            .await
            .unwrap();
        assert!(transactions.open_checkpoints().is_empty());

        let invoices = target.query(EntityType::SalesInvoice, &Filter::new()).await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(docstatus(&invoices[0]), DOCSTATUS_SUBMITTED);
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_records_are_outcomes() {
        let target = seeded().await;
        let (handler, _) = live_handler(target.clone());
        let builder = DocumentBuilder::new(accounts());
        handler.begin_batch(1).await.unwrap();

        let mut stranger = record("sales_invoice", "F-2", "10");
        stranger.party_reference = Some("CUST-404".into());
        match handler.process(builder.prepare(Mutation::classify(stranger))).await {
            RecordOutcome::Failed(message) => assert!(message.contains("CUST-404")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            handler.process(builder.prepare(Mutation::classify(record("btw_aangifte", "X-1", "1")))).await,
            RecordOutcome::Skipped(UNKNOWN_RECORD_TYPE.into())
        );
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
    }

    #[tokio::test]
    async fn test_payment_reference_links_imported_invoice() {
        let target = seeded().await;
        let (handler, _) = live_handler(target.clone());
        let builder = DocumentBuilder::new(accounts());
        handler.begin_batch(1).await.unwrap();
        assert_eq!(
            handler.process(builder.prepare(Mutation::classify(record("sales_invoice", "F-9", "40")))).await,
            RecordOutcome::Succeeded
        );

        let mut payment = record("payment_received", "P-9", "40");
        payment.invoice_reference = Some("F-9".into());
        let mut prepared = builder.prepare(Mutation::classify(payment));
        handler.link_references(&mut prepared.doc).await.unwrap();
        let invoice = &target.query(EntityType::SalesInvoice, &Filter::new()).await.unwrap()[0];
        assert_eq!(prepared.doc["references"][0]["reference_name"], invoice["name"]);

        let mut orphan = builder.prepare(Mutation::classify(record("payment_received", "P-10", "5")));
        orphan.doc.insert(
            "references".into(),
            json!([{ "reference_type": "sales_invoice", "reference_external_id": "F-404" }]),
        );
        handler.link_references(&mut orphan.doc).await.unwrap();
        assert!(!orphan.doc.contains_key("references"));
    }

    /// Accepts drafts but refuses to finalize them.
    struct SubmitRejecting(Arc<InMemoryTarget>);

    #[async_trait]
    impl TargetSystem for SubmitRejecting {
        fn name(&self) -> &str {
            "submit-rejecting"
        }

        async fn create(&self, entity: EntityType, data: Document) -> Result<String> {
            self.0.create(entity, data).await
        }

        async fn update(&self, entity: EntityType, id: &str, changes: Document) -> Result<()> {
            self.0.update(entity, id, changes).await
        }

        async fn delete(&self, entity: EntityType, id: &str) -> Result<()> {
            self.0.delete(entity, id).await
        }

        async fn submit(&self, entity: EntityType, id: &str) -> Result<()> {
            Err(MigrateError::validation(entity.to_string(), format!("{} is locked", id)))
        }

        async fn cancel(&self, entity: EntityType, id: &str) -> Result<()> {
            self.0.cancel(entity, id).await
        }

        async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Document>> {
            self.0.get(entity, id).await
        }

        async fn query(&self, entity: EntityType, filter: &Filter) -> Result<Vec<Document>> {
            self.0.query(entity, filter).await
        }
    }

    #[tokio::test]
    async fn test_failed_submit_removes_draft_so_rerun_imports() {
        let store = seeded().await;
        let prepared = DocumentBuilder::new(accounts()).prepare(Mutation::classify(record("sales_invoice", "F-1", "100")));

        let (handler, transactions) = live_handler(Arc::new(SubmitRejecting(store.clone())));
        handler.begin_batch(1).await.unwrap();
        match handler.process(prepared.clone()).await {
            RecordOutcome::Failed(message) => assert!(message.contains("is locked")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.count(EntityType::SalesInvoice), 0);
        let checkpoint = handler.current_checkpoint().clone().unwrap();
        let report = transactions.rollback_to_checkpoint(&checkpoint, "test").await.unwrap();
        assert!(report.steps.is_empty());

        let (handler, _) = live_handler(store.clone());
        handler.begin_batch(1).await.unwrap();
        assert_eq!(handler.process(prepared).await, RecordOutcome::Succeeded);
        assert_eq!(store.count(EntityType::SalesInvoice), 1);
    }

    #[tokio::test]
    async fn test_similar_records_with_distinct_ids_are_imported_and_flagged() {
        let target = seeded().await;
        target.insert(EntityType::Customer, "CUST-2", json!({"customer_name": "Bakker"}).as_object().cloned().unwrap());
        let (handler, _) = live_handler(target.clone());
        let builder = DocumentBuilder::new(accounts());
        handler.begin_batch(1).await.unwrap();

        for (id, party, day) in [("F-1", "CUST-1", 1), ("F-2", "CUST-1", 1), ("F-3", "CUST-2", 3)] {
            let mut invoice = record("sales_invoice", id, "25");
            invoice.party_reference = Some(party.into());
            invoice.posting_date = NaiveDate::from_ymd_opt(2024, 2, day).unwrap();
            invoice.description = Some("Contributie februari".into());
            assert_eq!(
                handler.process(builder.prepare(Mutation::classify(invoice))).await,
                RecordOutcome::Succeeded
            );
        }

        let invoices = target.query(EntityType::SalesInvoice, &Filter::new()).await.unwrap();
        assert_eq!(invoices.len(), 3);
        // F-2 resembles F-1; F-3 belongs to another customer
        let flagged: Vec<&Document> = invoices.iter().filter(|d| d.contains_key("possible_duplicate_of")).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0]["external_id"], "F-2");
    }

    #[tokio::test]
    async fn test_dry_run_never_writes() {
        let target = seeded().await;
        let (audit, _) = AuditTrail::in_memory("run-dry");
        let simulator = Arc::new(DryRunSimulator::new(target.clone()));
        let handler = Arc::new(ImportHandler::new(
            target.clone(),
            DuplicateDetector::new(target.clone(), DuplicateConfig::default()),
            Arc::new(audit),
            ImportMode::DryRun(simulator.clone()),
            true,
        ));
        let builder = DocumentBuilder::new(accounts());
        let records: Vec<PreparedRecord> = (0..5)
            .map(|i| builder.prepare(Mutation::classify(record("sales_invoice", &format!("F-{}", i), "10"))))
            .collect();

        let stats = BatchProcessor::new(2, 2).process_in_batches(records, handler).await.unwrap();
        assert_eq!(stats.succeeded, 5);
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
        let report = simulator.generate_dry_run_report();
        assert_eq!(report.summary.would_succeed, 5);
    }
}
