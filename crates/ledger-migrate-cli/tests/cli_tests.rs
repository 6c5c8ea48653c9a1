//! CLI integration tests for ledger-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes, and end-to-end runs against file-backed stores.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Get a command for the ledger-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("ledger-migrate").unwrap()
}

/// Source records, a seeded target store and a config pointing at both.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(accounts: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let records = json!([
            {"record_type": "sales_invoice", "external_id": "F-1", "posting_date": "2024-03-04",
             "amount": "121.00", "party_reference": "CUST-1"},
            {"record_type": "sales_invoice", "external_id": "F-2", "posting_date": "2024-03-05",
             "amount": "300.00", "party_reference": "CUST-1"},
            {"record_type": "payment_received", "external_id": "P-1", "posting_date": "2024-03-20",
             "amount": "121.00", "party_reference": "CUST-1", "invoice_reference": "F-1"},
            {"record_type": "vat_return", "external_id": "V-1", "posting_date": "2024-03-21",
             "amount": "10.00"}
        ]);
        fs::write(dir.path().join("records.json"), records.to_string()).unwrap();

        let store = json!({
            "records": {
                "customer": {"CUST-1": {"name": "CUST-1", "customer_name": "Jansen"}},
                "account": {
                    "1300 Debtors": {"name": "1300 Debtors"},
                    "1100 Bank": {"name": "1100 Bank"},
                    "8000 Revenue": {"name": "8000 Revenue"}
                }
            }
        });
        fs::write(dir.path().join("store.json"), store.to_string()).unwrap();

        let config = format!(
            r#"source:
  endpoint: file://records
  records_file: {records}
  api_limit: 50
target:
  scope: Test BV
  store_path: {store}
migration:
  date_from: 2024-03-01
  date_to: 2024-03-31
  batch_size: 10
  workers: 2
  output_dir: {output}
accounts:
{accounts}
"#,
            records = dir.path().join("records.json").display(),
            store = dir.path().join("store.json").display(),
            output = dir.path().join("out").display(),
            accounts = accounts,
        );
        fs::write(dir.path().join("migration.yaml"), config).unwrap();
        Self { dir }
    }

    fn mapped() -> Self {
        Self::new(
            "  receivable: 1300 Debtors\n  bank: 1100 Bank\n  income: 8000 Revenue\n",
        )
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("migration.yaml")
    }

    fn store(&self) -> Value {
        let content = fs::read_to_string(self.dir.path().join("store.json")).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    /// Directory of the only run written so far.
    fn run_dir(&self) -> PathBuf {
        let runs: Vec<PathBuf> = fs::read_dir(self.dir.path().join("out"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.file_name().map_or(false, |name| name != "locks"))
            .collect();
        assert_eq!(runs.len(), 1, "expected one run directory: {:?}", runs);
        runs[0].clone()
    }
}

fn sales_invoices(store: &Value) -> usize {
    store["records"]["sales_invoice"]
        .as_object()
        .map_or(0, |docs| docs.len())
}

fn checkpoint_for(run_dir: &Path, operation: &str) -> PathBuf {
    fs::read_dir(run_dir.join("checkpoints"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| {
            let checkpoint: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
            checkpoint["operation"] == operation
        })
        .unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("estimate"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("rollback"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--from"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ledger-migrate"));
}

#[test]
fn test_progress_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--progress"))
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_rollback_requires_checkpoint() {
    cmd().arg("rollback").assert().failure();
}

// =============================================================================
// Error Exit Codes
// =============================================================================

#[test]
fn test_missing_config_file_fails() {
    cmd()
        .args(["--config", "/nonexistent/migration.yaml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_inverted_date_override_is_config_error() {
    let fixture = Fixture::mapped();
    cmd()
        .arg("--config")
        .arg(fixture.config())
        .args(["--from", "2024-04-01", "--to", "2024-03-01", "validate"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("date_from"));
}

#[test]
fn test_validate_reports_unmapped_accounts() {
    let fixture = Fixture::new("  receivable: 1300 Debtors\n  bank: 1100 Bank\n");
    cmd()
        .arg("--config")
        .arg(fixture.config())
        .arg("validate")
        .assert()
        .code(3)
        .stdout(predicate::str::contains("Unmapped accounts: income"));
}

// =============================================================================
// End-to-end Runs
// =============================================================================

#[test]
fn test_validate_passes_with_mapped_accounts() {
    let fixture = Fixture::mapped();
    cmd()
        .arg("--config")
        .arg(fixture.config())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Validation completed successfully"));
}

#[test]
fn test_estimate_outputs_json() {
    let fixture = Fixture::mapped();
    cmd()
        .arg("--config")
        .arg(fixture.config())
        .args(["--output-json", "estimate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"strategy\""))
        .stdout(predicate::str::contains("\"records_per_day\""));
}

#[test]
fn test_dry_run_writes_reports_but_not_the_store() {
    let fixture = Fixture::mapped();
    cmd()
        .arg("--config")
        .arg(fixture.config())
        .args(["run", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run completed!"))
        .stdout(predicate::str::contains("Would create: 3"));

    assert_eq!(sales_invoices(&fixture.store()), 0);
    let run_dir = fixture.run_dir();
    assert!(run_dir.join("dry_run_report.json").exists());
    assert!(run_dir.join("migration_report.json").exists());
    assert!(run_dir.join("audit_trail.jsonl").exists());
}

#[test]
fn test_run_verify_and_rollback() {
    let fixture = Fixture::mapped();
    let output = cmd()
        .arg("--config")
        .arg(fixture.config())
        .args(["--output-json", "run"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["status"], "completed");
    assert_eq!(report["import"]["records"]["succeeded"], 3);
    assert_eq!(sales_invoices(&fixture.store()), 2);

    cmd()
        .arg("--config")
        .arg(fixture.config())
        .arg("verify")
        .assert()
        .success()
        .stdout(predicate::str::contains("Integrity: Passed"));

    let run_dir = fixture.run_dir();

    cmd()
        .arg("--config")
        .arg(fixture.config())
        .arg("rollback")
        .arg("--checkpoint")
        .arg(checkpoint_for(&run_dir, "import"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Success: true"));
    assert_eq!(sales_invoices(&fixture.store()), 0);
}
