#![cfg(feature = "storage-rocksdb")]

mod common;

use assert_cmd::cargo_bin;
use common::{fast_config, write_config, write_scenario};
use std::process::Command;
use tempfile::tempdir;
use washpay::domain::money::Cents;
use washpay::domain::ports::SettlementStore;
use washpay::domain::session::AttemptId;
use washpay::domain::settlement::{FinishReason, PendingRefund};
use washpay::infrastructure::rocksdb::RocksDBStore;

#[test]
fn test_decisions_accumulate_across_runs() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");
    let config_path = dir.path().join("kiosk.json");
    write_config(&config_path, &fast_config());

    for _ in 0..2 {
        let mut csv = tempfile::NamedTempFile::new().unwrap();
        write_scenario(&mut csv, &["attempt,Basic,5,card,,,,,,,"]);
        let output = Command::new(cargo_bin!("washpay"))
            .arg(csv.path())
            .arg("--config")
            .arg(&config_path)
            .arg("--db-path")
            .arg(&db_path)
            .output()
            .expect("Failed to execute command");
        assert!(output.status.success());
    }

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = RocksDBStore::open(&db_path).unwrap();
    let decisions = runtime.block_on(store.decisions()).unwrap();
    assert_eq!(decisions.len(), 2);
    assert!(decisions.iter().all(|d| d.success && d.kept == Cents(500)));
}

#[test]
fn test_pending_refund_from_previous_run_blocks_cash() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");
    let config_path = dir.path().join("kiosk.json");
    write_config(&config_path, &fast_config());

    // Left behind by a run that could not pay a customer back.
    {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let store = RocksDBStore::open(&db_path).unwrap();
        runtime
            .block_on(store.set_pending_refund(PendingRefund {
                attempt_id: AttemptId::new(),
                amount: Cents(700),
                reason: FinishReason::Timeout,
                created_at: chrono::Utc::now(),
            }))
            .unwrap();
    }

    // The fresh simulated kiosk has no stock, so the refund stays owed.
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    write_scenario(&mut csv, &["attempt,Basic,5,cash,5,,,,,,"]);
    let output = Command::new(cargo_bin!("washpay"))
        .arg(csv.path())
        .arg("--config")
        .arg(&config_path)
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("1,"));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PENDING_REFUND_OUTSTANDING"));
}
