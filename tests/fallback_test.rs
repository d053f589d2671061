mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::{fast_config, write_config, write_scenario};
use predicates::prelude::*;
use std::process::Command;

#[cfg(not(feature = "storage-rocksdb"))]
#[test]
fn test_rocksdb_fallback_warning() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("kiosk.json");
    write_config(&config_path, &fast_config());
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    write_scenario(&mut csv, &["attempt,Basic,5,card,,,,,,,"]);

    let mut cmd = Command::new(cargo_bin!("washpay"));
    cmd.arg(csv.path())
        .arg("--config")
        .arg(&config_path)
        .arg("--db-path")
        .arg(dir.path().join("some_db"));

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1,true,5,5,0,0,0,success,pay_success,"))
        .stderr(predicate::str::contains("WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."));
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_rocksdb_no_fallback_warning() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("kiosk.json");
    write_config(&config_path, &fast_config());
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    write_scenario(&mut csv, &["attempt,Basic,5,card,,,,,,,"]);

    let mut cmd = Command::new(cargo_bin!("washpay"));
    cmd.arg(csv.path())
        .arg("--config")
        .arg(&config_path)
        .arg("--db-path")
        .arg(dir.path().join("test_db"));

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("WARNING").not());
}
