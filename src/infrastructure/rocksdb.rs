use crate::domain::ports::SettlementStore;
use crate::domain::settlement::{PendingRefund, SettlementDecision};
use crate::error::{KioskError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;

/// Column Family for settlement decisions, in decision order.
pub const CF_DECISIONS: &str = "decisions";
/// Column Family holding the outstanding pending refund, if any.
pub const CF_PENDING_REFUNDS: &str = "pending_refunds";

const PENDING_KEY: &[u8] = b"current";

/// A persistent settlement store using RocksDB.
///
/// Decisions and the pending-refund ledger live in separate Column Families.
/// A pending refund survives a kiosk restart, so a new cash attempt stays
/// blocked until it is paid or cleared.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path` with both column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_decisions = ColumnFamilyDescriptor::new(CF_DECISIONS, Options::default());
        let cf_pending = ColumnFamilyDescriptor::new(CF_PENDING_REFUNDS, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_decisions, cf_pending])?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| KioskError::Storage(format!("{name} column family not found")))
    }
}

/// Decision keys sort by decision time; the attempt id keeps them unique.
fn decision_key(decision: &SettlementDecision) -> Vec<u8> {
    let nanos = decision.decided_at.timestamp_nanos_opt().unwrap_or_default();
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&(nanos.max(0) as u64).to_be_bytes());
    key.extend_from_slice(decision.attempt_id.0.as_bytes());
    key
}

#[async_trait]
impl SettlementStore for RocksDBStore {
    async fn record_decision(&self, decision: SettlementDecision) -> Result<()> {
        let cf = self.cf(CF_DECISIONS)?;
        let value = serde_json::to_vec(&decision)?;
        self.db.put_cf(cf, decision_key(&decision), value)?;
        Ok(())
    }

    async fn decisions(&self) -> Result<Vec<SettlementDecision>> {
        let cf = self.cf(CF_DECISIONS)?;
        let mut decisions = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            decisions.push(serde_json::from_slice(&value)?);
        }
        Ok(decisions)
    }

    async fn pending_refund(&self) -> Result<Option<PendingRefund>> {
        let cf = self.cf(CF_PENDING_REFUNDS)?;
        match self.db.get_cf(cf, PENDING_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_pending_refund(&self, refund: PendingRefund) -> Result<()> {
        let cf = self.cf(CF_PENDING_REFUNDS)?;
        let value = serde_json::to_vec(&refund)?;
        self.db.put_cf(cf, PENDING_KEY, value)?;
        Ok(())
    }

    async fn clear_pending_refund(&self) -> Result<()> {
        let cf = self.cf(CF_PENDING_REFUNDS)?;
        self.db.delete_cf(cf, PENDING_KEY)?;
        Ok(())
    }
}
