use crate::domain::ports::SettlementStore;
use crate::domain::settlement::{PendingRefund, SettlementDecision};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory settlement store.
///
/// Decisions are appended in finalization order. Ideal for tests and the
/// CLI simulator where nothing has to survive a restart.
#[derive(Default, Clone)]
pub struct InMemorySettlementStore {
    decisions: Arc<RwLock<Vec<SettlementDecision>>>,
    pending: Arc<RwLock<Option<PendingRefund>>>,
}

impl InMemorySettlementStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn record_decision(&self, decision: SettlementDecision) -> Result<()> {
        let mut decisions = self.decisions.write().await;
        decisions.push(decision);
        Ok(())
    }

    async fn decisions(&self) -> Result<Vec<SettlementDecision>> {
        let decisions = self.decisions.read().await;
        Ok(decisions.clone())
    }

    async fn pending_refund(&self) -> Result<Option<PendingRefund>> {
        let pending = self.pending.read().await;
        Ok(pending.clone())
    }

    async fn set_pending_refund(&self, refund: PendingRefund) -> Result<()> {
        let mut pending = self.pending.write().await;
        *pending = Some(refund);
        Ok(())
    }

    async fn clear_pending_refund(&self) -> Result<()> {
        let mut pending = self.pending.write().await;
        *pending = None;
        Ok(())
    }
}
