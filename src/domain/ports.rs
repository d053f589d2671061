//! Gateway traits the settlement core consumes.
//!
//! Raw transports (REST framing for the cash device, the wash machine's serial
//! registers, the POS SDK) live behind these traits.

use super::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use super::settlement::{PendingRefund, Receipt, SettlementDecision};
use crate::error::{DeviceResult, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Diagnostic counters of a cash unit. Never used for money decisions.
pub type DeviceCounters = BTreeMap<String, u64>;

#[async_trait]
pub trait CashDevice: Send + Sync {
    async fn start_cash_session(&self) -> DeviceResult<()>;
    async fn stop_cash_session(&self, reason: &str) -> DeviceResult<()>;
    async fn enable_acceptor(&self, device: DeviceId) -> DeviceResult<()>;
    async fn disable_acceptor(&self, device: DeviceId) -> DeviceResult<()>;
    async fn set_auto_accept(&self, device: DeviceId, enabled: bool) -> DeviceResult<()>;
    /// Authoritative stored counts per denomination.
    async fn read_current_levels(&self, device: DeviceId) -> DeviceResult<DeviceLevelsSnapshot>;
    /// Pays out one piece. `Ok(false)` means the unit refused without a transport error.
    async fn dispense_value(
        &self,
        device: DeviceId,
        denomination: Cents,
        currency: &str,
    ) -> DeviceResult<bool>;
    async fn get_counters(&self, device: DeviceId) -> DeviceResult<DeviceCounters>;
}

/// Register reads and the start command of the wash machine.
#[async_trait]
pub trait WashMachine: Send + Sync {
    async fn has_fault(&self) -> DeviceResult<bool>;
    async fn previous_car_present(&self) -> DeviceResult<bool>;
    async fn car_in_position(&self) -> DeviceResult<bool>;
    async fn device_ready(&self) -> DeviceResult<bool>;
    async fn is_running_automatic(&self) -> DeviceResult<bool>;
    /// Returns whether the machine acknowledged the mode.
    async fn send_mode(&self, mode: u32) -> DeviceResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PosOutcome {
    Approved { reference: String },
    Declined,
    Cancelled,
    Error(String),
}

#[async_trait]
pub trait PosTerminal: Send + Sync {
    async fn initialize(&self) -> bool;
    async fn initiate_payment(&self, amount: Cents) -> PosOutcome;
    /// Voids the in-flight or last approved payment.
    async fn cancel_payment(&self) -> bool;
}

#[async_trait]
pub trait ReceiptPrinter: Send + Sync {
    async fn print_receipt(&self, receipt: &Receipt) -> DeviceResult<()>;
}

/// Where decisions and the outstanding refund balance are kept.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn record_decision(&self, decision: SettlementDecision) -> Result<()>;
    async fn decisions(&self) -> Result<Vec<SettlementDecision>>;
    async fn pending_refund(&self) -> Result<Option<PendingRefund>>;
    async fn set_pending_refund(&self, refund: PendingRefund) -> Result<()>;
    async fn clear_pending_refund(&self) -> Result<()>;
}

pub type CashDeviceHandle = Arc<dyn CashDevice>;
pub type WashMachineHandle = Arc<dyn WashMachine>;
pub type PosTerminalHandle = Arc<dyn PosTerminal>;
pub type ReceiptPrinterHandle = Arc<dyn ReceiptPrinter>;
pub type SettlementStoreHandle = Arc<dyn SettlementStore>;
