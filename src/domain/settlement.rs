use crate::domain::flow::PaymentMethod;
use crate::domain::money::Cents;
use crate::domain::session::AttemptId;
use crate::domain::wash::WashRefundReason;
use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a cash attempt is being finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    PaySuccess,
    Cancel,
    Timeout,
    PayFailed,
    Exception,
    /// Post-settlement refund because the wash could not be started.
    WashAborted(WashRefundReason),
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::PaySuccess => "pay_success",
            FinishReason::Cancel => "cancel",
            FinishReason::Timeout => "timeout",
            FinishReason::PayFailed => "pay_failed",
            FinishReason::Exception => "exception",
            FinishReason::WashAborted(_) => "wash_aborted",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::WashAborted(reason) => write!(f, "wash_aborted:{reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Terminal payment outcome committed by the finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Success,
    Failed,
    Cancelled,
    /// Money is still owed to the customer; blocks new cash attempts.
    RefundPending,
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalState::Success => "success",
            FinalState::Failed => "failed",
            FinalState::Cancelled => "cancelled",
            FinalState::RefundPending => "refund_pending",
        };
        f.write_str(s)
    }
}

/// The record every finalization emits exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementDecision {
    pub attempt_id: AttemptId,
    pub success: bool,
    pub paid: Cents,
    pub target: Cents,
    pub change_dispensed: Cents,
    pub refund_dispensed: Cents,
    /// Revenue retained by the kiosk.
    pub kept: Cents,
    /// Owed to the customer but not paid out.
    pub remaining: Cents,
    pub final_state: FinalState,
    pub reason: FinishReason,
    pub error: Option<ErrorCode>,
    pub decided_at: DateTime<Utc>,
}

impl SettlementDecision {
    /// Every cent inserted is either kept, handed back, or still owed.
    pub fn is_conserved(&self) -> bool {
        self.paid == self.change_dispensed + self.refund_dispensed + self.kept + self.remaining
    }

    pub fn assert_conserved(&self) {
        assert!(
            self.is_conserved(),
            "conservation violated for attempt {}: paid {} != change {} + refund {} + kept {} + remaining {}",
            self.attempt_id,
            self.paid,
            self.change_dispensed,
            self.refund_dispensed,
            self.kept,
            self.remaining
        );
    }
}

/// Money owed to a customer after a payout came up short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRefund {
    pub attempt_id: AttemptId,
    pub amount: Cents,
    pub reason: FinishReason,
    pub created_at: DateTime<Utc>,
}

/// Data handed to the receipt printer. Layout is the printer's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub attempt_id: AttemptId,
    pub program: String,
    pub method: PaymentMethod,
    pub paid: Cents,
    pub change: Cents,
    pub printed_at: DateTime<Utc>,
}
