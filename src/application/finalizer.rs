//! The one exit point of every cash attempt.

use crate::application::cash_session::CashSessionController;
use crate::application::flow_handle::FlowHandle;
use crate::domain::change::{ChangeCalculator, ChangeInventory};
use crate::domain::flow::{FlowStatus, PaymentFlowStateMachine, PaymentMethod};
use crate::domain::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use crate::domain::ports::{ReceiptPrinterHandle, SettlementStoreHandle};
use crate::domain::session::AttemptId;
use crate::domain::settlement::{
    FinalState, FinishReason, PendingRefund, Receipt, SettlementDecision,
};
use crate::domain::wash::WashRefundReason;
use crate::error::{ErrorCode, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Money movements of one finalization before they become a decision.
#[derive(Debug, Default)]
struct Settlement {
    change: Cents,
    refund: Cents,
    kept: Cents,
    remaining: Cents,
    error: Option<ErrorCode>,
}

/// Kept revenue of the last successful attempt, refundable while its wash
/// has not started.
#[derive(Debug, Clone, Copy)]
struct Refundable {
    attempt: AttemptId,
    kept: Cents,
    target: Cents,
}

#[derive(Debug, Default)]
struct Ledger {
    /// Last attempt whose finalization token has been taken. Older attempts
    /// are refused by the session phase.
    finalized_tx_id: Option<AttemptId>,
    /// Taken on use, so each refund happens once.
    refundable: Option<Refundable>,
}

/// Classifies how a cash attempt ended, pays out change or refunds, and
/// commits the terminal payment state exactly once.
pub struct SettlementFinalizer {
    session: Arc<CashSessionController>,
    flow: Arc<FlowHandle>,
    store: SettlementStoreHandle,
    printer: ReceiptPrinterHandle,
    ledger: Mutex<Ledger>,
}

impl SettlementFinalizer {
    pub fn new(
        session: Arc<CashSessionController>,
        flow: Arc<FlowHandle>,
        store: SettlementStoreHandle,
        printer: ReceiptPrinterHandle,
    ) -> Self {
        Self {
            session,
            flow,
            store,
            printer,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Settles `attempt`. Returns `None` when it was already finalized or
    /// is not collecting; nothing is paid out in that case.
    pub async fn finish_attempt(
        &self,
        attempt: AttemptId,
        reason: FinishReason,
    ) -> Option<SettlementDecision> {
        let mut ledger = self.ledger.lock().await;
        if ledger.finalized_tx_id == Some(attempt) {
            tracing::info!(attempt_id = %attempt, %reason, "Attempt already finalized; ignoring");
            return None;
        }
        if !self.session.begin_finishing(attempt).await {
            return None;
        }
        ledger.finalized_tx_id = Some(attempt);
        ledger.refundable = None;

        self.session.shutdown_acceptors(reason).await;

        let settled = match self.session.settle(attempt).await {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!(attempt_id = %attempt, error = %e, "Settlement reads rejected");
                self.session.release(attempt, reason).await;
                return None;
            }
        };
        let paid = settled.delta;
        let target = settled.target;
        tracing::info!(attempt_id = %attempt, %reason, %paid, %target, "Finalizing attempt");

        let settlement = match reason {
            FinishReason::PaySuccess if paid >= target => {
                self.settle_success(attempt, paid, target, &settled.levels)
                    .await
            }
            FinishReason::PaySuccess => {
                tracing::error!(
                    attempt_id = %attempt,
                    %paid,
                    %target,
                    "Paid amount dropped below target at finalization"
                );
                self.settle_refund(attempt, paid, ErrorCode::PaymentFailed)
                    .await
            }
            other => {
                let code = match other {
                    FinishReason::Cancel => ErrorCode::PaymentCancelled,
                    FinishReason::Timeout => ErrorCode::PaymentTimeout,
                    FinishReason::Exception => ErrorCode::Internal,
                    _ => ErrorCode::PaymentFailed,
                };
                self.settle_refund(attempt, paid, code).await
            }
        };

        self.session.release(attempt, reason).await;

        let success = reason == FinishReason::PaySuccess && settlement.error.is_none();
        let final_state = if !settlement.remaining.is_zero() {
            FinalState::RefundPending
        } else if success {
            FinalState::Success
        } else if reason == FinishReason::Cancel {
            FinalState::Cancelled
        } else {
            FinalState::Failed
        };
        let decision = SettlementDecision {
            attempt_id: attempt,
            success,
            paid,
            target,
            change_dispensed: settlement.change,
            refund_dispensed: settlement.refund,
            kept: settlement.kept,
            remaining: settlement.remaining,
            final_state,
            reason,
            error: settlement.error,
            decided_at: Utc::now(),
        };
        decision.assert_conserved();
        self.persist(&decision).await;

        if success {
            ledger.refundable = Some(Refundable {
                attempt,
                kept: decision.kept,
                target,
            });
        }
        drop(ledger);

        self.commit_flow(&decision);
        if success {
            self.print(Receipt {
                attempt_id: attempt,
                program: settled.program,
                method: PaymentMethod::Cash,
                paid,
                change: decision.change_dispensed,
                printed_at: Utc::now(),
            })
            .await;
        }
        tracing::info!(
            attempt_id = %attempt,
            success = decision.success,
            %paid,
            change = %decision.change_dispensed,
            refund = %decision.refund_dispensed,
            remaining = %decision.remaining,
            final_state = %decision.final_state,
            "Attempt finalized"
        );
        Some(decision)
    }

    async fn settle_success(
        &self,
        attempt: AttemptId,
        paid: Cents,
        target: Cents,
        levels: &[(DeviceId, Option<DeviceLevelsSnapshot>)],
    ) -> Settlement {
        let change_needed = paid - target;
        if change_needed.is_zero() {
            return Settlement {
                kept: target,
                ..Settlement::default()
            };
        }

        let plan = ChangeInventory::from_levels(levels)
            .and_then(|inventory| ChangeCalculator::plan(change_needed, &inventory));
        let plan = match plan {
            Ok(plan) => plan,
            Err(failure) => {
                tracing::error!(
                    attempt_id = %attempt,
                    %change_needed,
                    %failure,
                    "Change infeasible; refunding everything received"
                );
                return self.settle_refund(attempt, paid, failure.code()).await;
            }
        };

        if !self.session.payout_allowed(attempt).await {
            tracing::error!(attempt_id = %attempt, "Rejected hardware call: change payout outside finalization");
            return Settlement {
                remaining: paid,
                error: Some(ErrorCode::GuardRejected),
                ..Settlement::default()
            };
        }
        let payout = self.session.payout();
        let outcome = payout.dispense_plan(attempt, &plan).await;
        if outcome.is_complete() {
            return Settlement {
                change: outcome.dispensed,
                kept: target,
                ..Settlement::default()
            };
        }

        // The sale is off: whatever did not go out as change goes back.
        let owed = paid - outcome.dispensed;
        tracing::error!(
            attempt_id = %attempt,
            change_dispensed = %outcome.dispensed,
            %owed,
            "Change dispense failed; aborting into refund"
        );
        let avoid: Vec<_> = outcome.failed_at.into_iter().collect();
        let refund = payout.refund(attempt, owed, &avoid).await;
        Settlement {
            change: outcome.dispensed,
            refund: refund.dispensed,
            kept: Cents::ZERO,
            remaining: refund.remaining,
            error: Some(if refund.remaining.is_zero() {
                ErrorCode::ChangeDispenseFailed
            } else {
                ErrorCode::RefundIncomplete
            }),
        }
    }

    /// Hands back exactly `paid`. An empty balance dispenses nothing.
    async fn settle_refund(&self, attempt: AttemptId, paid: Cents, code: ErrorCode) -> Settlement {
        if paid.is_zero() {
            return Settlement {
                error: Some(code),
                ..Settlement::default()
            };
        }
        if !self.session.payout_allowed(attempt).await {
            tracing::error!(attempt_id = %attempt, "Rejected hardware call: refund outside finalization");
            return Settlement {
                remaining: paid,
                error: Some(ErrorCode::GuardRejected),
                ..Settlement::default()
            };
        }
        let refund = self.session.payout().refund(attempt, paid, &[]).await;
        if !refund.remaining.is_zero() {
            tracing::error!(
                attempt_id = %attempt,
                refunded = %refund.dispensed,
                remaining = %refund.remaining,
                "Partial refund; amount left pending"
            );
        }
        Settlement {
            refund: refund.dispensed,
            remaining: refund.remaining,
            error: Some(if refund.remaining.is_zero() {
                code
            } else {
                ErrorCode::RefundIncomplete
            }),
            ..Settlement::default()
        }
    }

    async fn persist(&self, decision: &SettlementDecision) {
        if let Err(e) = self.store.record_decision(decision.clone()).await {
            tracing::error!(attempt_id = %decision.attempt_id, error = %e, "Failed to record decision");
        }
        if decision.remaining.is_zero() {
            return;
        }
        let pending = PendingRefund {
            attempt_id: decision.attempt_id,
            amount: decision.remaining,
            reason: decision.reason,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.set_pending_refund(pending).await {
            tracing::error!(attempt_id = %decision.attempt_id, error = %e, "Failed to record pending refund");
        }
    }

    fn commit_flow(&self, decision: &SettlementDecision) {
        let paid = decision.paid;
        self.flow
            .apply(|s| PaymentFlowStateMachine::update_paid_amount(s, paid));

        let status = self.flow.snapshot().status;
        if decision.success {
            // Payment completed while the cancel dialog was open; the sale stands.
            if status == FlowStatus::ShowCancelConfirm {
                self.flow.apply(PaymentFlowStateMachine::dismiss_cancel);
            }
            self.flow
                .apply(|s| PaymentFlowStateMachine::payment_success(s, paid));
            return;
        }

        if decision.reason == FinishReason::Cancel {
            match status {
                FlowStatus::ShowCancelConfirm => {
                    self.flow.apply(PaymentFlowStateMachine::confirm_cancel);
                }
                FlowStatus::Paying => {
                    self.flow.apply(|s| {
                        PaymentFlowStateMachine::payment_cancelled(s, ErrorCode::PaymentCancelled)
                    });
                }
                _ => {}
            }
            match decision.error.filter(|_| !decision.remaining.is_zero()) {
                Some(code) => self.flow.apply(|s| {
                    PaymentFlowStateMachine::cancel_refund_incomplete(s, code)
                }),
                None => self
                    .flow
                    .apply(PaymentFlowStateMachine::cancel_refund_completed),
            };
            return;
        }

        if status == FlowStatus::ShowCancelConfirm {
            self.flow.apply(PaymentFlowStateMachine::dismiss_cancel);
        }
        let code = decision.error.unwrap_or(ErrorCode::PaymentFailed);
        self.flow
            .apply(|s| PaymentFlowStateMachine::payment_failed(s, code));
    }

    async fn print(&self, receipt: Receipt) {
        if let Err(e) = self.printer.print_receipt(&receipt).await {
            tracing::warn!(attempt_id = %receipt.attempt_id, error = %e, "Receipt not printed");
        }
    }

    pub async fn last_finalized(&self) -> Option<AttemptId> {
        self.ledger.lock().await.finalized_tx_id
    }

    /// Hands back the kept amount of a settled cash attempt whose wash could
    /// not be started. Once per attempt, and only for the last one settled;
    /// later calls return `None`.
    pub async fn refund_settled(
        &self,
        attempt: AttemptId,
        reason: WashRefundReason,
    ) -> Option<SettlementDecision> {
        let mut ledger = self.ledger.lock().await;
        let Some(entry) = ledger.refundable.filter(|r| r.attempt == attempt) else {
            tracing::warn!(attempt_id = %attempt, %reason, "Nothing refundable for attempt");
            return None;
        };
        if !self.session.payout_allowed(attempt).await {
            tracing::error!(attempt_id = %attempt, "Rejected hardware call: a newer session owns the device");
            return None;
        }
        ledger.refundable = None;
        let amount = entry.kept;

        tracing::info!(attempt_id = %attempt, %reason, %amount, "Refunding settled attempt");
        let refund = self.session.payout().refund(attempt, amount, &[]).await;
        let decision = SettlementDecision {
            attempt_id: attempt,
            success: false,
            paid: amount,
            target: entry.target,
            change_dispensed: Cents::ZERO,
            refund_dispensed: refund.dispensed,
            kept: Cents::ZERO,
            remaining: refund.remaining,
            final_state: if refund.remaining.is_zero() {
                FinalState::Failed
            } else {
                FinalState::RefundPending
            },
            reason: FinishReason::WashAborted(reason),
            error: Some(if refund.remaining.is_zero() {
                reason.code()
            } else {
                ErrorCode::RefundIncomplete
            }),
            decided_at: Utc::now(),
        };
        decision.assert_conserved();
        self.persist(&decision).await;
        Some(decision)
    }

    /// The wash of `attempt` started; its revenue is no longer refundable.
    pub async fn wash_started(&self, attempt: AttemptId) {
        let mut ledger = self.ledger.lock().await;
        if ledger.refundable.is_some_and(|r| r.attempt == attempt) {
            ledger.refundable = None;
        }
    }

    /// Tries to pay out a pending refund left by an earlier attempt.
    ///
    /// Returns the amount still owed afterwards; zero means the ledger is clear.
    pub async fn retry_pending_refund(&self) -> Result<Cents> {
        let _ledger = self.ledger.lock().await;
        let Some(pending) = self.store.pending_refund().await? else {
            return Ok(Cents::ZERO);
        };
        if !self.session.is_idle().await {
            tracing::error!("Rejected hardware call: pending refund while a session is open");
            return Ok(pending.amount);
        }

        tracing::info!(
            attempt_id = %pending.attempt_id,
            amount = %pending.amount,
            "Retrying pending refund"
        );
        let refund = self
            .session
            .payout()
            .refund(pending.attempt_id, pending.amount, &[])
            .await;
        if refund.remaining.is_zero() {
            self.store.clear_pending_refund().await?;
            tracing::info!(attempt_id = %pending.attempt_id, "Pending refund settled");
        } else {
            self.store
                .set_pending_refund(PendingRefund {
                    amount: refund.remaining,
                    ..pending
                })
                .await?;
            tracing::warn!(remaining = %refund.remaining, "Pending refund still outstanding");
        }
        Ok(refund.remaining)
    }
}
