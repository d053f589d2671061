use crate::application::cash_session::CashSessionController;
use crate::application::finalizer::SettlementFinalizer;
use crate::application::flow_handle::FlowHandle;
use crate::application::wash_start::WashStartController;
use crate::config::KioskConfig;
use crate::domain::flow::{
    FlowStatus, PaymentFlowState, PaymentFlowStateMachine, PaymentMethod, WashProgram,
};
use crate::domain::money::Cents;
use crate::domain::ports::{
    CashDeviceHandle, PosOutcome, PosTerminalHandle, ReceiptPrinterHandle,
    SettlementStoreHandle, WashMachineHandle,
};
use crate::domain::session::AttemptId;
use crate::domain::settlement::{
    FinalState, FinishReason, PendingRefund, Receipt, SettlementDecision,
};
use crate::domain::wash::{WashRefundReason, WashStartState};
use crate::error::{ErrorCode, KioskError, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Hardware and storage the kiosk runs against.
#[derive(Clone)]
pub struct KioskDevices {
    pub cash: CashDeviceHandle,
    pub wash: WashMachineHandle,
    pub pos: PosTerminalHandle,
    pub printer: ReceiptPrinterHandle,
    pub store: SettlementStoreHandle,
}

/// Where a cancel request came from. Logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    CancelButton,
    BackButton,
}

/// What one `process_payment` call settled.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub method: PaymentMethod,
    /// The payment decision; `None` if another finalization already won.
    pub decision: Option<SettlementDecision>,
    pub wash: WashStartState,
    /// Refund issued because the wash could not be started.
    pub wash_refund: Option<SettlementDecision>,
}

/// Composes the payment core and exposes it to the UI layer.
///
/// The orchestrator owns every controller; the UI only sees commands and
/// the two watch streams.
pub struct PaymentOrchestrator {
    flow: Arc<FlowHandle>,
    session: Arc<CashSessionController>,
    finalizer: SettlementFinalizer,
    wash: WashStartController,
    machine: WashMachineHandle,
    pos: PosTerminalHandle,
    printer: ReceiptPrinterHandle,
    store: SettlementStoreHandle,
    attempt_lock: tokio::sync::Mutex<()>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl PaymentOrchestrator {
    pub fn new(config: KioskConfig, devices: KioskDevices) -> Self {
        let config = Arc::new(config);
        let flow = Arc::new(FlowHandle::new());
        let session = Arc::new(CashSessionController::new(
            config.clone(),
            devices.cash,
            flow.clone(),
        ));
        let finalizer = SettlementFinalizer::new(
            session.clone(),
            flow.clone(),
            devices.store.clone(),
            devices.printer.clone(),
        );
        let wash = WashStartController::new(config.wash.clone(), devices.wash.clone());
        Self {
            flow,
            session,
            finalizer,
            wash,
            machine: devices.wash,
            pos: devices.pos,
            printer: devices.printer,
            store: devices.store,
            attempt_lock: tokio::sync::Mutex::new(()),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    pub fn flow_state(&self) -> PaymentFlowState {
        self.flow.snapshot()
    }

    pub fn subscribe_flow(&self) -> watch::Receiver<PaymentFlowState> {
        self.flow.subscribe()
    }

    pub fn subscribe_wash(&self) -> watch::Receiver<WashStartState> {
        self.wash.subscribe()
    }

    pub fn wash_state(&self) -> WashStartState {
        self.wash.state()
    }

    pub async fn pending_refund(&self) -> Result<Option<PendingRefund>> {
        self.store.pending_refund().await
    }

    /// Opens an attempt for `program` if the wash machine reports no fault.
    pub async fn select_program(&self, program: WashProgram) -> Result<()> {
        match self.machine.has_fault().await {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(program = %program.name, "Wash machine fault; program not started");
                return Err(KioskError::MachineFault);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fault status unknown; program not started");
                return Err(e.into());
            }
        }
        self.wash.reset();
        self.flow.try_apply("start_payment_flow", |s| {
            PaymentFlowStateMachine::start_payment_flow(s, program)
        })
    }

    pub fn select_payment_method(&self, method: PaymentMethod) -> Result<()> {
        self.flow.try_apply("select_payment_method", |s| {
            PaymentFlowStateMachine::select_payment_method(s, method)
        })
    }

    pub fn set_payment_confirmed(&self, confirmed: bool) -> Result<()> {
        self.flow.try_apply("set_payment_confirmed", |s| {
            PaymentFlowStateMachine::set_payment_confirmed(s, confirmed)
        })
    }

    /// Runs the confirmed payment to its end, then the wash start.
    ///
    /// Only one attempt runs at a time; a concurrent call fails with
    /// `SessionAlreadyActive` instead of waiting.
    pub async fn process_payment(&self) -> Result<AttemptReport> {
        let Ok(_attempt) = self.attempt_lock.try_lock() else {
            tracing::warn!("process_payment while an attempt is running");
            return Err(KioskError::SessionAlreadyActive);
        };
        match self.flow.snapshot().selected_payment_method {
            PaymentMethod::Cash => self.process_cash().await,
            PaymentMethod::Card => self.process_card().await,
            PaymentMethod::None => Err(KioskError::Validation(
                "no payment method selected".into(),
            )),
        }
    }

    async fn process_cash(&self) -> Result<AttemptReport> {
        let outstanding = self.finalizer.retry_pending_refund().await?;
        if !outstanding.is_zero() {
            tracing::error!(%outstanding, "Cash attempt blocked by pending refund");
            return Err(KioskError::PendingRefundOutstanding(outstanding));
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        if let Err(e) = self
            .flow
            .try_apply("confirm_payment", PaymentFlowStateMachine::confirm_payment)
        {
            *self.cancel.lock() = None;
            return Err(e);
        }

        let attempt = match self.session.begin_session().await {
            Ok(attempt) => attempt,
            Err(e) => {
                *self.cancel.lock() = None;
                let code = e.code();
                self.flow
                    .apply(|s| PaymentFlowStateMachine::payment_failed(s, code));
                return Err(e);
            }
        };

        let target = self.session.target().await;
        let collected = self.session.run_collection(attempt, target, &token).await;
        let reason = {
            let mut slot = self.cancel.lock();
            *slot = None;
            if token.is_cancelled() {
                FinishReason::Cancel
            } else {
                collected
            }
        };

        let decision = self.finalizer.finish_attempt(attempt, reason).await;
        let mut report = AttemptReport {
            method: PaymentMethod::Cash,
            decision: decision.clone(),
            wash: self.wash.state(),
            wash_refund: None,
        };
        if let Some(decision) = decision.filter(|d| d.success) {
            self.run_wash(attempt, PaymentMethod::Cash, decision.kept, &mut report)
                .await;
        }
        Ok(report)
    }

    async fn process_card(&self) -> Result<AttemptReport> {
        self.flow
            .try_apply("confirm_payment", PaymentFlowStateMachine::confirm_payment)?;
        let attempt = AttemptId::new();
        let snapshot = self.flow.snapshot();
        let target = snapshot.target_amount;

        let outcome = if self.pos.initialize().await {
            self.pos.initiate_payment(target).await
        } else {
            PosOutcome::Error("terminal did not initialize".into())
        };

        let decision = match outcome {
            PosOutcome::Approved { reference } => {
                tracing::info!(attempt_id = %attempt, %reference, %target, "Card payment approved");
                self.flow
                    .apply(|s| PaymentFlowStateMachine::payment_success(s, target));
                let program = snapshot
                    .selected_program
                    .map(|p| p.name)
                    .unwrap_or_default();
                let receipt = Receipt {
                    attempt_id: attempt,
                    program,
                    method: PaymentMethod::Card,
                    paid: target,
                    change: Cents::ZERO,
                    printed_at: Utc::now(),
                };
                if let Err(e) = self.printer.print_receipt(&receipt).await {
                    tracing::warn!(attempt_id = %attempt, error = %e, "Receipt not printed");
                }
                card_decision(attempt, target, FinishReason::PaySuccess, None)
            }
            PosOutcome::Declined => {
                tracing::info!(attempt_id = %attempt, "Card declined");
                self.flow.apply(|s| {
                    PaymentFlowStateMachine::payment_failed(s, ErrorCode::CardDeclined)
                });
                card_decision(attempt, target, FinishReason::PayFailed, Some(ErrorCode::CardDeclined))
            }
            PosOutcome::Cancelled => {
                tracing::info!(attempt_id = %attempt, "Card payment cancelled");
                if self.flow.snapshot().status == FlowStatus::ShowCancelConfirm {
                    self.flow.apply(PaymentFlowStateMachine::confirm_cancel);
                } else {
                    self.flow.apply(|s| {
                        PaymentFlowStateMachine::payment_cancelled(s, ErrorCode::PaymentCancelled)
                    });
                }
                self.flow
                    .apply(PaymentFlowStateMachine::cancel_refund_completed);
                card_decision(attempt, target, FinishReason::Cancel, Some(ErrorCode::PaymentCancelled))
            }
            PosOutcome::Error(message) => {
                tracing::warn!(attempt_id = %attempt, %message, "Card payment failed");
                self.flow.apply(|s| {
                    PaymentFlowStateMachine::payment_failed(s, ErrorCode::PaymentFailed)
                });
                card_decision(attempt, target, FinishReason::PayFailed, Some(ErrorCode::PaymentFailed))
            }
        };
        if let Err(e) = self.store.record_decision(decision.clone()).await {
            tracing::error!(attempt_id = %attempt, error = %e, "Failed to record decision");
        }

        let mut report = AttemptReport {
            method: PaymentMethod::Card,
            decision: Some(decision.clone()),
            wash: self.wash.state(),
            wash_refund: None,
        };
        if decision.success {
            self.run_wash(attempt, PaymentMethod::Card, decision.kept, &mut report)
                .await;
        }
        Ok(report)
    }

    async fn run_wash(
        &self,
        attempt: AttemptId,
        method: PaymentMethod,
        kept: Cents,
        report: &mut AttemptReport,
    ) {
        if !self.flow.apply(PaymentFlowStateMachine::start_washing) {
            return;
        }
        self.flow.apply(PaymentFlowStateMachine::wait_for_machine);
        let mode = self
            .flow
            .snapshot()
            .selected_program
            .map(|p| p.id)
            .unwrap_or_default();

        let started = match self.wash.await_gates().await {
            Ok(()) => {
                self.flow.apply(PaymentFlowStateMachine::proceed_from_waiting);
                self.wash.start_machine(mode).await
            }
            Err(reason) => Err(reason),
        };

        match started {
            Ok(()) => {
                if method == PaymentMethod::Cash {
                    self.finalizer.wash_started(attempt).await;
                }
                self.flow.apply(PaymentFlowStateMachine::complete_flow);
            }
            Err(reason) => {
                report.wash_refund = match method {
                    PaymentMethod::Card => Some(self.void_card(attempt, kept, reason).await),
                    _ => self.finalizer.refund_settled(attempt, reason).await,
                };
                self.flow
                    .apply(|s| PaymentFlowStateMachine::abort_wash(s, reason.code()));
            }
        }
        report.wash = self.wash.state();
    }

    async fn void_card(
        &self,
        attempt: AttemptId,
        amount: Cents,
        reason: WashRefundReason,
    ) -> SettlementDecision {
        let voided = self.pos.cancel_payment().await;
        if !voided {
            tracing::error!(attempt_id = %attempt, %amount, "Card void failed");
        }
        let decision = SettlementDecision {
            attempt_id: attempt,
            success: false,
            paid: amount,
            target: amount,
            change_dispensed: Cents::ZERO,
            refund_dispensed: if voided { amount } else { Cents::ZERO },
            kept: Cents::ZERO,
            remaining: if voided { Cents::ZERO } else { amount },
            final_state: if voided {
                FinalState::Failed
            } else {
                FinalState::RefundPending
            },
            reason: FinishReason::WashAborted(reason),
            error: Some(if voided {
                reason.code()
            } else {
                ErrorCode::CardRefundFailed
            }),
            decided_at: Utc::now(),
        };
        decision.assert_conserved();
        if let Err(e) = self.store.record_decision(decision.clone()).await {
            tracing::error!(attempt_id = %attempt, error = %e, "Failed to record decision");
        }
        decision
    }

    /// Back or cancel pressed. Cash asks for confirmation first; card
    /// payments are cancelled at the terminal right away.
    pub async fn on_user_cancel_requested(&self, source: CancelSource) -> Result<()> {
        let state = self.flow.snapshot();
        tracing::info!(?source, status = %state.status, "Cancel requested");
        match (state.status, state.selected_payment_method) {
            (FlowStatus::Paying, PaymentMethod::Card) => {
                if !self.pos.cancel_payment().await {
                    tracing::warn!("Terminal refused to cancel the payment");
                }
                Ok(())
            }
            (FlowStatus::Paying, _) => self
                .flow
                .try_apply("show_cancel_confirm", PaymentFlowStateMachine::show_cancel_confirm),
            (FlowStatus::AwaitingPaymentMethod, _) => self
                .flow
                .try_apply("reset_to_selecting", PaymentFlowStateMachine::reset_to_selecting),
            _ => Err(KioskError::TransitionRejected("on_user_cancel_requested")),
        }
    }

    /// The customer confirmed the cancel: stop collecting and refund.
    pub fn confirm_cancel_and_refund(&self) -> Result<()> {
        let slot = self.cancel.lock();
        let Some(token) = slot.as_ref() else {
            tracing::warn!("Cancel confirmed but no collection is running");
            return Err(KioskError::TransitionRejected("confirm_cancel"));
        };
        self.flow
            .try_apply("confirm_cancel", PaymentFlowStateMachine::confirm_cancel)?;
        token.cancel();
        Ok(())
    }

    pub fn dismiss_cancel(&self) -> Result<()> {
        self.flow
            .try_apply("dismiss_cancel", PaymentFlowStateMachine::dismiss_cancel)
    }

    pub fn retry_payment(&self) -> Result<()> {
        self.wash.reset();
        self.flow
            .try_apply("retry_payment", PaymentFlowStateMachine::retry_payment)
    }

    /// Back to the start screen. A running collection is cancelled and
    /// still settles through the finalizer.
    pub async fn reset(&self) {
        if let Some(token) = self.cancel.lock().as_ref() {
            token.cancel();
        }
        self.session.end_session("reset").await;
        self.wash.reset();
        self.flow
            .apply(PaymentFlowStateMachine::force_reset_to_not_started);
    }

    /// Operator acknowledgement that a pending refund was paid by hand.
    pub async fn clear_pending_refund(&self) -> Result<Option<PendingRefund>> {
        let pending = self.store.pending_refund().await?;
        if let Some(pending) = &pending {
            tracing::warn!(
                attempt_id = %pending.attempt_id,
                amount = %pending.amount,
                "Pending refund cleared by operator"
            );
            self.store.clear_pending_refund().await?;
        }
        Ok(pending)
    }
}

fn card_decision(
    attempt: AttemptId,
    target: Cents,
    reason: FinishReason,
    error: Option<ErrorCode>,
) -> SettlementDecision {
    let success = reason == FinishReason::PaySuccess;
    let paid = if success { target } else { Cents::ZERO };
    SettlementDecision {
        attempt_id: attempt,
        success,
        paid,
        target,
        change_dispensed: Cents::ZERO,
        refund_dispensed: Cents::ZERO,
        kept: paid,
        remaining: Cents::ZERO,
        final_state: match reason {
            FinishReason::PaySuccess => FinalState::Success,
            FinishReason::Cancel => FinalState::Cancelled,
            _ => FinalState::Failed,
        },
        reason,
        error,
        decided_at: Utc::now(),
    }
}
