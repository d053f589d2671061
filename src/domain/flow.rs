//! Payment flow state machine.
//!
//! Every transition is a pure function from the current state to
//! `Some(next)` or `None` when the transition is not allowed from the
//! current status. Rejections are logged and never mutate anything.

use crate::domain::money::Cents;
use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    NotStarted,
    AwaitingPaymentMethod,
    Paying,
    Success,
    Failed,
    ShowCancelConfirm,
    CancelledRefunding,
    CancelledRefunded,
    StartingWash,
    WaitingForMachine,
    Completed,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Success | FlowStatus::CancelledRefunded | FlowStatus::Completed
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    #[default]
    None,
}

impl std::str::FromStr for PaymentMethod {
    type Err = crate::error::KioskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            other => Err(crate::error::KioskError::Validation(format!(
                "unknown payment method: {other}"
            ))),
        }
    }
}

/// A wash program offered on the kiosk screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WashProgram {
    pub id: u32,
    pub name: String,
    pub price: Cents,
}

impl WashProgram {
    pub fn new(id: u32, name: impl Into<String>, price: Cents) -> Self {
        Self {
            id,
            name: name.into(),
            price,
        }
    }
}

/// State of one purchase attempt as seen by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFlowState {
    pub status: FlowStatus,
    pub selected_program: Option<WashProgram>,
    pub selected_payment_method: PaymentMethod,
    pub payment_confirmed: bool,
    pub paid_amount: Cents,
    pub target_amount: Cents,
    pub error_message: Option<ErrorCode>,
    pub last_updated: DateTime<Utc>,
}

impl Default for PaymentFlowState {
    fn default() -> Self {
        Self {
            status: FlowStatus::NotStarted,
            selected_program: None,
            selected_payment_method: PaymentMethod::None,
            payment_confirmed: false,
            paid_amount: Cents::ZERO,
            target_amount: Cents::ZERO,
            error_message: None,
            last_updated: Utc::now(),
        }
    }
}

impl PaymentFlowState {
    fn advance(&self, status: FlowStatus) -> Self {
        Self {
            status,
            last_updated: Utc::now(),
            ..self.clone()
        }
    }
}

fn allowed(
    transition: &'static str,
    state: &PaymentFlowState,
    sources: &[FlowStatus],
) -> Option<()> {
    if sources.contains(&state.status) {
        Some(())
    } else {
        tracing::warn!(
            transition,
            status = %state.status,
            "Rejected flow transition"
        );
        None
    }
}

const ANY: &[FlowStatus] = &[
    FlowStatus::NotStarted,
    FlowStatus::AwaitingPaymentMethod,
    FlowStatus::Paying,
    FlowStatus::Success,
    FlowStatus::Failed,
    FlowStatus::ShowCancelConfirm,
    FlowStatus::CancelledRefunding,
    FlowStatus::CancelledRefunded,
    FlowStatus::StartingWash,
    FlowStatus::WaitingForMachine,
    FlowStatus::Completed,
];

const SELECTING: &[FlowStatus] = &[FlowStatus::AwaitingPaymentMethod, FlowStatus::Paying];

/// Transition functions over `PaymentFlowState`.
pub struct PaymentFlowStateMachine;

impl PaymentFlowStateMachine {
    /// Opens an attempt for `program`.
    ///
    /// The wash-machine fault check is the caller's precondition; this only
    /// checks that no attempt is in progress.
    pub fn start_payment_flow(
        state: &PaymentFlowState,
        program: WashProgram,
    ) -> Option<PaymentFlowState> {
        allowed("start_payment_flow", state, &[FlowStatus::NotStarted])?;
        Some(PaymentFlowState {
            status: FlowStatus::AwaitingPaymentMethod,
            target_amount: program.price,
            selected_program: Some(program),
            selected_payment_method: PaymentMethod::None,
            payment_confirmed: false,
            paid_amount: Cents::ZERO,
            error_message: None,
            last_updated: Utc::now(),
        })
    }

    pub fn select_payment_method(
        state: &PaymentFlowState,
        method: PaymentMethod,
    ) -> Option<PaymentFlowState> {
        allowed("select_payment_method", state, SELECTING)?;
        let mut next = state.advance(state.status);
        next.selected_payment_method = method;
        Some(next)
    }

    pub fn set_payment_confirmed(
        state: &PaymentFlowState,
        confirmed: bool,
    ) -> Option<PaymentFlowState> {
        allowed("set_payment_confirmed", state, SELECTING)?;
        let mut next = state.advance(state.status);
        next.payment_confirmed = confirmed;
        Some(next)
    }

    pub fn confirm_payment(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed(
            "confirm_payment",
            state,
            &[FlowStatus::AwaitingPaymentMethod],
        )?;
        if !state.payment_confirmed || state.selected_payment_method == PaymentMethod::None {
            tracing::warn!(
                confirmed = state.payment_confirmed,
                method = ?state.selected_payment_method,
                "Rejected confirm_payment: method not selected or not confirmed"
            );
            return None;
        }
        Some(state.advance(FlowStatus::Paying))
    }

    /// Publishes the running paid amount while collecting.
    pub fn update_paid_amount(state: &PaymentFlowState, paid: Cents) -> Option<PaymentFlowState> {
        allowed(
            "update_paid_amount",
            state,
            &[FlowStatus::Paying, FlowStatus::ShowCancelConfirm],
        )?;
        let mut next = state.advance(state.status);
        next.paid_amount = paid;
        Some(next)
    }

    pub fn payment_success(state: &PaymentFlowState, paid: Cents) -> Option<PaymentFlowState> {
        allowed("payment_success", state, &[FlowStatus::Paying])?;
        let mut next = state.advance(FlowStatus::Success);
        next.paid_amount = paid;
        next.error_message = None;
        Some(next)
    }

    pub fn payment_failed(state: &PaymentFlowState, code: ErrorCode) -> Option<PaymentFlowState> {
        allowed("payment_failed", state, &[FlowStatus::Paying])?;
        let mut next = state.advance(FlowStatus::Failed);
        next.error_message = Some(code);
        Some(next)
    }

    pub fn payment_cancelled(
        state: &PaymentFlowState,
        reason: ErrorCode,
    ) -> Option<PaymentFlowState> {
        allowed("payment_cancelled", state, &[FlowStatus::Paying])?;
        let mut next = state.advance(FlowStatus::CancelledRefunding);
        next.error_message = Some(reason);
        Some(next)
    }

    pub fn show_cancel_confirm(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("show_cancel_confirm", state, &[FlowStatus::Paying])?;
        Some(state.advance(FlowStatus::ShowCancelConfirm))
    }

    pub fn dismiss_cancel(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("dismiss_cancel", state, &[FlowStatus::ShowCancelConfirm])?;
        Some(state.advance(FlowStatus::Paying))
    }

    pub fn confirm_cancel(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("confirm_cancel", state, &[FlowStatus::ShowCancelConfirm])?;
        let mut next = state.advance(FlowStatus::CancelledRefunding);
        next.error_message = Some(ErrorCode::PaymentCancelled);
        Some(next)
    }

    pub fn cancel_refund_completed(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed(
            "cancel_refund_completed",
            state,
            &[FlowStatus::CancelledRefunding],
        )?;
        Some(state.advance(FlowStatus::CancelledRefunded))
    }

    /// The cancel refund stopped short; the terminal state carries what is
    /// still owed instead of the cancel code.
    pub fn cancel_refund_incomplete(
        state: &PaymentFlowState,
        code: ErrorCode,
    ) -> Option<PaymentFlowState> {
        allowed(
            "cancel_refund_incomplete",
            state,
            &[FlowStatus::CancelledRefunding],
        )?;
        let mut next = state.advance(FlowStatus::CancelledRefunded);
        next.error_message = Some(code);
        Some(next)
    }

    pub fn start_washing(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("start_washing", state, &[FlowStatus::Success])?;
        Some(state.advance(FlowStatus::StartingWash))
    }

    pub fn wait_for_machine(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("wait_for_machine", state, &[FlowStatus::StartingWash])?;
        Some(state.advance(FlowStatus::WaitingForMachine))
    }

    pub fn proceed_from_waiting(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed(
            "proceed_from_waiting",
            state,
            &[FlowStatus::WaitingForMachine],
        )?;
        Some(state.advance(FlowStatus::StartingWash))
    }

    pub fn complete_flow(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("complete_flow", state, &[FlowStatus::StartingWash])?;
        Some(state.advance(FlowStatus::Completed))
    }

    /// The wash could not be started after payment; the money goes back.
    pub fn abort_wash(state: &PaymentFlowState, code: ErrorCode) -> Option<PaymentFlowState> {
        allowed(
            "abort_wash",
            state,
            &[FlowStatus::StartingWash, FlowStatus::WaitingForMachine],
        )?;
        let mut next = state.advance(FlowStatus::Failed);
        next.error_message = Some(code);
        Some(next)
    }

    pub fn retry_payment(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("retry_payment", state, &[FlowStatus::Failed])?;
        let mut next = state.advance(FlowStatus::AwaitingPaymentMethod);
        next.selected_payment_method = PaymentMethod::None;
        next.payment_confirmed = false;
        next.paid_amount = Cents::ZERO;
        next.error_message = None;
        Some(next)
    }

    pub fn reset_to_selecting(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed(
            "reset_to_selecting",
            state,
            &[
                FlowStatus::AwaitingPaymentMethod,
                FlowStatus::Failed,
                FlowStatus::CancelledRefunded,
                FlowStatus::Completed,
            ],
        )?;
        Some(PaymentFlowState::default())
    }

    pub fn force_reset_to_not_started(state: &PaymentFlowState) -> Option<PaymentFlowState> {
        allowed("force_reset_to_not_started", state, ANY)?;
        if state.paid_amount > Cents::ZERO {
            tracing::info!(paid = %state.paid_amount, status = %state.status, "Force reset clears paid amount");
        }
        Some(PaymentFlowState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> WashProgram {
        WashProgram::new(1, "Basic", Cents(500))
    }

    fn paying(method: PaymentMethod) -> PaymentFlowState {
        let s = PaymentFlowState::default();
        let s = PaymentFlowStateMachine::start_payment_flow(&s, program()).unwrap();
        let s = PaymentFlowStateMachine::select_payment_method(&s, method).unwrap();
        let s = PaymentFlowStateMachine::set_payment_confirmed(&s, true).unwrap();
        PaymentFlowStateMachine::confirm_payment(&s).unwrap()
    }

    #[test]
    fn test_start_sets_target_from_program() {
        let s = PaymentFlowStateMachine::start_payment_flow(&PaymentFlowState::default(), program())
            .unwrap();
        assert_eq!(s.status, FlowStatus::AwaitingPaymentMethod);
        assert_eq!(s.target_amount, Cents(500));
        assert_eq!(s.paid_amount, Cents::ZERO);
    }

    #[test]
    fn test_start_rejected_while_paying() {
        let s = paying(PaymentMethod::Cash);
        assert!(PaymentFlowStateMachine::start_payment_flow(&s, program()).is_none());
    }

    #[test]
    fn test_confirm_requires_confirmation_and_method() {
        let s = PaymentFlowStateMachine::start_payment_flow(&PaymentFlowState::default(), program())
            .unwrap();
        assert!(PaymentFlowStateMachine::confirm_payment(&s).is_none());

        let s = PaymentFlowStateMachine::set_payment_confirmed(&s, true).unwrap();
        assert!(PaymentFlowStateMachine::confirm_payment(&s).is_none());

        let s = PaymentFlowStateMachine::select_payment_method(&s, PaymentMethod::Card).unwrap();
        let s = PaymentFlowStateMachine::confirm_payment(&s).unwrap();
        assert_eq!(s.status, FlowStatus::Paying);
    }

    #[test]
    fn test_method_selection_rejected_after_success() {
        let s = PaymentFlowStateMachine::payment_success(&paying(PaymentMethod::Cash), Cents(500))
            .unwrap();
        assert!(PaymentFlowStateMachine::select_payment_method(&s, PaymentMethod::Card).is_none());
        assert!(PaymentFlowStateMachine::set_payment_confirmed(&s, false).is_none());
    }

    #[test]
    fn test_outcomes_only_from_paying() {
        let idle = PaymentFlowState::default();
        assert!(PaymentFlowStateMachine::payment_success(&idle, Cents(1)).is_none());
        assert!(PaymentFlowStateMachine::payment_failed(&idle, ErrorCode::PaymentFailed).is_none());
        assert!(
            PaymentFlowStateMachine::payment_cancelled(&idle, ErrorCode::PaymentCancelled)
                .is_none()
        );

        let failed =
            PaymentFlowStateMachine::payment_failed(&paying(PaymentMethod::Cash), ErrorCode::PaymentTimeout)
                .unwrap();
        assert_eq!(failed.status, FlowStatus::Failed);
        assert_eq!(failed.error_message, Some(ErrorCode::PaymentTimeout));
    }

    #[test]
    fn test_cancel_confirmation_path() {
        let s = PaymentFlowStateMachine::show_cancel_confirm(&paying(PaymentMethod::Cash)).unwrap();
        let back = PaymentFlowStateMachine::dismiss_cancel(&s).unwrap();
        assert_eq!(back.status, FlowStatus::Paying);

        let s = PaymentFlowStateMachine::confirm_cancel(&s).unwrap();
        assert_eq!(s.status, FlowStatus::CancelledRefunding);
        let s = PaymentFlowStateMachine::cancel_refund_completed(&s).unwrap();
        assert_eq!(s.status, FlowStatus::CancelledRefunded);
        assert!(s.status.is_terminal());
    }

    #[test]
    fn test_incomplete_cancel_refund_keeps_the_owed_code() {
        let s = PaymentFlowStateMachine::payment_cancelled(
            &paying(PaymentMethod::Cash),
            ErrorCode::PaymentCancelled,
        )
        .unwrap();
        let s =
            PaymentFlowStateMachine::cancel_refund_incomplete(&s, ErrorCode::RefundIncomplete)
                .unwrap();
        assert_eq!(s.status, FlowStatus::CancelledRefunded);
        assert_eq!(s.error_message, Some(ErrorCode::RefundIncomplete));
        assert!(
            PaymentFlowStateMachine::cancel_refund_incomplete(&s, ErrorCode::RefundIncomplete)
                .is_none()
        );
    }

    #[test]
    fn test_wash_path_to_completed() {
        let s = PaymentFlowStateMachine::payment_success(&paying(PaymentMethod::Cash), Cents(500))
            .unwrap();
        let s = PaymentFlowStateMachine::start_washing(&s).unwrap();
        let s = PaymentFlowStateMachine::wait_for_machine(&s).unwrap();
        assert!(PaymentFlowStateMachine::complete_flow(&s).is_none());
        let s = PaymentFlowStateMachine::proceed_from_waiting(&s).unwrap();
        let s = PaymentFlowStateMachine::complete_flow(&s).unwrap();
        assert_eq!(s.status, FlowStatus::Completed);
    }

    #[test]
    fn test_retry_clears_attempt_fields() {
        let s = paying(PaymentMethod::Cash);
        let s = PaymentFlowStateMachine::update_paid_amount(&s, Cents(200)).unwrap();
        let s = PaymentFlowStateMachine::payment_failed(&s, ErrorCode::PaymentFailed).unwrap();
        let s = PaymentFlowStateMachine::retry_payment(&s).unwrap();
        assert_eq!(s.status, FlowStatus::AwaitingPaymentMethod);
        assert_eq!(s.paid_amount, Cents::ZERO);
        assert_eq!(s.target_amount, Cents(500));
        assert!(!s.payment_confirmed);
    }

    #[test]
    fn test_force_reset_from_anywhere_zeroes_paid() {
        let s = PaymentFlowStateMachine::update_paid_amount(&paying(PaymentMethod::Cash), Cents(300))
            .unwrap();
        let s = PaymentFlowStateMachine::force_reset_to_not_started(&s).unwrap();
        assert_eq!(s.status, FlowStatus::NotStarted);
        assert_eq!(s.paid_amount, Cents::ZERO);
        assert!(s.selected_program.is_none());
    }

    #[test]
    fn test_reset_to_selecting_rejected_mid_payment() {
        assert!(PaymentFlowStateMachine::reset_to_selecting(&paying(PaymentMethod::Cash)).is_none());
    }
}
