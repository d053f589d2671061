use crate::domain::flow::PaymentFlowState;
use crate::error::{KioskError, Result};
use tokio::sync::watch;

/// The single live `PaymentFlowState`, observable by the UI.
///
/// Transitions are applied atomically: the state machine function sees the
/// latest state and its result replaces it, or nothing changes.
pub struct FlowHandle {
    tx: watch::Sender<PaymentFlowState>,
}

impl Default for FlowHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PaymentFlowState::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> PaymentFlowState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PaymentFlowState> {
        self.tx.subscribe()
    }

    /// Applies `transition`; returns whether it was accepted.
    pub fn apply<F>(&self, transition: F) -> bool
    where
        F: FnOnce(&PaymentFlowState) -> Option<PaymentFlowState>,
    {
        self.tx.send_if_modified(|state| match transition(state) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        })
    }

    /// Like `apply`, but a rejection becomes `TransitionRejected(name)`.
    pub fn try_apply<F>(&self, name: &'static str, transition: F) -> Result<()>
    where
        F: FnOnce(&PaymentFlowState) -> Option<PaymentFlowState>,
    {
        if self.apply(transition) {
            Ok(())
        } else {
            Err(KioskError::TransitionRejected(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::{FlowStatus, PaymentFlowStateMachine, WashProgram};
    use crate::domain::money::Cents;

    #[tokio::test]
    async fn test_subscribers_see_accepted_transitions_only() {
        let flow = FlowHandle::new();
        let mut rx = flow.subscribe();

        assert!(!flow.apply(PaymentFlowStateMachine::confirm_payment));
        assert!(!rx.has_changed().unwrap());

        let program = WashProgram::new(1, "Basic", Cents(500));
        flow.try_apply("start_payment_flow", |s| {
            PaymentFlowStateMachine::start_payment_flow(s, program)
        })
        .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().status,
            FlowStatus::AwaitingPaymentMethod
        );
    }

    #[test]
    fn test_try_apply_reports_rejection() {
        let flow = FlowHandle::new();
        let result = flow.try_apply("complete_flow", PaymentFlowStateMachine::complete_flow);
        assert!(matches!(result, Err(KioskError::TransitionRejected("complete_flow"))));
    }
}
