//! Replays a scenario file against the simulated kiosk hardware.
//!
//! Each attempt row plays one customer: pick the program, pick the method,
//! confirm, feed the machine, optionally cancel, then reset the kiosk for
//! the next customer.

use crate::application::orchestrator::{CancelSource, KioskDevices, PaymentOrchestrator};
use crate::config::KioskConfig;
use crate::domain::flow::{FlowStatus, PaymentMethod};
use crate::domain::money::DeviceId;
use crate::domain::ports::{PosOutcome, SettlementStoreHandle};
use crate::domain::settlement::SettlementDecision;
use crate::error::Result;
use crate::infrastructure::simulated::{
    RecordingPrinter, SimulatedCashDevice, SimulatedPosTerminal, SimulatedWashMachine, WashSignal,
};
use crate::interfaces::csv::scenario_reader::{AttemptSpec, ScenarioStep, WashBehaviour};
use std::sync::Arc;

/// Decisions produced by one attempt row, tagged with its 1-based position.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub seq: usize,
    pub decisions: Vec<SettlementDecision>,
}

pub struct ScenarioRunner {
    cash: SimulatedCashDevice,
    wash: SimulatedWashMachine,
    pos: SimulatedPosTerminal,
    printer: RecordingPrinter,
    orchestrator: PaymentOrchestrator,
    seq: usize,
}

impl ScenarioRunner {
    pub fn new(config: KioskConfig, store: SettlementStoreHandle) -> Self {
        let cash = SimulatedCashDevice::new();
        let wash = SimulatedWashMachine::new();
        let pos = SimulatedPosTerminal::new();
        let printer = RecordingPrinter::new();
        let devices = KioskDevices {
            cash: Arc::new(cash.clone()),
            wash: Arc::new(wash.clone()),
            pos: Arc::new(pos.clone()),
            printer: Arc::new(printer.clone()),
            store,
        };
        Self {
            cash,
            wash,
            pos,
            printer,
            orchestrator: PaymentOrchestrator::new(config, devices),
            seq: 0,
        }
    }

    pub fn orchestrator(&self) -> &PaymentOrchestrator {
        &self.orchestrator
    }

    pub fn cash(&self) -> &SimulatedCashDevice {
        &self.cash
    }

    pub fn printer(&self) -> &RecordingPrinter {
        &self.printer
    }

    /// Applies one step. Stock rows yield `None`.
    pub async fn apply(&mut self, step: ScenarioStep) -> Result<Option<AttemptOutcome>> {
        match step {
            ScenarioStep::Stock {
                device,
                denomination,
                count,
            } => {
                tracing::debug!(%device, %denomination, count, "Stocking payout storage");
                self.cash.stock(device, denomination, count);
                Ok(None)
            }
            ScenarioStep::Attempt(spec) => {
                self.seq += 1;
                let seq = self.seq;
                let result = self.run_attempt(seq, spec).await;
                self.orchestrator.reset().await;
                let unused = self.cash.take_back_insertions();
                if !unused.is_empty() {
                    tracing::warn!(seq, pieces = unused.len(), "Pieces never inserted");
                }
                result.map(|decisions| Some(AttemptOutcome { seq, decisions }))
            }
        }
    }

    async fn run_attempt(&self, seq: usize, mut spec: AttemptSpec) -> Result<Vec<SettlementDecision>> {
        spec.program.id = seq as u32;
        self.configure_wash(spec.wash);
        tracing::info!(seq, program = %spec.program.name, method = ?spec.method, "Replaying attempt");

        self.orchestrator.select_program(spec.program.clone()).await?;
        self.orchestrator.select_payment_method(spec.method)?;
        self.orchestrator.set_payment_confirmed(true)?;

        let report = match spec.method {
            PaymentMethod::Card => {
                if spec.cancel {
                    self.pos.push_outcome(PosOutcome::Cancelled);
                }
                self.orchestrator.process_payment().await?
            }
            _ => {
                for bill in &spec.bills {
                    self.cash.queue_insertion(DeviceId::Bill, *bill);
                }
                for coin in &spec.coins {
                    self.cash.queue_insertion(DeviceId::Coin, *coin);
                }
                if spec.cancel {
                    let payment = self.orchestrator.process_payment();
                    tokio::pin!(payment);
                    tokio::select! {
                        biased;
                        report = &mut payment => report?,
                        () = self.cancel_when_fed(&spec) => payment.await?,
                    }
                } else {
                    self.orchestrator.process_payment().await?
                }
            }
        };

        Ok(report.decision.into_iter().chain(report.wash_refund).collect())
    }

    /// Presses cancel once every queued piece has been counted. Returns
    /// without cancelling if the attempt ended first.
    async fn cancel_when_fed(&self, spec: &AttemptSpec) {
        let inserted = spec.inserted();
        let mut flow = self.orchestrator.subscribe_flow();
        let funded = flow
            .wait_for(|state| match state.status {
                FlowStatus::Paying => {
                    self.cash.pending_insertions() == 0 && state.paid_amount == inserted
                }
                FlowStatus::AwaitingPaymentMethod | FlowStatus::ShowCancelConfirm => false,
                _ => true,
            })
            .await
            .is_ok_and(|state| state.status == FlowStatus::Paying);
        if !funded {
            return;
        }

        if let Err(e) = self
            .orchestrator
            .on_user_cancel_requested(CancelSource::CancelButton)
            .await
        {
            tracing::warn!(error = %e, "Cancel request rejected");
            return;
        }
        if let Err(e) = self.orchestrator.confirm_cancel_and_refund() {
            tracing::warn!(error = %e, "Cancel confirmation rejected");
        }
    }

    fn configure_wash(&self, behaviour: WashBehaviour) {
        let wash = &self.wash;
        wash.set_fault(false);
        wash.script(WashSignal::PreviousCarPresent, &[], Some(false));
        wash.script(WashSignal::CarInPosition, &[], Some(true));
        wash.script(WashSignal::DeviceReady, &[], Some(true));
        wash.script(WashSignal::RunningAutomatic, &[], Some(true));
        wash.script_send_mode(&[], Some(true));

        match behaviour {
            WashBehaviour::Healthy => {}
            WashBehaviour::PreviousCarStays => {
                wash.script(WashSignal::PreviousCarPresent, &[], Some(true))
            }
            WashBehaviour::NoCar => wash.script(WashSignal::CarInPosition, &[], Some(false)),
            WashBehaviour::NotReady => wash.script(WashSignal::DeviceReady, &[], Some(false)),
            WashBehaviour::SendFails => wash.script_send_mode(&[], None),
            WashBehaviour::NoAutomatic => {
                wash.script(WashSignal::RunningAutomatic, &[], Some(false))
            }
            WashBehaviour::Fault => wash.set_fault(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::WashProgram;
    use crate::domain::money::Cents;
    use crate::domain::settlement::{FinalState, FinishReason};
    use crate::error::{ErrorCode, KioskError};
    use crate::infrastructure::in_memory::InMemorySettlementStore;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(KioskConfig::default(), Arc::new(InMemorySettlementStore::new()))
    }

    fn cash_attempt(price: u64, bills: &[u64], coins: &[u64], cancel: bool) -> ScenarioStep {
        ScenarioStep::Attempt(AttemptSpec {
            program: WashProgram::new(0, "Basic", Cents(price)),
            method: PaymentMethod::Cash,
            bills: bills.iter().copied().map(Cents).collect(),
            coins: coins.iter().copied().map(Cents).collect(),
            cancel,
            wash: WashBehaviour::Healthy,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_exact_cash_payment() {
        let mut runner = runner();
        let outcome = runner
            .apply(cash_attempt(500, &[500], &[], false))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.seq, 1);
        assert_eq!(outcome.decisions.len(), 1);
        let decision = &outcome.decisions[0];
        assert!(decision.success);
        assert_eq!(decision.kept, Cents(500));
        assert_eq!(runner.printer().receipts().len(), 1);
        assert_eq!(runner.orchestrator().flow_state().status, FlowStatus::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_stock_then_change() {
        let mut runner = runner();
        let stocked = runner
            .apply(ScenarioStep::Stock {
                device: DeviceId::Coin,
                denomination: Cents(200),
                count: 3,
            })
            .await
            .unwrap();
        assert!(stocked.is_none());

        let outcome = runner
            .apply(cash_attempt(500, &[500], &[200], false))
            .await
            .unwrap()
            .unwrap();
        let decision = &outcome.decisions[0];
        assert_eq!(decision.paid, Cents(700));
        assert_eq!(decision.change_dispensed, Cents(200));
        assert_eq!(decision.final_state, FinalState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_cancel_refunds_inserted_cash() {
        let mut runner = runner();
        let outcome = runner
            .apply(cash_attempt(1000, &[500], &[], true))
            .await
            .unwrap()
            .unwrap();

        let decision = &outcome.decisions[0];
        assert_eq!(decision.reason, FinishReason::Cancel);
        assert_eq!(decision.refund_dispensed, Cents(500));
        assert_eq!(decision.final_state, FinalState::Cancelled);
        assert_eq!(runner.cash().dispensed_total(), Cents(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_wash_failure_adds_refund_decision() {
        let mut runner = runner();
        let mut step = cash_attempt(500, &[500], &[], false);
        if let ScenarioStep::Attempt(spec) = &mut step {
            spec.wash = WashBehaviour::NoCar;
        }
        let outcome = runner.apply(step).await.unwrap().unwrap();

        assert_eq!(outcome.decisions.len(), 2);
        let refund = &outcome.decisions[1];
        assert!(matches!(refund.reason, FinishReason::WashAborted(_)));
        assert_eq!(refund.error, Some(ErrorCode::CarNotInPosition));
        assert_eq!(refund.refund_dispensed, Cents(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_machine_fault_skips_attempt() {
        let mut runner = runner();
        let mut step = cash_attempt(500, &[500], &[], false);
        if let ScenarioStep::Attempt(spec) = &mut step {
            spec.wash = WashBehaviour::Fault;
        }
        let err = runner.apply(step).await.unwrap_err();
        assert!(matches!(err, KioskError::MachineFault));
        assert_eq!(runner.cash().pending_insertions(), 0);

        // The next customer finds a healthy kiosk again.
        let outcome = runner
            .apply(cash_attempt(500, &[500], &[], false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.seq, 2);
        assert!(outcome.decisions[0].success);
    }
}
