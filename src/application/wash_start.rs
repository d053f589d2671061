//! Gate checks and start command of the wash machine after payment.

use crate::config::{GateWindow, WashStartConfig};
use crate::domain::ports::WashMachineHandle;
use crate::domain::wash::{WashRefundReason, WashStartState};
use crate::error::DeviceResult;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// A register read and the value it has to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    PreviousCarGone,
    CarInPosition,
    DeviceReady,
    RunningAutomatic,
}

impl Gate {
    fn name(&self) -> &'static str {
        match self {
            Gate::PreviousCarGone => "previous_car_gone",
            Gate::CarInPosition => "car_in_position",
            Gate::DeviceReady => "device_ready",
            Gate::RunningAutomatic => "running_automatic",
        }
    }
}

/// Drives the sequence `WaitingPreviousCarLeave → WaitingCarInPosition →
/// WaitingDeviceReady → SendingMode → ConfirmingStart → Success`, or ends in
/// `Refunding(reason)`. Progress is published on a watch channel.
pub struct WashStartController {
    config: WashStartConfig,
    machine: WashMachineHandle,
    tx: watch::Sender<WashStartState>,
}

impl WashStartController {
    pub fn new(config: WashStartConfig, machine: WashMachineHandle) -> Self {
        let (tx, _rx) = watch::channel(WashStartState::Idle);
        Self {
            config,
            machine,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WashStartState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> WashStartState {
        *self.tx.borrow()
    }

    pub fn reset(&self) {
        self.publish(WashStartState::Idle);
    }

    fn publish(&self, state: WashStartState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?*current, to = ?state, "Wash start state");
                *current = state;
                true
            }
        });
    }

    fn refunding(&self, reason: WashRefundReason) -> WashRefundReason {
        tracing::warn!(%reason, "Wash start failed");
        self.publish(WashStartState::Refunding(reason));
        reason
    }

    /// Gates, then start. The error is the refund reason.
    pub async fn run(&self, mode: u32) -> Result<(), WashRefundReason> {
        self.await_gates().await?;
        self.start_machine(mode).await
    }

    /// Waits for the bay: previous car gone, new car in position, machine ready.
    pub async fn await_gates(&self) -> Result<(), WashRefundReason> {
        let steps = [
            (
                WashStartState::WaitingPreviousCarLeave,
                Gate::PreviousCarGone,
                self.config.previous_car,
                WashRefundReason::PreviousCarNotLeft,
            ),
            (
                WashStartState::WaitingCarInPosition,
                Gate::CarInPosition,
                self.config.car_in_position,
                WashRefundReason::CarNotInPosition,
            ),
            (
                WashStartState::WaitingDeviceReady,
                Gate::DeviceReady,
                self.config.device_ready,
                WashRefundReason::DeviceNotReady,
            ),
        ];
        for (state, gate, window, reason) in steps {
            self.publish(state);
            if !self.await_gate(gate, window).await {
                return Err(self.refunding(reason));
            }
        }
        Ok(())
    }

    /// Sends `mode` and waits for automatic operation, in up to
    /// `start_rounds` rounds.
    pub async fn start_machine(&self, mode: u32) -> Result<(), WashRefundReason> {
        let rounds = self.config.start_rounds.max(1);
        for round in 1..=rounds {
            self.publish(WashStartState::SendingMode);
            if !self.send_mode(mode).await {
                return Err(self.refunding(WashRefundReason::SendModeFailed));
            }

            self.publish(WashStartState::ConfirmingStart);
            if self
                .await_gate(Gate::RunningAutomatic, self.config.confirm)
                .await
            {
                tracing::info!(mode, round, "Wash machine running");
                self.publish(WashStartState::Success);
                return Ok(());
            }
            tracing::warn!(mode, round, "Machine did not enter automatic; resending mode");
        }
        Err(self.refunding(WashRefundReason::NotEnteredAutoStatus))
    }

    /// One attempt plus `send_mode_retries` retries.
    async fn send_mode(&self, mode: u32) -> bool {
        let attempts = self.config.send_mode_retries + 1;
        for attempt in 1..=attempts {
            match self.machine.send_mode(mode).await {
                Ok(true) => return true,
                Ok(false) => tracing::warn!(mode, attempt, "Mode not acknowledged"),
                Err(e) => tracing::warn!(mode, attempt, error = %e, "Mode send failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.send_mode_retry_delay).await;
            }
        }
        false
    }

    async fn read(&self, gate: Gate) -> DeviceResult<bool> {
        match gate {
            Gate::PreviousCarGone => self.machine.previous_car_present().await.map(|present| !present),
            Gate::CarInPosition => self.machine.car_in_position().await,
            Gate::DeviceReady => self.machine.device_ready().await,
            Gate::RunningAutomatic => self.machine.is_running_automatic().await,
        }
    }

    /// Polls `gate` every `window.interval` until `required_consecutive`
    /// good reads in a row, or `window.cap` runs out. A failed read breaks
    /// the streak like a bad one.
    async fn await_gate(&self, gate: Gate, window: GateWindow) -> bool {
        let required = self.config.required_consecutive.max(1);
        let polling = async {
            let mut ticker = tokio::time::interval(window.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut streak = 0u32;
            loop {
                ticker.tick().await;
                match self.read(gate).await {
                    Ok(true) => {
                        streak += 1;
                        if streak >= required {
                            return;
                        }
                    }
                    Ok(false) => streak = 0,
                    Err(e) => {
                        tracing::warn!(gate = gate.name(), error = %e, "Gate read failed");
                        streak = 0;
                    }
                }
            }
        };
        match tokio::time::timeout(window.cap, polling).await {
            Ok(()) => {
                tracing::debug!(gate = gate.name(), "Gate passed");
                true
            }
            Err(_) => {
                tracing::warn!(gate = gate.name(), cap = ?window.cap, "Gate timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::simulated::{SimulatedWashMachine, WashSignal};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn controller(machine: &SimulatedWashMachine) -> WashStartController {
        WashStartController::new(WashStartConfig::default(), Arc::new(machine.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_bay_starts() {
        let machine = SimulatedWashMachine::new();
        let wash = controller(&machine);

        wash.run(3).await.unwrap();

        assert_eq!(wash.state(), WashStartState::Success);
        assert_eq!(machine.modes_sent(), vec![3]);
        assert_eq!(machine.reads(WashSignal::PreviousCarPresent), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_car_never_leaves() {
        let machine = SimulatedWashMachine::new();
        machine.script(WashSignal::PreviousCarPresent, &[], Some(true));
        let wash = controller(&machine);
        let started = Instant::now();

        let result = wash.run(1).await;

        assert_eq!(result, Err(WashRefundReason::PreviousCarNotLeft));
        assert_eq!(
            wash.state(),
            WashStartState::Refunding(WashRefundReason::PreviousCarNotLeft)
        );
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(machine.modes_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_sensor_needs_consecutive_reads() {
        let machine = SimulatedWashMachine::new();
        machine.script(
            WashSignal::CarInPosition,
            &[Some(true), Some(false), Some(true), None, Some(true)],
            Some(true),
        );
        let wash = controller(&machine);

        wash.await_gates().await.unwrap();

        assert_eq!(machine.reads(WashSignal::CarInPosition), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_blocks_send() {
        let machine = SimulatedWashMachine::new();
        machine.script(WashSignal::DeviceReady, &[], Some(false));
        let wash = controller(&machine);

        assert_eq!(wash.run(1).await, Err(WashRefundReason::DeviceNotReady));
        assert_eq!(machine.send_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_mode_retried_three_times() {
        let machine = SimulatedWashMachine::new();
        machine.script_send_mode(&[], None);
        let wash = controller(&machine);

        assert_eq!(
            wash.start_machine(2).await,
            Err(WashRefundReason::SendModeFailed)
        );
        assert_eq!(machine.send_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_mode_recovers_after_retry() {
        let machine = SimulatedWashMachine::new();
        machine.script_send_mode(&[None, Some(false)], Some(true));
        let wash = controller(&machine);

        wash.start_machine(2).await.unwrap();
        assert_eq!(machine.send_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_automatic_after_three_rounds() {
        let machine = SimulatedWashMachine::new();
        machine.script(WashSignal::RunningAutomatic, &[], Some(false));
        let wash = controller(&machine);

        assert_eq!(
            wash.start_machine(2).await,
            Err(WashRefundReason::NotEnteredAutoStatus)
        );
        assert_eq!(machine.modes_sent(), vec![2, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_round_confirms() {
        let machine = SimulatedWashMachine::new();
        // Enough stopped reads to cover the whole first confirmation window.
        let stopped = vec![Some(false); 11];
        machine.script(WashSignal::RunningAutomatic, &stopped, Some(true));
        let wash = controller(&machine);

        wash.start_machine(2).await.unwrap();
        assert_eq!(machine.modes_sent(), vec![2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_progress() {
        let machine = SimulatedWashMachine::new();
        let wash = controller(&machine);
        let rx = wash.subscribe();

        wash.run(1).await.unwrap();
        assert_eq!(*rx.borrow(), WashStartState::Success);
    }
}
