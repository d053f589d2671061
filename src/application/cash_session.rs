//! Acceptor lifecycle and paid-amount reconciliation of one cash attempt.

use crate::application::flow_handle::FlowHandle;
use crate::application::payout::Payout;
use crate::application::tracker::AmountTracker;
use crate::config::KioskConfig;
use crate::domain::flow::{FlowStatus, PaymentFlowStateMachine, PaymentMethod};
use crate::domain::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use crate::domain::ports::CashDeviceHandle;
use crate::domain::session::{AttemptId, SessionPhase};
use crate::domain::settlement::FinishReason;
use crate::error::{DeviceError, KioskError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    tracker: AmountTracker,
    enabled: BTreeSet<DeviceId>,
    /// Price and program name of the attempt, fixed when it begins.
    target: Cents,
    program: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            tracker: AmountTracker::new(),
            enabled: BTreeSet::new(),
            target: Cents::ZERO,
            program: String::new(),
        }
    }
}

/// Levels read at finalization and the delta they imply.
#[derive(Debug, Clone)]
pub struct SettledLevels {
    pub delta: Cents,
    /// Target captured when the attempt began.
    pub target: Cents,
    pub program: String,
    /// Fresh levels per device; `None` when the device could not be read.
    pub levels: Vec<(DeviceId, Option<DeviceLevelsSnapshot>)>,
}

/// Owns the bill and coin acceptors for the duration of one cash attempt.
///
/// All session state sits behind one async mutex, which is also the
/// re-entrancy lock of `begin_session`: a second caller waits for the first
/// to finish and then sees an active session.
pub struct CashSessionController {
    config: Arc<KioskConfig>,
    device: CashDeviceHandle,
    flow: Arc<FlowHandle>,
    payout: Payout,
    state: Mutex<SessionState>,
}

impl CashSessionController {
    pub fn new(config: Arc<KioskConfig>, device: CashDeviceHandle, flow: Arc<FlowHandle>) -> Self {
        let payout = Payout::new(device.clone(), config.clone());
        Self {
            config,
            device,
            flow,
            payout,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Price of the attempt that currently owns the session.
    pub async fn target(&self) -> Cents {
        self.state.lock().await.target
    }

    /// Guard for every acceptor mutation during collection.
    pub async fn is_session_allowed(&self) -> bool {
        let state = self.state.lock().await;
        self.collection_allowed(&state)
    }

    fn collection_allowed(&self, state: &SessionState) -> bool {
        let flow = self.flow.snapshot();
        state.phase.is_collecting()
            && flow.selected_payment_method == PaymentMethod::Cash
            && flow.status == FlowStatus::Paying
    }

    fn reject(&self, operation: &'static str, state: &SessionState) -> KioskError {
        let flow = self.flow.snapshot();
        tracing::error!(
            operation,
            phase = %state.phase,
            status = %flow.status,
            method = ?flow.selected_payment_method,
            "Rejected hardware call: session guard is closed"
        );
        KioskError::GuardRejected(operation)
    }

    /// Opens the cash session and enables every acceptor that can be
    /// accounted for.
    pub async fn begin_session(&self) -> Result<AttemptId> {
        let mut state = self.state.lock().await;
        if !state.phase.can_begin() {
            tracing::warn!(phase = %state.phase, "Cash session already active");
            return Err(KioskError::SessionAlreadyActive);
        }
        let flow = self.flow.snapshot();
        if flow.selected_payment_method != PaymentMethod::Cash || flow.status != FlowStatus::Paying {
            return Err(self.reject("begin_session", &state));
        }

        let attempt = AttemptId::new();
        state.tracker.clear();
        state.enabled.clear();
        state.phase = SessionPhase::Collecting { attempt };
        state.target = flow.target_amount;
        state.program = flow.selected_program.map(|p| p.name).unwrap_or_default();
        tracing::info!(attempt_id = %attempt, target = %state.target, "Beginning cash session");

        let started = tokio::time::timeout(
            self.config.session_start_timeout,
            self.device.start_cash_session(),
        )
        .await;
        let started = match started {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout("cash session start".into())),
        };
        if let Err(e) = started {
            tracing::error!(attempt_id = %attempt, error = %e, "Cash session did not start");
            state.phase = SessionPhase::Idle;
            return Err(e.into());
        }

        for device in DeviceId::ALL {
            self.enable_device(&mut state, attempt, device).await;
        }

        if state.enabled.is_empty() {
            tracing::error!(attempt_id = %attempt, "No acceptor could be enabled");
            if let Err(e) = self.device.stop_cash_session("no_acceptor").await {
                tracing::warn!(error = %e, "Failed to stop cash session");
            }
            state.tracker.clear();
            state.phase = SessionPhase::Idle;
            return Err(KioskError::NoAcceptorAvailable);
        }
        Ok(attempt)
    }

    async fn enable_device(&self, state: &mut SessionState, attempt: AttemptId, device: DeviceId) {
        if !self.collection_allowed(state) {
            self.reject("enable_acceptor", state);
            return;
        }

        // The zero-point is read while the acceptor is still closed, so
        // nothing inserted can end up inside it.
        let baseline = if state.tracker.has_baseline(device) {
            None
        } else {
            match self.device.read_current_levels(device).await {
                Ok(levels) => Some(levels),
                Err(e) => {
                    tracing::error!(
                        attempt_id = %attempt,
                        %device,
                        error = %e,
                        "Baseline unreadable; leaving acceptor disabled"
                    );
                    return;
                }
            }
        };

        if let Err(e) = self.device.enable_acceptor(device).await {
            tracing::warn!(attempt_id = %attempt, %device, error = %e, "Acceptor enable failed");
            return;
        }
        if let Some(baseline) = baseline {
            state.tracker.capture_baseline(device, baseline);
        }
        if let Err(e) = self.device.set_auto_accept(device, true).await {
            tracing::warn!(attempt_id = %attempt, %device, error = %e, "Auto-accept not set");
        }
        state.enabled.insert(device);

        match self.device.get_counters(device).await {
            Ok(counters) => tracing::debug!(%device, ?counters, "Acceptor enabled"),
            Err(e) => tracing::debug!(%device, error = %e, "Counters unavailable"),
        }
    }

    /// Reads every enabled device once and returns the session delta.
    ///
    /// A device whose levels cannot be read counts as zero for this tick.
    pub async fn poll_once(&self, attempt: AttemptId) -> Result<Cents> {
        let mut state = self.state.lock().await;
        if !state.phase.can_finish(attempt) {
            return Err(self.reject("poll", &state));
        }
        let enabled: Vec<DeviceId> = state.enabled.iter().copied().collect();
        for device in enabled {
            let read = match self.device.read_current_levels(device).await {
                Ok(levels) => Some(levels),
                Err(e) => {
                    tracing::warn!(attempt_id = %attempt, %device, error = %e, "Levels unreadable this tick");
                    None
                }
            };
            state.tracker.update_current(device, read);
        }
        Ok(state.tracker.session_delta())
    }

    /// Polls until the attempt has to be finalized and returns why.
    ///
    /// Per tick the exit checks run in a fixed order: cancel, then paid,
    /// then timeout. A cancel seen in the same tick as full payment wins.
    /// An open cancel dialog is not a cancel.
    pub async fn run_collection(
        &self,
        attempt: AttemptId,
        target: Cents,
        cancel: &CancellationToken,
    ) -> FinishReason {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published = Cents::ZERO;
        let mut last_publish: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(attempt_id = %attempt, "Cancel observed while waiting for tick");
                    return FinishReason::Cancel;
                }
                _ = ticker.tick() => {}
            }

            let paid = match self.poll_once(attempt).await {
                Ok(paid) => paid,
                Err(e) => {
                    tracing::error!(attempt_id = %attempt, error = %e, "Poll failed");
                    return FinishReason::Exception;
                }
            };

            let throttled = last_publish
                .is_some_and(|at| at.elapsed() < self.config.paid_update_min_interval);
            if paid != published && !throttled {
                self.flow
                    .apply(|s| PaymentFlowStateMachine::update_paid_amount(s, paid));
                published = paid;
                last_publish = Some(Instant::now());
            }

            if cancel.is_cancelled() {
                tracing::info!(attempt_id = %attempt, %paid, "Cancel wins over this tick");
                return FinishReason::Cancel;
            }
            if paid >= target {
                tracing::info!(attempt_id = %attempt, %paid, %target, "Target reached");
                return FinishReason::PaySuccess;
            }
            if started.elapsed() >= self.config.payment_timeout {
                tracing::warn!(attempt_id = %attempt, %paid, %target, "Payment timed out");
                return FinishReason::Timeout;
            }
        }
    }

    /// Hands `attempt` to the finalizer. False if it is not collecting.
    pub async fn begin_finishing(&self, attempt: AttemptId) -> bool {
        let mut state = self.state.lock().await;
        if !state.phase.can_finish(attempt) {
            tracing::warn!(attempt_id = %attempt, phase = %state.phase, "Attempt is not collecting");
            return false;
        }
        state.phase = SessionPhase::Finishing { attempt };
        true
    }

    /// Disables both acceptors, each independently of the other.
    pub async fn shutdown_acceptors(&self, reason: FinishReason) {
        let mut state = self.state.lock().await;
        for device in DeviceId::ALL {
            if let Err(e) = self.device.set_auto_accept(device, false).await {
                tracing::debug!(%device, error = %e, "Auto-accept not cleared");
            }
            match self.device.disable_acceptor(device).await {
                Ok(()) => {
                    state.enabled.remove(&device);
                }
                Err(e) => {
                    tracing::error!(%device, %reason, error = %e, "Acceptor disable failed");
                }
            }
        }
    }

    /// Fresh levels of both devices and the delta against the baselines.
    pub async fn settle(&self, attempt: AttemptId) -> Result<SettledLevels> {
        let mut state = self.state.lock().await;
        if !state.phase.is_finishing(attempt) {
            return Err(self.reject("settle", &state));
        }
        let mut levels = Vec::with_capacity(DeviceId::ALL.len());
        for device in DeviceId::ALL {
            let read = self.payout.read_levels(device).await;
            if read.is_none() && state.tracker.has_baseline(device) {
                tracing::error!(
                    attempt_id = %attempt,
                    %device,
                    "Levels unreadable at finalization; device delta counts as zero"
                );
            }
            state.tracker.update_current(device, read.clone());
            levels.push((device, read));
        }
        let delta = state.tracker.session_delta();
        Ok(SettledLevels {
            delta,
            target: state.target,
            program: state.program.clone(),
            levels,
        })
    }

    /// Whether a payout for `attempt` may touch the hardware now.
    pub async fn payout_allowed(&self, attempt: AttemptId) -> bool {
        let state = self.state.lock().await;
        match state.phase {
            SessionPhase::Finishing { attempt: a } | SessionPhase::Finalized { attempt: a } => {
                a == attempt
            }
            _ => false,
        }
    }

    /// Whether a payout outside any attempt may run: no session is open.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.phase.can_begin()
    }

    /// Drops the baselines and closes the session after finalization.
    pub async fn release(&self, attempt: AttemptId, reason: FinishReason) {
        let mut state = self.state.lock().await;
        if !state.phase.is_finishing(attempt) {
            tracing::warn!(attempt_id = %attempt, phase = %state.phase, "Release for an attempt that is not finishing");
            return;
        }
        if let Err(e) = self.device.stop_cash_session(reason.as_str()).await {
            tracing::warn!(attempt_id = %attempt, error = %e, "Failed to stop cash session");
        }
        state.tracker.clear();
        state.enabled.clear();
        state.phase = SessionPhase::Finalized { attempt };
    }

    /// Tears the session down without settling. Used on operator reset
    /// when nothing is collecting.
    pub async fn end_session(&self, reason: &str) {
        let mut state = self.state.lock().await;
        if matches!(state.phase, SessionPhase::Collecting { .. } | SessionPhase::Finishing { .. }) {
            tracing::warn!(phase = %state.phase, "Session is still owned by an attempt; not ending");
            return;
        }
        for device in DeviceId::ALL {
            if let Err(e) = self.device.disable_acceptor(device).await {
                tracing::warn!(%device, error = %e, "Acceptor disable failed");
            }
        }
        if let Err(e) = self.device.stop_cash_session(reason).await {
            tracing::warn!(error = %e, "Failed to stop cash session");
        }
        state.tracker.clear();
        state.enabled.clear();
        state.phase = SessionPhase::Idle;
    }

    pub(crate) fn payout(&self) -> &Payout {
        &self.payout
    }
}
