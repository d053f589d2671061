//! Denomination-level payout through the cash device.

use crate::config::KioskConfig;
use crate::domain::change::{ChangeCalculator, ChangeFailure, ChangeInventory, ChangePlan};
use crate::domain::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use crate::domain::ports::CashDeviceHandle;
use crate::domain::session::AttemptId;
use crate::error::ErrorCode;
use std::sync::Arc;

/// Re-plans a refund at most this many times after pieces fail.
const REFUND_ROUNDS: usize = 3;

/// Result of dispensing one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOutcome {
    pub dispensed: Cents,
    /// The piece that could not be paid out; the rest of the plan was skipped.
    pub failed_at: Option<(DeviceId, Cents)>,
}

impl PlanOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_at.is_none()
    }
}

/// Result of a refund of a fixed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundOutcome {
    pub dispensed: Cents,
    pub remaining: Cents,
    pub error: Option<ErrorCode>,
}

/// Dispenses change and refunds piece by piece.
///
/// Callers own the guards: nothing here checks the session phase.
pub struct Payout {
    device: CashDeviceHandle,
    config: Arc<KioskConfig>,
}

impl Payout {
    pub fn new(device: CashDeviceHandle, config: Arc<KioskConfig>) -> Self {
        Self { device, config }
    }

    /// Reads the levels of `device`, retrying at the poll cadence.
    pub async fn read_levels(&self, device: DeviceId) -> Option<DeviceLevelsSnapshot> {
        let attempts = self.config.levels_read_attempts.max(1);
        for attempt in 1..=attempts {
            match self.device.read_current_levels(device).await {
                Ok(levels) => return Some(levels),
                Err(e) => {
                    tracing::warn!(%device, attempt, error = %e, "Levels read failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        None
    }

    /// Fresh dispensable stock of both units.
    pub async fn read_inventory(&self) -> Result<ChangeInventory, ChangeFailure> {
        let mut levels = Vec::with_capacity(DeviceId::ALL.len());
        for device in DeviceId::ALL {
            levels.push((device, self.read_levels(device).await));
        }
        ChangeInventory::from_levels(&levels)
    }

    /// One piece with unit-level retries. Returns whether it came out.
    async fn dispense_piece(&self, attempt: AttemptId, device: DeviceId, denomination: Cents) -> bool {
        let attempts = self.config.dispense_attempts.max(1);
        for n in 1..=attempts {
            match self
                .device
                .dispense_value(device, denomination, &self.config.currency)
                .await
            {
                Ok(true) => {
                    tracing::debug!(attempt_id = %attempt, %device, %denomination, "Dispensed");
                    return true;
                }
                Ok(false) => {
                    tracing::warn!(
                        attempt_id = %attempt,
                        %device,
                        %denomination,
                        try_no = n,
                        "Dispense refused by unit"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        attempt_id = %attempt,
                        %device,
                        %denomination,
                        try_no = n,
                        error = %e,
                        "Dispense failed"
                    );
                }
            }
            if n < attempts {
                tokio::time::sleep(self.config.dispense_retry_delay).await;
            }
        }
        tracing::error!(attempt_id = %attempt, %device, %denomination, "Giving up on piece");
        false
    }

    /// Dispenses `plan` largest piece first and stops at the first piece
    /// that cannot be paid out.
    pub async fn dispense_plan(&self, attempt: AttemptId, plan: &ChangePlan) -> PlanOutcome {
        let mut dispensed = Cents::ZERO;
        for line in plan.lines() {
            for _ in 0..line.count {
                if !self
                    .dispense_piece(attempt, line.device, line.denomination)
                    .await
                {
                    return PlanOutcome {
                        dispensed,
                        failed_at: Some((line.device, line.denomination)),
                    };
                }
                dispensed += line.denomination;
            }
        }
        PlanOutcome {
            dispensed,
            failed_at: None,
        }
    }

    /// Pays back exactly `amount`, re-planning around pieces that fail.
    ///
    /// `avoid` lists pieces known to be stuck before the refund starts.
    pub async fn refund(
        &self,
        attempt: AttemptId,
        amount: Cents,
        avoid: &[(DeviceId, Cents)],
    ) -> RefundOutcome {
        let mut blocked: Vec<(DeviceId, Cents)> = avoid.to_vec();
        let mut dispensed = Cents::ZERO;
        let mut error = None;

        for round in 0..REFUND_ROUNDS {
            let remaining = amount.saturating_sub(dispensed);
            if remaining.is_zero() {
                break;
            }
            let mut inventory = match self.read_inventory().await {
                Ok(inventory) => inventory,
                Err(failure) => {
                    error = Some(failure.code());
                    break;
                }
            };
            for (device, denomination) in &blocked {
                inventory.exclude(*device, *denomination);
            }
            let plan = match ChangeCalculator::plan(remaining, &inventory) {
                Ok(plan) => plan,
                Err(failure) => {
                    tracing::error!(
                        attempt_id = %attempt,
                        %remaining,
                        %failure,
                        "No refund plan"
                    );
                    error = Some(failure.code());
                    break;
                }
            };
            let outcome = self.dispense_plan(attempt, &plan).await;
            dispensed += outcome.dispensed;
            match outcome.failed_at {
                None => {
                    error = None;
                }
                Some(piece) => {
                    tracing::warn!(attempt_id = %attempt, round, "Refund piece failed; re-planning");
                    blocked.push(piece);
                    error = Some(ErrorCode::RefundIncomplete);
                }
            }
        }

        let remaining = amount.saturating_sub(dispensed);
        if !remaining.is_zero() && error.is_none() {
            error = Some(ErrorCode::RefundIncomplete);
        }
        RefundOutcome {
            dispensed,
            remaining,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::simulated::SimulatedCashDevice;

    fn payout(cash: &SimulatedCashDevice) -> Payout {
        Payout::new(Arc::new(cash.clone()), Arc::new(KioskConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_dispensed_largest_first() {
        let cash = SimulatedCashDevice::new()
            .with_stock(DeviceId::Bill, Cents(500), 1)
            .with_stock(DeviceId::Coin, Cents(200), 2);
        let inventory = payout(&cash).read_inventory().await.unwrap();
        let plan = ChangeCalculator::plan(Cents(900), &inventory).unwrap();

        let outcome = payout(&cash).dispense_plan(AttemptId::new(), &plan).await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.dispensed, Cents(900));
        assert_eq!(
            cash.dispensed(),
            vec![
                (DeviceId::Bill, Cents(500)),
                (DeviceId::Coin, Cents(200)),
                (DeviceId::Coin, Cents(200)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_per_piece() {
        let cash = SimulatedCashDevice::new().with_stock(DeviceId::Coin, Cents(200), 1);
        cash.fail_dispense(DeviceId::Coin, Cents(200), 2);
        let plan = ChangeCalculator::plan(
            Cents(200),
            &ChangeInventory::new().with_stock(DeviceId::Coin, Cents(200), 1),
        )
        .unwrap();

        let outcome = payout(&cash).dispense_plan(AttemptId::new(), &plan).await;

        assert!(outcome.is_complete());
        assert_eq!(cash.count_calls("dispense:coin:200"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_replans_around_jammed_piece() {
        let cash = SimulatedCashDevice::new()
            .with_stock(DeviceId::Coin, Cents(200), 1)
            .with_stock(DeviceId::Coin, Cents(100), 2);
        cash.jam(DeviceId::Coin, Cents(200));

        let outcome = payout(&cash)
            .refund(AttemptId::new(), Cents(200), &[])
            .await;

        assert_eq!(outcome.dispensed, Cents(200));
        assert_eq!(outcome.remaining, Cents::ZERO);
        assert_eq!(outcome.error, None);
        assert_eq!(
            cash.dispensed(),
            vec![(DeviceId::Coin, Cents(100)), (DeviceId::Coin, Cents(100))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_reports_what_is_still_owed() {
        let cash = SimulatedCashDevice::new()
            .with_stock(DeviceId::Bill, Cents(500), 1)
            .with_stock(DeviceId::Coin, Cents(200), 1);
        cash.jam(DeviceId::Coin, Cents(200));

        let outcome = payout(&cash)
            .refund(AttemptId::new(), Cents(700), &[])
            .await;

        assert_eq!(outcome.dispensed, Cents(500));
        assert_eq!(outcome.remaining, Cents(200));
        assert_eq!(outcome.error, Some(ErrorCode::InsufficientSum));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_without_readable_levels() {
        let cash = SimulatedCashDevice::new();
        cash.set_levels_offline(DeviceId::Bill);
        cash.set_levels_offline(DeviceId::Coin);

        let outcome = payout(&cash)
            .refund(AttemptId::new(), Cents(300), &[])
            .await;

        assert_eq!(outcome.dispensed, Cents::ZERO);
        assert_eq!(outcome.remaining, Cents(300));
        assert_eq!(outcome.error, Some(ErrorCode::LevelsUnavailable));
        assert_eq!(cash.count_calls("dispense"), 0);
    }
}
