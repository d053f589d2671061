use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the wash could not be started after payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WashRefundReason {
    PreviousCarNotLeft,
    CarNotInPosition,
    DeviceNotReady,
    SendModeFailed,
    NotEnteredAutoStatus,
}

impl WashRefundReason {
    pub fn code(&self) -> ErrorCode {
        match self {
            WashRefundReason::PreviousCarNotLeft => ErrorCode::PreviousCarNotLeft,
            WashRefundReason::CarNotInPosition => ErrorCode::CarNotInPosition,
            WashRefundReason::DeviceNotReady => ErrorCode::DeviceNotReady,
            WashRefundReason::SendModeFailed => ErrorCode::SendModeFailed,
            WashRefundReason::NotEnteredAutoStatus => ErrorCode::NotEnteredAutoStatus,
        }
    }
}

impl fmt::Display for WashRefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WashRefundReason::PreviousCarNotLeft => "previous_car_not_left",
            WashRefundReason::CarNotInPosition => "car_not_in_position",
            WashRefundReason::DeviceNotReady => "device_not_ready",
            WashRefundReason::SendModeFailed => "send_mode_failed",
            WashRefundReason::NotEnteredAutoStatus => "not_entered_auto_status",
        };
        f.write_str(s)
    }
}

/// Post-payment gate and start sequence, as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WashStartState {
    /// Not started yet for the current attempt.
    #[default]
    Idle,
    WaitingPreviousCarLeave,
    WaitingCarInPosition,
    WaitingDeviceReady,
    SendingMode,
    ConfirmingStart,
    Success,
    Refunding(WashRefundReason),
}

impl WashStartState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WashStartState::Success | WashStartState::Refunding(_))
    }
}
