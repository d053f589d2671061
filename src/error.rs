use crate::domain::change::ChangeFailure;
use crate::domain::money::Cents;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KioskError>;
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Failures reported by a hardware gateway.
///
/// These never leave the controllers as-is; each controller maps them to one
/// of the settlement outcomes or logs them as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("communication with {0} failed: {1}")]
    Communication(String, String),
    #[error("could not parse response from {0}: {1}")]
    Parse(String, String),
    #[error("{0} is unavailable")]
    Unavailable(String),
    #[error("{0} rejected the command: {1}")]
    Rejected(String, String),
    #[error("{0} did not answer in time")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum KioskError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Change error: {0}")]
    Change(#[from] ChangeFailure),
    #[error("A cash session is already active for this attempt")]
    SessionAlreadyActive,
    #[error("Rejected hardware call `{0}`: session guard is closed")]
    GuardRejected(&'static str),
    #[error("Transition `{0}` rejected in current flow state")]
    TransitionRejected(&'static str),
    #[error("No acceptor could be enabled")]
    NoAcceptorAvailable,
    #[error("Wash machine reports a fault")]
    MachineFault,
    #[error("Refund of {0} is still outstanding")]
    PendingRefundOutstanding(Cents),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
}

impl KioskError {
    /// Machine-readable code for the UI boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            KioskError::Device(_) => ErrorCode::DeviceError,
            KioskError::Change(failure) => failure.code(),
            KioskError::SessionAlreadyActive => ErrorCode::SessionAlreadyActive,
            KioskError::GuardRejected(_) => ErrorCode::GuardRejected,
            KioskError::TransitionRejected(_) => ErrorCode::InvalidState,
            KioskError::NoAcceptorAvailable => ErrorCode::NoAcceptorAvailable,
            KioskError::MachineFault => ErrorCode::MachineFault,
            KioskError::PendingRefundOutstanding(_) => ErrorCode::PendingRefundOutstanding,
            _ => ErrorCode::Internal,
        }
    }
}

/// Short codes surfaced to the UI and written to decision records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PaymentTimeout,
    PaymentFailed,
    PaymentCancelled,
    CardDeclined,
    CardRefundFailed,
    LevelsUnavailable,
    InsufficientSum,
    NoSmallDenoms,
    AlgoNoSolution,
    ChangeDispenseFailed,
    RefundIncomplete,
    PendingRefundOutstanding,
    SessionAlreadyActive,
    GuardRejected,
    NoAcceptorAvailable,
    MachineFault,
    DeviceError,
    InvalidState,
    PreviousCarNotLeft,
    CarNotInPosition,
    DeviceNotReady,
    SendModeFailed,
    NotEnteredAutoStatus,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PaymentTimeout => "PAYMENT_TIMEOUT",
            ErrorCode::PaymentFailed => "PAYMENT_FAILED",
            ErrorCode::PaymentCancelled => "PAYMENT_CANCELLED",
            ErrorCode::CardDeclined => "CARD_DECLINED",
            ErrorCode::CardRefundFailed => "CARD_REFUND_FAILED",
            ErrorCode::LevelsUnavailable => "LEVELS_UNAVAILABLE",
            ErrorCode::InsufficientSum => "INSUFFICIENT_SUM",
            ErrorCode::NoSmallDenoms => "NO_SMALL_DENOMS",
            ErrorCode::AlgoNoSolution => "ALGO_NO_SOLUTION",
            ErrorCode::ChangeDispenseFailed => "CHANGE_DISPENSE_FAILED",
            ErrorCode::RefundIncomplete => "REFUND_INCOMPLETE",
            ErrorCode::PendingRefundOutstanding => "PENDING_REFUND_OUTSTANDING",
            ErrorCode::SessionAlreadyActive => "SESSION_ALREADY_ACTIVE",
            ErrorCode::GuardRejected => "GUARD_REJECTED",
            ErrorCode::NoAcceptorAvailable => "NO_ACCEPTOR_AVAILABLE",
            ErrorCode::MachineFault => "MACHINE_FAULT",
            ErrorCode::DeviceError => "DEVICE_ERROR",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::PreviousCarNotLeft => "PREVIOUS_CAR_NOT_LEFT",
            ErrorCode::CarNotInPosition => "CAR_NOT_IN_POSITION",
            ErrorCode::DeviceNotReady => "DEVICE_NOT_READY",
            ErrorCode::SendModeFailed => "SEND_MODE_FAILED",
            ErrorCode::NotEnteredAutoStatus => "NOT_ENTERED_AUTO_STATUS",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
