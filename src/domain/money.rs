use crate::error::KioskError;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A monetary value in euro cents.
///
/// All settlement arithmetic happens on whole cents; `Decimal` only shows up
/// at the edges when amounts are parsed from or rendered to euros.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(pub u64);

impl Cents {
    pub const ZERO: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parses a euro amount such as `5.00` into cents.
    ///
    /// Negative values and sub-cent precision are rejected.
    pub fn from_euros(euros: Decimal) -> Result<Self, KioskError> {
        if euros.is_sign_negative() {
            return Err(KioskError::Validation(format!(
                "amount must not be negative: {euros}"
            )));
        }
        let cents = euros * Decimal::ONE_HUNDRED;
        if cents.fract() != Decimal::ZERO {
            return Err(KioskError::Validation(format!(
                "amount has sub-cent precision: {euros}"
            )));
        }
        cents
            .to_u64()
            .map(Self)
            .ok_or_else(|| KioskError::Validation(format!("amount out of range: {euros}")))
    }

    pub fn to_euros(&self) -> Decimal {
        Decimal::new(self.0 as i64, 2)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_mul(self, count: u32) -> Option<Self> {
        self.0.checked_mul(count as u64).map(Self)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_euros())
    }
}

impl Add for Cents {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Cents {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Cents {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Cents::ZERO, |acc, c| acc + c)
    }
}

/// The two physical cash units of the kiosk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceId {
    /// Bill validator / recycler.
    Bill,
    /// Coin hopper.
    Coin,
}

impl DeviceId {
    pub const ALL: [DeviceId; 2] = [DeviceId::Bill, DeviceId::Coin];
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Bill => write!(f, "bill"),
            DeviceId::Coin => write!(f, "coin"),
        }
    }
}

impl std::str::FromStr for DeviceId {
    type Err = KioskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bill" => Ok(DeviceId::Bill),
            "coin" => Ok(DeviceId::Coin),
            other => Err(KioskError::Validation(format!("unknown device: {other}"))),
        }
    }
}

/// Stored count per denomination for one device, as reported by the hardware.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceLevelsSnapshot {
    levels: BTreeMap<Cents, u32>,
}

impl DeviceLevelsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, denomination: Cents, count: u32) -> Self {
        self.levels.insert(denomination, count);
        self
    }

    pub fn count(&self, denomination: Cents) -> u32 {
        self.levels.get(&denomination).copied().unwrap_or(0)
    }

    /// Total stored value. Saturates rather than wrapping on absurd counts.
    pub fn total(&self) -> Cents {
        Cents(
            self.levels
                .iter()
                .map(|(denom, count)| denom.0.saturating_mul(*count as u64))
                .fold(0u64, u64::saturating_add),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (Cents, u32)> + '_ {
        self.levels.iter().map(|(d, c)| (*d, *c))
    }

    pub fn add_pieces(&mut self, denomination: Cents, count: u32) {
        *self.levels.entry(denomination).or_insert(0) += count;
    }

    /// Removes one piece. Returns false when none is stored.
    pub fn remove_piece(&mut self, denomination: Cents) -> bool {
        match self.levels.get_mut(&denomination) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

impl FromIterator<(Cents, u32)> for DeviceLevelsSnapshot {
    fn from_iter<T: IntoIterator<Item = (Cents, u32)>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for (denom, count) in iter {
            snapshot.add_pieces(denom, count);
        }
        snapshot
    }
}
