//! Denomination-constrained change making.
//!
//! Given what the cash units currently hold, decide whether an exact amount
//! can be paid out and with which pieces. The same planner serves both
//! change (overpayment) and refunds.

use crate::domain::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use crate::error::ErrorCode;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why no payout plan exists.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFailure {
    #[error("inventory levels could not be read")]
    LevelsUnavailable,
    #[error("total inventory is below the requested amount")]
    InsufficientSum,
    #[error("only denominations larger than the requested amount are stocked")]
    NoSmallDenoms,
    #[error("no combination of stocked pieces reaches the exact amount")]
    AlgoNoSolution,
}

impl ChangeFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChangeFailure::LevelsUnavailable => ErrorCode::LevelsUnavailable,
            ChangeFailure::InsufficientSum => ErrorCode::InsufficientSum,
            ChangeFailure::NoSmallDenoms => ErrorCode::NoSmallDenoms,
            ChangeFailure::AlgoNoSolution => ErrorCode::AlgoNoSolution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StockEntry {
    device: DeviceId,
    denomination: Cents,
    count: u32,
}

/// Dispensable stock across both cash units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeInventory {
    entries: Vec<StockEntry>,
}

impl ChangeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an inventory from per-device level reads.
    ///
    /// A device that could not be read contributes nothing. If no device
    /// could be read at all the inventory is unknown.
    pub fn from_levels(
        levels: &[(DeviceId, Option<DeviceLevelsSnapshot>)],
    ) -> Result<Self, ChangeFailure> {
        if levels.iter().all(|(_, snapshot)| snapshot.is_none()) {
            return Err(ChangeFailure::LevelsUnavailable);
        }
        let mut inventory = Self::new();
        for (device, snapshot) in levels {
            if let Some(snapshot) = snapshot {
                for (denomination, count) in snapshot.iter() {
                    inventory.add(*device, denomination, count);
                }
            }
        }
        Ok(inventory)
    }

    pub fn with_stock(mut self, device: DeviceId, denomination: Cents, count: u32) -> Self {
        self.add(device, denomination, count);
        self
    }

    fn add(&mut self, device: DeviceId, denomination: Cents, count: u32) {
        if count == 0 || denomination.is_zero() {
            return;
        }
        match self
            .entries
            .iter_mut()
            .find(|e| e.device == device && e.denomination == denomination)
        {
            Some(entry) => entry.count += count,
            None => self.entries.push(StockEntry {
                device,
                denomination,
                count,
            }),
        }
    }

    /// Drops the stock of `denomination` held by `device`, e.g. after it jammed.
    pub fn exclude(&mut self, device: DeviceId, denomination: Cents) {
        self.entries
            .retain(|e| !(e.device == device && e.denomination == denomination));
    }

    /// Pieces per denomination, merged across devices.
    pub fn merged(&self) -> BTreeMap<Cents, u32> {
        let mut merged = BTreeMap::new();
        for entry in &self.entries {
            *merged.entry(entry.denomination).or_insert(0) += entry.count;
        }
        merged
    }

    pub fn total(&self) -> Cents {
        self.entries
            .iter()
            .map(|e| Cents(e.denomination.0.saturating_mul(e.count as u64)))
            .sum()
    }

    /// Devices holding `denomination`, fullest first. Ties keep bill before coin.
    fn sources(&self, denomination: Cents) -> Vec<StockEntry> {
        let mut sources: Vec<StockEntry> = self
            .entries
            .iter()
            .filter(|e| e.denomination == denomination && e.count > 0)
            .copied()
            .collect();
        sources.sort_by(|a, b| b.count.cmp(&a.count).then(a.device.cmp(&b.device)));
        sources
    }
}

/// One dispense instruction: `count` pieces of `denomination` from `device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispenseLine {
    pub device: DeviceId,
    pub denomination: Cents,
    pub count: u32,
}

/// A feasible payout. Sums exactly to the requested amount and never asks
/// a device for more pieces than it holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePlan {
    pieces: BTreeMap<Cents, u32>,
    lines: Vec<DispenseLine>,
}

impl ChangePlan {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Denomination to piece count.
    pub fn pieces(&self) -> &BTreeMap<Cents, u32> {
        &self.pieces
    }

    /// Dispense instructions, largest denomination first.
    pub fn lines(&self) -> &[DispenseLine] {
        &self.lines
    }

    pub fn total(&self) -> Cents {
        self.pieces
            .iter()
            .map(|(d, c)| Cents(d.0 * *c as u64))
            .sum()
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// Plans payouts against a `ChangeInventory`.
pub struct ChangeCalculator;

impl ChangeCalculator {
    /// Returns a plan paying exactly `amount`, or the reason none exists.
    ///
    /// Greedy by descending denomination first; a bounded exact search runs
    /// as fallback and also replaces the greedy plan when it needs fewer
    /// pieces. Equal piece counts resolve towards larger denominations, so a
    /// given inventory and amount always produce the same plan.
    pub fn plan(amount: Cents, inventory: &ChangeInventory) -> Result<ChangePlan, ChangeFailure> {
        if amount.is_zero() {
            return Ok(ChangePlan::empty());
        }
        if inventory.total() < amount {
            return Err(ChangeFailure::InsufficientSum);
        }

        let stock: Vec<(Cents, u32)> = inventory
            .merged()
            .into_iter()
            .rev()
            .filter(|(denom, count)| *denom <= amount && *count > 0)
            .collect();
        let usable: Cents = stock
            .iter()
            .map(|(d, c)| Cents(d.0.saturating_mul(*c as u64)))
            .sum();
        if usable < amount {
            return Err(ChangeFailure::NoSmallDenoms);
        }

        let greedy = greedy(amount, &stock);
        let exact = exact_search(amount, &stock);
        let pieces = match (greedy, exact) {
            (Some(g), Some(e)) => {
                if piece_count(&e) < piece_count(&g) {
                    e
                } else {
                    g
                }
            }
            (Some(g), None) => g,
            (None, Some(e)) => e,
            (None, None) => return Err(ChangeFailure::AlgoNoSolution),
        };

        Ok(assign_devices(pieces, inventory))
    }
}

fn piece_count(pieces: &BTreeMap<Cents, u32>) -> u32 {
    pieces.values().sum()
}

/// `stock` is sorted by descending denomination.
fn greedy(amount: Cents, stock: &[(Cents, u32)]) -> Option<BTreeMap<Cents, u32>> {
    let mut remaining = amount.0;
    let mut pieces = BTreeMap::new();
    for (denom, count) in stock {
        let take = (remaining / denom.0).min(*count as u64) as u32;
        if take > 0 {
            pieces.insert(*denom, take);
            remaining -= denom.0 * take as u64;
        }
        if remaining == 0 {
            return Some(pieces);
        }
    }
    None
}

/// Fewest-pieces bounded knapsack over the stocked denominations.
///
/// The table is `stock.len() x (amount + 1)`; the fixed euro denomination set
/// keeps that small for any realistic change amount.
fn exact_search(amount: Cents, stock: &[(Cents, u32)]) -> Option<BTreeMap<Cents, u32>> {
    const UNREACHABLE: u32 = u32::MAX;
    let target = usize::try_from(amount.0).ok()?;

    let mut best = vec![UNREACHABLE; target + 1];
    best[0] = 0;
    let mut choices: Vec<Vec<u32>> = Vec::with_capacity(stock.len());

    for (denom, count) in stock {
        let d = denom.0 as usize;
        let mut next = vec![UNREACHABLE; target + 1];
        let mut choice = vec![0u32; target + 1];
        for v in 0..=target {
            let max_k = (*count as usize).min(v / d);
            // Larger k first: on equal piece counts keep more of this (larger) denomination.
            for k in (0..=max_k).rev() {
                let prev = best[v - k * d];
                if prev == UNREACHABLE {
                    continue;
                }
                let candidate = prev + k as u32;
                if candidate < next[v] {
                    next[v] = candidate;
                    choice[v] = k as u32;
                }
            }
        }
        best = next;
        choices.push(choice);
    }

    if best[target] == UNREACHABLE {
        return None;
    }

    let mut pieces = BTreeMap::new();
    let mut v = target;
    for (i, (denom, _)) in stock.iter().enumerate().rev() {
        let k = choices[i][v];
        if k > 0 {
            pieces.insert(*denom, k);
            v -= k as usize * denom.0 as usize;
        }
    }
    debug_assert_eq!(v, 0);
    Some(pieces)
}

fn assign_devices(pieces: BTreeMap<Cents, u32>, inventory: &ChangeInventory) -> ChangePlan {
    let mut lines = Vec::new();
    for (denom, needed) in pieces.iter().rev() {
        let mut left = *needed;
        for source in inventory.sources(*denom) {
            if left == 0 {
                break;
            }
            let take = left.min(source.count);
            lines.push(DispenseLine {
                device: source.device,
                denomination: *denom,
                count: take,
            });
            left -= take;
        }
    }
    ChangePlan { pieces, lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn coins(stock: &[(u64, u32)]) -> ChangeInventory {
        stock.iter().fold(ChangeInventory::new(), |inv, (d, c)| {
            inv.with_stock(DeviceId::Coin, Cents(*d), *c)
        })
    }

    #[test]
    fn test_zero_amount_is_empty_plan() {
        let plan = ChangeCalculator::plan(Cents::ZERO, &ChangeInventory::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_prefers_single_two_euro_coin() {
        let inventory = coins(&[(200, 2), (100, 5), (50, 10)]);
        let plan = ChangeCalculator::plan(Cents(200), &inventory).unwrap();
        assert_eq!(plan.pieces().get(&Cents(200)), Some(&1));
        assert_eq!(plan.piece_count(), 1);
        assert_eq!(plan.total(), Cents(200));
    }

    #[test]
    fn test_falls_back_when_no_two_euro_coin() {
        let inventory = coins(&[(100, 1), (50, 4)]);
        let plan = ChangeCalculator::plan(Cents(200), &inventory).unwrap();
        assert_eq!(plan.total(), Cents(200));
        assert_eq!(plan.pieces().get(&Cents(100)), Some(&1));
        assert_eq!(plan.pieces().get(&Cents(50)), Some(&2));
    }

    #[test]
    fn test_insufficient_sum() {
        let inventory = coins(&[(100, 1)]);
        assert_eq!(
            ChangeCalculator::plan(Cents(200), &inventory),
            Err(ChangeFailure::InsufficientSum)
        );
    }

    #[test]
    fn test_only_large_denominations() {
        let inventory = ChangeInventory::new().with_stock(DeviceId::Bill, Cents(500), 10);
        assert_eq!(
            ChangeCalculator::plan(Cents(200), &inventory),
            Err(ChangeFailure::NoSmallDenoms)
        );
    }

    #[test]
    fn test_no_exact_combination() {
        // 3 x 0.50 covers 1.30 in value but cannot hit it exactly.
        let inventory = coins(&[(50, 3)]);
        assert_eq!(
            ChangeCalculator::plan(Cents(130), &inventory),
            Err(ChangeFailure::AlgoNoSolution)
        );
    }

    #[test]
    fn test_greedy_dead_end_is_recovered_by_exact_search() {
        // Greedy takes 50 + 20 + 20 = 90 and gets stuck; 20 x 3 = 60 works.
        let inventory = coins(&[(50, 1), (20, 3)]);
        let plan = ChangeCalculator::plan(Cents(60), &inventory).unwrap();
        assert_eq!(plan.pieces().get(&Cents(20)), Some(&3));
        assert_eq!(plan.pieces().get(&Cents(50)), None);
    }

    #[test]
    fn test_levels_unavailable_when_nothing_readable() {
        let result = ChangeInventory::from_levels(&[(DeviceId::Bill, None), (DeviceId::Coin, None)]);
        assert_eq!(result, Err(ChangeFailure::LevelsUnavailable));
    }

    #[test]
    fn test_unreadable_device_contributes_nothing() {
        let coin = DeviceLevelsSnapshot::new().with_level(Cents(100), 2);
        let inventory =
            ChangeInventory::from_levels(&[(DeviceId::Bill, None), (DeviceId::Coin, Some(coin))])
                .unwrap();
        assert_eq!(inventory.total(), Cents(200));
    }

    #[test]
    fn test_lines_are_largest_first_and_prefer_fuller_device() {
        let inventory = ChangeInventory::new()
            .with_stock(DeviceId::Bill, Cents(500), 1)
            .with_stock(DeviceId::Coin, Cents(200), 1)
            .with_stock(DeviceId::Bill, Cents(200), 4);
        let plan = ChangeCalculator::plan(Cents(900), &inventory).unwrap();
        let lines = plan.lines();
        assert_eq!(lines[0].denomination, Cents(500));
        assert_eq!(lines[1].denomination, Cents(200));
        assert_eq!(lines[1].device, DeviceId::Bill);
        assert_eq!(lines[1].count, 2);
    }

    #[test]
    fn test_plan_spills_over_to_second_device() {
        let inventory = ChangeInventory::new()
            .with_stock(DeviceId::Bill, Cents(200), 1)
            .with_stock(DeviceId::Coin, Cents(200), 2);
        let plan = ChangeCalculator::plan(Cents(600), &inventory).unwrap();
        assert_eq!(
            plan.lines(),
            &[
                DispenseLine {
                    device: DeviceId::Coin,
                    denomination: Cents(200),
                    count: 2
                },
                DispenseLine {
                    device: DeviceId::Bill,
                    denomination: Cents(200),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_excluded_stock_is_planned_around() {
        let mut inventory = coins(&[(200, 1), (100, 2)]);
        inventory.exclude(DeviceId::Coin, Cents(200));
        let plan = ChangeCalculator::plan(Cents(200), &inventory).unwrap();
        assert_eq!(plan.pieces().get(&Cents(100)), Some(&2));
        assert_eq!(inventory.total(), Cents(200));
    }

    #[test]
    fn test_plan_is_reproducible() {
        let inventory = coins(&[(200, 3), (100, 4), (50, 6), (20, 5), (10, 9)]);
        let first = ChangeCalculator::plan(Cents(370), &inventory).unwrap();
        for _ in 0..10 {
            assert_eq!(ChangeCalculator::plan(Cents(370), &inventory).unwrap(), first);
        }
    }

    /// Minimum piece count by brute force, `None` if unreachable.
    fn oracle(amount: u64, stock: &[(u64, u32)]) -> Option<u32> {
        fn go(amount: u64, stock: &[(u64, u32)]) -> Option<u32> {
            if amount == 0 {
                return Some(0);
            }
            let ((denom, count), rest) = stock.split_first()?;
            (0..=*count)
                .filter(|k| denom * *k as u64 <= amount)
                .filter_map(|k| go(amount - denom * k as u64, rest).map(|p| p + k))
                .min()
        }
        go(amount, stock)
    }

    #[test]
    fn test_matches_brute_force_on_random_inventories() {
        let denominations = [200u64, 100, 50, 20, 10, 5];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..300 {
            let stock: Vec<(u64, u32)> = denominations
                .iter()
                .map(|d| (*d, rng.gen_range(0..=3)))
                .collect();
            let amount = rng.gen_range(1..=600u64);
            let inventory = coins(&stock);

            match (ChangeCalculator::plan(Cents(amount), &inventory), oracle(amount, &stock)) {
                (Ok(plan), Some(min)) => {
                    assert_eq!(plan.total(), Cents(amount));
                    assert_eq!(plan.piece_count(), min, "amount {amount} stock {stock:?}");
                    for (denom, count) in plan.pieces() {
                        let available = stock.iter().find(|(d, _)| *d == denom.0).unwrap().1;
                        assert!(*count <= available);
                    }
                }
                (Err(_), None) => {}
                (result, min) => panic!("amount {amount} stock {stock:?}: {result:?} vs {min:?}"),
            }
        }
    }
}
