use crate::domain::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use std::collections::BTreeMap;

/// Per-device baseline and current inventories of the active attempt.
///
/// The session delta is always derived from these two snapshots; there is no
/// second running total to drift out of sync.
#[derive(Debug, Default)]
pub struct AmountTracker {
    baselines: BTreeMap<DeviceId, DeviceLevelsSnapshot>,
    current: BTreeMap<DeviceId, DeviceLevelsSnapshot>,
    anomalies: u32,
}

impl AmountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the zero-point of `device`. Write-once per session: returns
    /// false and keeps the existing baseline if one was already captured.
    pub fn capture_baseline(&mut self, device: DeviceId, snapshot: DeviceLevelsSnapshot) -> bool {
        if self.baselines.contains_key(&device) {
            tracing::warn!(%device, "Baseline already captured; refusing to overwrite");
            return false;
        }
        tracing::debug!(%device, total = %snapshot.total(), "Baseline captured");
        self.current.insert(device, snapshot.clone());
        self.baselines.insert(device, snapshot);
        true
    }

    pub fn has_baseline(&self, device: DeviceId) -> bool {
        self.baselines.contains_key(&device)
    }

    pub fn baseline(&self, device: DeviceId) -> Option<&DeviceLevelsSnapshot> {
        self.baselines.get(&device)
    }

    /// Stores the latest read. `None` means the levels could not be read, and
    /// the device counts as zero until the next successful read.
    pub fn update_current(&mut self, device: DeviceId, snapshot: Option<DeviceLevelsSnapshot>) {
        match snapshot {
            Some(snapshot) => {
                self.current.insert(device, snapshot);
            }
            None => {
                self.current.remove(&device);
            }
        }
    }

    /// Cents inserted into `device` this session, never negative.
    pub fn device_delta(&mut self, device: DeviceId) -> Cents {
        let (Some(baseline), Some(current)) = (self.baselines.get(&device), self.current.get(&device))
        else {
            return Cents::ZERO;
        };
        let (delta, anomaly) = delta_between(baseline, current);
        if anomaly {
            self.anomalies += 1;
            tracing::error!(
                %device,
                baseline = %baseline.total(),
                current = %current.total(),
                "Negative session delta clamped to zero; baseline looks corrupted"
            );
        }
        delta
    }

    /// Sum of the per-device deltas.
    pub fn session_delta(&mut self) -> Cents {
        DeviceId::ALL.iter().map(|d| self.device_delta(*d)).sum()
    }

    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    pub fn clear(&mut self) {
        self.baselines.clear();
        self.current.clear();
        self.anomalies = 0;
    }
}

/// `current - baseline` by value, clamped at zero. The flag reports a clamp.
pub fn delta_between(baseline: &DeviceLevelsSnapshot, current: &DeviceLevelsSnapshot) -> (Cents, bool) {
    let base = baseline.total();
    let now = current.total();
    if now < base {
        (Cents::ZERO, true)
    } else {
        (now - base, false)
    }
}
