//! Software stand-ins for the kiosk hardware.
//!
//! Used by the CLI replay and by tests. Each simulator is cheap to clone and
//! shares its state, so a test can keep a handle for scripting and
//! inspection while the controllers own another.

use crate::domain::money::{Cents, DeviceId, DeviceLevelsSnapshot};
use crate::domain::ports::{
    CashDevice, DeviceCounters, PosOutcome, PosTerminal, ReceiptPrinter, WashMachine,
};
use crate::domain::settlement::Receipt;
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct CashState {
    levels: BTreeMap<DeviceId, DeviceLevelsSnapshot>,
    enabled: BTreeSet<DeviceId>,
    auto_accept: BTreeSet<DeviceId>,
    session_open: bool,
    insertions: VecDeque<(DeviceId, Cents)>,
    level_read_failures: BTreeMap<DeviceId, u32>,
    levels_offline: BTreeSet<DeviceId>,
    dispense_failures: BTreeMap<(DeviceId, Cents), u32>,
    jammed: BTreeSet<(DeviceId, Cents)>,
    enable_refused: BTreeSet<DeviceId>,
    disable_refused: BTreeSet<DeviceId>,
    start_refused: bool,
    dispensed: Vec<(DeviceId, Cents)>,
    calls: Vec<String>,
}

/// Bill recycler and coin hopper behind one REST-like gateway.
///
/// Queued insertions land one piece per level read while the acceptor of
/// that device is enabled, which mimics a customer feeding the machine
/// between polls.
#[derive(Default, Clone)]
pub struct SimulatedCashDevice {
    state: Arc<Mutex<CashState>>,
}

impl SimulatedCashDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock(self, device: DeviceId, denomination: Cents, count: u32) -> Self {
        self.stock(device, denomination, count);
        self
    }

    pub fn stock(&self, device: DeviceId, denomination: Cents, count: u32) {
        let mut state = self.state.lock();
        state
            .levels
            .entry(device)
            .or_default()
            .add_pieces(denomination, count);
    }

    /// Queues a piece the customer will insert.
    pub fn queue_insertion(&self, device: DeviceId, denomination: Cents) {
        self.state.lock().insertions.push_back((device, denomination));
    }

    /// Puts a piece straight into storage, as if inserted between two reads.
    pub fn insert_now(&self, device: DeviceId, denomination: Cents) {
        self.stock(device, denomination, 1);
    }

    pub fn pending_insertions(&self) -> usize {
        self.state.lock().insertions.len()
    }

    /// The customer walks away with whatever was not inserted yet.
    pub fn take_back_insertions(&self) -> Vec<(DeviceId, Cents)> {
        self.state.lock().insertions.drain(..).collect()
    }

    /// The next `times` level reads of `device` fail.
    pub fn fail_level_reads(&self, device: DeviceId, times: u32) {
        self.state.lock().level_read_failures.insert(device, times);
    }

    /// Every level read of `device` fails until `set_levels_online`.
    pub fn set_levels_offline(&self, device: DeviceId) {
        self.state.lock().levels_offline.insert(device);
    }

    pub fn set_levels_online(&self, device: DeviceId) {
        self.state.lock().levels_offline.remove(&device);
    }

    /// The next `times` dispense calls for this piece fail transiently.
    pub fn fail_dispense(&self, device: DeviceId, denomination: Cents, times: u32) {
        self.state
            .lock()
            .dispense_failures
            .insert((device, denomination), times);
    }

    /// Dispensing this piece always fails.
    pub fn jam(&self, device: DeviceId, denomination: Cents) {
        self.state.lock().jammed.insert((device, denomination));
    }

    pub fn unjam(&self, device: DeviceId, denomination: Cents) {
        self.state.lock().jammed.remove(&(device, denomination));
    }

    pub fn refuse_enable(&self, device: DeviceId) {
        self.state.lock().enable_refused.insert(device);
    }

    pub fn refuse_disable(&self, device: DeviceId) {
        self.state.lock().disable_refused.insert(device);
    }

    pub fn refuse_session_start(&self) {
        self.state.lock().start_refused = true;
    }

    /// Forces the stored levels of `device`, e.g. to corrupt a baseline.
    pub fn overwrite_levels(&self, device: DeviceId, snapshot: DeviceLevelsSnapshot) {
        self.state.lock().levels.insert(device, snapshot);
    }

    pub fn levels(&self, device: DeviceId) -> DeviceLevelsSnapshot {
        self.state
            .lock()
            .levels
            .get(&device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, device: DeviceId) -> bool {
        self.state.lock().enabled.contains(&device)
    }

    pub fn is_session_open(&self) -> bool {
        self.state.lock().session_open
    }

    /// Pieces paid out so far, in dispense order.
    pub fn dispensed(&self) -> Vec<(DeviceId, Cents)> {
        self.state.lock().dispensed.clone()
    }

    pub fn dispensed_total(&self) -> Cents {
        self.state.lock().dispensed.iter().map(|(_, c)| *c).sum()
    }

    /// Every gateway call in order, e.g. `enable:bill` or `dispense:coin:200`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

fn unit_name(device: DeviceId) -> String {
    format!("{device} unit")
}

#[async_trait]
impl CashDevice for SimulatedCashDevice {
    async fn start_cash_session(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.calls.push("start_session".into());
        if state.start_refused {
            return Err(DeviceError::Rejected(
                "cash device".into(),
                "session start refused".into(),
            ));
        }
        state.session_open = true;
        Ok(())
    }

    async fn stop_cash_session(&self, reason: &str) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("stop_session:{reason}"));
        state.session_open = false;
        Ok(())
    }

    async fn enable_acceptor(&self, device: DeviceId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("enable:{device}"));
        if state.enable_refused.contains(&device) {
            return Err(DeviceError::Communication(
                unit_name(device),
                "enable timed out".into(),
            ));
        }
        state.enabled.insert(device);
        Ok(())
    }

    async fn disable_acceptor(&self, device: DeviceId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("disable:{device}"));
        if state.disable_refused.contains(&device) {
            return Err(DeviceError::Communication(
                unit_name(device),
                "disable timed out".into(),
            ));
        }
        state.enabled.remove(&device);
        state.auto_accept.remove(&device);
        Ok(())
    }

    async fn set_auto_accept(&self, device: DeviceId, enabled: bool) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("auto_accept:{device}:{enabled}"));
        if enabled {
            state.auto_accept.insert(device);
        } else {
            state.auto_accept.remove(&device);
        }
        Ok(())
    }

    async fn read_current_levels(&self, device: DeviceId) -> DeviceResult<DeviceLevelsSnapshot> {
        let mut state = self.state.lock();
        if state.levels_offline.contains(&device) {
            return Err(DeviceError::Unavailable(unit_name(device)));
        }
        if let Some(left) = state.level_read_failures.get_mut(&device)
            && *left > 0
        {
            *left -= 1;
            return Err(DeviceError::Communication(
                unit_name(device),
                "levels request failed".into(),
            ));
        }
        if state.enabled.contains(&device)
            && let Some(pos) = state.insertions.iter().position(|(d, _)| *d == device)
            && let Some((_, denomination)) = state.insertions.remove(pos)
        {
            state
                .levels
                .entry(device)
                .or_default()
                .add_pieces(denomination, 1);
        }
        Ok(state.levels.get(&device).cloned().unwrap_or_default())
    }

    async fn dispense_value(
        &self,
        device: DeviceId,
        denomination: Cents,
        currency: &str,
    ) -> DeviceResult<bool> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("dispense:{device}:{}", denomination.value()));
        if currency.is_empty() {
            return Err(DeviceError::Rejected(unit_name(device), "no currency".into()));
        }
        if state.jammed.contains(&(device, denomination)) {
            return Err(DeviceError::Communication(unit_name(device), "jammed".into()));
        }
        if let Some(left) = state.dispense_failures.get_mut(&(device, denomination))
            && *left > 0
        {
            *left -= 1;
            return Err(DeviceError::Communication(
                unit_name(device),
                "payout not confirmed".into(),
            ));
        }
        let removed = state
            .levels
            .get_mut(&device)
            .is_some_and(|levels| levels.remove_piece(denomination));
        if removed {
            state.dispensed.push((device, denomination));
        }
        Ok(removed)
    }

    async fn get_counters(&self, device: DeviceId) -> DeviceResult<DeviceCounters> {
        let state = self.state.lock();
        let mut counters = DeviceCounters::new();
        counters.insert(
            "stored_value".into(),
            state
                .levels
                .get(&device)
                .map(|l| l.total().value())
                .unwrap_or(0),
        );
        counters.insert(
            "dispensed_pieces".into(),
            state.dispensed.iter().filter(|(d, _)| *d == device).count() as u64,
        );
        Ok(counters)
    }
}

/// Scripted register: queued reads first, then `default` forever.
/// `None` stands for a failed read.
#[derive(Debug, Clone)]
struct Register {
    queue: VecDeque<Option<bool>>,
    default: Option<bool>,
    reads: usize,
}

impl Register {
    fn new(default: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            default: Some(default),
            reads: 0,
        }
    }

    fn read(&mut self, name: &str) -> DeviceResult<bool> {
        self.reads += 1;
        let value = self.queue.pop_front().unwrap_or(self.default);
        value.ok_or_else(|| DeviceError::Communication(name.into(), "register read failed".into()))
    }
}

struct WashState {
    fault: bool,
    previous_car: Register,
    car_in_position: Register,
    device_ready: Register,
    running: Register,
    send_mode: VecDeque<Option<bool>>,
    send_mode_default: Option<bool>,
    modes_sent: Vec<u32>,
    send_attempts: usize,
}

impl Default for WashState {
    fn default() -> Self {
        Self {
            fault: false,
            previous_car: Register::new(false),
            car_in_position: Register::new(true),
            device_ready: Register::new(true),
            running: Register::new(true),
            send_mode: VecDeque::new(),
            send_mode_default: Some(true),
            modes_sent: Vec::new(),
            send_attempts: 0,
        }
    }
}

/// Which register a script applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WashSignal {
    PreviousCarPresent,
    CarInPosition,
    DeviceReady,
    RunningAutomatic,
}

/// A wash bay that by default is empty, ready, and starts on the first command.
#[derive(Default, Clone)]
pub struct SimulatedWashMachine {
    state: Arc<Mutex<WashState>>,
}

impl SimulatedWashMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault(&self, fault: bool) {
        self.state.lock().fault = fault;
    }

    /// Reads `values` first (`None` = read error), then `default` forever.
    pub fn script(&self, signal: WashSignal, values: &[Option<bool>], default: Option<bool>) {
        let mut state = self.state.lock();
        let register = match signal {
            WashSignal::PreviousCarPresent => &mut state.previous_car,
            WashSignal::CarInPosition => &mut state.car_in_position,
            WashSignal::DeviceReady => &mut state.device_ready,
            WashSignal::RunningAutomatic => &mut state.running,
        };
        register.queue = values.iter().copied().collect();
        register.default = default;
    }

    /// Send-mode answers (`None` = communication error), then `default`.
    pub fn script_send_mode(&self, values: &[Option<bool>], default: Option<bool>) {
        let mut state = self.state.lock();
        state.send_mode = values.iter().copied().collect();
        state.send_mode_default = default;
    }

    pub fn reads(&self, signal: WashSignal) -> usize {
        let state = self.state.lock();
        match signal {
            WashSignal::PreviousCarPresent => state.previous_car.reads,
            WashSignal::CarInPosition => state.car_in_position.reads,
            WashSignal::DeviceReady => state.device_ready.reads,
            WashSignal::RunningAutomatic => state.running.reads,
        }
    }

    /// Modes the machine acknowledged.
    pub fn modes_sent(&self) -> Vec<u32> {
        self.state.lock().modes_sent.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }
}

#[async_trait]
impl WashMachine for SimulatedWashMachine {
    async fn has_fault(&self) -> DeviceResult<bool> {
        Ok(self.state.lock().fault)
    }

    async fn previous_car_present(&self) -> DeviceResult<bool> {
        self.state.lock().previous_car.read("previous car sensor")
    }

    async fn car_in_position(&self) -> DeviceResult<bool> {
        self.state.lock().car_in_position.read("position sensor")
    }

    async fn device_ready(&self) -> DeviceResult<bool> {
        self.state.lock().device_ready.read("ready register")
    }

    async fn is_running_automatic(&self) -> DeviceResult<bool> {
        self.state.lock().running.read("run status register")
    }

    async fn send_mode(&self, mode: u32) -> DeviceResult<bool> {
        let mut state = self.state.lock();
        state.send_attempts += 1;
        let answer = state.send_mode.pop_front().unwrap_or(state.send_mode_default);
        match answer {
            Some(true) => {
                state.modes_sent.push(mode);
                Ok(true)
            }
            Some(false) => Ok(false),
            None => Err(DeviceError::Communication(
                "wash machine".into(),
                "mode write failed".into(),
            )),
        }
    }
}

struct PosState {
    initialized: bool,
    init_ok: bool,
    outcomes: VecDeque<PosOutcome>,
    cancel_ok: bool,
    payments: Vec<Cents>,
    cancels: usize,
}

impl Default for PosState {
    fn default() -> Self {
        Self {
            initialized: false,
            init_ok: true,
            outcomes: VecDeque::new(),
            cancel_ok: true,
            payments: Vec::new(),
            cancels: 0,
        }
    }
}

/// Card terminal approving everything unless scripted otherwise.
#[derive(Default, Clone)]
pub struct SimulatedPosTerminal {
    state: Arc<Mutex<PosState>>,
}

impl SimulatedPosTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: PosOutcome) {
        self.state.lock().outcomes.push_back(outcome);
    }

    pub fn fail_initialize(&self) {
        self.state.lock().init_ok = false;
    }

    pub fn fail_cancel(&self) {
        self.state.lock().cancel_ok = false;
    }

    pub fn payments(&self) -> Vec<Cents> {
        self.state.lock().payments.clone()
    }

    pub fn cancels(&self) -> usize {
        self.state.lock().cancels
    }
}

#[async_trait]
impl PosTerminal for SimulatedPosTerminal {
    async fn initialize(&self) -> bool {
        let mut state = self.state.lock();
        state.initialized = state.init_ok;
        state.initialized
    }

    async fn initiate_payment(&self, amount: Cents) -> PosOutcome {
        let mut state = self.state.lock();
        if !state.initialized {
            return PosOutcome::Error("terminal not initialized".into());
        }
        state.payments.push(amount);
        let sequence = state.payments.len();
        state
            .outcomes
            .pop_front()
            .unwrap_or_else(|| PosOutcome::Approved {
                reference: format!("SIM-{sequence:06}"),
            })
    }

    async fn cancel_payment(&self) -> bool {
        let mut state = self.state.lock();
        state.cancels += 1;
        state.cancel_ok
    }
}

/// Keeps every receipt it is asked to print.
#[derive(Default, Clone)]
pub struct RecordingPrinter {
    receipts: Arc<Mutex<Vec<Receipt>>>,
    out_of_paper: Arc<Mutex<bool>>,
}

impl RecordingPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_out_of_paper(&self, value: bool) {
        *self.out_of_paper.lock() = value;
    }

    pub fn receipts(&self) -> Vec<Receipt> {
        self.receipts.lock().clone()
    }
}

#[async_trait]
impl ReceiptPrinter for RecordingPrinter {
    async fn print_receipt(&self, receipt: &Receipt) -> DeviceResult<()> {
        if *self.out_of_paper.lock() {
            return Err(DeviceError::Unavailable("printer".into()));
        }
        self.receipts.lock().push(receipt.clone());
        Ok(())
    }
}
