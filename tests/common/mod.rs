#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use washpay::application::orchestrator::{KioskDevices, PaymentOrchestrator};
use washpay::config::{GateWindow, KioskConfig, WashStartConfig};
use washpay::domain::flow::{PaymentMethod, WashProgram};
use washpay::domain::money::{Cents, DeviceId};
use washpay::infrastructure::in_memory::InMemorySettlementStore;
use washpay::infrastructure::simulated::{
    RecordingPrinter, SimulatedCashDevice, SimulatedPosTerminal, SimulatedWashMachine,
};

pub const SCENARIO_HEADER: &str =
    "kind,program,price,method,bills,coins,cancel,wash,device,denomination,count";

/// A kiosk wired to simulated hardware, with handles kept for inspection.
pub struct Kiosk {
    pub cash: SimulatedCashDevice,
    pub machine: SimulatedWashMachine,
    pub pos: SimulatedPosTerminal,
    pub printer: RecordingPrinter,
    pub store: InMemorySettlementStore,
    pub orchestrator: Arc<PaymentOrchestrator>,
}

pub fn kiosk(config: KioskConfig) -> Kiosk {
    let cash = SimulatedCashDevice::new();
    let machine = SimulatedWashMachine::new();
    let pos = SimulatedPosTerminal::new();
    let printer = RecordingPrinter::new();
    let store = InMemorySettlementStore::new();
    let devices = KioskDevices {
        cash: Arc::new(cash.clone()),
        wash: Arc::new(machine.clone()),
        pos: Arc::new(pos.clone()),
        printer: Arc::new(printer.clone()),
        store: Arc::new(store.clone()),
    };
    Kiosk {
        cash,
        machine,
        pos,
        printer,
        store,
        orchestrator: Arc::new(PaymentOrchestrator::new(config, devices)),
    }
}

impl Kiosk {
    pub fn stock_coins(&self, denomination: u64, count: u32) -> &Self {
        self.cash.stock(DeviceId::Coin, Cents(denomination), count);
        self
    }

    pub fn feed(&self, bills: &[u64], coins: &[u64]) {
        for bill in bills {
            self.cash.queue_insertion(DeviceId::Bill, Cents(*bill));
        }
        for coin in coins {
            self.cash.queue_insertion(DeviceId::Coin, Cents(*coin));
        }
    }

    /// Walks the flow up to a confirmed payment for a program at `price`.
    pub async fn choose(&self, price: u64, method: PaymentMethod) {
        self.orchestrator
            .select_program(WashProgram::new(3, "Deluxe", Cents(price)))
            .await
            .unwrap();
        self.orchestrator.select_payment_method(method).unwrap();
        self.orchestrator.set_payment_confirmed(true).unwrap();
    }
}

/// Short timings for tests that run the real clock, e.g. through the CLI.
pub fn fast_config() -> KioskConfig {
    let quick = GateWindow::new(Duration::from_millis(20), Duration::from_millis(500));
    KioskConfig {
        poll_interval: Duration::from_millis(100),
        paid_update_min_interval: Duration::from_millis(10),
        payment_timeout: Duration::from_millis(1500),
        session_start_timeout: Duration::from_millis(500),
        dispense_retry_delay: Duration::from_millis(10),
        wash: WashStartConfig {
            previous_car: quick,
            car_in_position: quick,
            device_ready: quick,
            send_mode_retry_delay: Duration::from_millis(10),
            confirm: quick,
            ..WashStartConfig::default()
        },
        ..KioskConfig::default()
    }
}

pub fn write_config(path: &Path, config: &KioskConfig) {
    let json = serde_json::to_string_pretty(config).unwrap();
    std::fs::write(path, json).unwrap();
}

/// Writes a scenario file from body lines (header added).
pub fn write_scenario(file: &mut impl Write, rows: &[&str]) {
    writeln!(file, "{SCENARIO_HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
}
