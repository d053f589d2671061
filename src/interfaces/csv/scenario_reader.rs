use crate::domain::flow::{PaymentMethod, WashProgram};
use crate::domain::money::{Cents, DeviceId};
use crate::error::{KioskError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Stock,
    Attempt,
}

/// One raw scenario line. Which columns matter depends on `kind`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScenarioRecord {
    pub kind: RowKind,
    pub program: Option<String>,
    pub price: Option<Decimal>,
    pub method: Option<String>,
    /// Euro values separated by `;`, e.g. `5;10`.
    pub bills: Option<String>,
    pub coins: Option<String>,
    pub cancel: Option<bool>,
    pub wash: Option<String>,
    pub device: Option<String>,
    pub denomination: Option<Decimal>,
    pub count: Option<u32>,
}

/// How the simulated wash bay behaves after a successful payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WashBehaviour {
    #[default]
    Healthy,
    PreviousCarStays,
    NoCar,
    NotReady,
    SendFails,
    NoAutomatic,
    Fault,
}

impl FromStr for WashBehaviour {
    type Err = KioskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "ok" => Ok(WashBehaviour::Healthy),
            "previous_car" => Ok(WashBehaviour::PreviousCarStays),
            "no_car" => Ok(WashBehaviour::NoCar),
            "not_ready" => Ok(WashBehaviour::NotReady),
            "send_fail" => Ok(WashBehaviour::SendFails),
            "no_auto" => Ok(WashBehaviour::NoAutomatic),
            "fault" => Ok(WashBehaviour::Fault),
            other => Err(KioskError::Validation(format!("unknown wash behaviour: {other}"))),
        }
    }
}

/// A purchase to replay.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSpec {
    pub program: WashProgram,
    pub method: PaymentMethod,
    pub bills: Vec<Cents>,
    pub coins: Vec<Cents>,
    pub cancel: bool,
    pub wash: WashBehaviour,
}

impl AttemptSpec {
    pub fn inserted(&self) -> Cents {
        self.bills.iter().chain(&self.coins).copied().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioStep {
    Stock {
        device: DeviceId,
        denomination: Cents,
        count: u32,
    },
    Attempt(AttemptSpec),
}

fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| KioskError::Validation(format!("missing column value: {column}")))
}

fn pieces(list: Option<&str>) -> Result<Vec<Cents>> {
    list.unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let euros = Decimal::from_str(p)
                .map_err(|e| KioskError::Validation(format!("bad amount {p}: {e}")))?;
            Cents::from_euros(euros)
        })
        .collect()
}

impl TryFrom<ScenarioRecord> for ScenarioStep {
    type Error = KioskError;

    fn try_from(record: ScenarioRecord) -> Result<Self> {
        match record.kind {
            RowKind::Stock => Ok(ScenarioStep::Stock {
                device: required(record.device, "device")?.parse()?,
                denomination: Cents::from_euros(required(record.denomination, "denomination")?)?,
                count: required(record.count, "count")?,
            }),
            RowKind::Attempt => {
                let name = required(record.program, "program")?;
                let price = Cents::from_euros(required(record.price, "price")?)?;
                if price.is_zero() {
                    return Err(KioskError::Validation("price must be positive".into()));
                }
                Ok(ScenarioStep::Attempt(AttemptSpec {
                    // The program id doubles as the wash mode; assigned by the runner.
                    program: WashProgram::new(0, name, price),
                    method: required(record.method, "method")?.parse()?,
                    bills: pieces(record.bills.as_deref())?,
                    coins: pieces(record.coins.as_deref())?,
                    cancel: record.cancel.unwrap_or(false),
                    wash: record.wash.as_deref().unwrap_or_default().parse()?,
                }))
            }
        }
    }
}

/// Reads a kiosk scenario from CSV.
///
/// Header: `kind,program,price,method,bills,coins,cancel,wash,device,denomination,count`.
/// Fields are trimmed and unused columns may be left empty.
pub struct ScenarioReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScenarioReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses rows into steps; a bad row yields an error and the
    /// stream continues.
    pub fn steps(self) -> impl Iterator<Item = Result<ScenarioStep>> {
        self.reader
            .into_deserialize::<ScenarioRecord>()
            .map(|record| record.map_err(KioskError::from).and_then(ScenarioStep::try_from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "kind,program,price,method,bills,coins,cancel,wash,device,denomination,count";

    fn read(body: &str) -> Vec<Result<ScenarioStep>> {
        let data = format!("{HEADER}\n{body}");
        ScenarioReader::new(data.as_bytes()).steps().collect()
    }

    #[test]
    fn test_reader_stock_and_attempt() {
        let steps = read(
            "stock,,,,,,,,coin,2,5\n\
             attempt, Foam, 5.00, cash, 5, 2;0.5, false, ok,,,",
        );
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0].as_ref().unwrap(),
            &ScenarioStep::Stock {
                device: DeviceId::Coin,
                denomination: Cents(200),
                count: 5
            }
        );
        let ScenarioStep::Attempt(spec) = steps[1].as_ref().unwrap() else {
            panic!("expected attempt");
        };
        assert_eq!(spec.program.price, Cents(500));
        assert_eq!(spec.method, PaymentMethod::Cash);
        assert_eq!(spec.bills, vec![Cents(500)]);
        assert_eq!(spec.coins, vec![Cents(200), Cents(50)]);
        assert_eq!(spec.inserted(), Cents(750));
        assert_eq!(spec.wash, WashBehaviour::Healthy);
    }

    #[test]
    fn test_reader_defaults_for_empty_columns() {
        let steps = read("attempt,Basic,3,card,,,,,,,");
        let ScenarioStep::Attempt(spec) = steps[0].as_ref().unwrap() else {
            panic!("expected attempt");
        };
        assert!(spec.bills.is_empty());
        assert!(!spec.cancel);
        assert_eq!(spec.wash, WashBehaviour::Healthy);
    }

    #[test]
    fn test_reader_bad_rows_do_not_stop_the_stream() {
        let steps = read(
            "attempt,Basic,3,cheque,,,,,,,\n\
             refill,,,,,,,,,,\n\
             attempt,Basic,3,cash,5,,,teleport,,,\n\
             attempt,Basic,3,cash,5,,,,,,",
        );
        assert_eq!(steps.len(), 4);
        assert!(steps[0].is_err());
        assert!(steps[1].is_err());
        assert!(steps[2].is_err());
        assert!(steps[3].is_ok());
    }

    #[test]
    fn test_reader_rejects_sub_cent_amounts() {
        let steps = read("attempt,Basic,3,cash,0.005,,,,,,");
        assert!(steps[0].is_err());
    }
}
