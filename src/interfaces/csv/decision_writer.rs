use crate::domain::money::Cents;
use crate::domain::settlement::SettlementDecision;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

/// One output line; amounts in euros.
#[derive(Debug, Serialize)]
struct DecisionRow {
    attempt: usize,
    success: bool,
    paid: Decimal,
    target: Decimal,
    change: Decimal,
    refund: Decimal,
    remaining: Decimal,
    final_state: String,
    reason: String,
    error: String,
}

fn euros(amount: Cents) -> Decimal {
    amount.to_euros().normalize()
}

impl DecisionRow {
    fn new(attempt: usize, decision: &SettlementDecision) -> Self {
        Self {
            attempt,
            success: decision.success,
            paid: euros(decision.paid),
            target: euros(decision.target),
            change: euros(decision.change_dispensed),
            refund: euros(decision.refund_dispensed),
            remaining: euros(decision.remaining),
            final_state: decision.final_state.to_string(),
            reason: decision.reason.to_string(),
            error: decision
                .error
                .map(|code| code.as_str().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Writes settlement decisions as CSV:
/// `attempt,success,paid,target,change,refund,remaining,final_state,reason,error`.
pub struct DecisionWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> DecisionWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// `attempt` is the 1-based position of the purchase in the scenario.
    pub fn write_decision(&mut self, attempt: usize, decision: &SettlementDecision) -> Result<()> {
        self.writer.serialize(DecisionRow::new(attempt, decision))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::AttemptId;
    use crate::domain::settlement::{FinalState, FinishReason};
    use crate::error::ErrorCode;
    use chrono::Utc;

    #[test]
    fn test_writer_renders_euros() {
        let decision = SettlementDecision {
            attempt_id: AttemptId::new(),
            success: true,
            paid: Cents(750),
            target: Cents(500),
            change_dispensed: Cents(250),
            refund_dispensed: Cents::ZERO,
            kept: Cents(500),
            remaining: Cents::ZERO,
            final_state: FinalState::Success,
            reason: FinishReason::PaySuccess,
            error: None,
            decided_at: Utc::now(),
        };
        let mut out = Vec::new();
        {
            let mut writer = DecisionWriter::new(&mut out);
            writer.write_decision(1, &decision).unwrap();
            writer.flush().unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "attempt,success,paid,target,change,refund,remaining,final_state,reason,error\n\
             1,true,7.5,5,2.5,0,0,success,pay_success,\n"
        );
    }

    #[test]
    fn test_writer_renders_error_code() {
        let decision = SettlementDecision {
            attempt_id: AttemptId::new(),
            success: false,
            paid: Cents(200),
            target: Cents(500),
            change_dispensed: Cents::ZERO,
            refund_dispensed: Cents::ZERO,
            kept: Cents::ZERO,
            remaining: Cents(200),
            final_state: FinalState::RefundPending,
            reason: FinishReason::Timeout,
            error: Some(ErrorCode::RefundIncomplete),
            decided_at: Utc::now(),
        };
        let mut out = Vec::new();
        {
            let mut writer = DecisionWriter::new(&mut out);
            writer.write_decision(3, &decision).unwrap();
            writer.flush().unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("3,false,2,5,0,0,2,refund_pending,timeout,REFUND_INCOMPLETE\n"));
    }
}
