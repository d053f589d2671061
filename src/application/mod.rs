//! Application layer: the async controllers that drive one purchase attempt.
//!
//! `PaymentOrchestrator` is the entry point. It owns the cash session, the
//! settlement finalizer and the wash-start controller, and wires them to the
//! gateway handles it was built with.

pub mod cash_session;
pub mod finalizer;
pub mod flow_handle;
pub mod orchestrator;
pub mod payout;
pub mod tracker;
pub mod wash_start;
