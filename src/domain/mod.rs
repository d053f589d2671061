//! Domain types and pure settlement logic. No I/O happens here.

pub mod change;
pub mod flow;
pub mod money;
pub mod ports;
pub mod session;
pub mod settlement;
pub mod wash;
