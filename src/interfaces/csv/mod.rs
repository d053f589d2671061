pub mod decision_writer;
pub mod scenario_reader;
