pub mod engine;
pub mod sweeper;

pub use engine::{SettlementEngine, SettlementOutcome};
pub use sweeper::ExpirySweeper;
