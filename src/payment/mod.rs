pub mod calculator;
pub mod rail;
pub mod verification;

pub use calculator::{compute, PaymentBreakdown};
pub use rail::PaymentRailClient;
pub use verification::PaymentVerification;
