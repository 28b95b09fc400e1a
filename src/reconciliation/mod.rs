pub mod service;

pub use service::{ReconcileOutcome, ReconciliationService};
