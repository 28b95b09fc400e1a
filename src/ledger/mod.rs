pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use store::LedgerStore;
