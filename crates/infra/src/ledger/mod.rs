//! Subscriptions, quota admission and the append-only usage ledger.

pub mod postgres;
pub mod service;
pub mod store;

pub use postgres::PostgresLedgerStore;
pub use service::UsageLedger;
pub use store::{InMemoryLedgerStore, LedgerStore, LedgerStoreError, RecordOutcome};
