//! Durable, append-only record of every stage transition.
//!
//! [`RunLedger`] stores sealed [`corvus_types::LedgerEntry`] values in SQLite
//! (WAL mode, so readers never block the writer) and chains each entry to the
//! previous one of the same run. [`LedgerAnchor`] captures a run's chain state
//! for storage outside the ledger.

pub mod anchor;
pub mod ledger;

pub use anchor::LedgerAnchor;
pub use ledger::{RunLedger, DEFAULT_MAX_CONNECTIONS};
