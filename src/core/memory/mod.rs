//! In-process implementations of the core traits
//!
//! - `ledger` - double-entry [`MemoryLedger`]
//! - `record_store` - snapshot-isolated [`MemoryRecordStore`]
//! - `directory` - [`MemoryDirectory`] of user and merchant profiles

pub mod directory;
pub mod ledger;
pub mod record_store;

pub use directory::MemoryDirectory;
pub use ledger::MemoryLedger;
pub use record_store::MemoryRecordStore;
