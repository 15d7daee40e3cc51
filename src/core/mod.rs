//! Core business logic module
//!
//! This module contains the payment processing components:
//! - `traits` - seams to the ledger, the record store, the user directory and the clock
//! - `memory` - in-process implementations of those traits
//! - `ledger` - typed ledger adapter
//! - `policy` - discount pricing and payment gates
//! - `coordinator` - value-moving operations under the intent discipline
//! - `history` - financial history projection
//! - `reconciler` - background closing of stranded pending intents
//! - `events` - payment event fan-out

pub mod clock;
pub mod coordinator;
pub mod events;
pub mod history;
pub mod ledger;
pub mod memory;
pub mod policy;
pub mod reconciler;
pub mod traits;

pub use clock::{ManualClock, SystemClock};
pub use coordinator::PaymentCoordinator;
pub use events::{EventBus, EventOutcome, PaymentEvent};
pub use history::HistoryProjector;
pub use ledger::{AccountCreation, LedgerAdapter};
pub use policy::{MerchantCategory, Policy};
pub use reconciler::{Inconsistency, ReconcileReport, Reconciler, ReconcilerConfig};
pub use traits::{Clock, Directory, Ledger, RecordScope, RecordStore};
