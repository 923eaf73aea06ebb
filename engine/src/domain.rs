//! Ledger value objects and their invariants.
//!
//! Every type exposes `validate()`; persistence and the validator call it
//! before anything is written. Accepted records are immutable: the only
//! mutable numeric fields in the whole model are the denormalized balance row
//! and `TaxLot::quantity_remaining`.

pub mod account;
pub mod balance;
pub mod entry;
pub mod lot;
pub mod transaction;

pub use account::{Account, AccountType};
pub use balance::AccountBalance;
pub use entry::{Direction, Entry, EntryType};
pub use lot::{CostBasisSource, DisposalType, LotDisposal, LotOverrideHistory, TaxLot};
pub use transaction::{Transaction, TransactionStatus, TransactionType};

/// Free-form metadata attached to accounts, entries and transactions.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
