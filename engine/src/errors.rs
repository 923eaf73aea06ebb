use uuid::Uuid;

use crate::money::Amount;

/// Error taxonomy shared by every layer of the ledger. Business-logic
/// conditions never panic; each fallible operation surfaces one of these.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	/// Parse failures and missing required fields at the request boundary.
	#[error("invalid input: {0}")]
	InvalidInput(String),

	/// A domain invariant does not hold (negative amount, future timestamp,
	/// wallet id on a non-wallet account, ...).
	#[error("domain invariant violated: {0}")]
	InvalidDomain(String),

	/// Handler-level ownership check failed.
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	/// No handler registered for the requested transaction type tag.
	#[error("no handler registered for transaction type `{0}`")]
	NotRegistered(String),

	/// Attempt to register a second handler for the same type tag.
	#[error("a handler is already registered for transaction type `{0}`")]
	AlreadyRegistered(String),

	/// Attempt to register a handler with an empty type tag.
	#[error("handler type tag must not be empty")]
	EmptyTypeTag,

	#[error("{0} not found")]
	NotFound(String),

	/// Duplicate `(source, external_id)` pair.
	#[error("conflict: {0}")]
	Conflict(String),

	/// Global debit/credit sums diverge.
	#[error("entries do not balance: debits {debits}, credits {credits}")]
	Unbalanced { debits: Amount, credits: Amount },

	/// A crypto-wallet balance would be driven below zero.
	#[error("balance of account `{account}` for asset {asset_id} would become {projected}")]
	NegativeBalance { account: String, asset_id: String, projected: Amount },

	/// FIFO disposal cannot cover the requested quantity.
	#[error("open lots cover {available} of requested {requested}")]
	InsufficientLots { requested: Amount, available: Amount },

	/// Reconciliation divergence between the entry log and the denormalized
	/// balance.
	#[error(
		"balance mismatch for account {account_id} asset {asset_id}: entries sum to {expected}, balance row holds {observed}"
	)]
	BalanceMismatch { account_id: Uuid, asset_id: String, expected: Amount, observed: Amount },

	/// Retryable storage condition (lock contention, pool timeout, ...).
	/// The ledger never retries internally; the caller decides.
	#[error("transient storage failure: {0}")]
	Transient(String),

	#[error("operation cancelled")]
	Cancelled,

	/// Driver failure that maps to no taxonomy kind.
	#[error("storage error: {0}")]
	Storage(String),
}

impl LedgerError {
	/// Whether the caller may retry the operation verbatim.
	pub fn is_transient(&self) -> bool {
		matches!(self, LedgerError::Transient(_))
	}
}
