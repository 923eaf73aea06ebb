//! Persistence port.
//!
//! `Store` is the pool-scoped read side plus the unit-of-work factory;
//! `UnitOfWork` is the scoped transactional handle every write goes through.
//! Dropping a unit-of-work without committing rolls it back on all exit
//! paths, including panics and cancellation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
	domain::{
		Account, AccountBalance, Entry, LotDisposal, LotOverrideHistory, TaxLot, Transaction,
		TransactionStatus, TransactionType,
	},
	errors::LedgerError,
	money::Amount,
};

#[derive(Clone, Debug, Default)]
pub struct TransactionFilter {
	pub wallet_id: Option<Uuid>,
	pub tx_type: Option<TransactionType>,
	pub status: Option<TransactionStatus>,
	pub occurred_after: Option<DateTime<Utc>>,
	pub occurred_before: Option<DateTime<Utc>>,
	pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct DisposalFilter {
	pub account_id: Option<Uuid>,
	pub asset: Option<String>,
	pub disposed_after: Option<DateTime<Utc>>,
	pub disposed_before: Option<DateTime<Utc>>,
}

/// Pool-scoped repository operations. Reads outside a unit-of-work observe a
/// snapshot consistent with some past commit.
#[async_trait]
pub trait Store: Send + Sync {
	/// Open a unit-of-work. All writes between `begin` and `commit` become
	/// visible atomically.
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, LedgerError>;

	async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError>;
	async fn get_account_by_code(&self, code: &str) -> Result<Option<Account>, LedgerError>;
	async fn find_accounts_by_wallet(&self, wallet_id: Uuid) -> Result<Vec<Account>, LedgerError>;

	/// Transaction with its entries.
	async fn get_transaction(&self, id: Uuid) -> Result<Transaction, LedgerError>;
	async fn find_by_source(
		&self,
		source: &str,
		external_id: &str,
	) -> Result<Option<Transaction>, LedgerError>;
	async fn list_transactions(
		&self,
		filter: &TransactionFilter,
	) -> Result<Vec<Transaction>, LedgerError>;

	async fn get_entries_by_transaction(
		&self,
		transaction_id: Uuid,
	) -> Result<Vec<Entry>, LedgerError>;
	async fn get_entries_by_account(&self, account_id: Uuid) -> Result<Vec<Entry>, LedgerError>;

	/// `None` when no balance row exists yet.
	async fn get_balance(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Option<AccountBalance>, LedgerError>;
	async fn list_balances(&self, account_id: Uuid) -> Result<Vec<AccountBalance>, LedgerError>;
	/// Every persisted balance row; the reconciliation sweep's work list.
	async fn list_all_balances(&self) -> Result<Vec<AccountBalance>, LedgerError>;

	/// Signed sum (debit positive, credit negative) of all entries for the
	/// pair, straight from the entry log.
	async fn calculate_balance_from_entries(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Amount, LedgerError>;

	async fn get_lot(&self, id: Uuid) -> Result<TaxLot, LedgerError>;
	async fn list_lots(&self, account_id: Uuid, asset: &str) -> Result<Vec<TaxLot>, LedgerError>;
	async fn list_disposals(
		&self,
		filter: &DisposalFilter,
	) -> Result<Vec<LotDisposal>, LedgerError>;
	async fn list_override_history(
		&self,
		lot_id: Uuid,
	) -> Result<Vec<LotOverrideHistory>, LedgerError>;
}

/// Scoped transactional handle. Within one unit-of-work the implementation
/// guarantees read-your-own-writes; across units, writes to the same
/// `(account, asset)` pair serialize on the balance row lock.
#[async_trait]
pub trait UnitOfWork: Send {
	/// Idempotent upsert on `code`: insert the candidate, or return the
	/// account that already owns the code. Safe under concurrent attempts to
	/// create the same code; the insert is rolled back with the rest of the
	/// unit-of-work if it never commits.
	async fn get_or_create_account(&mut self, candidate: Account) -> Result<Account, LedgerError>;

	/// Insert the transaction and all of its entries in one call. A
	/// duplicate `(source, external_id)` surfaces as `Conflict`.
	async fn create_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError>;

	/// Non-locking read of the balance row inside this unit-of-work
	/// (read-your-own-writes). `None` when no row exists yet.
	async fn get_balance(
		&mut self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Option<AccountBalance>, LedgerError>;

	/// Read the balance row under an exclusive row-level lock, synthesizing
	/// a zero-valued row when none exists yet. The lock is held until commit
	/// or rollback.
	async fn get_balance_for_update(
		&mut self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<AccountBalance, LedgerError>;

	async fn upsert_balance(&mut self, balance: &AccountBalance) -> Result<(), LedgerError>;

	async fn create_lot(&mut self, lot: &TaxLot) -> Result<(), LedgerError>;

	async fn get_lot(&mut self, id: Uuid) -> Result<TaxLot, LedgerError>;

	/// Open lots (`quantity_remaining > 0`) for the pair, locked for update,
	/// ordered by `acquired_at` ascending. The deterministic order is what
	/// keeps concurrent disposals deadlock-free.
	async fn open_lots_for_update(
		&mut self,
		account_id: Uuid,
		asset: &str,
	) -> Result<Vec<TaxLot>, LedgerError>;

	async fn decrement_lot_remaining(
		&mut self,
		lot_id: Uuid,
		delta: &Amount,
	) -> Result<(), LedgerError>;

	async fn record_disposal(&mut self, disposal: &LotDisposal) -> Result<(), LedgerError>;

	/// Write (or clear, with `None`) the override cost basis on a lot.
	async fn set_override(
		&mut self,
		lot_id: Uuid,
		cost: Option<Amount>,
		reason: &str,
		at: DateTime<Utc>,
	) -> Result<(), LedgerError>;

	async fn append_override_history(
		&mut self,
		row: &LotOverrideHistory,
	) -> Result<(), LedgerError>;

	async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
	async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}
