//! In-memory store.
//!
//! A full implementation of the persistence port over process-local tables,
//! used by the test suites and as a reference for the locking contract. The
//! whole table set sits behind one async mutex: a unit-of-work takes the
//! guard for its lifetime and mutates a working copy, so concurrent
//! units-of-work serialize (coarser than the per-row locks of the Postgres
//! store, but within the contract) and dropping the unit-of-work without
//! committing discards every staged write.

use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{DisposalFilter, Store, TransactionFilter, UnitOfWork};
use crate::{
	domain::{
		Account, AccountBalance, Entry, LotDisposal, LotOverrideHistory, TaxLot, Transaction,
	},
	errors::LedgerError,
	money::Amount,
};

#[derive(Clone, Default)]
struct Tables {
	accounts: HashMap<Uuid, Account>,
	code_index: HashMap<String, Uuid>,
	transactions: HashMap<Uuid, Transaction>,
	source_index: HashMap<(String, String), Uuid>,
	entries: Vec<Entry>,
	balances: BTreeMap<(Uuid, String), AccountBalance>,
	lots: HashMap<Uuid, TaxLot>,
	disposals: Vec<LotDisposal>,
	override_history: Vec<LotOverrideHistory>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
	tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

pub struct MemoryUnitOfWork {
	guard: OwnedMutexGuard<Tables>,
	work: Tables,
}

#[async_trait]
impl Store for MemoryStore {
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, LedgerError> {
		let guard = self.tables.clone().lock_owned().await;
		let work = guard.clone();
		Ok(Box::new(MemoryUnitOfWork { guard, work }))
	}

	async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError> {
		self.tables
			.lock()
			.await
			.accounts
			.get(&id)
			.cloned()
			.ok_or_else(|| LedgerError::NotFound(format!("account {id}")))
	}

	async fn get_account_by_code(&self, code: &str) -> Result<Option<Account>, LedgerError> {
		let tables = self.tables.lock().await;
		Ok(tables.code_index.get(code).map(|id| tables.accounts[id].clone()))
	}

	async fn find_accounts_by_wallet(&self, wallet_id: Uuid) -> Result<Vec<Account>, LedgerError> {
		Ok(self
			.tables
			.lock()
			.await
			.accounts
			.values()
			.filter(|a| a.wallet_id == Some(wallet_id))
			.cloned()
			.collect())
	}

	async fn get_transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
		self.tables
			.lock()
			.await
			.transactions
			.get(&id)
			.cloned()
			.ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))
	}

	async fn find_by_source(
		&self,
		source: &str,
		external_id: &str,
	) -> Result<Option<Transaction>, LedgerError> {
		let tables = self.tables.lock().await;
		Ok(tables
			.source_index
			.get(&(source.to_string(), external_id.to_string()))
			.map(|id| tables.transactions[id].clone()))
	}

	async fn list_transactions(
		&self,
		filter: &TransactionFilter,
	) -> Result<Vec<Transaction>, LedgerError> {
		let tables = self.tables.lock().await;
		let mut matches: Vec<Transaction> = tables
			.transactions
			.values()
			.filter(|tx| filter.wallet_id.is_none_or(|w| tx.wallet_id == Some(w)))
			.filter(|tx| filter.tx_type.is_none_or(|t| tx.tx_type == t))
			.filter(|tx| filter.status.is_none_or(|s| tx.status == s))
			.filter(|tx| filter.occurred_after.is_none_or(|t| tx.occurred_at >= t))
			.filter(|tx| filter.occurred_before.is_none_or(|t| tx.occurred_at <= t))
			.cloned()
			.collect();
		matches.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
		if let Some(limit) = filter.limit {
			matches.truncate(limit);
		}
		Ok(matches)
	}

	async fn get_entries_by_transaction(
		&self,
		transaction_id: Uuid,
	) -> Result<Vec<Entry>, LedgerError> {
		Ok(self
			.tables
			.lock()
			.await
			.entries
			.iter()
			.filter(|e| e.transaction_id == transaction_id)
			.cloned()
			.collect())
	}

	async fn get_entries_by_account(&self, account_id: Uuid) -> Result<Vec<Entry>, LedgerError> {
		Ok(self
			.tables
			.lock()
			.await
			.entries
			.iter()
			.filter(|e| e.account_id == Some(account_id))
			.cloned()
			.collect())
	}

	async fn get_balance(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Option<AccountBalance>, LedgerError> {
		Ok(self.tables.lock().await.balances.get(&(account_id, asset_id.to_string())).cloned())
	}

	async fn list_balances(&self, account_id: Uuid) -> Result<Vec<AccountBalance>, LedgerError> {
		Ok(self
			.tables
			.lock()
			.await
			.balances
			.values()
			.filter(|b| b.account_id == account_id)
			.cloned()
			.collect())
	}

	async fn list_all_balances(&self) -> Result<Vec<AccountBalance>, LedgerError> {
		Ok(self.tables.lock().await.balances.values().cloned().collect())
	}

	async fn calculate_balance_from_entries(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Amount, LedgerError> {
		Ok(self
			.tables
			.lock()
			.await
			.entries
			.iter()
			.filter(|e| e.account_id == Some(account_id) && e.asset_id == asset_id)
			.fold(Amount::zero(), |acc, e| acc + e.signed_amount()))
	}

	async fn get_lot(&self, id: Uuid) -> Result<TaxLot, LedgerError> {
		self.tables
			.lock()
			.await
			.lots
			.get(&id)
			.cloned()
			.ok_or_else(|| LedgerError::NotFound(format!("lot {id}")))
	}

	async fn list_lots(&self, account_id: Uuid, asset: &str) -> Result<Vec<TaxLot>, LedgerError> {
		let mut lots: Vec<TaxLot> = self
			.tables
			.lock()
			.await
			.lots
			.values()
			.filter(|l| l.account_id == account_id && l.asset == asset)
			.cloned()
			.collect();
		lots.sort_by(|a, b| (a.acquired_at, a.created_at).cmp(&(b.acquired_at, b.created_at)));
		Ok(lots)
	}

	async fn list_disposals(
		&self,
		filter: &DisposalFilter,
	) -> Result<Vec<LotDisposal>, LedgerError> {
		let tables = self.tables.lock().await;
		let mut disposals: Vec<LotDisposal> = tables
			.disposals
			.iter()
			.filter(|d| {
				let lot = &tables.lots[&d.lot_id];
				filter.account_id.is_none_or(|a| lot.account_id == a) &&
					filter.asset.as_deref().is_none_or(|x| lot.asset == x)
			})
			.filter(|d| filter.disposed_after.is_none_or(|t| d.disposed_at >= t))
			.filter(|d| filter.disposed_before.is_none_or(|t| d.disposed_at <= t))
			.cloned()
			.collect();
		disposals.sort_by(|a, b| a.disposed_at.cmp(&b.disposed_at));
		Ok(disposals)
	}

	async fn list_override_history(
		&self,
		lot_id: Uuid,
	) -> Result<Vec<LotOverrideHistory>, LedgerError> {
		Ok(self
			.tables
			.lock()
			.await
			.override_history
			.iter()
			.filter(|h| h.lot_id == lot_id)
			.cloned()
			.collect())
	}
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
	async fn get_or_create_account(&mut self, candidate: Account) -> Result<Account, LedgerError> {
		candidate.validate()?;
		if let Some(id) = self.work.code_index.get(&candidate.code) {
			return Ok(self.work.accounts[id].clone());
		}
		self.work.code_index.insert(candidate.code.clone(), candidate.id);
		self.work.accounts.insert(candidate.id, candidate.clone());
		Ok(candidate)
	}

	async fn create_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
		if let Some(external_id) = &tx.external_id {
			let key = (tx.source.clone(), external_id.clone());
			if self.work.source_index.contains_key(&key) {
				return Err(LedgerError::Conflict(format!(
					"transaction for source `{}` external id `{}` already exists",
					tx.source, external_id
				)));
			}
			self.work.source_index.insert(key, tx.id);
		}
		self.work.transactions.insert(tx.id, tx.clone());
		self.work.entries.extend(tx.entries.iter().cloned());
		Ok(())
	}

	async fn get_balance(
		&mut self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Option<AccountBalance>, LedgerError> {
		Ok(self.work.balances.get(&(account_id, asset_id.to_string())).cloned())
	}

	async fn get_balance_for_update(
		&mut self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<AccountBalance, LedgerError> {
		Ok(self
			.work
			.balances
			.get(&(account_id, asset_id.to_string()))
			.cloned()
			.unwrap_or_else(|| AccountBalance::zero(account_id, asset_id)))
	}

	async fn upsert_balance(&mut self, balance: &AccountBalance) -> Result<(), LedgerError> {
		self.work
			.balances
			.insert((balance.account_id, balance.asset_id.clone()), balance.clone());
		Ok(())
	}

	async fn create_lot(&mut self, lot: &TaxLot) -> Result<(), LedgerError> {
		lot.validate()?;
		self.work.lots.insert(lot.id, lot.clone());
		Ok(())
	}

	async fn get_lot(&mut self, id: Uuid) -> Result<TaxLot, LedgerError> {
		self.work
			.lots
			.get(&id)
			.cloned()
			.ok_or_else(|| LedgerError::NotFound(format!("lot {id}")))
	}

	async fn open_lots_for_update(
		&mut self,
		account_id: Uuid,
		asset: &str,
	) -> Result<Vec<TaxLot>, LedgerError> {
		let mut lots: Vec<TaxLot> = self
			.work
			.lots
			.values()
			.filter(|l| l.account_id == account_id && l.asset == asset && l.is_open())
			.cloned()
			.collect();
		lots.sort_by(|a, b| (a.acquired_at, a.created_at).cmp(&(b.acquired_at, b.created_at)));
		Ok(lots)
	}

	async fn decrement_lot_remaining(
		&mut self,
		lot_id: Uuid,
		delta: &Amount,
	) -> Result<(), LedgerError> {
		let lot = self
			.work
			.lots
			.get_mut(&lot_id)
			.ok_or_else(|| LedgerError::NotFound(format!("lot {lot_id}")))?;
		if delta > &lot.quantity_remaining {
			// Mirrors the CHECK constraint of the relational schema.
			return Err(LedgerError::Storage(format!(
				"lot {lot_id} remaining would fall below zero"
			)));
		}
		lot.quantity_remaining -= delta;
		Ok(())
	}

	async fn record_disposal(&mut self, disposal: &LotDisposal) -> Result<(), LedgerError> {
		disposal.validate()?;
		self.work.disposals.push(disposal.clone());
		Ok(())
	}

	async fn set_override(
		&mut self,
		lot_id: Uuid,
		cost: Option<Amount>,
		reason: &str,
		at: DateTime<Utc>,
	) -> Result<(), LedgerError> {
		let lot = self
			.work
			.lots
			.get_mut(&lot_id)
			.ok_or_else(|| LedgerError::NotFound(format!("lot {lot_id}")))?;
		lot.override_cost_basis_per_unit = cost;
		lot.override_reason = Some(reason.to_string());
		lot.override_at = Some(at);
		Ok(())
	}

	async fn append_override_history(
		&mut self,
		row: &LotOverrideHistory,
	) -> Result<(), LedgerError> {
		self.work.override_history.push(row.clone());
		Ok(())
	}

	async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
		let mut this = *self;
		*this.guard = this.work;
		Ok(())
	}

	async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
		// Dropping the working copy is the rollback.
		Ok(())
	}
}
