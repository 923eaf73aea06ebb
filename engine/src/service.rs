//! Service facade.
//!
//! `Ledger` wires the handler registry and the committer (which runs account
//! resolution, validation and the balance/lot writes inside one
//! unit-of-work) into the `record_transaction` pipeline and exposes the read
//! APIs. A failed stage never leaves partial writes: the caller gets the
//! error plus an in-memory `Failed` transaction it may persist for audit.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
	committer,
	constants::DEFAULT_WRITE_DEADLINE,
	domain::{
		AccountBalance, LotDisposal, LotOverrideHistory, Metadata, TaxLot, Transaction,
		TransactionStatus, TransactionType,
	},
	errors::LedgerError,
	handlers::{wallet_code, HandlerRegistry},
	lots,
	money::Amount,
	reconcile,
	store::{DisposalFilter, Store, TransactionFilter},
};

/// A write request: the type tag picks the handler, `raw_data` is the
/// handler's payload, and `(source, external_id)` carries idempotency.
#[derive(Clone, Debug)]
pub struct RecordTransaction {
	pub tx_type: String,
	pub source: String,
	pub external_id: Option<String>,
	pub occurred_at: DateTime<Utc>,
	pub raw_data: serde_json::Value,
}

/// Failure of the record pipeline. `failed` is the in-memory transaction
/// marked `Failed` with the error text (absent only when the type tag was
/// not parseable at all); it is not persisted here.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RecordFailure {
	pub error: LedgerError,
	pub failed: Option<Box<Transaction>>,
}

/// Per-disposal PnL line of the read API.
#[derive(Clone, Debug)]
pub struct DisposalReport {
	pub disposal: LotDisposal,
	pub effective_cost_basis_per_unit: Amount,
	pub realized_pnl: Amount,
}

pub struct Ledger {
	store: Arc<dyn Store>,
	registry: Arc<HandlerRegistry>,
	write_deadline: Duration,
}

impl Ledger {
	pub fn new(store: Arc<dyn Store>, registry: Arc<HandlerRegistry>) -> Self {
		Self { store, registry, write_deadline: DEFAULT_WRITE_DEADLINE }
	}

	pub fn with_write_deadline(mut self, write_deadline: Duration) -> Self {
		self.write_deadline = write_deadline;
		self
	}

	pub fn store(&self) -> &dyn Store {
		self.store.as_ref()
	}

	/// Run the full write pipeline under the write deadline, observing the
	/// caller's cancellation token. Cancellation or timeout before commit
	/// rolls back; a transaction that already committed stays committed.
	pub async fn record_transaction(
		&self,
		request: RecordTransaction,
		cancel: &CancellationToken,
	) -> Result<Transaction, RecordFailure> {
		let result = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				let failed = TransactionType::parse(&request.tx_type)
					.ok()
					.map(|tx_type| failed_transaction(&request, tx_type, &LedgerError::Cancelled));
				Err(RecordFailure { error: LedgerError::Cancelled, failed })
			},
			result = tokio::time::timeout(self.write_deadline, self.pipeline(&request)) => {
				match result {
					Ok(result) => result,
					Err(_) => {
						let error = LedgerError::Transient(format!(
							"write deadline of {:?} exceeded",
							self.write_deadline
						));
						let failed = TransactionType::parse(&request.tx_type)
							.ok()
							.map(|tx_type| failed_transaction(&request, tx_type, &error));
						Err(RecordFailure { error, failed })
					},
				}
			},
		};
		match &result {
			Ok(transaction) => {
				info!(
					transaction_id = %transaction.id,
					tx_type = transaction.tx_type.as_str(),
					source = %transaction.source,
					"transaction recorded"
				);
			},
			Err(failure) => {
				warn!(
					tx_type = %request.tx_type,
					source = %request.source,
					error = %failure.error,
					"transaction rejected"
				);
			},
		}
		result
	}

	async fn pipeline(&self, request: &RecordTransaction) -> Result<Transaction, RecordFailure> {
		let tx_type = TransactionType::parse(&request.tx_type)
			.map_err(|error| RecordFailure { error, failed: None })?;
		let fail = |error: LedgerError| {
			let failed = Some(failed_transaction(request, tx_type, &error));
			RecordFailure { error, failed }
		};

		let handler = self.registry.get(&request.tx_type).map_err(&fail)?;
		handler.validate(self.store.as_ref(), &request.raw_data).await.map_err(&fail)?;
		let entries =
			handler.generate_entries(self.store.as_ref(), &request.raw_data).await.map_err(&fail)?;

		let mut transaction = Transaction {
			id: Uuid::new_v4(),
			tx_type,
			source: request.source.clone(),
			external_id: request.external_id.clone(),
			wallet_id: wallet_id_of(&request.raw_data),
			status: TransactionStatus::Completed,
			version: 1,
			occurred_at: request.occurred_at,
			recorded_at: Utc::now(),
			raw_data: request.raw_data.clone(),
			metadata: Metadata::new(),
			error_message: None,
			entries,
		};
		for entry in &mut transaction.entries {
			entry.transaction_id = transaction.id;
		}

		// Account resolution, validation and the balance/lot writes all run
		// inside the committer's single unit-of-work, so a failure at any of
		// those stages rolls back every write, resolved accounts included.
		committer::commit_transaction(self.store.as_ref(), &mut transaction)
			.await
			.map_err(&fail)?;
		Ok(transaction)
	}

	// ==== Read APIs ====

	pub async fn get_transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
		self.store.get_transaction(id).await
	}

	pub async fn list_transactions(
		&self,
		filter: &TransactionFilter,
	) -> Result<Vec<Transaction>, LedgerError> {
		self.store.list_transactions(filter).await
	}

	/// Balance of `wallet.<wallet_id>.<asset>`. Missing account or balance
	/// row reads as zero; this is the only absence-is-zero read the service
	/// exposes.
	pub async fn wallet_balance(
		&self,
		wallet_id: Uuid,
		asset_id: &str,
	) -> Result<Amount, LedgerError> {
		let code = wallet_code(wallet_id, asset_id);
		match self.store.get_account_by_code(&code).await? {
			Some(account) => Ok(self
				.store
				.get_balance(account.id, asset_id)
				.await?
				.map(|b| b.balance)
				.unwrap_or_else(Amount::zero)),
			None => Ok(Amount::zero()),
		}
	}

	/// Every balance row of every account attached to the wallet.
	pub async fn wallet_balances(
		&self,
		wallet_id: Uuid,
	) -> Result<Vec<AccountBalance>, LedgerError> {
		let mut balances = Vec::new();
		for account in self.store.find_accounts_by_wallet(wallet_id).await? {
			balances.extend(self.store.list_balances(account.id).await?);
		}
		Ok(balances)
	}

	pub async fn list_lots(
		&self,
		wallet_id: Uuid,
		asset_id: &str,
	) -> Result<Vec<TaxLot>, LedgerError> {
		let code = wallet_code(wallet_id, asset_id);
		match self.store.get_account_by_code(&code).await? {
			Some(account) => self.store.list_lots(account.id, asset_id).await,
			None => Ok(Vec::new()),
		}
	}

	/// Realized PnL per disposal, derived on read from the current effective
	/// cost basis of each lot.
	pub async fn realized_pnl(
		&self,
		filter: &DisposalFilter,
	) -> Result<Vec<DisposalReport>, LedgerError> {
		let disposals = self.store.list_disposals(filter).await?;
		let mut lot_cache: HashMap<Uuid, TaxLot> = HashMap::new();
		let mut reports = Vec::with_capacity(disposals.len());
		for disposal in disposals {
			if !lot_cache.contains_key(&disposal.lot_id) {
				let lot = self.store.get_lot(disposal.lot_id).await?;
				lot_cache.insert(disposal.lot_id, lot);
			}
			let lot = &lot_cache[&disposal.lot_id];
			let effective_cost_basis_per_unit =
				lots::effective_cost_basis(self.store.as_ref(), lot).await?;
			let realized_pnl = lots::realized_pnl(&disposal, &effective_cost_basis_per_unit);
			reports.push(DisposalReport {
				disposal,
				effective_cost_basis_per_unit,
				realized_pnl,
			});
		}
		Ok(reports)
	}

	/// Override (or clear) a lot's cost basis, appending the audit row.
	pub async fn set_lot_override(
		&self,
		lot_id: Uuid,
		new_cost: Option<Amount>,
		reason: &str,
	) -> Result<LotOverrideHistory, LedgerError> {
		let mut uow = self.store.begin().await?;
		match lots::apply_override(uow.as_mut(), lot_id, new_cost, reason).await {
			Ok(row) => {
				uow.commit().await?;
				info!(%lot_id, reason, "lot cost basis overridden");
				Ok(row)
			},
			Err(e) => {
				uow.rollback().await.ok();
				Err(e)
			},
		}
	}

	pub async fn override_history(
		&self,
		lot_id: Uuid,
	) -> Result<Vec<LotOverrideHistory>, LedgerError> {
		self.store.list_override_history(lot_id).await
	}

	pub async fn reconcile(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<(), LedgerError> {
		reconcile::reconcile(self.store.as_ref(), account_id, asset_id).await
	}

	/// Audit every persisted balance row; returns the mismatch count.
	pub async fn reconcile_all(&self) -> Result<usize, LedgerError> {
		reconcile::sweep(self.store.as_ref()).await
	}
}

fn failed_transaction(
	request: &RecordTransaction,
	tx_type: TransactionType,
	error: &LedgerError,
) -> Box<Transaction> {
	Box::new(Transaction {
		id: Uuid::new_v4(),
		tx_type,
		source: request.source.clone(),
		external_id: request.external_id.clone(),
		wallet_id: wallet_id_of(&request.raw_data),
		status: TransactionStatus::Failed,
		version: 1,
		occurred_at: request.occurred_at,
		recorded_at: Utc::now(),
		raw_data: request.raw_data.clone(),
		metadata: Metadata::new(),
		error_message: Some(error.to_string()),
		entries: Vec::new(),
	})
}

fn wallet_id_of(raw_data: &serde_json::Value) -> Option<Uuid> {
	["wallet_id", "from_wallet_id"]
		.into_iter()
		.find_map(|key| raw_data.get(key))
		.and_then(|v| v.as_str())
		.and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{handlers, money::usd, store::memory::MemoryStore};

	fn ledger() -> Ledger {
		Ledger::new(
			Arc::new(MemoryStore::new()),
			Arc::new(handlers::default_registry().unwrap()),
		)
	}

	fn income_request(wallet_id: Uuid, amount: &str) -> RecordTransaction {
		RecordTransaction {
			tx_type: "manual_income".into(),
			source: "manual".into(),
			external_id: None,
			occurred_at: Utc::now(),
			raw_data: serde_json::json!({
				"wallet_id": wallet_id,
				"asset_id": "BTC",
				"amount": amount,
				"occurred_at": Utc::now(),
				"decimals": 8,
				"usd_rate": usd(50_000).to_string(),
			}),
		}
	}

	#[tokio::test]
	async fn unknown_type_tag_fails_without_a_transaction() {
		let ledger = ledger();
		let cancel = CancellationToken::new();
		let request = RecordTransaction {
			tx_type: "teleport".into(),
			source: "manual".into(),
			external_id: None,
			occurred_at: Utc::now(),
			raw_data: serde_json::Value::Null,
		};
		let failure = ledger.record_transaction(request, &cancel).await.unwrap_err();
		assert!(matches!(failure.error, LedgerError::NotRegistered(_)));
		assert!(failure.failed.is_none());
	}

	#[tokio::test]
	async fn handler_rejection_yields_failed_transaction() {
		let ledger = ledger();
		let cancel = CancellationToken::new();
		let wallet_id = Uuid::new_v4();
		let request = RecordTransaction {
			tx_type: "manual_outcome".into(),
			source: "manual".into(),
			external_id: None,
			occurred_at: Utc::now(),
			raw_data: serde_json::json!({
				"wallet_id": wallet_id,
				"asset_id": "BTC",
				"amount": "100",
				"occurred_at": Utc::now(),
				"decimals": 8,
			}),
		};
		let failure = ledger.record_transaction(request, &cancel).await.unwrap_err();
		assert!(matches!(failure.error, LedgerError::NegativeBalance { .. }));
		let failed = failure.failed.unwrap();
		assert_eq!(failed.status, TransactionStatus::Failed);
		assert!(failed.entries.is_empty());
		assert!(failed.error_message.is_some());
		// The failed write left no trace, not even lazily created accounts.
		assert!(ledger.store().find_accounts_by_wallet(wallet_id).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn cancelled_token_short_circuits() {
		let ledger = ledger();
		let cancel = CancellationToken::new();
		cancel.cancel();
		let failure = ledger
			.record_transaction(income_request(Uuid::new_v4(), "1"), &cancel)
			.await
			.unwrap_err();
		assert!(matches!(failure.error, LedgerError::Cancelled));
	}

	#[tokio::test]
	async fn happy_path_records_and_reads_back() {
		let ledger = ledger();
		let cancel = CancellationToken::new();
		let wallet_id = Uuid::new_v4();
		let recorded = ledger
			.record_transaction(income_request(wallet_id, "100000000"), &cancel)
			.await
			.unwrap();
		assert_eq!(recorded.status, TransactionStatus::Completed);
		assert_eq!(
			ledger.wallet_balance(wallet_id, "BTC").await.unwrap(),
			Amount::from(100_000_000i64)
		);
		let fetched = ledger.get_transaction(recorded.id).await.unwrap();
		assert_eq!(fetched.id, recorded.id);
		assert_eq!(fetched.entries.len(), 2);
	}
}
