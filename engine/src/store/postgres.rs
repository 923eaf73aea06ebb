//! PostgreSQL store.
//!
//! Queries are built at runtime against the schema below. Numeric columns
//! are `numeric(78,0)` and travel as decimal text in both directions so that
//! arbitrary-precision amounts survive the driver unchanged. Row-level
//! `FOR UPDATE` locks on balance rows and open lots serialize concurrent
//! writers per `(account, asset)`; a dropped transaction handle rolls back.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
	postgres::{PgPoolOptions, PgRow},
	PgPool, Postgres, QueryBuilder, Row,
};
use uuid::Uuid;

use super::{DisposalFilter, Store, TransactionFilter, UnitOfWork};
use crate::{
	domain::{
		Account, AccountBalance, AccountType, CostBasisSource, Direction, DisposalType, Entry,
		EntryType, LotDisposal, LotOverrideHistory, Metadata, TaxLot, Transaction,
		TransactionStatus, TransactionType,
	},
	errors::LedgerError,
	money::Amount,
	settings::Database,
};

const SCHEMA: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS accounts (
		id UUID PRIMARY KEY,
		code TEXT NOT NULL UNIQUE,
		type TEXT NOT NULL CHECK (type IN
			('CRYPTO_WALLET', 'INCOME', 'EXPENSE', 'GAS_FEE', 'CLEARING', 'DEFI_INCOME')),
		asset_id TEXT NOT NULL,
		wallet_id UUID,
		chain_id TEXT,
		created_at TIMESTAMPTZ NOT NULL,
		metadata JSONB NOT NULL DEFAULT '{}'
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS transactions (
		id UUID PRIMARY KEY,
		type TEXT NOT NULL,
		source TEXT NOT NULL,
		external_id TEXT,
		wallet_id UUID,
		status TEXT NOT NULL,
		version INT NOT NULL,
		occurred_at TIMESTAMPTZ NOT NULL,
		recorded_at TIMESTAMPTZ NOT NULL,
		raw_data JSONB NOT NULL DEFAULT '{}',
		metadata JSONB NOT NULL DEFAULT '{}',
		error_message TEXT,
		UNIQUE (source, external_id)
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS entries (
		id UUID PRIMARY KEY,
		transaction_id UUID NOT NULL REFERENCES transactions(id) ON DELETE RESTRICT,
		account_id UUID NOT NULL REFERENCES accounts(id) ON DELETE RESTRICT,
		debit_credit TEXT NOT NULL,
		entry_type TEXT NOT NULL,
		amount NUMERIC(78,0) NOT NULL CHECK (amount >= 0),
		asset_id TEXT NOT NULL,
		usd_rate NUMERIC(78,0) NOT NULL,
		usd_value NUMERIC(78,0) NOT NULL,
		occurred_at TIMESTAMPTZ NOT NULL,
		created_at TIMESTAMPTZ NOT NULL,
		metadata JSONB NOT NULL DEFAULT '{}'
	)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_entries_transaction ON entries(transaction_id)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_entries_account_asset ON entries(account_id, asset_id)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS account_balances (
		account_id UUID NOT NULL,
		asset_id TEXT NOT NULL,
		balance NUMERIC(78,0) NOT NULL,
		usd_value NUMERIC(78,0) NOT NULL,
		last_updated TIMESTAMPTZ NOT NULL,
		PRIMARY KEY (account_id, asset_id)
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS tax_lots (
		id UUID PRIMARY KEY,
		transaction_id UUID NOT NULL,
		account_id UUID NOT NULL,
		asset TEXT NOT NULL,
		quantity_acquired NUMERIC(78,0) NOT NULL,
		quantity_remaining NUMERIC(78,0) NOT NULL,
		acquired_at TIMESTAMPTZ NOT NULL,
		auto_cost_basis_per_unit NUMERIC(78,0) NOT NULL,
		auto_cost_basis_source TEXT NOT NULL CHECK (auto_cost_basis_source IN
			('SWAP_PRICE', 'FMV_AT_TRANSFER', 'LINKED_TRANSFER')),
		override_cost_basis_per_unit NUMERIC(78,0),
		override_reason TEXT,
		override_at TIMESTAMPTZ,
		linked_source_lot_id UUID,
		created_at TIMESTAMPTZ NOT NULL,
		CHECK (quantity_acquired > 0
			AND quantity_remaining >= 0
			AND quantity_remaining <= quantity_acquired)
	)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_tax_lots_open
	ON tax_lots(account_id, asset, acquired_at)
	WHERE quantity_remaining > 0
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS lot_disposals (
		id UUID PRIMARY KEY,
		transaction_id UUID NOT NULL,
		lot_id UUID NOT NULL REFERENCES tax_lots(id),
		quantity_disposed NUMERIC(78,0) NOT NULL CHECK (quantity_disposed > 0),
		proceeds_per_unit NUMERIC(78,0) NOT NULL,
		disposal_type TEXT NOT NULL CHECK (disposal_type IN ('sale', 'internal_transfer')),
		disposed_at TIMESTAMPTZ NOT NULL
	)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_lot_disposals_lot ON lot_disposals(lot_id)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS lot_override_history (
		id UUID PRIMARY KEY,
		lot_id UUID NOT NULL REFERENCES tax_lots(id),
		previous_cost_basis NUMERIC(78,0),
		new_cost_basis NUMERIC(78,0),
		reason TEXT NOT NULL,
		changed_at TIMESTAMPTZ NOT NULL
	)
	"#,
];

#[derive(Clone)]
pub struct PgStore {
	pool: PgPool,
}

impl PgStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	pub async fn connect(settings: &Database) -> Result<Self, LedgerError> {
		let pool = PgPoolOptions::new()
			.max_connections(settings.max_connections)
			.acquire_timeout(Duration::from_millis(settings.acquire_timeout_ms))
			.connect(&settings.url)
			.await
			.map_err(map_sqlx)?;
		Ok(Self::new(pool))
	}

	/// Create every table, check and index of the ledger schema, in one DDL
	/// transaction. Safe to run on every boot.
	pub async fn init_schema(&self) -> Result<(), LedgerError> {
		let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
		for statement in SCHEMA {
			sqlx::query(statement).execute(&mut *tx).await.map_err(map_sqlx)?;
		}
		tx.commit().await.map_err(map_sqlx)?;
		Ok(())
	}

	async fn load_entries(&self, transaction_ids: &[Uuid]) -> Result<Vec<Entry>, LedgerError> {
		let rows = sqlx::query(&format!(
			"SELECT {ENTRY_COLUMNS} FROM entries WHERE transaction_id = ANY($1) \
			 ORDER BY created_at ASC"
		))
		.bind(transaction_ids)
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?;
		rows.iter().map(entry_from_row).collect()
	}

	async fn assemble(
		&self,
		mut transactions: Vec<Transaction>,
	) -> Result<Vec<Transaction>, LedgerError> {
		let ids: Vec<Uuid> = transactions.iter().map(|tx| tx.id).collect();
		let mut by_transaction: HashMap<Uuid, Vec<Entry>> = HashMap::new();
		for entry in self.load_entries(&ids).await? {
			by_transaction.entry(entry.transaction_id).or_default().push(entry);
		}
		for tx in &mut transactions {
			tx.entries = by_transaction.remove(&tx.id).unwrap_or_default();
		}
		Ok(transactions)
	}
}

const ACCOUNT_COLUMNS: &str =
	"id, code, type, asset_id, wallet_id, chain_id, created_at, metadata";
const TRANSACTION_COLUMNS: &str = "id, type, source, external_id, wallet_id, status, version, \
				   occurred_at, recorded_at, raw_data, metadata, error_message";
const ENTRY_COLUMNS: &str = "id, transaction_id, account_id, debit_credit, entry_type, \
			     amount::TEXT AS amount, asset_id, usd_rate::TEXT AS usd_rate, \
			     usd_value::TEXT AS usd_value, occurred_at, created_at, metadata";
const BALANCE_COLUMNS: &str = "account_id, asset_id, balance::TEXT AS balance, \
			       usd_value::TEXT AS usd_value, last_updated";
const LOT_COLUMNS: &str = "id, transaction_id, account_id, asset, \
			   quantity_acquired::TEXT AS quantity_acquired, \
			   quantity_remaining::TEXT AS quantity_remaining, acquired_at, \
			   auto_cost_basis_per_unit::TEXT AS auto_cost_basis_per_unit, \
			   auto_cost_basis_source, \
			   override_cost_basis_per_unit::TEXT AS override_cost_basis_per_unit, \
			   override_reason, override_at, linked_source_lot_id, created_at";
const DISPOSAL_COLUMNS: &str = "d.id, d.transaction_id, d.lot_id, \
				d.quantity_disposed::TEXT AS quantity_disposed, \
				d.proceeds_per_unit::TEXT AS proceeds_per_unit, d.disposal_type, \
				d.disposed_at";

fn map_sqlx(e: sqlx::Error) -> LedgerError {
	match &e {
		sqlx::Error::Database(db) => match db.code().as_deref() {
			// unique_violation
			Some("23505") => LedgerError::Conflict(db.message().to_string()),
			// serialization_failure, deadlock_detected, lock_not_available
			Some("40001") | Some("40P01") | Some("55P03") =>
				LedgerError::Transient(db.message().to_string()),
			_ => LedgerError::Storage(e.to_string()),
		},
		sqlx::Error::PoolTimedOut => LedgerError::Transient("connection pool timed out".into()),
		_ => LedgerError::Storage(e.to_string()),
	}
}

fn amount_col(row: &PgRow, col: &str) -> Result<Amount, LedgerError> {
	let text: String = row.try_get(col).map_err(map_sqlx)?;
	Amount::parse(&text)
}

fn opt_amount_col(row: &PgRow, col: &str) -> Result<Option<Amount>, LedgerError> {
	let text: Option<String> = row.try_get(col).map_err(map_sqlx)?;
	text.as_deref().map(Amount::parse).transpose()
}

fn metadata_col(row: &PgRow, col: &str) -> Result<Metadata, LedgerError> {
	let value: serde_json::Value = row.try_get(col).map_err(map_sqlx)?;
	Ok(value.as_object().cloned().unwrap_or_default())
}

fn metadata_value(metadata: &Metadata) -> serde_json::Value {
	serde_json::Value::Object(metadata.clone())
}

fn account_from_row(row: &PgRow) -> Result<Account, LedgerError> {
	Ok(Account {
		id: row.try_get("id").map_err(map_sqlx)?,
		code: row.try_get("code").map_err(map_sqlx)?,
		account_type: AccountType::parse(row.try_get("type").map_err(map_sqlx)?)?,
		asset_id: row.try_get("asset_id").map_err(map_sqlx)?,
		wallet_id: row.try_get("wallet_id").map_err(map_sqlx)?,
		chain_id: row.try_get("chain_id").map_err(map_sqlx)?,
		created_at: row.try_get("created_at").map_err(map_sqlx)?,
		metadata: metadata_col(row, "metadata")?,
	})
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, LedgerError> {
	Ok(Transaction {
		id: row.try_get("id").map_err(map_sqlx)?,
		tx_type: TransactionType::parse(row.try_get("type").map_err(map_sqlx)?)?,
		source: row.try_get("source").map_err(map_sqlx)?,
		external_id: row.try_get("external_id").map_err(map_sqlx)?,
		wallet_id: row.try_get("wallet_id").map_err(map_sqlx)?,
		status: TransactionStatus::parse(row.try_get("status").map_err(map_sqlx)?)?,
		version: row.try_get("version").map_err(map_sqlx)?,
		occurred_at: row.try_get("occurred_at").map_err(map_sqlx)?,
		recorded_at: row.try_get("recorded_at").map_err(map_sqlx)?,
		raw_data: row.try_get("raw_data").map_err(map_sqlx)?,
		metadata: metadata_col(row, "metadata")?,
		error_message: row.try_get("error_message").map_err(map_sqlx)?,
		entries: Vec::new(),
	})
}

fn entry_from_row(row: &PgRow) -> Result<Entry, LedgerError> {
	Ok(Entry {
		id: row.try_get("id").map_err(map_sqlx)?,
		transaction_id: row.try_get("transaction_id").map_err(map_sqlx)?,
		account_id: row.try_get("account_id").map_err(map_sqlx)?,
		direction: Direction::parse(row.try_get("debit_credit").map_err(map_sqlx)?)?,
		entry_type: EntryType::parse(row.try_get("entry_type").map_err(map_sqlx)?)?,
		amount: amount_col(row, "amount")?,
		asset_id: row.try_get("asset_id").map_err(map_sqlx)?,
		usd_rate: amount_col(row, "usd_rate")?,
		usd_value: amount_col(row, "usd_value")?,
		occurred_at: row.try_get("occurred_at").map_err(map_sqlx)?,
		created_at: row.try_get("created_at").map_err(map_sqlx)?,
		metadata: metadata_col(row, "metadata")?,
	})
}

fn balance_from_row(row: &PgRow) -> Result<AccountBalance, LedgerError> {
	Ok(AccountBalance {
		account_id: row.try_get("account_id").map_err(map_sqlx)?,
		asset_id: row.try_get("asset_id").map_err(map_sqlx)?,
		balance: amount_col(row, "balance")?,
		usd_value: amount_col(row, "usd_value")?,
		last_updated: row.try_get("last_updated").map_err(map_sqlx)?,
	})
}

fn lot_from_row(row: &PgRow) -> Result<TaxLot, LedgerError> {
	Ok(TaxLot {
		id: row.try_get("id").map_err(map_sqlx)?,
		transaction_id: row.try_get("transaction_id").map_err(map_sqlx)?,
		account_id: row.try_get("account_id").map_err(map_sqlx)?,
		asset: row.try_get("asset").map_err(map_sqlx)?,
		quantity_acquired: amount_col(row, "quantity_acquired")?,
		quantity_remaining: amount_col(row, "quantity_remaining")?,
		acquired_at: row.try_get("acquired_at").map_err(map_sqlx)?,
		auto_cost_basis_per_unit: amount_col(row, "auto_cost_basis_per_unit")?,
		auto_cost_basis_source: CostBasisSource::parse(
			row.try_get("auto_cost_basis_source").map_err(map_sqlx)?,
		)?,
		override_cost_basis_per_unit: opt_amount_col(row, "override_cost_basis_per_unit")?,
		override_reason: row.try_get("override_reason").map_err(map_sqlx)?,
		override_at: row.try_get("override_at").map_err(map_sqlx)?,
		linked_source_lot_id: row.try_get("linked_source_lot_id").map_err(map_sqlx)?,
		created_at: row.try_get("created_at").map_err(map_sqlx)?,
	})
}

fn disposal_from_row(row: &PgRow) -> Result<LotDisposal, LedgerError> {
	Ok(LotDisposal {
		id: row.try_get("id").map_err(map_sqlx)?,
		transaction_id: row.try_get("transaction_id").map_err(map_sqlx)?,
		lot_id: row.try_get("lot_id").map_err(map_sqlx)?,
		quantity_disposed: amount_col(row, "quantity_disposed")?,
		proceeds_per_unit: amount_col(row, "proceeds_per_unit")?,
		disposal_type: DisposalType::parse(row.try_get("disposal_type").map_err(map_sqlx)?)?,
		disposed_at: row.try_get("disposed_at").map_err(map_sqlx)?,
	})
}

#[async_trait]
impl Store for PgStore {
	async fn begin(&self) -> Result<Box<dyn UnitOfWork>, LedgerError> {
		let tx = self.pool.begin().await.map_err(map_sqlx)?;
		Ok(Box::new(PgUnitOfWork { tx }))
	}

	async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError> {
		sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
			.bind(id)
			.fetch_optional(&self.pool)
			.await
			.map_err(map_sqlx)?
			.as_ref()
			.map(account_from_row)
			.transpose()?
			.ok_or_else(|| LedgerError::NotFound(format!("account {id}")))
	}

	async fn get_account_by_code(&self, code: &str) -> Result<Option<Account>, LedgerError> {
		sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE code = $1"))
			.bind(code)
			.fetch_optional(&self.pool)
			.await
			.map_err(map_sqlx)?
			.as_ref()
			.map(account_from_row)
			.transpose()
	}

	async fn find_accounts_by_wallet(&self, wallet_id: Uuid) -> Result<Vec<Account>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE wallet_id = $1 ORDER BY code"
		))
		.bind(wallet_id)
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?
		.iter()
		.map(account_from_row)
		.collect()
	}

	async fn get_transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
		let tx = sqlx::query(&format!(
			"SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
		))
		.bind(id)
		.fetch_optional(&self.pool)
		.await
		.map_err(map_sqlx)?
		.as_ref()
		.map(transaction_from_row)
		.transpose()?
		.ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))?;

		Ok(self.assemble(vec![tx]).await?.remove(0))
	}

	async fn find_by_source(
		&self,
		source: &str,
		external_id: &str,
	) -> Result<Option<Transaction>, LedgerError> {
		let found = sqlx::query(&format!(
			"SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE source = $1 AND external_id = $2"
		))
		.bind(source)
		.bind(external_id)
		.fetch_optional(&self.pool)
		.await
		.map_err(map_sqlx)?
		.as_ref()
		.map(transaction_from_row)
		.transpose()?;

		match found {
			Some(tx) => Ok(Some(self.assemble(vec![tx]).await?.remove(0))),
			None => Ok(None),
		}
	}

	async fn list_transactions(
		&self,
		filter: &TransactionFilter,
	) -> Result<Vec<Transaction>, LedgerError> {
		let mut query = QueryBuilder::<Postgres>::new(format!(
			"SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE TRUE"
		));
		if let Some(wallet_id) = filter.wallet_id {
			query.push(" AND wallet_id = ").push_bind(wallet_id);
		}
		if let Some(tx_type) = filter.tx_type {
			query.push(" AND type = ").push_bind(tx_type.as_str());
		}
		if let Some(status) = filter.status {
			query.push(" AND status = ").push_bind(status.as_str());
		}
		if let Some(after) = filter.occurred_after {
			query.push(" AND occurred_at >= ").push_bind(after);
		}
		if let Some(before) = filter.occurred_before {
			query.push(" AND occurred_at <= ").push_bind(before);
		}
		query.push(" ORDER BY occurred_at DESC");
		if let Some(limit) = filter.limit {
			query.push(" LIMIT ").push_bind(limit as i64);
		}

		let transactions = query
			.build()
			.fetch_all(&self.pool)
			.await
			.map_err(map_sqlx)?
			.iter()
			.map(transaction_from_row)
			.collect::<Result<Vec<_>, _>>()?;
		self.assemble(transactions).await
	}

	async fn get_entries_by_transaction(
		&self,
		transaction_id: Uuid,
	) -> Result<Vec<Entry>, LedgerError> {
		self.load_entries(&[transaction_id]).await
	}

	async fn get_entries_by_account(&self, account_id: Uuid) -> Result<Vec<Entry>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY created_at ASC"
		))
		.bind(account_id)
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?
		.iter()
		.map(entry_from_row)
		.collect()
	}

	async fn get_balance(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Option<AccountBalance>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {BALANCE_COLUMNS} FROM account_balances \
			 WHERE account_id = $1 AND asset_id = $2"
		))
		.bind(account_id)
		.bind(asset_id)
		.fetch_optional(&self.pool)
		.await
		.map_err(map_sqlx)?
		.as_ref()
		.map(balance_from_row)
		.transpose()
	}

	async fn list_balances(&self, account_id: Uuid) -> Result<Vec<AccountBalance>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {BALANCE_COLUMNS} FROM account_balances WHERE account_id = $1 \
			 ORDER BY asset_id"
		))
		.bind(account_id)
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?
		.iter()
		.map(balance_from_row)
		.collect()
	}

	async fn list_all_balances(&self) -> Result<Vec<AccountBalance>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {BALANCE_COLUMNS} FROM account_balances ORDER BY account_id, asset_id"
		))
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?
		.iter()
		.map(balance_from_row)
		.collect()
	}

	async fn calculate_balance_from_entries(
		&self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Amount, LedgerError> {
		let row = sqlx::query(
			"SELECT COALESCE(SUM(CASE WHEN debit_credit = 'DEBIT' THEN amount \
			 ELSE -amount END), 0)::TEXT AS signed_sum \
			 FROM entries WHERE account_id = $1 AND asset_id = $2",
		)
		.bind(account_id)
		.bind(asset_id)
		.fetch_one(&self.pool)
		.await
		.map_err(map_sqlx)?;
		amount_col(&row, "signed_sum")
	}

	async fn get_lot(&self, id: Uuid) -> Result<TaxLot, LedgerError> {
		sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM tax_lots WHERE id = $1"))
			.bind(id)
			.fetch_optional(&self.pool)
			.await
			.map_err(map_sqlx)?
			.as_ref()
			.map(lot_from_row)
			.transpose()?
			.ok_or_else(|| LedgerError::NotFound(format!("lot {id}")))
	}

	async fn list_lots(&self, account_id: Uuid, asset: &str) -> Result<Vec<TaxLot>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {LOT_COLUMNS} FROM tax_lots WHERE account_id = $1 AND asset = $2 \
			 ORDER BY acquired_at ASC, created_at ASC"
		))
		.bind(account_id)
		.bind(asset)
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?
		.iter()
		.map(lot_from_row)
		.collect()
	}

	async fn list_disposals(
		&self,
		filter: &DisposalFilter,
	) -> Result<Vec<LotDisposal>, LedgerError> {
		let mut query = QueryBuilder::<Postgres>::new(format!(
			"SELECT {DISPOSAL_COLUMNS} FROM lot_disposals d \
			 JOIN tax_lots l ON d.lot_id = l.id WHERE TRUE"
		));
		if let Some(account_id) = filter.account_id {
			query.push(" AND l.account_id = ").push_bind(account_id);
		}
		if let Some(asset) = &filter.asset {
			query.push(" AND l.asset = ").push_bind(asset.clone());
		}
		if let Some(after) = filter.disposed_after {
			query.push(" AND d.disposed_at >= ").push_bind(after);
		}
		if let Some(before) = filter.disposed_before {
			query.push(" AND d.disposed_at <= ").push_bind(before);
		}
		query.push(" ORDER BY d.disposed_at ASC");

		query
			.build()
			.fetch_all(&self.pool)
			.await
			.map_err(map_sqlx)?
			.iter()
			.map(disposal_from_row)
			.collect()
	}

	async fn list_override_history(
		&self,
		lot_id: Uuid,
	) -> Result<Vec<LotOverrideHistory>, LedgerError> {
		let rows = sqlx::query(
			"SELECT id, lot_id, previous_cost_basis::TEXT AS previous_cost_basis, \
			 new_cost_basis::TEXT AS new_cost_basis, reason, changed_at \
			 FROM lot_override_history WHERE lot_id = $1 ORDER BY changed_at ASC",
		)
		.bind(lot_id)
		.fetch_all(&self.pool)
		.await
		.map_err(map_sqlx)?;
		rows.iter()
			.map(|row| {
				Ok(LotOverrideHistory {
					id: row.try_get("id").map_err(map_sqlx)?,
					lot_id: row.try_get("lot_id").map_err(map_sqlx)?,
					previous_cost_basis: opt_amount_col(row, "previous_cost_basis")?,
					new_cost_basis: opt_amount_col(row, "new_cost_basis")?,
					reason: row.try_get("reason").map_err(map_sqlx)?,
					changed_at: row.try_get("changed_at").map_err(map_sqlx)?,
				})
			})
			.collect()
	}
}

pub struct PgUnitOfWork {
	tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
	async fn get_or_create_account(&mut self, candidate: Account) -> Result<Account, LedgerError> {
		candidate.validate()?;
		sqlx::query(
			"INSERT INTO accounts (id, code, type, asset_id, wallet_id, chain_id, created_at, \
			 metadata) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (code) DO NOTHING",
		)
		.bind(candidate.id)
		.bind(&candidate.code)
		.bind(candidate.account_type.as_str())
		.bind(&candidate.asset_id)
		.bind(candidate.wallet_id)
		.bind(&candidate.chain_id)
		.bind(candidate.created_at)
		.bind(metadata_value(&candidate.metadata))
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;

		sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE code = $1"))
			.bind(&candidate.code)
			.fetch_optional(&mut *self.tx)
			.await
			.map_err(map_sqlx)?
			.as_ref()
			.map(account_from_row)
			.transpose()?
			.ok_or_else(|| LedgerError::NotFound(format!("account `{}`", candidate.code)))
	}

	async fn create_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
		sqlx::query(
			"INSERT INTO transactions (id, type, source, external_id, wallet_id, status, \
			 version, occurred_at, recorded_at, raw_data, metadata, error_message) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
		)
		.bind(tx.id)
		.bind(tx.tx_type.as_str())
		.bind(&tx.source)
		.bind(&tx.external_id)
		.bind(tx.wallet_id)
		.bind(tx.status.as_str())
		.bind(tx.version)
		.bind(tx.occurred_at)
		.bind(tx.recorded_at)
		.bind(&tx.raw_data)
		.bind(metadata_value(&tx.metadata))
		.bind(&tx.error_message)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;

		for entry in &tx.entries {
			let account_id = entry.account_id.ok_or_else(|| {
				LedgerError::InvalidDomain(format!("entry {} has no resolved account", entry.id))
			})?;
			sqlx::query(
				"INSERT INTO entries (id, transaction_id, account_id, debit_credit, \
				 entry_type, amount, asset_id, usd_rate, usd_value, occurred_at, created_at, \
				 metadata) VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8::NUMERIC, \
				 $9::NUMERIC, $10, $11, $12)",
			)
			.bind(entry.id)
			.bind(entry.transaction_id)
			.bind(account_id)
			.bind(entry.direction.as_str())
			.bind(entry.entry_type.as_str())
			.bind(entry.amount.to_string())
			.bind(&entry.asset_id)
			.bind(entry.usd_rate.to_string())
			.bind(entry.usd_value.to_string())
			.bind(entry.occurred_at)
			.bind(entry.created_at)
			.bind(metadata_value(&entry.metadata))
			.execute(&mut *self.tx)
			.await
			.map_err(map_sqlx)?;
		}
		Ok(())
	}

	async fn get_balance(
		&mut self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<Option<AccountBalance>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {BALANCE_COLUMNS} FROM account_balances \
			 WHERE account_id = $1 AND asset_id = $2"
		))
		.bind(account_id)
		.bind(asset_id)
		.fetch_optional(&mut *self.tx)
		.await
		.map_err(map_sqlx)?
		.as_ref()
		.map(balance_from_row)
		.transpose()
	}

	async fn get_balance_for_update(
		&mut self,
		account_id: Uuid,
		asset_id: &str,
	) -> Result<AccountBalance, LedgerError> {
		// Materialize the row first so the exclusive lock has something to
		// latch onto; otherwise two first writers could both read "absent".
		sqlx::query(
			"INSERT INTO account_balances (account_id, asset_id, balance, usd_value, \
			 last_updated) VALUES ($1, $2, 0, 0, NOW()) \
			 ON CONFLICT (account_id, asset_id) DO NOTHING",
		)
		.bind(account_id)
		.bind(asset_id)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;

		let row = sqlx::query(&format!(
			"SELECT {BALANCE_COLUMNS} FROM account_balances \
			 WHERE account_id = $1 AND asset_id = $2 FOR UPDATE"
		))
		.bind(account_id)
		.bind(asset_id)
		.fetch_one(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		balance_from_row(&row)
	}

	async fn upsert_balance(&mut self, balance: &AccountBalance) -> Result<(), LedgerError> {
		sqlx::query(
			"INSERT INTO account_balances (account_id, asset_id, balance, usd_value, \
			 last_updated) VALUES ($1, $2, $3::NUMERIC, $4::NUMERIC, $5) \
			 ON CONFLICT (account_id, asset_id) DO UPDATE SET balance = EXCLUDED.balance, \
			 usd_value = EXCLUDED.usd_value, last_updated = EXCLUDED.last_updated",
		)
		.bind(balance.account_id)
		.bind(&balance.asset_id)
		.bind(balance.balance.to_string())
		.bind(balance.usd_value.to_string())
		.bind(balance.last_updated)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		Ok(())
	}

	async fn create_lot(&mut self, lot: &TaxLot) -> Result<(), LedgerError> {
		lot.validate()?;
		sqlx::query(
			"INSERT INTO tax_lots (id, transaction_id, account_id, asset, quantity_acquired, \
			 quantity_remaining, acquired_at, auto_cost_basis_per_unit, \
			 auto_cost_basis_source, override_cost_basis_per_unit, override_reason, \
			 override_at, linked_source_lot_id, created_at) \
			 VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7, $8::NUMERIC, $9, \
			 $10::NUMERIC, $11, $12, $13, $14)",
		)
		.bind(lot.id)
		.bind(lot.transaction_id)
		.bind(lot.account_id)
		.bind(&lot.asset)
		.bind(lot.quantity_acquired.to_string())
		.bind(lot.quantity_remaining.to_string())
		.bind(lot.acquired_at)
		.bind(lot.auto_cost_basis_per_unit.to_string())
		.bind(lot.auto_cost_basis_source.as_str())
		.bind(lot.override_cost_basis_per_unit.as_ref().map(|a| a.to_string()))
		.bind(&lot.override_reason)
		.bind(lot.override_at)
		.bind(lot.linked_source_lot_id)
		.bind(lot.created_at)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		Ok(())
	}

	async fn get_lot(&mut self, id: Uuid) -> Result<TaxLot, LedgerError> {
		sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM tax_lots WHERE id = $1"))
			.bind(id)
			.fetch_optional(&mut *self.tx)
			.await
			.map_err(map_sqlx)?
			.as_ref()
			.map(lot_from_row)
			.transpose()?
			.ok_or_else(|| LedgerError::NotFound(format!("lot {id}")))
	}

	async fn open_lots_for_update(
		&mut self,
		account_id: Uuid,
		asset: &str,
	) -> Result<Vec<TaxLot>, LedgerError> {
		sqlx::query(&format!(
			"SELECT {LOT_COLUMNS} FROM tax_lots \
			 WHERE account_id = $1 AND asset = $2 AND quantity_remaining > 0 \
			 ORDER BY acquired_at ASC, created_at ASC FOR UPDATE"
		))
		.bind(account_id)
		.bind(asset)
		.fetch_all(&mut *self.tx)
		.await
		.map_err(map_sqlx)?
		.iter()
		.map(lot_from_row)
		.collect()
	}

	async fn decrement_lot_remaining(
		&mut self,
		lot_id: Uuid,
		delta: &Amount,
	) -> Result<(), LedgerError> {
		let result = sqlx::query(
			"UPDATE tax_lots SET quantity_remaining = quantity_remaining - $2::NUMERIC \
			 WHERE id = $1",
		)
		.bind(lot_id)
		.bind(delta.to_string())
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		if result.rows_affected() == 0 {
			return Err(LedgerError::NotFound(format!("lot {lot_id}")));
		}
		Ok(())
	}

	async fn record_disposal(&mut self, disposal: &LotDisposal) -> Result<(), LedgerError> {
		disposal.validate()?;
		sqlx::query(
			"INSERT INTO lot_disposals (id, transaction_id, lot_id, quantity_disposed, \
			 proceeds_per_unit, disposal_type, disposed_at) \
			 VALUES ($1, $2, $3, $4::NUMERIC, $5::NUMERIC, $6, $7)",
		)
		.bind(disposal.id)
		.bind(disposal.transaction_id)
		.bind(disposal.lot_id)
		.bind(disposal.quantity_disposed.to_string())
		.bind(disposal.proceeds_per_unit.to_string())
		.bind(disposal.disposal_type.as_str())
		.bind(disposal.disposed_at)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		Ok(())
	}

	async fn set_override(
		&mut self,
		lot_id: Uuid,
		cost: Option<Amount>,
		reason: &str,
		at: DateTime<Utc>,
	) -> Result<(), LedgerError> {
		let result = sqlx::query(
			"UPDATE tax_lots SET override_cost_basis_per_unit = $2::NUMERIC, \
			 override_reason = $3, override_at = $4 WHERE id = $1",
		)
		.bind(lot_id)
		.bind(cost.as_ref().map(|a| a.to_string()))
		.bind(reason)
		.bind(at)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		if result.rows_affected() == 0 {
			return Err(LedgerError::NotFound(format!("lot {lot_id}")));
		}
		Ok(())
	}

	async fn append_override_history(
		&mut self,
		row: &LotOverrideHistory,
	) -> Result<(), LedgerError> {
		sqlx::query(
			"INSERT INTO lot_override_history (id, lot_id, previous_cost_basis, \
			 new_cost_basis, reason, changed_at) \
			 VALUES ($1, $2, $3::NUMERIC, $4::NUMERIC, $5, $6)",
		)
		.bind(row.id)
		.bind(row.lot_id)
		.bind(row.previous_cost_basis.as_ref().map(|a| a.to_string()))
		.bind(row.new_cost_basis.as_ref().map(|a| a.to_string()))
		.bind(&row.reason)
		.bind(row.changed_at)
		.execute(&mut *self.tx)
		.await
		.map_err(map_sqlx)?;
		Ok(())
	}

	async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
		self.tx.commit().await.map_err(map_sqlx)
	}

	async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
		self.tx.rollback().await.map_err(map_sqlx)
	}
}
