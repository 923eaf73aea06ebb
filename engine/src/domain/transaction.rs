use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Entry, Metadata};
use crate::{errors::LedgerError, money::Amount};

/// Closed set of transaction type tags. The tag selects the handler that
/// turns a payload into a balanced entry set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
	TransferIn,
	TransferOut,
	InternalTransfer,
	ManualIncome,
	ManualOutcome,
	AssetAdjustment,
	Swap,
	DefiDeposit,
	DefiWithdraw,
	DefiClaim,
}

impl TransactionType {
	pub fn as_str(&self) -> &'static str {
		match self {
			TransactionType::TransferIn => "transfer_in",
			TransactionType::TransferOut => "transfer_out",
			TransactionType::InternalTransfer => "internal_transfer",
			TransactionType::ManualIncome => "manual_income",
			TransactionType::ManualOutcome => "manual_outcome",
			TransactionType::AssetAdjustment => "asset_adjustment",
			TransactionType::Swap => "swap",
			TransactionType::DefiDeposit => "defi_deposit",
			TransactionType::DefiWithdraw => "defi_withdraw",
			TransactionType::DefiClaim => "defi_claim",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"transfer_in" => Ok(TransactionType::TransferIn),
			"transfer_out" => Ok(TransactionType::TransferOut),
			"internal_transfer" => Ok(TransactionType::InternalTransfer),
			"manual_income" => Ok(TransactionType::ManualIncome),
			"manual_outcome" => Ok(TransactionType::ManualOutcome),
			"asset_adjustment" => Ok(TransactionType::AssetAdjustment),
			"swap" => Ok(TransactionType::Swap),
			"defi_deposit" => Ok(TransactionType::DefiDeposit),
			"defi_withdraw" => Ok(TransactionType::DefiWithdraw),
			"defi_claim" => Ok(TransactionType::DefiClaim),
			other => Err(LedgerError::NotRegistered(other.to_string())),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
	Pending,
	Completed,
	Failed,
}

impl TransactionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			TransactionStatus::Pending => "PENDING",
			TransactionStatus::Completed => "COMPLETED",
			TransactionStatus::Failed => "FAILED",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"PENDING" => Ok(TransactionStatus::Pending),
			"COMPLETED" => Ok(TransactionStatus::Completed),
			"FAILED" => Ok(TransactionStatus::Failed),
			other => Err(LedgerError::InvalidInput(format!("unknown status `{other}`"))),
		}
	}
}

/// Group of entries that must balance (global Σ debit = Σ credit). Inserted
/// once with its entries and never updated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub id: Uuid,
	pub tx_type: TransactionType,
	/// Origin marker, e.g. `"manual"` or the name of an external provider.
	pub source: String,
	/// Provider-side identifier. `(source, external_id)` is unique when set,
	/// which is what makes `record_transaction` idempotent.
	pub external_id: Option<String>,
	pub wallet_id: Option<Uuid>,
	pub status: TransactionStatus,
	/// Always 1 at creation. Reserved for compensating flows; nothing
	/// increments it today.
	pub version: i32,
	pub occurred_at: DateTime<Utc>,
	pub recorded_at: DateTime<Utc>,
	pub raw_data: serde_json::Value,
	pub metadata: Metadata,
	pub error_message: Option<String>,
	pub entries: Vec<Entry>,
}

impl Transaction {
	/// Sum of debit amounts minus sum of credit amounts across all entries;
	/// zero for a balanced set.
	pub fn balance_delta(&self) -> Amount {
		self.entries.iter().fold(Amount::zero(), |acc, e| acc + e.signed_amount())
	}

	/// Global double-entry check. Per-asset balance is a handler convention
	/// and deliberately not checked here.
	pub fn verify_balance(&self) -> Result<(), LedgerError> {
		let mut debits = Amount::zero();
		let mut credits = Amount::zero();
		for entry in &self.entries {
			if entry.is_debit() {
				debits += &entry.amount;
			} else {
				credits += &entry.amount;
			}
		}
		if debits != credits {
			return Err(LedgerError::Unbalanced { debits, credits });
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), LedgerError> {
		if self.source.is_empty() {
			return Err(LedgerError::InvalidDomain(format!(
				"transaction {} has no source",
				self.id
			)));
		}
		if self.occurred_at > self.recorded_at {
			return Err(LedgerError::InvalidDomain(format!(
				"transaction {} occurred after it was recorded",
				self.id
			)));
		}
		if self.occurred_at > Utc::now() {
			return Err(LedgerError::InvalidDomain(format!(
				"transaction {} occurred in the future",
				self.id
			)));
		}
		if self.status == TransactionStatus::Completed {
			self.verify_balance()?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::{Direction, EntryType};

	fn entry(tx: Uuid, direction: Direction, amount: i64) -> Entry {
		Entry {
			id: Uuid::new_v4(),
			transaction_id: tx,
			account_id: Some(Uuid::new_v4()),
			direction,
			entry_type: EntryType::Transfer,
			amount: Amount::from(amount),
			asset_id: "ETH".into(),
			usd_rate: Amount::zero(),
			usd_value: Amount::zero(),
			occurred_at: Utc::now(),
			created_at: Utc::now(),
			metadata: Metadata::new(),
		}
	}

	fn transaction(entries: Vec<Entry>) -> Transaction {
		Transaction {
			id: Uuid::new_v4(),
			tx_type: TransactionType::ManualIncome,
			source: "test".into(),
			external_id: None,
			wallet_id: None,
			status: TransactionStatus::Completed,
			version: 1,
			occurred_at: Utc::now(),
			recorded_at: Utc::now(),
			raw_data: serde_json::Value::Null,
			metadata: Metadata::new(),
			error_message: None,
			entries,
		}
	}

	#[test]
	fn balanced_set_passes() {
		let id = Uuid::new_v4();
		let tx =
			transaction(vec![entry(id, Direction::Debit, 100), entry(id, Direction::Credit, 100)]);
		assert!(tx.verify_balance().is_ok());
	}

	#[test]
	fn unbalanced_set_is_rejected() {
		let id = Uuid::new_v4();
		let tx =
			transaction(vec![entry(id, Direction::Debit, 100), entry(id, Direction::Credit, 90)]);
		assert!(matches!(tx.verify_balance(), Err(LedgerError::Unbalanced { .. })));
	}

	#[test]
	fn cross_asset_sums_balance_globally() {
		// The clearing technique: each amount appears once per direction even
		// though the assets differ.
		let id = Uuid::new_v4();
		let mut bought = entry(id, Direction::Debit, 1);
		bought.asset_id = "BTC".into();
		let mut bought_mirror = entry(id, Direction::Credit, 1);
		bought_mirror.asset_id = "BTC".into();
		let mut sold = entry(id, Direction::Credit, 50_000);
		sold.asset_id = "USDT".into();
		let mut sold_mirror = entry(id, Direction::Debit, 50_000);
		sold_mirror.asset_id = "USDT".into();
		let tx = transaction(vec![bought, bought_mirror, sold, sold_mirror]);
		assert!(tx.verify_balance().is_ok());
	}

	#[test]
	fn occurred_after_recorded_is_rejected() {
		let mut tx = transaction(vec![]);
		tx.recorded_at = tx.occurred_at - chrono::Duration::seconds(10);
		assert!(matches!(tx.validate(), Err(LedgerError::InvalidDomain(_))));
	}
}
