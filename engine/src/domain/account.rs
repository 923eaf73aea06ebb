use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Metadata;
use crate::errors::LedgerError;

/// Closed set of account kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
	CryptoWallet,
	Income,
	Expense,
	GasFee,
	Clearing,
	DefiIncome,
}

impl AccountType {
	pub fn as_str(&self) -> &'static str {
		match self {
			AccountType::CryptoWallet => "CRYPTO_WALLET",
			AccountType::Income => "INCOME",
			AccountType::Expense => "EXPENSE",
			AccountType::GasFee => "GAS_FEE",
			AccountType::Clearing => "CLEARING",
			AccountType::DefiIncome => "DEFI_INCOME",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"CRYPTO_WALLET" => Ok(AccountType::CryptoWallet),
			"INCOME" => Ok(AccountType::Income),
			"EXPENSE" => Ok(AccountType::Expense),
			"GAS_FEE" => Ok(AccountType::GasFee),
			"CLEARING" => Ok(AccountType::Clearing),
			"DEFI_INCOME" => Ok(AccountType::DefiIncome),
			other => Err(LedgerError::InvalidInput(format!("unknown account type `{other}`"))),
		}
	}
}

/// Bucket into which entries are posted, identified by a stable unique code
/// such as `wallet.<wallet_id>.<asset>`. Immutable once created; only
/// metadata may be adjusted outside the ledger core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
	pub id: Uuid,
	pub code: String,
	pub account_type: AccountType,
	pub asset_id: String,
	pub wallet_id: Option<Uuid>,
	pub chain_id: Option<String>,
	pub created_at: DateTime<Utc>,
	pub metadata: Metadata,
}

impl Account {
	pub fn new(
		code: String,
		account_type: AccountType,
		asset_id: String,
		wallet_id: Option<Uuid>,
		chain_id: Option<String>,
	) -> Self {
		Self {
			id: Uuid::new_v4(),
			code,
			account_type,
			asset_id,
			wallet_id,
			chain_id,
			created_at: Utc::now(),
			metadata: Metadata::new(),
		}
	}

	pub fn validate(&self) -> Result<(), LedgerError> {
		if self.code.is_empty() {
			return Err(LedgerError::InvalidDomain("account code must not be empty".into()));
		}
		if self.asset_id.is_empty() {
			return Err(LedgerError::InvalidDomain(format!(
				"account `{}` has no asset id",
				self.code
			)));
		}
		match (self.account_type, self.wallet_id) {
			(AccountType::CryptoWallet, None) => Err(LedgerError::InvalidDomain(format!(
				"crypto wallet account `{}` requires a wallet id",
				self.code
			))),
			(AccountType::CryptoWallet, Some(_)) => Ok(()),
			(_, Some(_)) => Err(LedgerError::InvalidDomain(format!(
				"account `{}` of type {} must not carry a wallet id",
				self.code,
				self.account_type.as_str()
			))),
			(_, None) => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wallet_id_presence_must_match_type() {
		let wallet = Account::new(
			"wallet.w1.BTC".into(),
			AccountType::CryptoWallet,
			"BTC".into(),
			Some(Uuid::new_v4()),
			None,
		);
		assert!(wallet.validate().is_ok());

		let mut missing = wallet.clone();
		missing.wallet_id = None;
		assert!(matches!(missing.validate(), Err(LedgerError::InvalidDomain(_))));

		let mut income = Account::new(
			"income.BTC".into(),
			AccountType::Income,
			"BTC".into(),
			None,
			None,
		);
		assert!(income.validate().is_ok());
		income.wallet_id = Some(Uuid::new_v4());
		assert!(matches!(income.validate(), Err(LedgerError::InvalidDomain(_))));
	}
}
