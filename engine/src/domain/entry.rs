use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Metadata;
use crate::{errors::LedgerError, money::Amount};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
	Debit,
	Credit,
}

impl Direction {
	pub fn as_str(&self) -> &'static str {
		match self {
			Direction::Debit => "DEBIT",
			Direction::Credit => "CREDIT",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"DEBIT" => Ok(Direction::Debit),
			"CREDIT" => Ok(Direction::Credit),
			other => Err(LedgerError::InvalidInput(format!("unknown direction `{other}`"))),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
	AssetIncrease,
	AssetDecrease,
	Income,
	Expense,
	GasFee,
	Transfer,
}

impl EntryType {
	pub fn as_str(&self) -> &'static str {
		match self {
			EntryType::AssetIncrease => "ASSET_INCREASE",
			EntryType::AssetDecrease => "ASSET_DECREASE",
			EntryType::Income => "INCOME",
			EntryType::Expense => "EXPENSE",
			EntryType::GasFee => "GAS_FEE",
			EntryType::Transfer => "TRANSFER",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"ASSET_INCREASE" => Ok(EntryType::AssetIncrease),
			"ASSET_DECREASE" => Ok(EntryType::AssetDecrease),
			"INCOME" => Ok(EntryType::Income),
			"EXPENSE" => Ok(EntryType::Expense),
			"GAS_FEE" => Ok(EntryType::GasFee),
			"TRANSFER" => Ok(EntryType::Transfer),
			other => Err(LedgerError::InvalidInput(format!("unknown entry type `{other}`"))),
		}
	}

	/// The direction this entry type is pinned to, if any. `Transfer` legs
	/// (clearing transit) may go either way.
	fn required_direction(&self) -> Option<Direction> {
		match self {
			EntryType::AssetIncrease => Some(Direction::Debit),
			EntryType::AssetDecrease => Some(Direction::Credit),
			EntryType::Income => Some(Direction::Credit),
			EntryType::Expense => Some(Direction::Debit),
			EntryType::GasFee => Some(Direction::Debit),
			EntryType::Transfer => None,
		}
	}
}

/// Immutable atomic accounting fact bound to a transaction. Never updated or
/// deleted after commit; corrections are new compensating transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
	pub id: Uuid,
	pub transaction_id: Uuid,
	/// Left unset by handlers; the account resolver fills it in from the
	/// `account_code` metadata hint before validation.
	pub account_id: Option<Uuid>,
	pub direction: Direction,
	pub entry_type: EntryType,
	/// Non-negative quantity in the asset's base units.
	pub amount: Amount,
	pub asset_id: String,
	/// USD per one whole unit, scaled by 10^8.
	pub usd_rate: Amount,
	/// Total USD value, scaled by 10^8.
	pub usd_value: Amount,
	pub occurred_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub metadata: Metadata,
}

impl Entry {
	pub fn is_debit(&self) -> bool {
		self.direction == Direction::Debit
	}

	pub fn is_credit(&self) -> bool {
		self.direction == Direction::Credit
	}

	/// `+amount` for debits, `-amount` for credits.
	pub fn signed_amount(&self) -> Amount {
		match self.direction {
			Direction::Debit => self.amount.clone(),
			Direction::Credit => -&self.amount,
		}
	}

	/// Signed USD value with the same convention as `signed_amount`.
	pub fn signed_usd_value(&self) -> Amount {
		match self.direction {
			Direction::Debit => self.usd_value.clone(),
			Direction::Credit => -&self.usd_value,
		}
	}

	pub fn validate(&self) -> Result<(), LedgerError> {
		if self.amount.is_negative() {
			return Err(LedgerError::InvalidDomain(format!(
				"entry {} has negative amount {}",
				self.id, self.amount
			)));
		}
		if self.asset_id.is_empty() {
			return Err(LedgerError::InvalidDomain(format!("entry {} has no asset id", self.id)));
		}
		if let Some(required) = self.entry_type.required_direction() {
			if required != self.direction {
				return Err(LedgerError::InvalidDomain(format!(
					"entry {} of type {} must be a {}",
					self.id,
					self.entry_type.as_str(),
					required.as_str()
				)));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::Metadata;

	fn entry(direction: Direction, entry_type: EntryType, amount: i64) -> Entry {
		Entry {
			id: Uuid::new_v4(),
			transaction_id: Uuid::new_v4(),
			account_id: Some(Uuid::new_v4()),
			direction,
			entry_type,
			amount: Amount::from(amount),
			asset_id: "BTC".into(),
			usd_rate: Amount::zero(),
			usd_value: Amount::zero(),
			occurred_at: Utc::now(),
			created_at: Utc::now(),
			metadata: Metadata::new(),
		}
	}

	#[test]
	fn signed_amount_follows_direction() {
		assert_eq!(
			entry(Direction::Debit, EntryType::AssetIncrease, 7).signed_amount(),
			Amount::from(7i64)
		);
		assert_eq!(
			entry(Direction::Credit, EntryType::AssetDecrease, 7).signed_amount(),
			Amount::from(-7i64)
		);
	}

	#[test]
	fn entry_type_pins_direction() {
		assert!(entry(Direction::Debit, EntryType::AssetIncrease, 1).validate().is_ok());
		assert!(entry(Direction::Credit, EntryType::AssetIncrease, 1).validate().is_err());
		assert!(entry(Direction::Debit, EntryType::Income, 1).validate().is_err());
		// Transfer legs may go either way.
		assert!(entry(Direction::Debit, EntryType::Transfer, 1).validate().is_ok());
		assert!(entry(Direction::Credit, EntryType::Transfer, 1).validate().is_ok());
	}
}
