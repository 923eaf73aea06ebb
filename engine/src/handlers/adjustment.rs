//! Balance adjustments.
//!
//! `asset_adjustment` reconciles a wallet's recorded balance to an observed
//! target: the handler reads the current balance and emits the entry pair
//! that closes the gap, against income for upward moves and expense for
//! downward ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{
	expense_code, income_code, parse_payload, wallet_balance, wallet_code, EntryDraft,
	TransactionHandler,
};
use crate::{
	domain::{Direction, Entry, EntryType, TransactionType},
	errors::LedgerError,
	money::Amount,
	store::Store,
};

#[derive(Clone, Debug, Deserialize)]
pub struct AdjustmentPayload {
	pub wallet_id: Uuid,
	pub asset_id: String,
	/// Desired post-adjustment balance in base units.
	pub target_balance: Amount,
	pub occurred_at: DateTime<Utc>,
	pub decimals: u32,
	#[serde(default)]
	pub usd_rate: Option<Amount>,
	#[serde(default)]
	pub chain_id: Option<String>,
	#[serde(default)]
	pub notes: Option<String>,
}

pub struct AssetAdjustmentHandler;

#[async_trait]
impl TransactionHandler for AssetAdjustmentHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::AssetAdjustment.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: AdjustmentPayload = parse_payload(payload)?;
		if payload.target_balance.is_negative() {
			return Err(LedgerError::InvalidDomain(format!(
				"target balance must not be negative, got {}",
				payload.target_balance
			)));
		}
		let current =
			wallet_balance(store, payload.wallet_id, &payload.asset_id).await?;
		if current == payload.target_balance {
			return Err(LedgerError::InvalidDomain(format!(
				"wallet balance already at target {current}"
			)));
		}
		Ok(())
	}

	async fn generate_entries(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: AdjustmentPayload = parse_payload(payload)?;
		let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
		let current = wallet_balance(store, payload.wallet_id, &payload.asset_id).await?;
		let delta = payload.target_balance.clone() - current;

		let entries = if delta.is_positive() {
			vec![
				EntryDraft::new(
					Direction::Debit,
					EntryType::AssetIncrease,
					delta.clone(),
					&payload.asset_id,
					rate.clone(),
					payload.decimals,
					payload.occurred_at,
				)
				.account_code(wallet_code(payload.wallet_id, &payload.asset_id))
				.wallet(payload.wallet_id)
				.chain(payload.chain_id.as_deref())
				.build(),
				EntryDraft::new(
					Direction::Credit,
					EntryType::Income,
					delta,
					&payload.asset_id,
					rate,
					payload.decimals,
					payload.occurred_at,
				)
				.account_code(income_code(&payload.asset_id))
				.build(),
			]
		} else {
			let shortfall = -delta;
			vec![
				EntryDraft::new(
					Direction::Credit,
					EntryType::AssetDecrease,
					shortfall.clone(),
					&payload.asset_id,
					rate.clone(),
					payload.decimals,
					payload.occurred_at,
				)
				.account_code(wallet_code(payload.wallet_id, &payload.asset_id))
				.wallet(payload.wallet_id)
				.chain(payload.chain_id.as_deref())
				.build(),
				EntryDraft::new(
					Direction::Debit,
					EntryType::Expense,
					shortfall,
					&payload.asset_id,
					rate,
					payload.decimals,
					payload.occurred_at,
				)
				.account_code(expense_code(&payload.asset_id))
				.build(),
			]
		};
		Ok(entries)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::memory::MemoryStore;

	#[tokio::test]
	async fn upward_adjustment_books_income() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"asset_id": "DOT",
			"target_balance": "500",
			"occurred_at": Utc::now(),
			"decimals": 0,
		});
		let entries =
			AssetAdjustmentHandler.generate_entries(&store, &payload).await.unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].entry_type, EntryType::AssetIncrease);
		assert_eq!(entries[0].amount, Amount::from(500i64));
		assert_eq!(entries[1].entry_type, EntryType::Income);
	}

	#[tokio::test]
	async fn adjustment_to_current_balance_is_rejected() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"asset_id": "DOT",
			"target_balance": "0",
			"occurred_at": Utc::now(),
			"decimals": 0,
		});
		assert!(matches!(
			AssetAdjustmentHandler.validate(&store, &payload).await,
			Err(LedgerError::InvalidDomain(_))
		));
	}
}
