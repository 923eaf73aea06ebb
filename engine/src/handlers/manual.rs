//! Manually recorded income and spending.

use async_trait::async_trait;

use super::{
	expense_code, income_code, parse_payload, require_balance, require_positive, wallet_code,
	EntryDraft, MovementPayload, TransactionHandler,
};
use crate::{
	domain::{Direction, Entry, EntryType, TransactionType},
	errors::LedgerError,
	money::Amount,
	store::Store,
};

/// `manual_income`: Debit `wallet.<wid>.<asset>` / Credit `income.<asset>`.
pub struct ManualIncomeHandler;

#[async_trait]
impl TransactionHandler for ManualIncomeHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::ManualIncome.as_str()
	}

	async fn validate(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: MovementPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "income amount")
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: MovementPayload = parse_payload(payload)?;
		Ok(income_entries(&payload))
	}
}

/// `manual_outcome`: Credit `wallet.<wid>.<asset>` / Debit `expense.<asset>`.
/// Requires the wallet balance to cover the outflow.
pub struct ManualOutcomeHandler;

#[async_trait]
impl TransactionHandler for ManualOutcomeHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::ManualOutcome.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: MovementPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "outcome amount")?;
		require_balance(store, payload.wallet_id, &payload.asset_id, &payload.amount).await
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: MovementPayload = parse_payload(payload)?;
		Ok(outcome_entries(&payload))
	}
}

pub(super) fn income_entries(payload: &MovementPayload) -> Vec<Entry> {
	let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
	vec![
		EntryDraft::new(
			Direction::Debit,
			EntryType::AssetIncrease,
			payload.amount.clone(),
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
			payload.amount.clone(),
			&payload.asset_id,
			rate,
			payload.decimals,
			payload.occurred_at,
		)
		.account_code(income_code(&payload.asset_id))
		.build(),
	]
}

pub(super) fn outcome_entries(payload: &MovementPayload) -> Vec<Entry> {
	let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
	vec![
		EntryDraft::new(
			Direction::Credit,
			EntryType::AssetDecrease,
			payload.amount.clone(),
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
			payload.amount.clone(),
			&payload.asset_id,
			rate,
			payload.decimals,
			payload.occurred_at,
		)
		.account_code(expense_code(&payload.asset_id))
		.build(),
	]
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use uuid::Uuid;

	use super::*;
	use crate::{constants::ACCOUNT_CODE_KEY, money::usd, store::memory::MemoryStore};

	fn payload(amount: &str) -> serde_json::Value {
		serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"asset_id": "BTC",
			"amount": amount,
			"occurred_at": Utc::now(),
			"decimals": 8,
			"usd_rate": usd(50_000).to_string(),
		})
	}

	#[tokio::test]
	async fn income_emits_balanced_wallet_and_income_legs() {
		let store = MemoryStore::new();
		let entries = ManualIncomeHandler
			.generate_entries(&store, &payload("100000000"))
			.await
			.unwrap();
		assert_eq!(entries.len(), 2);
		assert!(entries[0].is_debit());
		assert!(entries[1].is_credit());
		assert_eq!(entries[0].amount, entries[1].amount);
		assert_eq!(
			entries[1].metadata[ACCOUNT_CODE_KEY].as_str().unwrap(),
			"income.BTC"
		);
		// 1 BTC at $50,000.
		assert_eq!(entries[0].usd_value, usd(50_000));
	}

	#[tokio::test]
	async fn outcome_requires_covering_balance() {
		let store = MemoryStore::new();
		let result = ManualOutcomeHandler.validate(&store, &payload("1")).await;
		assert!(matches!(result, Err(LedgerError::NegativeBalance { .. })));
	}

	#[tokio::test]
	async fn zero_amount_is_rejected() {
		let store = MemoryStore::new();
		assert!(matches!(
			ManualIncomeHandler.validate(&store, &payload("0")).await,
			Err(LedgerError::InvalidDomain(_))
		));
	}
}
