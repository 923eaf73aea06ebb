//! DeFi protocol interactions: deposits, withdrawals and reward claims.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{
	clearing_code, defi_income_code, parse_payload, require_balance, require_positive,
	wallet_code, EntryDraft, TransactionHandler,
};
use crate::{
	domain::{AccountType, Direction, Entry, EntryType, TransactionType},
	errors::LedgerError,
	money::Amount,
	store::Store,
};

/// Clearing scope used by deposit/withdraw transit legs.
const DEFI_SCOPE: &str = "defi";

#[derive(Clone, Debug, Deserialize)]
pub struct DefiMovementPayload {
	pub wallet_id: Uuid,
	pub asset_id: String,
	pub amount: Amount,
	pub occurred_at: DateTime<Utc>,
	pub decimals: u32,
	pub protocol: String,
	pub chain_id: String,
	#[serde(default)]
	pub usd_rate: Option<Amount>,
	/// LP token received (deposit) or surrendered (withdraw) in exchange for
	/// the position, when the protocol issues one.
	#[serde(default)]
	pub lp_token_asset_id: Option<String>,
	#[serde(default)]
	pub lp_token_amount: Option<Amount>,
	#[serde(default)]
	pub lp_token_decimals: Option<u32>,
	#[serde(default)]
	pub lp_token_usd_rate: Option<Amount>,
	#[serde(default)]
	pub notes: Option<String>,
}

impl DefiMovementPayload {
	fn lp_leg(&self) -> Result<Option<(String, Amount, u32, Amount)>, LedgerError> {
		match (&self.lp_token_asset_id, &self.lp_token_amount) {
			(Some(asset), Some(amount)) => {
				require_positive(amount, "lp token amount")?;
				Ok(Some((
					asset.clone(),
					amount.clone(),
					self.lp_token_decimals.unwrap_or(self.decimals),
					self.lp_token_usd_rate.clone().unwrap_or_else(Amount::zero),
				)))
			},
			(None, None) => Ok(None),
			_ => Err(LedgerError::InvalidInput(
				"lp token asset and amount must be provided together".into(),
			)),
		}
	}
}

/// `defi_deposit`: the wallet sends the underlying asset into a protocol
/// (Credit wallet / Debit clearing) and, when one is issued, receives an LP
/// token back (Debit wallet / Credit clearing).
pub struct DefiDepositHandler;

#[async_trait]
impl TransactionHandler for DefiDepositHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::DefiDeposit.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: DefiMovementPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "deposit amount")?;
		payload.lp_leg()?;
		require_balance(store, payload.wallet_id, &payload.asset_id, &payload.amount).await
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: DefiMovementPayload = parse_payload(payload)?;
		let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
		let mut entries = vec![
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
			.chain(Some(&payload.chain_id))
			.build(),
			EntryDraft::new(
				Direction::Debit,
				EntryType::Transfer,
				payload.amount.clone(),
				&payload.asset_id,
				rate,
				payload.decimals,
				payload.occurred_at,
			)
			.account_code(clearing_code(DEFI_SCOPE, &payload.asset_id))
			.build(),
		];
		if let Some((lp_asset, lp_amount, lp_decimals, lp_rate)) = payload.lp_leg()? {
			entries.push(
				EntryDraft::new(
					Direction::Debit,
					EntryType::AssetIncrease,
					lp_amount.clone(),
					&lp_asset,
					lp_rate.clone(),
					lp_decimals,
					payload.occurred_at,
				)
				.account_code(wallet_code(payload.wallet_id, &lp_asset))
				.wallet(payload.wallet_id)
				.chain(Some(&payload.chain_id))
				.build(),
			);
			entries.push(
				EntryDraft::new(
					Direction::Credit,
					EntryType::Transfer,
					lp_amount,
					&lp_asset,
					lp_rate,
					lp_decimals,
					payload.occurred_at,
				)
				.account_code(clearing_code(DEFI_SCOPE, &lp_asset))
				.build(),
			);
		}
		Ok(entries)
	}
}

/// `defi_withdraw`: mirror image of the deposit. The protocol returns the
/// underlying asset, the LP token (if any) goes back.
pub struct DefiWithdrawHandler;

#[async_trait]
impl TransactionHandler for DefiWithdrawHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::DefiWithdraw.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: DefiMovementPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "withdraw amount")?;
		if let Some((lp_asset, lp_amount, _, _)) = payload.lp_leg()? {
			require_balance(store, payload.wallet_id, &lp_asset, &lp_amount).await?;
		}
		Ok(())
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: DefiMovementPayload = parse_payload(payload)?;
		let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
		let mut entries = vec![
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
			.chain(Some(&payload.chain_id))
			.build(),
			EntryDraft::new(
				Direction::Credit,
				EntryType::Transfer,
				payload.amount.clone(),
				&payload.asset_id,
				rate,
				payload.decimals,
				payload.occurred_at,
			)
			.account_code(clearing_code(DEFI_SCOPE, &payload.asset_id))
			.build(),
		];
		if let Some((lp_asset, lp_amount, lp_decimals, lp_rate)) = payload.lp_leg()? {
			entries.push(
				EntryDraft::new(
					Direction::Credit,
					EntryType::AssetDecrease,
					lp_amount.clone(),
					&lp_asset,
					lp_rate.clone(),
					lp_decimals,
					payload.occurred_at,
				)
				.account_code(wallet_code(payload.wallet_id, &lp_asset))
				.wallet(payload.wallet_id)
				.chain(Some(&payload.chain_id))
				.build(),
			);
			entries.push(
				EntryDraft::new(
					Direction::Debit,
					EntryType::Transfer,
					lp_amount,
					&lp_asset,
					lp_rate,
					lp_decimals,
					payload.occurred_at,
				)
				.account_code(clearing_code(DEFI_SCOPE, &lp_asset))
				.build(),
			);
		}
		Ok(entries)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct DefiClaimPayload {
	pub wallet_id: Uuid,
	pub reward_asset_id: String,
	pub amount: Amount,
	pub occurred_at: DateTime<Utc>,
	pub decimals: u32,
	pub protocol: String,
	pub chain_id: String,
	#[serde(default)]
	pub usd_rate: Option<Amount>,
	#[serde(default)]
	pub notes: Option<String>,
}

/// `defi_claim`: reward tokens land in the wallet against the protocol's
/// DeFi income account (`income.defi.<chain>.<protocol>`).
pub struct DefiClaimHandler;

#[async_trait]
impl TransactionHandler for DefiClaimHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::DefiClaim.as_str()
	}

	async fn validate(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: DefiClaimPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "claim amount")?;
		if payload.protocol.is_empty() || payload.chain_id.is_empty() {
			return Err(LedgerError::InvalidInput(
				"claim requires protocol and chain".into(),
			));
		}
		Ok(())
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: DefiClaimPayload = parse_payload(payload)?;
		let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
		Ok(vec![
			EntryDraft::new(
				Direction::Debit,
				EntryType::AssetIncrease,
				payload.amount.clone(),
				&payload.reward_asset_id,
				rate.clone(),
				payload.decimals,
				payload.occurred_at,
			)
			.account_code(wallet_code(payload.wallet_id, &payload.reward_asset_id))
			.wallet(payload.wallet_id)
			.chain(Some(&payload.chain_id))
			.build(),
			EntryDraft::new(
				Direction::Credit,
				EntryType::Income,
				payload.amount.clone(),
				&payload.reward_asset_id,
				rate,
				payload.decimals,
				payload.occurred_at,
			)
			.account_code(defi_income_code(&payload.chain_id, &payload.protocol))
			.account_type(AccountType::DefiIncome)
			.chain(Some(&payload.chain_id))
			.build(),
		])
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{constants::ACCOUNT_TYPE_KEY, store::memory::MemoryStore};

	#[tokio::test]
	async fn claim_credits_protocol_income_account() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"reward_asset_id": "CRV",
			"amount": "1000",
			"occurred_at": Utc::now(),
			"decimals": 0,
			"protocol": "curve",
			"chain_id": "ethereum",
		});
		let entries = DefiClaimHandler.generate_entries(&store, &payload).await.unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(
			entries[1].metadata[crate::constants::ACCOUNT_CODE_KEY].as_str().unwrap(),
			"income.defi.ethereum.curve"
		);
		assert_eq!(entries[1].metadata[ACCOUNT_TYPE_KEY].as_str().unwrap(), "DEFI_INCOME");
	}

	#[tokio::test]
	async fn deposit_with_lp_token_emits_four_legs() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"asset_id": "USDC",
			"amount": "1000",
			"occurred_at": Utc::now(),
			"decimals": 0,
			"protocol": "curve",
			"chain_id": "ethereum",
			"lp_token_asset_id": "crvUSDC",
			"lp_token_amount": "990",
		});
		let entries = DefiDepositHandler.generate_entries(&store, &payload).await.unwrap();
		assert_eq!(entries.len(), 4);
		let debits = entries
			.iter()
			.filter(|e| e.is_debit())
			.fold(Amount::zero(), |acc, e| acc + e.amount.clone());
		let credits = entries
			.iter()
			.filter(|e| e.is_credit())
			.fold(Amount::zero(), |acc, e| acc + e.amount.clone());
		assert_eq!(debits, credits);
	}

	#[tokio::test]
	async fn lp_token_fields_must_come_together() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"asset_id": "USDC",
			"amount": "1000",
			"occurred_at": Utc::now(),
			"decimals": 0,
			"protocol": "curve",
			"chain_id": "ethereum",
			"lp_token_asset_id": "crvUSDC",
		});
		assert!(matches!(
			DefiDepositHandler.validate(&store, &payload).await,
			Err(LedgerError::InvalidInput(_))
		));
	}
}
