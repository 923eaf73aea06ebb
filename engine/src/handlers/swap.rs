//! Asset swaps.
//!
//! A swap moves value between two assets of the same wallet. Mirroring both
//! legs through clearing accounts keeps the global debit/credit sums equal
//! even though the assets differ: each amount appears exactly once per
//! direction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{
	clearing_code, parse_payload, require_balance, require_positive, wallet_code, EntryDraft,
	TransactionHandler,
};
use crate::{
	domain::{Direction, Entry, EntryType, TransactionType},
	errors::LedgerError,
	money::Amount,
	store::Store,
};

/// Clearing scope used by swap transit legs.
const SWAP_SCOPE: &str = "swap";

#[derive(Clone, Debug, Deserialize)]
pub struct SwapPayload {
	pub wallet_id: Uuid,
	pub sold_asset_id: String,
	pub sold_amount: Amount,
	pub sold_decimals: u32,
	pub bought_asset_id: String,
	pub bought_amount: Amount,
	pub bought_decimals: u32,
	pub occurred_at: DateTime<Utc>,
	#[serde(default)]
	pub sold_usd_rate: Option<Amount>,
	#[serde(default)]
	pub bought_usd_rate: Option<Amount>,
	#[serde(default)]
	pub chain_id: Option<String>,
	#[serde(default)]
	pub notes: Option<String>,
}

pub struct SwapHandler;

#[async_trait]
impl TransactionHandler for SwapHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::Swap.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: SwapPayload = parse_payload(payload)?;
		require_positive(&payload.sold_amount, "sold amount")?;
		require_positive(&payload.bought_amount, "bought amount")?;
		if payload.sold_asset_id == payload.bought_asset_id {
			return Err(LedgerError::InvalidDomain(
				"swap requires two distinct assets".into(),
			));
		}
		require_balance(store, payload.wallet_id, &payload.sold_asset_id, &payload.sold_amount)
			.await
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: SwapPayload = parse_payload(payload)?;
		let bought_rate = payload.bought_usd_rate.clone().unwrap_or_else(Amount::zero);
		let sold_rate = payload.sold_usd_rate.clone().unwrap_or_else(Amount::zero);
		Ok(vec![
			EntryDraft::new(
				Direction::Debit,
				EntryType::AssetIncrease,
				payload.bought_amount.clone(),
				&payload.bought_asset_id,
				bought_rate.clone(),
				payload.bought_decimals,
				payload.occurred_at,
			)
			.account_code(wallet_code(payload.wallet_id, &payload.bought_asset_id))
			.wallet(payload.wallet_id)
			.chain(payload.chain_id.as_deref())
			.build(),
			EntryDraft::new(
				Direction::Credit,
				EntryType::Transfer,
				payload.bought_amount.clone(),
				&payload.bought_asset_id,
				bought_rate,
				payload.bought_decimals,
				payload.occurred_at,
			)
			.account_code(clearing_code(SWAP_SCOPE, &payload.bought_asset_id))
			.build(),
			EntryDraft::new(
				Direction::Debit,
				EntryType::Transfer,
				payload.sold_amount.clone(),
				&payload.sold_asset_id,
				sold_rate.clone(),
				payload.sold_decimals,
				payload.occurred_at,
			)
			.account_code(clearing_code(SWAP_SCOPE, &payload.sold_asset_id))
			.build(),
			EntryDraft::new(
				Direction::Credit,
				EntryType::AssetDecrease,
				payload.sold_amount.clone(),
				&payload.sold_asset_id,
				sold_rate,
				payload.sold_decimals,
				payload.occurred_at,
			)
			.account_code(wallet_code(payload.wallet_id, &payload.sold_asset_id))
			.wallet(payload.wallet_id)
			.chain(payload.chain_id.as_deref())
			.build(),
		])
	}
}
