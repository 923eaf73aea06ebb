//! On-chain transfers: external in/out plus wallet-to-wallet moves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{
	gas_code,
	manual::{income_entries, outcome_entries},
	parse_payload, require_balance, require_positive, wallet_code, EntryDraft, MovementPayload,
	TransactionHandler,
};
use crate::{
	domain::{Direction, Entry, EntryType, TransactionType},
	errors::LedgerError,
	money::Amount,
	store::Store,
};

/// `transfer_in`: an inbound on-chain transfer, booked like income against
/// `income.<asset>` (fair market value at transfer supplies the rate).
pub struct TransferInHandler;

#[async_trait]
impl TransactionHandler for TransferInHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::TransferIn.as_str()
	}

	async fn validate(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: MovementPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "transfer amount")
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

/// Outbound transfer payload: the movement itself plus the optional network
/// fee burned alongside it.
#[derive(Clone, Debug, Deserialize)]
pub struct TransferOutPayload {
	#[serde(flatten)]
	pub movement: MovementPayload,
	#[serde(default)]
	pub gas_fee: Option<Amount>,
	/// Defaults to the transferred asset (fees in the native coin of the
	/// chain are the common case, e.g. an ERC-20 transfer paying ETH gas).
	#[serde(default)]
	pub gas_asset_id: Option<String>,
	#[serde(default)]
	pub gas_decimals: Option<u32>,
	#[serde(default)]
	pub gas_usd_rate: Option<Amount>,
}

/// `transfer_out`: an outbound on-chain transfer, booked like spending
/// against `expense.<asset>`, with the network fee (when given) going to
/// `gas.<chain>.<asset>`.
pub struct TransferOutHandler;

#[async_trait]
impl TransactionHandler for TransferOutHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::TransferOut.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: TransferOutPayload = parse_payload(payload)?;
		require_positive(&payload.movement.amount, "transfer amount")?;
		if let Some(gas_fee) = &payload.gas_fee {
			require_positive(gas_fee, "gas fee")?;
		}
		require_balance(
			store,
			payload.movement.wallet_id,
			&payload.movement.asset_id,
			&payload.movement.amount,
		)
		.await
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: TransferOutPayload = parse_payload(payload)?;
		let movement = &payload.movement;
		let mut entries = outcome_entries(movement);
		if let Some(gas_fee) = &payload.gas_fee {
			let gas_asset =
				payload.gas_asset_id.clone().unwrap_or_else(|| movement.asset_id.clone());
			let gas_decimals = payload.gas_decimals.unwrap_or(movement.decimals);
			let gas_rate = payload.gas_usd_rate.clone().unwrap_or_else(Amount::zero);
			entries.push(
				EntryDraft::new(
					Direction::Credit,
					EntryType::AssetDecrease,
					gas_fee.clone(),
					&gas_asset,
					gas_rate.clone(),
					gas_decimals,
					movement.occurred_at,
				)
				.account_code(wallet_code(movement.wallet_id, &gas_asset))
				.wallet(movement.wallet_id)
				.chain(movement.chain_id.as_deref())
				.build(),
			);
			entries.push(
				EntryDraft::new(
					Direction::Debit,
					EntryType::GasFee,
					gas_fee.clone(),
					&gas_asset,
					gas_rate,
					gas_decimals,
					movement.occurred_at,
				)
				.account_code(gas_code(movement.chain_id.as_deref(), &gas_asset))
				.build(),
			);
		}
		Ok(entries)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct InternalTransferPayload {
	pub from_wallet_id: Uuid,
	pub to_wallet_id: Uuid,
	pub asset_id: String,
	pub amount: Amount,
	pub occurred_at: DateTime<Utc>,
	pub decimals: u32,
	#[serde(default)]
	pub usd_rate: Option<Amount>,
	#[serde(default)]
	pub chain_id: Option<String>,
	#[serde(default)]
	pub notes: Option<String>,
}

/// `internal_transfer`: Credit the source wallet / Debit the target wallet,
/// same asset, same amount. The tax-lot engine links destination lots to the
/// consumed source lots so no PnL is realized.
pub struct InternalTransferHandler;

#[async_trait]
impl TransactionHandler for InternalTransferHandler {
	fn type_tag(&self) -> &'static str {
		TransactionType::InternalTransfer.as_str()
	}

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError> {
		let payload: InternalTransferPayload = parse_payload(payload)?;
		require_positive(&payload.amount, "transfer amount")?;
		if payload.from_wallet_id == payload.to_wallet_id {
			return Err(LedgerError::InvalidDomain(
				"internal transfer requires two distinct wallets".into(),
			));
		}
		require_balance(store, payload.from_wallet_id, &payload.asset_id, &payload.amount).await
	}

	async fn generate_entries(
		&self,
		_store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let payload: InternalTransferPayload = parse_payload(payload)?;
		let rate = payload.usd_rate.clone().unwrap_or_else(Amount::zero);
		Ok(vec![
			EntryDraft::new(
				Direction::Credit,
				EntryType::AssetDecrease,
				payload.amount.clone(),
				&payload.asset_id,
				rate.clone(),
				payload.decimals,
				payload.occurred_at,
			)
			.account_code(wallet_code(payload.from_wallet_id, &payload.asset_id))
			.wallet(payload.from_wallet_id)
			.chain(payload.chain_id.as_deref())
			.build(),
			EntryDraft::new(
				Direction::Debit,
				EntryType::AssetIncrease,
				payload.amount.clone(),
				&payload.asset_id,
				rate,
				payload.decimals,
				payload.occurred_at,
			)
			.account_code(wallet_code(payload.to_wallet_id, &payload.asset_id))
			.wallet(payload.to_wallet_id)
			.chain(payload.chain_id.as_deref())
			.build(),
		])
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::memory::MemoryStore;

	#[tokio::test]
	async fn self_transfer_is_rejected() {
		let store = MemoryStore::new();
		let wallet = Uuid::new_v4();
		let payload = serde_json::json!({
			"from_wallet_id": wallet,
			"to_wallet_id": wallet,
			"asset_id": "ETH",
			"amount": "400",
			"occurred_at": Utc::now(),
			"decimals": 0,
		});
		assert!(matches!(
			InternalTransferHandler.validate(&store, &payload).await,
			Err(LedgerError::InvalidDomain(_))
		));
	}

	#[tokio::test]
	async fn transfer_out_books_gas_against_the_gas_account() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"wallet_id": Uuid::new_v4(),
			"asset_id": "USDC",
			"amount": "1000",
			"occurred_at": Utc::now(),
			"decimals": 0,
			"chain_id": "ethereum",
			"gas_fee": "21000",
			"gas_asset_id": "ETH",
			"gas_decimals": 0,
		});
		let entries = TransferOutHandler.generate_entries(&store, &payload).await.unwrap();
		assert_eq!(entries.len(), 4);
		assert_eq!(entries[2].entry_type, EntryType::AssetDecrease);
		assert_eq!(entries[2].asset_id, "ETH");
		assert_eq!(entries[3].entry_type, EntryType::GasFee);
		assert_eq!(
			entries[3].metadata[crate::constants::ACCOUNT_CODE_KEY].as_str().unwrap(),
			"gas.ethereum.ETH"
		);
	}

	#[tokio::test]
	async fn internal_transfer_legs_mirror_each_other() {
		let store = MemoryStore::new();
		let payload = serde_json::json!({
			"from_wallet_id": Uuid::new_v4(),
			"to_wallet_id": Uuid::new_v4(),
			"asset_id": "ETH",
			"amount": "400",
			"occurred_at": Utc::now(),
			"decimals": 0,
		});
		let entries =
			InternalTransferHandler.generate_entries(&store, &payload).await.unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].entry_type, EntryType::AssetDecrease);
		assert_eq!(entries[1].entry_type, EntryType::AssetIncrease);
		assert_eq!(entries[0].amount, entries[1].amount);
		assert_eq!(entries[0].asset_id, entries[1].asset_id);
	}
}
