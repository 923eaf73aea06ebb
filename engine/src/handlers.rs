//! Transaction handlers.
//!
//! A handler turns a raw request payload into a balanced set of entries with
//! unresolved accounts: each entry carries its deterministic account code
//! (plus wallet/chain/type hints) in metadata, and the account resolver later
//! swaps those hints for canonical account ids. One handler per transaction
//! type tag, looked up through the registry.

pub mod adjustment;
pub mod defi;
pub mod manual;
pub mod swap;
pub mod transfer;

use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{
	constants::{ACCOUNT_CODE_KEY, ACCOUNT_TYPE_KEY, CHAIN_ID_KEY, WALLET_ID_KEY},
	domain::{AccountType, Direction, Entry, EntryType, Metadata},
	errors::LedgerError,
	money::Amount,
	store::Store,
};

/// Contract between the ledger and a transaction type. `validate` runs
/// business-rule checks (it may use the read-only store, e.g. for
/// sufficient-balance checks on outflows); `generate_entries` emits a
/// globally balanced entry set with account codes in metadata.
#[async_trait]
pub trait TransactionHandler: Send + Sync {
	fn type_tag(&self) -> &'static str;

	async fn validate(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<(), LedgerError>;

	async fn generate_entries(
		&self,
		store: &dyn Store,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError>;
}

/// Maps transaction type tags to handlers. Reads vastly outnumber writes
/// (registration happens at boot, re-registration is rare), hence the
/// readers-writer lock.
#[derive(Default)]
pub struct HandlerRegistry {
	handlers: RwLock<HashMap<String, Arc<dyn TransactionHandler>>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registration is exclusive: one handler per tag.
	pub fn register(&self, handler: Arc<dyn TransactionHandler>) -> Result<(), LedgerError> {
		let tag = handler.type_tag();
		if tag.is_empty() {
			return Err(LedgerError::EmptyTypeTag);
		}
		let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
		if handlers.contains_key(tag) {
			return Err(LedgerError::AlreadyRegistered(tag.to_string()));
		}
		handlers.insert(tag.to_string(), handler);
		Ok(())
	}

	pub fn get(&self, tag: &str) -> Result<Arc<dyn TransactionHandler>, LedgerError> {
		self.handlers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(tag)
			.cloned()
			.ok_or_else(|| LedgerError::NotRegistered(tag.to_string()))
	}

	pub fn has(&self, tag: &str) -> bool {
		self.handlers.read().unwrap_or_else(PoisonError::into_inner).contains_key(tag)
	}

	pub fn tags(&self) -> Vec<String> {
		self.handlers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.keys()
			.cloned()
			.sorted()
			.collect()
	}

	/// Lookup + validate + generate in one call.
	pub async fn dispatch(
		&self,
		store: &dyn Store,
		tag: &str,
		payload: &serde_json::Value,
	) -> Result<Vec<Entry>, LedgerError> {
		let handler = self.get(tag)?;
		handler.validate(store, payload).await?;
		handler.generate_entries(store, payload).await
	}
}

/// The ten normative handlers, registered once at boot.
pub fn default_registry() -> Result<HandlerRegistry, LedgerError> {
	let registry = HandlerRegistry::new();
	registry.register(Arc::new(manual::ManualIncomeHandler))?;
	registry.register(Arc::new(manual::ManualOutcomeHandler))?;
	registry.register(Arc::new(transfer::TransferInHandler))?;
	registry.register(Arc::new(transfer::TransferOutHandler))?;
	registry.register(Arc::new(transfer::InternalTransferHandler))?;
	registry.register(Arc::new(adjustment::AssetAdjustmentHandler))?;
	registry.register(Arc::new(swap::SwapHandler))?;
	registry.register(Arc::new(defi::DefiDepositHandler))?;
	registry.register(Arc::new(defi::DefiWithdrawHandler))?;
	registry.register(Arc::new(defi::DefiClaimHandler))?;
	Ok(registry)
}

// ==== Account code derivation ====

pub fn wallet_code(wallet_id: Uuid, asset: &str) -> String {
	format!("wallet.{wallet_id}.{asset}")
}

pub fn income_code(asset: &str) -> String {
	format!("income.{asset}")
}

pub fn expense_code(asset: &str) -> String {
	format!("expense.{asset}")
}

pub fn clearing_code(scope: &str, asset: &str) -> String {
	format!("clearing.{scope}.{asset}")
}

pub fn gas_code(chain_id: Option<&str>, asset: &str) -> String {
	match chain_id {
		Some(chain_id) => format!("gas.{chain_id}.{asset}"),
		None => format!("gas.{asset}"),
	}
}

pub fn defi_income_code(chain_id: &str, protocol: &str) -> String {
	format!("income.defi.{chain_id}.{protocol}")
}

/// Common payload for single-wallet asset movements (manual income/outcome
/// and external transfers). Amounts arrive as decimal strings of base units;
/// `usd_rate` is 10^8-scaled USD per whole unit.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct MovementPayload {
	pub wallet_id: Uuid,
	pub asset_id: String,
	pub amount: Amount,
	pub occurred_at: DateTime<Utc>,
	pub decimals: u32,
	#[serde(default)]
	pub usd_rate: Option<Amount>,
	#[serde(default)]
	pub price_asset_id: Option<String>,
	#[serde(default)]
	pub chain_id: Option<String>,
	#[serde(default)]
	pub notes: Option<String>,
}

// ==== Shared handler plumbing ====

pub(crate) fn parse_payload<T: DeserializeOwned>(
	payload: &serde_json::Value,
) -> Result<T, LedgerError> {
	serde_json::from_value(payload.clone())
		.map_err(|e| LedgerError::InvalidInput(format!("malformed payload: {e}")))
}

pub(crate) fn require_positive(amount: &Amount, what: &str) -> Result<(), LedgerError> {
	if !amount.is_positive() {
		return Err(LedgerError::InvalidDomain(format!("{what} must be positive, got {amount}")));
	}
	Ok(())
}

/// Current balance of the wallet account derived from
/// `wallet.<wallet_id>.<asset>`; zero when the account or its balance row
/// does not exist yet. Advisory only; the committer re-checks under a lock.
pub(crate) async fn wallet_balance(
	store: &dyn Store,
	wallet_id: Uuid,
	asset: &str,
) -> Result<Amount, LedgerError> {
	let code = wallet_code(wallet_id, asset);
	match store.get_account_by_code(&code).await? {
		Some(account) => Ok(store
			.get_balance(account.id, asset)
			.await?
			.map(|b| b.balance)
			.unwrap_or_else(Amount::zero)),
		None => Ok(Amount::zero()),
	}
}

pub(crate) async fn require_balance(
	store: &dyn Store,
	wallet_id: Uuid,
	asset: &str,
	needed: &Amount,
) -> Result<(), LedgerError> {
	let available = wallet_balance(store, wallet_id, asset).await?;
	if &available < needed {
		return Err(LedgerError::NegativeBalance {
			account: wallet_code(wallet_id, asset),
			asset_id: asset.to_string(),
			projected: available - needed,
		});
	}
	Ok(())
}

/// Builder for the unresolved entries handlers emit. Computes the USD value
/// from amount and rate, and stashes the resolution hints in metadata.
pub(crate) struct EntryDraft {
	entry: Entry,
}

impl EntryDraft {
	pub(crate) fn new(
		direction: Direction,
		entry_type: EntryType,
		amount: Amount,
		asset_id: &str,
		usd_rate: Amount,
		decimals: u32,
		occurred_at: DateTime<Utc>,
	) -> Self {
		let usd_value = amount.usd_value(&usd_rate, decimals);
		Self {
			entry: Entry {
				id: Uuid::new_v4(),
				// Stamped by the facade once the transaction id exists.
				transaction_id: Uuid::nil(),
				account_id: None,
				direction,
				entry_type,
				amount,
				asset_id: asset_id.to_string(),
				usd_rate,
				usd_value,
				occurred_at,
				created_at: Utc::now(),
				metadata: Metadata::new(),
			},
		}
	}

	pub(crate) fn account_code(mut self, code: String) -> Self {
		self.entry.metadata.insert(ACCOUNT_CODE_KEY.into(), code.into());
		self
	}

	pub(crate) fn wallet(mut self, wallet_id: Uuid) -> Self {
		self.entry.metadata.insert(WALLET_ID_KEY.into(), wallet_id.to_string().into());
		self
	}

	pub(crate) fn chain(mut self, chain_id: Option<&str>) -> Self {
		if let Some(chain_id) = chain_id {
			self.entry.metadata.insert(CHAIN_ID_KEY.into(), chain_id.into());
		}
		self
	}

	pub(crate) fn account_type(mut self, account_type: AccountType) -> Self {
		self.entry.metadata.insert(ACCOUNT_TYPE_KEY.into(), account_type.as_str().into());
		self
	}

	pub(crate) fn build(self) -> Entry {
		self.entry
	}
}
