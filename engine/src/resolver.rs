//! Account resolution.
//!
//! Handlers emit entries that name their account by deterministic code; this
//! step turns each code into a canonical account id via an idempotent upsert
//! and writes the id back into the entry. It runs inside the committing
//! unit-of-work so that accounts created for a transaction that ultimately
//! fails are rolled back with it. Concurrent attempts to create the same
//! code converge on one row.

use std::collections::HashMap;

use uuid::Uuid;

use crate::{
	constants::{
		ACCOUNT_CODE_KEY, ACCOUNT_TYPE_KEY, CHAIN_ID_KEY, CLEARING_CODE_PREFIX,
		EXPENSE_CODE_PREFIX, GAS_CODE_PREFIX, INCOME_CODE_PREFIX, WALLET_CODE_PREFIX,
		WALLET_ID_KEY,
	},
	domain::{Account, AccountType, Entry},
	errors::LedgerError,
	store::UnitOfWork,
};

/// Resolve every entry of a pending transaction to a canonical account,
/// creating accounts lazily. Returns the resolved accounts keyed by id for
/// the downstream validator and committer.
pub async fn resolve_accounts(
	uow: &mut dyn UnitOfWork,
	entries: &mut [Entry],
) -> Result<HashMap<Uuid, Account>, LedgerError> {
	let mut accounts = HashMap::new();
	for entry in entries {
		let code = entry
			.metadata
			.get(ACCOUNT_CODE_KEY)
			.and_then(|v| v.as_str())
			.ok_or_else(|| {
				LedgerError::InvalidInput(format!(
					"entry {} carries no `{ACCOUNT_CODE_KEY}` metadata",
					entry.id
				))
			})?
			.to_string();

		let account_type = match entry.metadata.get(ACCOUNT_TYPE_KEY).and_then(|v| v.as_str()) {
			Some(explicit) => AccountType::parse(explicit)?,
			None => infer_account_type(&code)?,
		};
		let wallet_id = entry
			.metadata
			.get(WALLET_ID_KEY)
			.and_then(|v| v.as_str())
			.map(|raw| {
				Uuid::parse_str(raw).map_err(|e| {
					LedgerError::InvalidInput(format!("invalid wallet id `{raw}`: {e}"))
				})
			})
			.transpose()?;
		let chain_id =
			entry.metadata.get(CHAIN_ID_KEY).and_then(|v| v.as_str()).map(str::to_string);

		let candidate =
			Account::new(code, account_type, entry.asset_id.clone(), wallet_id, chain_id);
		let canonical = uow.get_or_create_account(candidate).await?;
		entry.account_id = Some(canonical.id);
		accounts.insert(canonical.id, canonical);
	}
	Ok(accounts)
}

fn infer_account_type(code: &str) -> Result<AccountType, LedgerError> {
	if code.starts_with(WALLET_CODE_PREFIX) {
		Ok(AccountType::CryptoWallet)
	} else if code.starts_with(INCOME_CODE_PREFIX) {
		Ok(AccountType::Income)
	} else if code.starts_with(EXPENSE_CODE_PREFIX) {
		Ok(AccountType::Expense)
	} else if code.starts_with(GAS_CODE_PREFIX) {
		Ok(AccountType::GasFee)
	} else if code.starts_with(CLEARING_CODE_PREFIX) {
		Ok(AccountType::Clearing)
	} else {
		Err(LedgerError::InvalidInput(format!(
			"cannot infer account type from code `{code}`"
		)))
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;
	use crate::{
		domain::{Direction, EntryType, Metadata},
		money::Amount,
		store::{memory::MemoryStore, Store},
	};

	fn entry_with_code(code: &str) -> Entry {
		let mut metadata = Metadata::new();
		metadata.insert(ACCOUNT_CODE_KEY.into(), code.into());
		if code.starts_with(WALLET_CODE_PREFIX) {
			metadata.insert(WALLET_ID_KEY.into(), Uuid::new_v4().to_string().into());
		}
		Entry {
			id: Uuid::new_v4(),
			transaction_id: Uuid::new_v4(),
			account_id: None,
			direction: Direction::Debit,
			entry_type: EntryType::Transfer,
			amount: Amount::from(1i64),
			asset_id: "BTC".into(),
			usd_rate: Amount::zero(),
			usd_value: Amount::zero(),
			occurred_at: Utc::now(),
			created_at: Utc::now(),
			metadata,
		}
	}

	#[tokio::test]
	async fn resolves_and_creates_accounts_lazily() {
		let store = MemoryStore::new();
		let mut entries = vec![entry_with_code("income.BTC")];
		let mut uow = store.begin().await.unwrap();
		let accounts = resolve_accounts(uow.as_mut(), &mut entries).await.unwrap();
		let id = entries[0].account_id.unwrap();
		assert_eq!(accounts[&id].account_type, AccountType::Income);
		assert_eq!(accounts[&id].code, "income.BTC");
	}

	#[tokio::test]
	async fn same_code_resolves_to_same_account() {
		let store = MemoryStore::new();
		let mut first = vec![entry_with_code("clearing.swap.BTC")];
		let mut second = vec![entry_with_code("clearing.swap.BTC")];
		let mut uow = store.begin().await.unwrap();
		resolve_accounts(uow.as_mut(), &mut first).await.unwrap();
		uow.commit().await.unwrap();
		let mut uow = store.begin().await.unwrap();
		resolve_accounts(uow.as_mut(), &mut second).await.unwrap();
		assert_eq!(first[0].account_id, second[0].account_id);
	}

	#[tokio::test]
	async fn unresolved_accounts_vanish_on_rollback() {
		let store = MemoryStore::new();
		let mut entries = vec![entry_with_code("income.BTC")];
		{
			let mut uow = store.begin().await.unwrap();
			resolve_accounts(uow.as_mut(), &mut entries).await.unwrap();
			// Dropped without commit.
		}
		assert!(store.get_account_by_code("income.BTC").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn missing_code_fails() {
		let store = MemoryStore::new();
		let mut entry = entry_with_code("income.BTC");
		entry.metadata.remove(ACCOUNT_CODE_KEY);
		let mut entries = vec![entry];
		let mut uow = store.begin().await.unwrap();
		assert!(matches!(
			resolve_accounts(uow.as_mut(), &mut entries).await,
			Err(LedgerError::InvalidInput(_))
		));
	}

	#[tokio::test]
	async fn unknown_prefix_without_explicit_type_fails() {
		let store = MemoryStore::new();
		let mut entries = vec![entry_with_code("mystery.BTC")];
		let mut uow = store.begin().await.unwrap();
		assert!(matches!(
			resolve_accounts(uow.as_mut(), &mut entries).await,
			Err(LedgerError::InvalidInput(_))
		));
	}
}
