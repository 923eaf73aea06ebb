//! Pre-commit validation.
//!
//! Runs after account resolution, inside the committing unit-of-work: domain
//! invariants on the transaction and every entry, the global debit/credit
//! equality, and a negative-balance projection for crypto-wallet accounts.
//! The projection reads balances without locks, so it can miss a concurrent
//! write; the committer repeats the check under the row lock and is the
//! authority.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{
	domain::{Account, AccountType, EntryType, Transaction},
	errors::LedgerError,
	money::Amount,
	store::UnitOfWork,
};

pub async fn validate_transaction(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	accounts: &std::collections::HashMap<Uuid, Account>,
) -> Result<(), LedgerError> {
	transaction.validate()?;
	for entry in &transaction.entries {
		entry.validate()?;
		let account_id = entry.account_id.ok_or_else(|| {
			LedgerError::InvalidDomain(format!("entry {} has no resolved account", entry.id))
		})?;
		if !accounts.contains_key(&account_id) {
			return Err(LedgerError::NotFound(format!("account {account_id}")));
		}
	}

	transaction.verify_balance()?;

	project_wallet_balances(uow, transaction, accounts).await
}

/// Advisory projection: for each `(account, asset)` touched by an asset
/// movement on a crypto wallet, current balance plus the transaction's
/// signed delta must stay non-negative.
async fn project_wallet_balances(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	accounts: &std::collections::HashMap<Uuid, Account>,
) -> Result<(), LedgerError> {
	let mut deltas: BTreeMap<(Uuid, String), Amount> = BTreeMap::new();
	for entry in &transaction.entries {
		if !matches!(entry.entry_type, EntryType::AssetIncrease | EntryType::AssetDecrease) {
			continue;
		}
		let account_id = entry.account_id.expect("checked by validate_transaction");
		if accounts[&account_id].account_type != AccountType::CryptoWallet {
			continue;
		}
		*deltas.entry((account_id, entry.asset_id.clone())).or_insert_with(Amount::zero) +=
			&entry.signed_amount();
	}

	for ((account_id, asset_id), delta) in deltas {
		let current = uow
			.get_balance(account_id, &asset_id)
			.await?
			.map(|b| b.balance)
			.unwrap_or_else(Amount::zero);
		let projected = current + &delta;
		if projected.is_negative() {
			return Err(LedgerError::NegativeBalance {
				account: accounts[&account_id].code.clone(),
				asset_id,
				projected,
			});
		}
	}
	Ok(())
}
