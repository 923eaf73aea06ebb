//! Commit orchestration.
//!
//! One unit-of-work per transaction, spanning everything the write touches:
//! resolve the entries' accounts, validate, persist the transaction with its
//! entries, fold the entries into balance deltas, apply them under row locks
//! in ascending `(account_id, asset_id)` order (the deterministic order is
//! the deadlock guard), run the tax-lot engine, then commit. Any failure
//! rolls the whole unit-of-work back; nothing partial survives, including
//! accounts the resolver created for the failed transaction.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::{
	domain::{Account, AccountBalance, AccountType, Transaction},
	errors::LedgerError,
	lots,
	money::Amount,
	resolver,
	store::{Store, UnitOfWork},
	validator,
};

pub async fn commit_transaction(
	store: &dyn Store,
	transaction: &mut Transaction,
) -> Result<(), LedgerError> {
	let mut uow = store.begin().await?;
	match run(uow.as_mut(), transaction).await {
		Ok(()) => {
			uow.commit().await?;
			debug!(transaction_id = %transaction.id, "transaction committed");
			Ok(())
		},
		Err(e) => {
			// Explicit rollback; dropping the handle would also roll back.
			uow.rollback().await.ok();
			Err(e)
		},
	}
}

async fn run(
	uow: &mut dyn UnitOfWork,
	transaction: &mut Transaction,
) -> Result<(), LedgerError> {
	let accounts = resolver::resolve_accounts(uow, &mut transaction.entries).await?;
	validator::validate_transaction(uow, transaction, &accounts).await?;
	apply(uow, transaction, &accounts).await
}

async fn apply(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	accounts: &HashMap<Uuid, Account>,
) -> Result<(), LedgerError> {
	uow.create_transaction(transaction).await?;

	// BTreeMap iteration gives the ascending (account, asset) lock order.
	let mut deltas: BTreeMap<(Uuid, String), (Amount, Amount)> = BTreeMap::new();
	for entry in &transaction.entries {
		let account_id = entry.account_id.ok_or_else(|| {
			LedgerError::InvalidDomain(format!("entry {} has no resolved account", entry.id))
		})?;
		let slot = deltas
			.entry((account_id, entry.asset_id.clone()))
			.or_insert_with(|| (Amount::zero(), Amount::zero()));
		slot.0 += &entry.signed_amount();
		slot.1 += &entry.signed_usd_value();
	}

	for ((account_id, asset_id), (delta, usd_delta)) in deltas {
		let account = accounts
			.get(&account_id)
			.ok_or_else(|| LedgerError::NotFound(format!("account {account_id}")))?;
		let current = uow.get_balance_for_update(account_id, &asset_id).await?;
		let new_balance = current.balance + &delta;
		// Authoritative re-check under the lock; the validator's earlier
		// projection can be stale under contention.
		if account.account_type == AccountType::CryptoWallet && new_balance.is_negative() {
			return Err(LedgerError::NegativeBalance {
				account: account.code.clone(),
				asset_id,
				projected: new_balance,
			});
		}
		uow.upsert_balance(&AccountBalance {
			account_id,
			asset_id,
			balance: new_balance,
			usd_value: current.usd_value + &usd_delta,
			last_updated: Utc::now(),
		})
		.await?;
	}

	lots::process(uow, transaction, accounts).await
}
