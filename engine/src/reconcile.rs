//! Reconciliation.
//!
//! The denormalized balance must equal the signed sum of entries for every
//! `(account, asset)` pair. This check runs off the write path: the service
//! binary sweeps all balance rows periodically, and the test suites call it
//! after every scenario.

use tracing::{info, warn};
use uuid::Uuid;

use crate::{errors::LedgerError, money::Amount, store::Store};

/// Compare the entry log against the balance row for one pair.
pub async fn reconcile(
	store: &dyn Store,
	account_id: Uuid,
	asset_id: &str,
) -> Result<(), LedgerError> {
	let expected = store.calculate_balance_from_entries(account_id, asset_id).await?;
	let observed = store
		.get_balance(account_id, asset_id)
		.await?
		.map(|b| b.balance)
		.unwrap_or_else(Amount::zero);
	if expected != observed {
		return Err(LedgerError::BalanceMismatch {
			account_id,
			asset_id: asset_id.to_string(),
			expected,
			observed,
		});
	}
	Ok(())
}

/// Sweep every persisted balance row, logging each divergence. Returns the
/// number of mismatches found.
pub async fn sweep(store: &dyn Store) -> Result<usize, LedgerError> {
	let balances = store.list_all_balances().await?;
	let total = balances.len();
	let mut mismatches = 0usize;
	for balance in balances {
		match reconcile(store, balance.account_id, &balance.asset_id).await {
			Ok(()) => {},
			Err(LedgerError::BalanceMismatch { account_id, asset_id, expected, observed }) => {
				mismatches += 1;
				warn!(
					%account_id,
					%asset_id,
					%expected,
					%observed,
					"balance diverged from entry log"
				);
			},
			Err(e) => return Err(e),
		}
	}
	info!(checked = total, mismatches, "reconciliation sweep finished");
	Ok(mismatches)
}
