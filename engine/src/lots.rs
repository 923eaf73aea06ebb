//! Tax-lot engine.
//!
//! Every asset acquisition on a crypto wallet opens a lot carrying its
//! per-unit cost; disposals consume open lots first-in-first-out under row
//! locks inside the committing unit-of-work. Internal transfers move lots
//! between wallets without realizing PnL: the destination lot freezes the
//! source's effective basis at transfer time and keeps a link to it.

use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::{
	domain::{
		Account, AccountType, CostBasisSource, DisposalType, Entry, EntryType, LotDisposal,
		LotOverrideHistory, TaxLot, Transaction, TransactionType,
	},
	errors::LedgerError,
	money::Amount,
	store::{Store, UnitOfWork},
};

/// One FIFO consumption step: which lot was consumed, how much of it, and
/// the effective basis frozen at that moment.
struct Consumed {
	lot_id: Uuid,
	quantity: Amount,
	effective_basis: Amount,
}

/// Proceeds attribution for a FIFO run.
enum Proceeds<'a> {
	/// Sale at the given per-unit price.
	Sale(&'a Amount),
	/// Internal transfer: each consumed slice is "sold" at its own effective
	/// basis, so realized PnL is zero by construction.
	SourceBasis,
}

/// Apply lot bookkeeping for a transaction inside the committing
/// unit-of-work. Acquisitions are entries of type `ASSET_INCREASE` on crypto
/// wallet accounts, disposals are `ASSET_DECREASE` on the same.
pub async fn process(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	accounts: &HashMap<Uuid, Account>,
) -> Result<(), LedgerError> {
	let is_wallet_entry = |entry: &&Entry, entry_type: EntryType| {
		entry.entry_type == entry_type &&
			entry
				.account_id
				.and_then(|id| accounts.get(&id))
				.is_some_and(|a| a.account_type == AccountType::CryptoWallet)
	};
	let acquisitions: Vec<&Entry> = transaction
		.entries
		.iter()
		.filter(|e| is_wallet_entry(e, EntryType::AssetIncrease))
		.collect();
	let disposals: Vec<&Entry> = transaction
		.entries
		.iter()
		.filter(|e| is_wallet_entry(e, EntryType::AssetDecrease))
		.collect();

	// Internal transfers with one matching disposal/acquisition pair keep
	// their cost basis through the move instead of realizing PnL.
	if transaction.tx_type == TransactionType::InternalTransfer {
		if let ([disposal], [acquisition]) = (disposals.as_slice(), acquisitions.as_slice()) {
			if disposal.asset_id == acquisition.asset_id && disposal.amount == acquisition.amount
			{
				return link_transfer(uow, transaction, disposal, acquisition).await;
			}
		}
		return Err(LedgerError::InvalidDomain(format!(
			"internal transfer {} must move one asset between two wallets",
			transaction.id
		)));
	}

	let touches_clearing = transaction.entries.iter().any(|e| {
		e.account_id
			.and_then(|id| accounts.get(&id))
			.is_some_and(|a| a.account_type == AccountType::Clearing)
	});

	// Lots open before disposals run, per the engine's ordering discipline.
	for acquisition in &acquisitions {
		let cross_asset_disposal =
			disposals.iter().any(|d| d.asset_id != acquisition.asset_id);
		let source = if touches_clearing && cross_asset_disposal {
			CostBasisSource::SwapPrice
		} else {
			CostBasisSource::FmvAtTransfer
		};
		create_acquisition_lot(uow, transaction, acquisition, source).await?;
	}

	for disposal in &disposals {
		let account_id = disposal.account_id.expect("wallet entries are resolved");
		consume_fifo(
			uow,
			transaction,
			account_id,
			&disposal.asset_id,
			&disposal.amount,
			Proceeds::Sale(&disposal.usd_rate),
			DisposalType::Sale,
		)
		.await?;
	}
	Ok(())
}

async fn link_transfer(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	disposal: &Entry,
	acquisition: &Entry,
) -> Result<(), LedgerError> {
	let source_account = disposal.account_id.expect("wallet entries are resolved");
	let consumed = consume_fifo(
		uow,
		transaction,
		source_account,
		&disposal.asset_id,
		&disposal.amount,
		Proceeds::SourceBasis,
		DisposalType::InternalTransfer,
	)
	.await?;

	// One destination lot per consumed source lot, each with the source's
	// effective basis frozen at transfer time.
	for piece in consumed {
		let lot = TaxLot {
			id: Uuid::new_v4(),
			transaction_id: transaction.id,
			account_id: acquisition.account_id.expect("wallet entries are resolved"),
			asset: acquisition.asset_id.clone(),
			quantity_acquired: piece.quantity.clone(),
			quantity_remaining: piece.quantity,
			acquired_at: transaction.occurred_at,
			auto_cost_basis_per_unit: piece.effective_basis,
			auto_cost_basis_source: CostBasisSource::LinkedTransfer,
			override_cost_basis_per_unit: None,
			override_reason: None,
			override_at: None,
			linked_source_lot_id: Some(piece.lot_id),
			created_at: Utc::now(),
		};
		uow.create_lot(&lot).await?;
	}
	Ok(())
}

async fn create_acquisition_lot(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	acquisition: &Entry,
	source: CostBasisSource,
) -> Result<(), LedgerError> {
	let lot = TaxLot {
		id: Uuid::new_v4(),
		transaction_id: transaction.id,
		account_id: acquisition.account_id.expect("wallet entries are resolved"),
		asset: acquisition.asset_id.clone(),
		quantity_acquired: acquisition.amount.clone(),
		quantity_remaining: acquisition.amount.clone(),
		acquired_at: acquisition.occurred_at,
		auto_cost_basis_per_unit: acquisition.usd_rate.clone(),
		auto_cost_basis_source: source,
		override_cost_basis_per_unit: None,
		override_reason: None,
		override_at: None,
		linked_source_lot_id: None,
		created_at: Utc::now(),
	};
	debug!(lot_id = %lot.id, asset = %lot.asset, source = source.as_str(), "opening tax lot");
	uow.create_lot(&lot).await
}

/// Walk open lots oldest-first, consuming until the requested quantity is
/// covered. The caller's unit-of-work holds the row locks, so concurrent
/// disposals of the same `(account, asset)` cannot over-consume.
async fn consume_fifo(
	uow: &mut dyn UnitOfWork,
	transaction: &Transaction,
	account_id: Uuid,
	asset: &str,
	quantity: &Amount,
	proceeds: Proceeds<'_>,
	disposal_type: DisposalType,
) -> Result<Vec<Consumed>, LedgerError> {
	let lots = uow.open_lots_for_update(account_id, asset).await?;
	let mut remaining = quantity.clone();
	let mut consumed = Vec::new();

	for lot in lots {
		if remaining.is_zero() {
			break;
		}
		let take = lot.quantity_remaining.clone().min(remaining.clone());
		let effective_basis = effective_basis_in_uow(uow, &lot).await?;
		let proceeds_per_unit = match proceeds {
			Proceeds::Sale(price) => price.clone(),
			Proceeds::SourceBasis => effective_basis.clone(),
		};
		uow.record_disposal(&LotDisposal {
			id: Uuid::new_v4(),
			transaction_id: transaction.id,
			lot_id: lot.id,
			quantity_disposed: take.clone(),
			proceeds_per_unit,
			disposal_type,
			disposed_at: transaction.occurred_at,
		})
		.await?;
		uow.decrement_lot_remaining(lot.id, &take).await?;
		remaining -= &take;
		consumed.push(Consumed { lot_id: lot.id, quantity: take, effective_basis });
	}

	if !remaining.is_zero() {
		return Err(LedgerError::InsufficientLots {
			requested: quantity.clone(),
			available: quantity.clone() - remaining,
		});
	}
	Ok(consumed)
}

/// Override the cost basis of a lot (or clear it with `None`), appending the
/// audit row. Permitted on fully consumed lots: realized PnL of existing
/// sale disposals is derived on read, so the edit applies retroactively.
pub async fn apply_override(
	uow: &mut dyn UnitOfWork,
	lot_id: Uuid,
	new_cost: Option<Amount>,
	reason: &str,
) -> Result<LotOverrideHistory, LedgerError> {
	let lot = uow.get_lot(lot_id).await?;
	let changed_at = Utc::now();
	uow.set_override(lot_id, new_cost.clone(), reason, changed_at).await?;
	let row = LotOverrideHistory {
		id: Uuid::new_v4(),
		lot_id,
		previous_cost_basis: lot.override_cost_basis_per_unit,
		new_cost_basis: new_cost,
		reason: reason.to_string(),
		changed_at,
	};
	uow.append_override_history(&row).await?;
	Ok(row)
}

/// Effective cost basis on the read side:
/// override, else the linked source lot's override-or-auto, else auto.
/// Linkage depth is capped at one; linked lots snapshot their basis at
/// creation, so deeper chains do not arise.
pub async fn effective_cost_basis(
	store: &dyn Store,
	lot: &TaxLot,
) -> Result<Amount, LedgerError> {
	if let Some(override_basis) = &lot.override_cost_basis_per_unit {
		return Ok(override_basis.clone());
	}
	if let Some(source_id) = lot.linked_source_lot_id {
		let source = store.get_lot(source_id).await?;
		return Ok(source
			.override_cost_basis_per_unit
			.unwrap_or(source.auto_cost_basis_per_unit));
	}
	Ok(lot.auto_cost_basis_per_unit.clone())
}

/// Same resolution against the open unit-of-work (read-your-own-writes).
async fn effective_basis_in_uow(
	uow: &mut dyn UnitOfWork,
	lot: &TaxLot,
) -> Result<Amount, LedgerError> {
	if let Some(override_basis) = &lot.override_cost_basis_per_unit {
		return Ok(override_basis.clone());
	}
	if let Some(source_id) = lot.linked_source_lot_id {
		let source = uow.get_lot(source_id).await?;
		return Ok(source
			.override_cost_basis_per_unit
			.unwrap_or(source.auto_cost_basis_per_unit));
	}
	Ok(lot.auto_cost_basis_per_unit.clone())
}

/// Realized PnL of one disposal given the lot's current effective basis.
/// Internal transfers never realize PnL, whatever the basis says today.
pub fn realized_pnl(disposal: &LotDisposal, effective_basis: &Amount) -> Amount {
	match disposal.disposal_type {
		DisposalType::InternalTransfer => Amount::zero(),
		DisposalType::Sale =>
			(disposal.proceeds_per_unit.clone() - effective_basis) *
				&disposal.quantity_disposed,
	}
}
