use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::LedgerError, money::Amount};

/// How a lot's automatic cost basis was determined at acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostBasisSource {
	/// The acquiring transaction also disposed of a different asset through
	/// a clearing account; the price comes from the swap itself.
	SwapPrice,
	/// Fair market value at the time of an inbound transfer.
	FmvAtTransfer,
	/// Basis carried over from the consumed source lot of an internal
	/// transfer.
	LinkedTransfer,
}

impl CostBasisSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			CostBasisSource::SwapPrice => "SWAP_PRICE",
			CostBasisSource::FmvAtTransfer => "FMV_AT_TRANSFER",
			CostBasisSource::LinkedTransfer => "LINKED_TRANSFER",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"SWAP_PRICE" => Ok(CostBasisSource::SwapPrice),
			"FMV_AT_TRANSFER" => Ok(CostBasisSource::FmvAtTransfer),
			"LINKED_TRANSFER" => Ok(CostBasisSource::LinkedTransfer),
			other => {
				Err(LedgerError::InvalidInput(format!("unknown cost basis source `{other}`")))
			},
		}
	}
}

/// Acquisition record. `quantity_remaining` is the only mutable numeric
/// field; the `auto_cost_basis_*` pair is frozen at creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaxLot {
	pub id: Uuid,
	pub transaction_id: Uuid,
	pub account_id: Uuid,
	pub asset: String,
	pub quantity_acquired: Amount,
	pub quantity_remaining: Amount,
	pub acquired_at: DateTime<Utc>,
	/// USD per whole unit, scaled by 10^8. Never mutated.
	pub auto_cost_basis_per_unit: Amount,
	pub auto_cost_basis_source: CostBasisSource,
	pub override_cost_basis_per_unit: Option<Amount>,
	pub override_reason: Option<String>,
	pub override_at: Option<DateTime<Utc>>,
	/// Set on lots created by an internal transfer; points at the consumed
	/// source lot. Linkage depth is capped at one.
	pub linked_source_lot_id: Option<Uuid>,
	pub created_at: DateTime<Utc>,
}

impl TaxLot {
	pub fn validate(&self) -> Result<(), LedgerError> {
		if !self.quantity_acquired.is_positive() {
			return Err(LedgerError::InvalidDomain(format!(
				"lot {} acquired non-positive quantity {}",
				self.id, self.quantity_acquired
			)));
		}
		if self.quantity_remaining.is_negative() ||
			self.quantity_remaining > self.quantity_acquired
		{
			return Err(LedgerError::InvalidDomain(format!(
				"lot {} remaining {} outside [0, {}]",
				self.id, self.quantity_remaining, self.quantity_acquired
			)));
		}
		Ok(())
	}

	pub fn is_open(&self) -> bool {
		self.quantity_remaining.is_positive()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposalType {
	Sale,
	InternalTransfer,
}

impl DisposalType {
	pub fn as_str(&self) -> &'static str {
		match self {
			DisposalType::Sale => "sale",
			DisposalType::InternalTransfer => "internal_transfer",
		}
	}

	pub fn parse(s: &str) -> Result<Self, LedgerError> {
		match s {
			"sale" => Ok(DisposalType::Sale),
			"internal_transfer" => Ok(DisposalType::InternalTransfer),
			other => Err(LedgerError::InvalidInput(format!("unknown disposal type `{other}`"))),
		}
	}
}

/// One FIFO consumption of a lot. Realized PnL is not stored; it is derived
/// on read from the proceeds and the lot's effective cost basis at that
/// moment, which is what makes overrides retroactive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LotDisposal {
	pub id: Uuid,
	pub transaction_id: Uuid,
	pub lot_id: Uuid,
	pub quantity_disposed: Amount,
	/// USD per whole unit, scaled by 10^8. For internal transfers this is
	/// the source lot's effective basis, pinning the realized PnL to zero.
	pub proceeds_per_unit: Amount,
	pub disposal_type: DisposalType,
	pub disposed_at: DateTime<Utc>,
}

impl LotDisposal {
	pub fn validate(&self) -> Result<(), LedgerError> {
		if !self.quantity_disposed.is_positive() {
			return Err(LedgerError::InvalidDomain(format!(
				"disposal {} has non-positive quantity {}",
				self.id, self.quantity_disposed
			)));
		}
		Ok(())
	}
}

/// Append-only audit row written alongside every override edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LotOverrideHistory {
	pub id: Uuid,
	pub lot_id: Uuid,
	pub previous_cost_basis: Option<Amount>,
	pub new_cost_basis: Option<Amount>,
	pub reason: String,
	pub changed_at: DateTime<Utc>,
}
