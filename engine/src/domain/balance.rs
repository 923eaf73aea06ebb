use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Amount;

/// Denormalized per-(account, asset) balance row, kept equal to the signed
/// sum of entries by the committer. Mutated only under a row-level lock
/// inside a unit-of-work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
	pub account_id: Uuid,
	pub asset_id: String,
	pub balance: Amount,
	pub usd_value: Amount,
	pub last_updated: DateTime<Utc>,
}

impl AccountBalance {
	/// The synthesized row handed out when no balance has been written yet.
	pub fn zero(account_id: Uuid, asset_id: &str) -> Self {
		Self {
			account_id,
			asset_id: asset_id.to_string(),
			balance: Amount::zero(),
			usd_value: Amount::zero(),
			last_updated: Utc::now(),
		}
	}
}
