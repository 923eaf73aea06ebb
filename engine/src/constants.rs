use std::time::Duration;

/// Fixed-point scale for USD values. Every USD figure in the system is an
/// integer number of 10^-8 dollars.
pub const USD_DECIMALS: u32 = 8;

/// Upper bound on the time a single write transaction may spend between
/// handler dispatch and commit. Overridable through settings.
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Default period of the background reconciliation sweep.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

// ==== Entry metadata keys ====
// Handlers leave account resolution hints under these keys; the resolver is
// the only consumer.
pub const ACCOUNT_CODE_KEY: &str = "account_code";
pub const ACCOUNT_TYPE_KEY: &str = "account_type";
pub const WALLET_ID_KEY: &str = "wallet_id";
pub const CHAIN_ID_KEY: &str = "chain_id";

// ==== Account code prefixes ====
pub const WALLET_CODE_PREFIX: &str = "wallet.";
pub const INCOME_CODE_PREFIX: &str = "income.";
pub const EXPENSE_CODE_PREFIX: &str = "expense.";
pub const GAS_CODE_PREFIX: &str = "gas.";
pub const CLEARING_CODE_PREFIX: &str = "clearing.";
