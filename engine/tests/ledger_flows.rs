//! End-to-end flows through the full record pipeline against the in-memory
//! store: handler dispatch, account resolution, validation, commit, tax-lot
//! bookkeeping and the read APIs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ledger_engine::{
	domain::{CostBasisSource, DisposalType, TransactionStatus},
	errors::LedgerError,
	handlers,
	money::{usd, Amount},
	service::{Ledger, RecordTransaction},
	store::{memory::MemoryStore, DisposalFilter},
};

fn ledger() -> Ledger {
	Ledger::new(
		Arc::new(MemoryStore::new()),
		Arc::new(handlers::default_registry().unwrap()),
	)
}

fn cancel() -> CancellationToken {
	CancellationToken::new()
}

fn minutes_ago(minutes: i64) -> DateTime<Utc> {
	Utc::now() - Duration::minutes(minutes)
}

fn income(
	wallet_id: Uuid,
	asset: &str,
	amount: &str,
	rate: Amount,
	decimals: u32,
	occurred_at: DateTime<Utc>,
) -> RecordTransaction {
	RecordTransaction {
		tx_type: "manual_income".into(),
		source: "manual".into(),
		external_id: None,
		occurred_at,
		raw_data: serde_json::json!({
			"wallet_id": wallet_id,
			"asset_id": asset,
			"amount": amount,
			"occurred_at": occurred_at,
			"decimals": decimals,
			"usd_rate": rate.to_string(),
		}),
	}
}

fn outcome(
	wallet_id: Uuid,
	asset: &str,
	amount: &str,
	rate: Amount,
	decimals: u32,
	occurred_at: DateTime<Utc>,
) -> RecordTransaction {
	RecordTransaction {
		tx_type: "manual_outcome".into(),
		source: "manual".into(),
		external_id: None,
		occurred_at,
		raw_data: serde_json::json!({
			"wallet_id": wallet_id,
			"asset_id": asset,
			"amount": amount,
			"occurred_at": occurred_at,
			"decimals": decimals,
			"usd_rate": rate.to_string(),
		}),
	}
}

#[tokio::test]
async fn income_updates_balance_and_opens_a_lot() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();

	let recorded = ledger
		.record_transaction(
			income(wallet, "BTC", "100000000", usd(50_000), 8, minutes_ago(5)),
			&cancel(),
		)
		.await
		.unwrap();
	assert_eq!(recorded.status, TransactionStatus::Completed);

	assert_eq!(
		ledger.wallet_balance(wallet, "BTC").await.unwrap(),
		Amount::from(100_000_000i64)
	);

	let lots = ledger.list_lots(wallet, "BTC").await.unwrap();
	assert_eq!(lots.len(), 1);
	assert_eq!(lots[0].quantity_acquired, Amount::from(100_000_000i64));
	assert_eq!(lots[0].quantity_remaining, Amount::from(100_000_000i64));
	assert_eq!(lots[0].auto_cost_basis_per_unit, usd(50_000));
	assert_eq!(lots[0].auto_cost_basis_source, CostBasisSource::FmvAtTransfer);

	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn outcome_consumes_lots_fifo_and_realizes_pnl() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();

	ledger
		.record_transaction(income(wallet, "BTC", "100", usd(40), 0, minutes_ago(30)), &cancel())
		.await
		.unwrap();
	ledger
		.record_transaction(income(wallet, "BTC", "100", usd(60), 0, minutes_ago(20)), &cancel())
		.await
		.unwrap();
	ledger
		.record_transaction(outcome(wallet, "BTC", "150", usd(80), 0, minutes_ago(10)), &cancel())
		.await
		.unwrap();

	assert_eq!(ledger.wallet_balance(wallet, "BTC").await.unwrap(), Amount::from(50i64));

	// The older lot is fully consumed before the newer one is touched.
	let lots = ledger.list_lots(wallet, "BTC").await.unwrap();
	assert_eq!(lots.len(), 2);
	assert!(lots[0].quantity_remaining.is_zero());
	assert_eq!(lots[1].quantity_remaining, Amount::from(50i64));

	let reports = ledger.realized_pnl(&DisposalFilter::default()).await.unwrap();
	assert_eq!(reports.len(), 2);
	assert_eq!(reports[0].disposal.quantity_disposed, Amount::from(100i64));
	assert_eq!(reports[0].realized_pnl, usd(4_000)); // (80-40) * 100
	assert_eq!(reports[1].disposal.quantity_disposed, Amount::from(50i64));
	assert_eq!(reports[1].realized_pnl, usd(1_000)); // (80-60) * 50

	let total =
		reports.iter().fold(Amount::zero(), |acc, r| acc + r.realized_pnl.clone());
	assert_eq!(total, usd(5_000));

	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn overdraw_is_rejected_without_partial_writes() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();

	ledger
		.record_transaction(
			income(wallet, "BTC", "10000000000", usd(50_000), 8, minutes_ago(10)),
			&cancel(),
		)
		.await
		.unwrap();

	let failure = ledger
		.record_transaction(
			outcome(wallet, "BTC", "20000000000", usd(50_000), 8, minutes_ago(5)),
			&cancel(),
		)
		.await
		.unwrap_err();
	assert!(matches!(failure.error, LedgerError::NegativeBalance { .. }));
	let failed = failure.failed.unwrap();
	assert_eq!(failed.status, TransactionStatus::Failed);

	// Balance untouched, only the income transaction persisted.
	assert_eq!(
		ledger.wallet_balance(wallet, "BTC").await.unwrap(),
		Amount::from(10_000_000_000i64)
	);
	assert_eq!(
		ledger.list_transactions(&Default::default()).await.unwrap().len(),
		1
	);
	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_source_external_id_is_idempotent() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();
	let request = RecordTransaction {
		tx_type: "transfer_in".into(),
		source: "zerion".into(),
		external_id: Some("zerion_abc".into()),
		occurred_at: minutes_ago(5),
		raw_data: serde_json::json!({
			"wallet_id": wallet,
			"asset_id": "ETH",
			"amount": "1000",
			"occurred_at": minutes_ago(5),
			"decimals": 0,
			"usd_rate": usd(3_000).to_string(),
		}),
	};

	let first = ledger.record_transaction(request.clone(), &cancel()).await.unwrap();
	let failure = ledger.record_transaction(request, &cancel()).await.unwrap_err();
	assert!(matches!(failure.error, LedgerError::Conflict(_)));

	// Only the first call persisted anything.
	let found = ledger
		.store()
		.find_by_source("zerion", "zerion_abc")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(found.id, first.id);
	assert_eq!(ledger.wallet_balance(wallet, "ETH").await.unwrap(), Amount::from(1000i64));
	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_commit_rolls_back_resolved_accounts() {
	let ledger = ledger();
	let wallet_a = Uuid::new_v4();
	let wallet_b = Uuid::new_v4();

	let request = |wallet: Uuid| RecordTransaction {
		tx_type: "transfer_in".into(),
		source: "zerion".into(),
		external_id: Some("zerion_dup".into()),
		occurred_at: minutes_ago(5),
		raw_data: serde_json::json!({
			"wallet_id": wallet,
			"asset_id": "ETH",
			"amount": "1000",
			"occurred_at": minutes_ago(5),
			"decimals": 0,
			"usd_rate": usd(3_000).to_string(),
		}),
	};

	ledger.record_transaction(request(wallet_a), &cancel()).await.unwrap();

	// The second call passes handler validation and resolves wallet B's
	// accounts inside the unit-of-work, then hits the idempotency conflict.
	// The rollback must take those accounts with it.
	let failure = ledger.record_transaction(request(wallet_b), &cancel()).await.unwrap_err();
	assert!(matches!(failure.error, LedgerError::Conflict(_)));

	assert!(ledger.store().find_accounts_by_wallet(wallet_b).await.unwrap().is_empty());
	assert!(ledger
		.store()
		.get_account_by_code(&format!("wallet.{wallet_b}.ETH"))
		.await
		.unwrap()
		.is_none());
	assert_eq!(ledger.wallet_balance(wallet_b, "ETH").await.unwrap(), Amount::zero());
	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn internal_transfer_links_lots_and_realizes_nothing() {
	let ledger = ledger();
	let wallet_a = Uuid::new_v4();
	let wallet_b = Uuid::new_v4();

	ledger
		.record_transaction(income(wallet_a, "ETH", "1000", usd(50), 0, minutes_ago(60)), &cancel())
		.await
		.unwrap();

	ledger
		.record_transaction(
			RecordTransaction {
				tx_type: "internal_transfer".into(),
				source: "manual".into(),
				external_id: None,
				occurred_at: minutes_ago(10),
				raw_data: serde_json::json!({
					"from_wallet_id": wallet_a,
					"to_wallet_id": wallet_b,
					"asset_id": "ETH",
					"amount": "400",
					"occurred_at": minutes_ago(10),
					"decimals": 0,
					"usd_rate": usd(80).to_string(),
				}),
			},
			&cancel(),
		)
		.await
		.unwrap();

	assert_eq!(ledger.wallet_balance(wallet_a, "ETH").await.unwrap(), Amount::from(600i64));
	assert_eq!(ledger.wallet_balance(wallet_b, "ETH").await.unwrap(), Amount::from(400i64));

	let source_lots = ledger.list_lots(wallet_a, "ETH").await.unwrap();
	assert_eq!(source_lots.len(), 1);
	assert_eq!(source_lots[0].quantity_remaining, Amount::from(600i64));

	let destination_lots = ledger.list_lots(wallet_b, "ETH").await.unwrap();
	assert_eq!(destination_lots.len(), 1);
	assert_eq!(destination_lots[0].quantity_acquired, Amount::from(400i64));
	assert_eq!(destination_lots[0].auto_cost_basis_per_unit, usd(50));
	assert_eq!(
		destination_lots[0].auto_cost_basis_source,
		CostBasisSource::LinkedTransfer
	);
	assert_eq!(destination_lots[0].linked_source_lot_id, Some(source_lots[0].id));

	// The disposal moved at the source's basis: zero PnL, whatever happens
	// to the basis later.
	let reports = ledger.realized_pnl(&DisposalFilter::default()).await.unwrap();
	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].disposal.disposal_type, DisposalType::InternalTransfer);
	assert_eq!(reports[0].disposal.proceeds_per_unit, usd(50));
	assert!(reports[0].realized_pnl.is_zero());

	ledger.set_lot_override(source_lots[0].id, Some(usd(70)), "audit").await.unwrap();
	let reports = ledger.realized_pnl(&DisposalFilter::default()).await.unwrap();
	assert!(reports[0].realized_pnl.is_zero());

	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn override_rewrites_history_and_pnl_retroactively() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();

	ledger
		.record_transaction(income(wallet, "BTC", "100", usd(40), 0, minutes_ago(60)), &cancel())
		.await
		.unwrap();
	ledger
		.record_transaction(outcome(wallet, "BTC", "100", usd(70), 0, minutes_ago(30)), &cancel())
		.await
		.unwrap();

	let reports = ledger.realized_pnl(&DisposalFilter::default()).await.unwrap();
	assert_eq!(reports[0].realized_pnl, usd(3_000));

	let lot = ledger.list_lots(wallet, "BTC").await.unwrap().remove(0);
	assert!(lot.quantity_remaining.is_zero());

	ledger.set_lot_override(lot.id, Some(usd(50)), "corrected").await.unwrap();

	let reports = ledger.realized_pnl(&DisposalFilter::default()).await.unwrap();
	assert_eq!(reports[0].realized_pnl, usd(2_000));

	let history = ledger.override_history(lot.id).await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].previous_cost_basis, None);
	assert_eq!(history[0].new_cost_basis, Some(usd(50)));
	assert_eq!(history[0].reason, "corrected");
}

#[tokio::test]
async fn swap_books_both_legs_and_prices_the_bought_lot() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();

	ledger
		.record_transaction(income(wallet, "USDT", "50000", usd(1), 0, minutes_ago(60)), &cancel())
		.await
		.unwrap();

	ledger
		.record_transaction(
			RecordTransaction {
				tx_type: "swap".into(),
				source: "manual".into(),
				external_id: None,
				occurred_at: minutes_ago(10),
				raw_data: serde_json::json!({
					"wallet_id": wallet,
					"sold_asset_id": "USDT",
					"sold_amount": "50000",
					"sold_decimals": 0,
					"bought_asset_id": "BTC",
					"bought_amount": "1",
					"bought_decimals": 0,
					"occurred_at": minutes_ago(10),
					"sold_usd_rate": usd(1).to_string(),
					"bought_usd_rate": usd(50_000).to_string(),
				}),
			},
			&cancel(),
		)
		.await
		.unwrap();

	assert_eq!(ledger.wallet_balance(wallet, "USDT").await.unwrap(), Amount::zero());
	assert_eq!(ledger.wallet_balance(wallet, "BTC").await.unwrap(), Amount::from(1i64));

	// The bought lot is priced by the swap itself.
	let lots = ledger.list_lots(wallet, "BTC").await.unwrap();
	assert_eq!(lots.len(), 1);
	assert_eq!(lots[0].auto_cost_basis_source, CostBasisSource::SwapPrice);
	assert_eq!(lots[0].auto_cost_basis_per_unit, usd(50_000));

	// The sold side was disposed as a sale at its rate.
	let reports = ledger.realized_pnl(&DisposalFilter::default()).await.unwrap();
	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].disposal.disposal_type, DisposalType::Sale);
	assert!(reports[0].realized_pnl.is_zero()); // bought at $1, sold at $1

	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn precision_survives_beyond_128_bits() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();
	let huge = format!("1{}", "0".repeat(38));

	ledger
		.record_transaction(
			income(wallet, "ETH", &huge, Amount::zero(), 18, minutes_ago(5)),
			&cancel(),
		)
		.await
		.unwrap();

	let balance = ledger.wallet_balance(wallet, "ETH").await.unwrap();
	assert_eq!(balance.to_string(), huge);
	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_overdraws_cannot_both_commit() {
	let ledger = Arc::new(ledger());
	let wallet = Uuid::new_v4();

	ledger
		.record_transaction(income(wallet, "BTC", "100", usd(50), 0, minutes_ago(30)), &cancel())
		.await
		.unwrap();

	// Two disposals of 60 against a balance of 100: the committer's locked
	// re-check must reject exactly one, even if both pass the advisory
	// validation.
	let mut handles = Vec::new();
	for _ in 0..2 {
		let ledger = ledger.clone();
		handles.push(tokio::spawn(async move {
			ledger
				.record_transaction(
					outcome(wallet, "BTC", "60", usd(50), 0, minutes_ago(5)),
					&cancel(),
				)
				.await
		}));
	}
	let outcomes: Vec<_> =
		futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

	let committed = outcomes.iter().filter(|r| r.is_ok()).count();
	assert_eq!(committed, 1, "exactly one of the two overdraws must commit");

	assert_eq!(ledger.wallet_balance(wallet, "BTC").await.unwrap(), Amount::from(40i64));
	assert_eq!(ledger.reconcile_all().await.unwrap(), 0);
}

#[tokio::test]
async fn completed_transactions_always_balance() {
	let ledger = ledger();
	let wallet = Uuid::new_v4();

	ledger
		.record_transaction(income(wallet, "BTC", "500", usd(100), 0, minutes_ago(30)), &cancel())
		.await
		.unwrap();
	ledger
		.record_transaction(outcome(wallet, "BTC", "200", usd(120), 0, minutes_ago(20)), &cancel())
		.await
		.unwrap();

	for tx in ledger.list_transactions(&Default::default()).await.unwrap() {
		assert_eq!(tx.status, TransactionStatus::Completed);
		tx.verify_balance().unwrap();
		for entry in &tx.entries {
			assert!(!entry.amount.is_negative());
			entry.validate().unwrap();
		}
	}
}
