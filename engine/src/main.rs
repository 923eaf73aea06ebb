use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use ledger_engine::{
	handlers,
	health::HealthMonitor,
	logging,
	service::Ledger,
	settings::{CommandLineOptions, Settings},
	store::postgres::PgStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CommandLineOptions::parse();
	let settings = Settings::new(opts).context("Failed to load settings")?;
	logging::init(settings.logging.json);

	let store = PgStore::connect(&settings.database)
		.await
		.context("Failed to connect to the database")?;
	store.init_schema().await.context("Failed to initialize the ledger schema")?;

	let registry =
		handlers::default_registry().map_err(|e| anyhow::anyhow!("handler registry: {e}"))?;
	let ledger = Ledger::new(Arc::new(store), Arc::new(registry))
		.with_write_deadline(Duration::from_millis(settings.ledger.write_deadline_ms));

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			tokio::signal::ctrl_c().await.ok();
			info!("shutdown requested");
			cancel.cancel();
		}
	});

	if let Some(health_check) = &settings.health_check {
		let monitor = HealthMonitor::new(health_check)
			.await
			.context("Failed to start the health monitor")?;
		tokio::spawn(monitor.run(cancel.child_token()));
	}

	info!(
		interval_secs = settings.ledger.reconcile_interval_secs,
		"ledger engine started, running reconciliation sweeps"
	);
	let interval = Duration::from_secs(settings.ledger.reconcile_interval_secs);
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = tokio::time::sleep(interval) => {
				if let Err(e) = ledger.reconcile_all().await {
					error!(error = %e, "reconciliation sweep failed");
				}
			},
		}
	}

	info!("ledger engine stopped");
	Ok(())
}
