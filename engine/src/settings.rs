//! Settings.
//!
//! Layered configuration: the TOML file (default path `config/Default.toml`)
//! is merged with `LEDGER_`-prefixed environment variables, then command-line
//! options override individual fields. Everything is validated before the
//! service boots.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Parser, Clone, Debug, Default)]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path", help = "Path of the settings TOML file")]
	pub config_path: Option<String>,

	#[clap(long = "database-url", help = "PostgreSQL connection URL")]
	pub database_url: Option<String>,

	#[clap(long = "health-check-hostname")]
	pub health_check_hostname: Option<String>,

	#[clap(long = "health-check-port")]
	pub health_check_port: Option<u16>,

	#[clap(long = "log-json", help = "Emit logs as JSON lines")]
	pub log_json: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Database {
	pub url: String,
	#[serde(default = "default_max_connections")]
	pub max_connections: u32,
	#[serde(default = "default_acquire_timeout_ms")]
	pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
	10
}

fn default_acquire_timeout_ms() -> u64 {
	3_000
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LedgerSettings {
	#[serde(default = "default_write_deadline_ms")]
	pub write_deadline_ms: u64,
	#[serde(default = "default_reconcile_interval_secs")]
	pub reconcile_interval_secs: u64,
}

impl Default for LedgerSettings {
	fn default() -> Self {
		Self {
			write_deadline_ms: default_write_deadline_ms(),
			reconcile_interval_secs: default_reconcile_interval_secs(),
		}
	}
}

fn default_write_deadline_ms() -> u64 {
	crate::constants::DEFAULT_WRITE_DEADLINE.as_millis() as u64
}

fn default_reconcile_interval_secs() -> u64 {
	crate::constants::DEFAULT_RECONCILE_INTERVAL.as_secs()
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct Logging {
	#[serde(default)]
	pub json: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
	pub database: Database,
	#[serde(default)]
	pub ledger: LedgerSettings,
	#[serde(default)]
	pub health_check: Option<HealthCheck>,
	#[serde(default)]
	pub logging: Logging,
}

impl Settings {
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let file = opts.config_path.clone().unwrap_or_else(|| "config/Default.toml".to_string());
		let mut settings = Self::from_file_and_env(&file)?;

		if let Some(url) = opts.database_url {
			settings.database.url = url;
		}
		if let Some(hostname) = opts.health_check_hostname {
			let port = settings.health_check.as_ref().map(|hc| hc.port).unwrap_or(0);
			settings.health_check = Some(HealthCheck { hostname, port });
		}
		if let Some(port) = opts.health_check_port {
			if let Some(health_check) = settings.health_check.as_mut() {
				health_check.port = port;
			}
		}
		if opts.log_json {
			settings.logging.json = true;
		}

		settings.validate_settings()?;
		Ok(settings)
	}

	fn from_file_and_env(file: &str) -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(File::with_name(file).required(false))
			.add_source(Environment::with_prefix("LEDGER").separator("__"))
			.build()?
			.try_deserialize()
	}

	pub fn validate_settings(&self) -> Result<(), ConfigError> {
		if self.database.url.is_empty() {
			return Err(ConfigError::Message("database.url must be set".to_string()));
		}
		if !self.database.url.starts_with("postgres://") &&
			!self.database.url.starts_with("postgresql://")
		{
			return Err(ConfigError::Message(format!(
				"database.url must be a postgres URL, got `{}`",
				self.database.url
			)));
		}
		if self.database.max_connections == 0 {
			return Err(ConfigError::Message(
				"database.max_connections must be at least 1".to_string(),
			));
		}
		if self.ledger.write_deadline_ms == 0 {
			return Err(ConfigError::Message(
				"ledger.write_deadline_ms must be positive".to_string(),
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_settings() -> Settings {
		Settings {
			database: Database {
				url: "postgres://localhost:5432/ledger".into(),
				max_connections: default_max_connections(),
				acquire_timeout_ms: default_acquire_timeout_ms(),
			},
			ledger: LedgerSettings::default(),
			health_check: None,
			logging: Logging::default(),
		}
	}

	#[test]
	fn valid_settings_pass() {
		assert!(base_settings().validate_settings().is_ok());
	}

	#[test]
	fn non_postgres_url_is_rejected() {
		let mut settings = base_settings();
		settings.database.url = "mysql://localhost/ledger".into();
		assert!(settings.validate_settings().is_err());
	}

	#[test]
	fn zero_write_deadline_is_rejected() {
		let mut settings = base_settings();
		settings.ledger.write_deadline_ms = 0;
		assert!(settings.validate_settings().is_err());
	}
}
