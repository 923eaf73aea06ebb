//! Health monitor.
//!
//! Answers HTTP 200 to any request on `{hostname}:{port}/health` so external
//! probes can tell the service is up. Construction and running are split so
//! callers (and tests) know the listener is bound before proceeding.

use anyhow::Context;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::settings;

pub struct HealthMonitor {
	listener: TcpListener,
}

impl HealthMonitor {
	pub async fn new(health_check: &settings::HealthCheck) -> anyhow::Result<Self> {
		let bind_address = format!("{}:{}", health_check.hostname, health_check.port);
		info!(%bind_address, "starting health monitor");
		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
		self.listener.local_addr().context("Could not read health listener address")
	}

	pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
		loop {
			let accepted = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				accepted = self.listener.accept() => accepted,
			};
			match accepted {
				Ok((mut stream, _address)) => {
					let mut buffer = [0; 1024];
					stream
						.read(&mut buffer)
						.await
						.context("Couldn't read stream into buffer")?;

					let mut headers = [httparse::EMPTY_HEADER; 16];
					let mut request = httparse::Request::new(&mut headers);
					match request.parse(&buffer) {
						Ok(_) =>
							if request.path == Some("/health") {
								stream
									.write_all(b"HTTP/1.1 200 OK\r\n\r\n")
									.await
									.context("Could not write to health check stream")?;
								stream
									.flush()
									.await
									.context("Could not flush health check TCP stream")?;
							} else {
								warn!(path = ?request.path, "health request at invalid path");
							},
						Err(error) => {
							warn!(%error, "could not parse health check request");
						},
					}
				},
				Err(error) => {
					warn!(%error, "could not open health check TCP stream");
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::net::TcpStream;

	use super::*;

	async fn request(address: std::net::SocketAddr, path: &str) -> String {
		let mut stream = TcpStream::connect(address).await.unwrap();
		stream
			.write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
			.await
			.unwrap();
		let mut response = vec![0u8; 64];
		let n = tokio::time::timeout(
			std::time::Duration::from_secs(1),
			stream.read(&mut response),
		)
		.await
		.map(|r| r.unwrap())
		.unwrap_or(0);
		String::from_utf8_lossy(&response[..n]).to_string()
	}

	#[tokio::test]
	async fn answers_200_on_health_path() {
		let monitor = HealthMonitor::new(&settings::HealthCheck {
			hostname: "127.0.0.1".into(),
			port: 0,
		})
		.await
		.unwrap();
		let address = monitor.local_addr().unwrap();
		let cancel = CancellationToken::new();
		tokio::spawn(monitor.run(cancel.clone()));

		let response = request(address, "/health").await;
		assert!(response.starts_with("HTTP/1.1 200 OK"));

		// Unknown paths get no response body, just a dropped connection.
		let response = request(address, "/unknown").await;
		assert!(response.is_empty());

		cancel.cancel();
	}
}
