// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use {
	crate::{
		apm::Listeners,
		common::{ClientOptions, HostAddress},
		connection::ConnectionEstablisher,
		description::{ServerDescription, TopologyVersion},
		error::{Error, Result},
		monitor::{Monitor, MonitorHandle},
		pool::{ConnectionPool, PooledConnection},
		topology::WeakTopology
	},
	std::{sync::Arc, time::Duration},
	bson::Document
};

#[derive(Debug)]
pub struct ServerInner {
	pub address: HostAddress,
	pool:        ConnectionPool,
	monitor:     Option<MonitorHandle>,
	topology:    WeakTopology
}

/// A single server of the deployment, its connection pool and its monitor.
#[derive(Debug, Clone)]
pub struct Server(Arc<ServerInner>);

impl std::ops::Deref for Server {
	type Target = ServerInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Server {
	pub(crate) fn new(
		address:     HostAddress,
		options:     &ClientOptions,
		establisher: Arc<ConnectionEstablisher>,
		listeners:   Arc<Listeners>,
		topology:    WeakTopology
	) -> Self {
		Self(Arc::new_cyclic(|server| {
			let server = server.clone();
			let pool = ConnectionPool::new(
				address.clone(),
				options.pool_options,
				establisher.clone(),
				listeners.clone(),
				Arc::new(move |error: &Error, generation| if let Some(server) = server.upgrade() {
					Server(server).handle_application_error(error, generation, false);
				})
			);

			// load balancers are not monitored
			let monitor = (!options.load_balanced).then(|| Monitor::start(
				address.clone(),
				establisher,
				topology.clone(),
				pool.clone(),
				listeners,
				options.server_selection,
				options.server_monitoring_mode
			));

			ServerInner { address, pool, monitor, topology }
		}))
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	/// The current description of this server, `None` once it was removed from the topology.
	pub fn description(&self) -> Option<ServerDescription> {
		self.topology.upgrade()?.description().server(&self.address).cloned()
	}

	pub async fn check_out(&self, timeout: Option<Duration>) -> Result<PooledConnection> {
		self.pool.check_out(timeout).await
	}

	/// Runs a command on a pooled connection, applying the SDAM error handling rules on failure.
	pub async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
		let mut connection = self.check_out(None).await?;
		let generation = connection.generation();

		connection.command(db, command).await.map_err(|e| {
			self.handle_application_error(&e, generation, true);
			e
		})
	}

	pub fn request_check(&self) {
		if let Some(monitor) = &self.monitor {
			monitor.request_check();
		}
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#error-handling
	pub(crate) fn handle_application_error(&self, error: &Error, generation: u32, handshake_completed: bool) {
		if generation < self.pool.generation() || self.monitor.is_none() {
			return;
		}

		if error.is_network_error() {
			if !error.is_network_timeout() || !handshake_completed {
				tracing::debug!(address = %self.address, %error, "marking server unknown after network error");
				self.mark_unknown(error.clone());
				self.pool.clear(false);
				if let Some(monitor) = &self.monitor {
					monitor.reset();
				}
			}
		} else if error.is_state_change_error() {
			let current = self.description().and_then(|d| d.topology_version);
			if TopologyVersion::is_stale(error.topology_version(), current.as_ref()) {
				return;
			}

			tracing::debug!(address = %self.address, %error, "marking server unknown after state change error");
			self.mark_unknown(error.clone());

			// legacy errors carry no code and leave the pool alone
			if error.code().is_some() {
				self.pool.clear(false);
			}
			self.request_check();
		} else if !handshake_completed {
			self.mark_unknown(error.clone());
			self.pool.clear(false);
		}
	}

	fn mark_unknown(&self, error: Error) {
		if let Some(topology) = self.topology.upgrade() {
			topology.apply_server_description(ServerDescription::from_error(self.address.clone(), error));
		}
	}

	pub(crate) fn close(&self) {
		if let Some(monitor) = &self.monitor {
			monitor.close();
		}
		self.pool.close();
	}
}
