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
		apm::{Event, Listeners},
		common::{ClientOptions, HostAddress},
		connection::ConnectionEstablisher,
		description::{ServerDescription, TopologyDescription, TopologyType},
		error::{Error, Result, SelectionFailure},
		selection::Selector,
		server::Server,
		session::ServerSessionPool,
		srv
	},
	std::{
		collections::HashMap,
		sync::{Arc, Mutex, RwLock, Weak, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant}
	},
	async_std::{channel::{self, Sender}, task}
};

#[derive(Debug)]
pub struct TopologyInner {
	options:     ClientOptions,
	listeners:   Arc<Listeners>,
	establisher: Arc<ConnectionEstablisher>,
	description: RwLock<Arc<TopologyDescription>>,
	servers:     RwLock<HashMap<HostAddress, Server>>,
	/// serializes description updates
	update_lock: Mutex<()>,
	/// closed on every description change to wake up pending selections
	waiters:     Mutex<Vec<Sender<()>>>,
	sessions:    ServerSessionPool,
	srv_poller:  Mutex<Option<task::JoinHandle<()>>>,
	closed:      AtomicBool
}

/// The deployment as seen by a client: the current description and one `Server` per known address.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst
#[derive(Debug, Clone)]
pub struct Topology(Arc<TopologyInner>);

impl std::ops::Deref for Topology {
	type Target = TopologyInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

/// Held by monitors, pools and pollers so they never keep the topology alive.
#[derive(Debug, Clone)]
pub(crate) struct WeakTopology(Weak<TopologyInner>);

impl WeakTopology {
	pub fn upgrade(&self) -> Option<Topology> {
		self.0.upgrade().map(Topology)
	}
}

impl Topology {
	/// Opens the topology on the given seed list, monitors start right away.
	pub(crate) fn new(options: ClientOptions, listeners: Arc<Listeners>, seeds: Vec<HostAddress>, srv_ttl: Option<Duration>) -> Self {
		let description = TopologyDescription::new(&options, &seeds);
		let topology = Self(Arc::new(TopologyInner {
			establisher: Arc::new(ConnectionEstablisher::new(&options)),
			listeners,
			description: RwLock::new(Arc::new(TopologyDescription::new(&options, &[]))),
			servers:     RwLock::new(HashMap::new()),
			update_lock: Mutex::new(()),
			waiters:     Mutex::new(Vec::new()),
			sessions:    ServerSessionPool::default(),
			srv_poller:  Mutex::new(None),
			closed:      AtomicBool::new(false),
			options
		}));

		tracing::debug!(topology_type = ?description.r#type, seeds = seeds.len(), "opening topology");
		topology.listeners.dispatch(Event::TopologyOpening);

		match topology.update_lock.lock() {
			Ok(_guard) => topology.publish(topology.description(), Arc::new(description)),
			Err(_) => tracing::error!("topology update lock poisoned")
		}

		if let (Some(srv_host), Some(resolver)) = (&topology.options.srv_host, &topology.options.srv_resolver) {
			let poller = srv::start_poller(topology.downgrade(), resolver.0.clone(), srv_host.clone(),
				&topology.options, srv_ttl);
			if let Ok(mut srv_poller) = topology.srv_poller.lock() {
				*srv_poller = Some(poller);
			}
		}

		topology
	}

	pub(crate) fn downgrade(&self) -> WeakTopology {
		WeakTopology(Arc::downgrade(&self.0))
	}

	pub fn options(&self) -> &ClientOptions {
		&self.options
	}

	pub fn listeners(&self) -> &Arc<Listeners> {
		&self.listeners
	}

	pub fn sessions(&self) -> &ServerSessionPool {
		&self.sessions
	}

	/// A snapshot of the current description.
	pub fn description(&self) -> Arc<TopologyDescription> {
		match self.0.description.read() {
			Ok(description) => description.clone(),
			Err(e) => e.into_inner().clone()
		}
	}

	pub fn server(&self, address: &HostAddress) -> Option<Server> {
		self.servers.read().ok()?.get(address).cloned()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Waits until a server matching `selector` is available, `timeout` defaults to
	/// `serverSelectionTimeoutMS`.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst#server-selection-algorithm
	pub async fn select_server(&self, selector: &Selector, timeout: Option<Duration>) -> Result<Server> {
		let timeout = timeout.unwrap_or(self.options.server_selection.server_selection_timeout);
		let local_threshold = self.options.server_selection.local_threshold;
		let start = Instant::now();
		let mut checks_requested = false;

		loop {
			if self.is_closed() {
				return Err(Error::TopologyClosed);
			}

			// registered before reading the description so no change is missed
			let (sender, receiver) = channel::bounded::<()>(1);
			if let Ok(mut waiters) = self.waiters.lock() {
				waiters.retain(|waiter| !waiter.is_closed());
				waiters.push(sender);
			}

			let description = self.description();
			if let Some(error) = &description.compatibility_error {
				return Err(Error::ServerSelection {
					reason:   SelectionFailure::Incompatible(error.clone()),
					topology: description
				});
			}

			if let Some(server) = selector.select(&description, local_threshold)
				.and_then(|server| self.server(&server.address)) {
				return Ok(server);
			}

			if !checks_requested {
				tracing::debug!(?selector, "no suitable server, requesting immediate checks");
				self.servers.read().map(|servers| servers.values().for_each(Server::request_check)).ok();
				checks_requested = true;
			}

			let remaining = timeout.saturating_sub(start.elapsed());
			if remaining.is_zero() {
				return Err(selection_error(selector, description));
			}

			let _ = async_std::future::timeout(remaining, receiver.recv()).await;
		}
	}

	/// Applies a server description from a monitor or an application error.
	pub(crate) fn apply_server_description(&self, server: ServerDescription) {
		let _guard = match self.update_lock.lock() {
			Ok(guard) => guard,
			Err(_) => return
		};

		if self.is_closed() {
			return;
		}

		let previous = self.description();
		if !previous.servers.contains_key(&server.address) {
			return;
		}

		let next = Arc::new(previous.update(server));
		self.publish(previous, next);
	}

	/// Applies the host list of an SRV rescan.
	pub(crate) fn apply_srv_hosts(&self, hosts: &[HostAddress]) {
		let _guard = match self.update_lock.lock() {
			Ok(guard) => guard,
			Err(_) => return
		};

		if self.is_closed() {
			return;
		}

		let previous = self.description();
		let next = Arc::new(previous.update_from_srv(hosts));
		self.publish(previous, next);
	}

	/// Swaps in a new description, reconciles servers and emits SDAM events.
	/// Must be called with the update lock held.
	fn publish(&self, previous: Arc<TopologyDescription>, next: Arc<TopologyDescription>) {
		match self.0.description.write() {
			Ok(mut description) => *description = next.clone(),
			Err(_) => return
		}

		let changed = previous.changed_servers(&next);
		for (old, new) in &changed {
			if let (Some(old), Some(new)) = (*old, *new) {
				self.listeners.dispatch(Event::ServerDescriptionChanged { address: &new.address, previous: old, new });
			}
		}

		let (opened, closed) = match self.servers.write() {
			Ok(mut servers) => {
				let closed = servers.keys()
					.filter(|address| !next.servers.contains_key(address))
					.cloned()
					.collect::<Vec<_>>();
				let closed = closed.into_iter()
					.filter_map(|address| servers.remove(&address))
					.collect::<Vec<_>>();

				let opened = next.servers.keys()
					.filter(|address| !servers.contains_key(address))
					.cloned()
					.collect::<Vec<_>>();
				for address in &opened {
					servers.insert(address.clone(), Server::new(
						address.clone(),
						&self.options,
						self.establisher.clone(),
						self.listeners.clone(),
						self.downgrade()
					));
				}
				(opened, closed)
			}
			Err(_) => (Vec::new(), Vec::new())
		};

		for address in &opened {
			self.listeners.dispatch(Event::ServerOpening { address });
		}

		for server in closed {
			server.close();
			self.listeners.dispatch(Event::ServerClosed { address: &server.address });
		}

		if !changed.is_empty() || previous.r#type != next.r#type || previous.set_name != next.set_name {
			tracing::debug!(previous = ?previous.r#type, new = ?next.r#type, "topology description changed");
			self.listeners.dispatch(Event::TopologyDescriptionChanged { previous: &previous, new: &next });
		}

		self.notify_waiters();
	}

	fn notify_waiters(&self) {
		if let Ok(mut waiters) = self.waiters.lock() {
			waiters.drain(..).for_each(|waiter| { waiter.close(); });
		}
	}

	/// Closes all servers, pending selections fail with `TopologyClosed`.
	pub(crate) async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		let poller = self.srv_poller.lock().ok().and_then(|mut poller| poller.take());
		if let Some(poller) = poller {
			poller.cancel().await;
		}

		let servers = self.servers.write()
			.map(|mut servers| servers.drain().map(|(_, server)| server).collect::<Vec<_>>())
			.unwrap_or_default();
		for server in servers {
			server.close();
			self.listeners.dispatch(Event::ServerClosed { address: &server.address });
		}

		self.notify_waiters();
		self.listeners.dispatch(Event::TopologyClosed);
	}
}

fn selection_error(selector: &Selector, description: Arc<TopologyDescription>) -> Error {
	let reason = match description.servers.values().find(|s| s.error.is_some()) {
		Some(server) => SelectionFailure::ServerError {
			address: server.address.clone(),
			error:   Box::new(server.error.clone().unwrap_or(Error::TopologyClosed))
		},
		None if selector.requires_primary() && matches!(description.r#type,
			TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary) => SelectionFailure::NoPrimary,
		None => SelectionFailure::NoMatchingServer(description.r#type)
	};

	Error::ServerSelection { reason, topology: description }
}

#[cfg(test)]
mod tests {
	use {super::*, crate::description::ServerType};

	#[test]
	fn selection_error_reasons() {
		let options = ClientOptions { replica_set: Some("rs".to_string()), ..ClientOptions::default() };
		let a = HostAddress::new("a", None);
		let mut description = TopologyDescription::new(&options, &[a.clone()]);

		let err = selection_error(&Selector::Write, Arc::new(description.clone()));
		assert!(matches!(err, Error::ServerSelection { reason: SelectionFailure::NoPrimary, .. }));

		let err = selection_error(&Selector::predicate(|_| false), Arc::new(description.clone()));
		assert!(matches!(err, Error::ServerSelection {
			reason: SelectionFailure::NoMatchingServer(TopologyType::ReplicaSetNoPrimary), .. }));

		description.servers.insert(a.clone(), ServerDescription::from_error(a,
			std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()));
		let err = selection_error(&Selector::Write, Arc::new(description));
		assert!(matches!(err, Error::ServerSelection { reason: SelectionFailure::ServerError { .. }, .. }));
		assert_eq!(ServerType::Unknown, ServerType::default());
	}
}
