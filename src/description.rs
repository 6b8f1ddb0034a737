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
		common::{ClientOptions, HostAddress},
		error::Error,
		wire::{self, Compressor, HelloReply}
	},
	std::{collections::{HashMap, HashSet}, time::{Duration, SystemTime}},
	serde::{Serialize, Deserialize},
	bson::oid::ObjectId
};

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologyversion
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
	pub process_id: ObjectId,
	pub counter:    i64
}

impl TopologyVersion {
	/// Returns `true` if `other` does not describe a newer state than `current`.
	/// Versions from different processes are never comparable, the newcomer always wins.
	pub fn is_stale(other: Option<&Self>, current: Option<&Self>) -> bool {
		match (current, other) {
			(Some(current), Some(other)) if current.process_id == other.process_id =>
				other.counter <= current.counter,
			_ => false
		}
	}

	/// Returns `true` if `other` strictly precedes `current` within the same process.
	pub fn is_older(other: Option<&Self>, current: Option<&Self>) -> bool {
		match (current, other) {
			(Some(current), Some(other)) if current.process_id == other.process_id =>
				other.counter < current.counter,
			_ => false
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum ServerType {
	Standalone,
	Mongos,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	LoadBalancer,
	#[default]
	Unknown
}

impl ServerType {
	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RSPrimary | Self::RSSecondary | Self::LoadBalancer)
	}

	pub fn is_known(self) -> bool {
		self != Self::Unknown
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#serverdescription
#[derive(Debug, Clone)]
pub struct ServerDescription {
	pub address:                         HostAddress,
	pub r#type:                          ServerType,
	pub rtt:                             Option<Duration>,
	pub last_update_time:                SystemTime,
	pub last_write_date:                 Option<SystemTime>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub me:                              Option<HostAddress>,
	pub hosts:                           Vec<HostAddress>,
	pub passives:                        Vec<HostAddress>,
	pub arbiters:                        Vec<HostAddress>,
	pub tags:                            HashMap<String, String>,
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub primary:                         Option<HostAddress>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub topology_version:                Option<TopologyVersion>,
	pub compression:                     Vec<Compressor>,
	pub error:                           Option<Error>
}

impl ServerDescription {
	/// An `Unknown` description, the initial state of every server.
	pub fn new(address: HostAddress) -> Self {
		Self {
			address,
			r#type:                          ServerType::Unknown,
			rtt:                             None,
			last_update_time:                SystemTime::now(),
			last_write_date:                 None,
			min_wire_version:                0,
			max_wire_version:                0,
			me:                              None,
			hosts:                           Vec::new(),
			passives:                        Vec::new(),
			arbiters:                        Vec::new(),
			tags:                            HashMap::new(),
			set_name:                        None,
			set_version:                     None,
			election_id:                     None,
			primary:                         None,
			logical_session_timeout_minutes: None,
			topology_version:                None,
			compression:                     Vec::new(),
			error:                           None
		}
	}

	/// An `Unknown` description carrying the error that caused it.
	pub fn from_error(address: HostAddress, error: Error) -> Self {
		Self {
			topology_version: error.topology_version().cloned(),
			error:            Some(error),
			..Self::new(address)
		}
	}

	pub fn from_hello(address: HostAddress, reply: HelloReply, rtt: Duration) -> Self {
		let r#type = match &reply {
			HelloReply { msg: Some(msg), .. } if msg == "isdbgrid"               => ServerType::Mongos,
			HelloReply { isreplicaset: true, .. }                                 => ServerType::RSGhost,
			HelloReply { set_name: Some(_), is_writable_primary: true, .. }       => ServerType::RSPrimary,
			HelloReply { set_name: Some(_), secondary: true, .. }                 => ServerType::RSSecondary,
			HelloReply { set_name: Some(_), arbiter_only: true, .. }              => ServerType::RSArbiter,
			HelloReply { set_name: Some(_), .. }                                  => ServerType::RSOther,
			_                                                                     => ServerType::Standalone
		};

		let mut hosts = reply.hosts;
		let mut passives = reply.passives;
		let mut arbiters = reply.arbiters;
		hosts.sort();
		passives.sort();
		arbiters.sort();

		Self {
			address,
			r#type,
			rtt:                             Some(rtt),
			last_update_time:                SystemTime::now(),
			last_write_date:                 reply.last_write.map(|w| w.last_write_date.to_system_time()),
			min_wire_version:                reply.min_wire_version,
			max_wire_version:                reply.max_wire_version,
			me:                              reply.me,
			hosts,
			passives,
			arbiters,
			tags:                            reply.tags,
			set_name:                        reply.set_name,
			set_version:                     reply.set_version,
			election_id:                     reply.election_id,
			primary:                         reply.primary,
			logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
			topology_version:                reply.topology_version,
			compression:                     reply.compression.unwrap_or_default(),
			error:                           None
		}
	}

	/// A load balancer is never monitored, it is always assumed to be available.
	pub fn load_balancer(address: HostAddress) -> Self {
		Self {
			r#type:           ServerType::LoadBalancer,
			min_wire_version: wire::MIN_WIRE_VERSION,
			max_wire_version: wire::MAX_WIRE_VERSION,
			..Self::new(address)
		}
	}

	pub fn is_available(&self) -> bool {
		self.r#type.is_known()
	}

	pub fn is_readable(&self) -> bool {
		matches!(self.r#type, ServerType::Standalone | ServerType::Mongos | ServerType::RSPrimary
			| ServerType::RSSecondary | ServerType::LoadBalancer)
	}

	fn members(&self) -> impl Iterator<Item = &HostAddress> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}
}

/// Equality as defined for `serverDescriptionChanged` events, ignoring timing fields.
impl PartialEq for ServerDescription {
	fn eq(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.r#type == other.r#type
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.tags == other.tags
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
			&& self.topology_version == other.topology_version
			&& self.error.as_ref().map(ToString::to_string) == other.error.as_ref().map(ToString::to_string)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TopologyType {
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	LoadBalanced,
	#[default]
	Unknown
}

/// An immutable snapshot of the deployment; every change produces a new description.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone)]
pub struct TopologyDescription {
	pub r#type:                          TopologyType,
	pub set_name:                        Option<String>,
	pub max_set_version:                 Option<i32>,
	pub max_election_id:                 Option<ObjectId>,
	pub servers:                         HashMap<HostAddress, ServerDescription>,
	pub compatibility_error:             Option<String>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub common_wire_version:             Option<i32>,
	pub heartbeat_frequency:             Duration
}

impl TopologyDescription {
	pub fn new(options: &ClientOptions, hosts: &[HostAddress]) -> Self {
		let r#type = options.initial_topology_type();
		let mut self_ = Self {
			r#type,
			set_name:                        options.replica_set.clone(),
			max_set_version:                 None,
			max_election_id:                 None,
			servers:                         hosts.iter()
				.map(|address| (address.clone(), match r#type {
					TopologyType::LoadBalanced => ServerDescription::load_balancer(address.clone()),
					_ => ServerDescription::new(address.clone())
				}))
				.collect(),
			compatibility_error:             None,
			logical_session_timeout_minutes: None,
			common_wire_version:             None,
			heartbeat_frequency:             options.server_selection.heartbeat_frequency
		};
		self_.update_derived();
		self_
	}

	pub fn server(&self, address: &HostAddress) -> Option<&ServerDescription> {
		self.servers.get(address)
	}

	pub fn primary(&self) -> Option<&ServerDescription> {
		self.servers.values().find(|s| s.r#type == ServerType::RSPrimary)
	}

	pub fn has_known_servers(&self) -> bool {
		self.servers.values().any(ServerDescription::is_available)
	}

	/// Returns the addresses whose description differs between `self` and `next`,
	/// including servers that were added or removed.
	pub fn changed_servers<'a>(&'a self, next: &'a Self) -> Vec<(Option<&'a ServerDescription>, Option<&'a ServerDescription>)> {
		let addresses: HashSet<_> = self.servers.keys().chain(next.servers.keys()).collect();
		addresses.into_iter()
			.map(|address| (self.servers.get(address), next.servers.get(address)))
			.filter(|(a, b)| a != b)
			.collect()
	}

	/// Applies a new server description, returning the resulting topology.
	pub fn update(&self, description: ServerDescription) -> Self {
		let mut next = self.clone();
		next.apply(description);
		next
	}

	/// Applies the host list of an SRV rescan, only meaningful for sharded or unknown topologies.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/polling-srv-records-for-mongos-discovery/polling-srv-records-for-mongos-discovery.rst
	pub fn update_from_srv(&self, hosts: &[HostAddress]) -> Self {
		let mut next = self.clone();

		if !matches!(self.r#type, TopologyType::Sharded | TopologyType::Unknown) || hosts.is_empty() {
			return next;
		}

		next.servers.retain(|address, _| hosts.contains(address));
		for address in hosts {
			next.servers.entry(address.clone())
				.or_insert_with(|| ServerDescription::new(address.clone()));
		}

		next.update_derived();
		next
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#updating-the-topologydescription
	fn apply(&mut self, mut description: ServerDescription) {
		let address = description.address.clone();

		match self.servers.get(&address) {
			None => return,
			Some(current) if description.error.is_none() && TopologyVersion::is_older(
				description.topology_version.as_ref(), current.topology_version.as_ref()) => return,
			_ => ()
		}

		if self.r#type == TopologyType::Single && description.r#type.is_known() {
			if let (Some(expected), actual) = (&self.set_name, &description.set_name) {
				if Some(expected) != actual.as_ref() {
					description = ServerDescription::from_error(address.clone(), Error::InvalidClientOptions(
						crate::common::ClientOptionsParseError::Conflict("replica set name mismatch")));
				}
			}
		}

		self.servers.insert(address.clone(), description.clone());

		match (self.r#type, description.r#type) {
			// no-op
			(TopologyType::Single, _)
			| (TopologyType::LoadBalanced, _)
			| (TopologyType::Unknown, ServerType::Unknown)
			| (TopologyType::Unknown, ServerType::RSGhost)
			| (TopologyType::Unknown, ServerType::LoadBalancer)
			| (TopologyType::Sharded, ServerType::Unknown)
			| (TopologyType::Sharded, ServerType::Mongos)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSGhost) => (),
			// remove
			(TopologyType::Sharded, _)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::LoadBalancer) => {
				self.servers.remove(&address);
			}
			(TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::LoadBalancer) => {
				self.servers.remove(&address);
				self.check_if_has_primary();
			}
			// update topology type
			(TopologyType::Unknown, ServerType::Standalone) => if self.servers.len() == 1 {
				self.r#type = TopologyType::Single;
			} else {
				self.servers.remove(&address);
			},
			(TopologyType::Unknown, ServerType::Mongos) => self.r#type = TopologyType::Sharded,
			(TopologyType::Unknown, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSPrimary) => self.update_rs_from_primary(&description),
			(TopologyType::Unknown, ServerType::RSSecondary)
			| (TopologyType::Unknown, ServerType::RSArbiter)
			| (TopologyType::Unknown, ServerType::RSOther)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSOther) => {
				self.r#type = TopologyType::ReplicaSetNoPrimary;
				self.update_rs_without_primary(&description);
			}
			(TopologyType::ReplicaSetWithPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSOther) =>
				self.update_rs_with_primary_from_member(&description),
			(TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSGhost) => self.check_if_has_primary()
		}

		self.update_derived();
	}

	fn update_rs_from_primary(&mut self, description: &ServerDescription) {
		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		} else if self.set_name != description.set_name {
			self.servers.remove(&description.address);
			self.check_if_has_primary();
			return;
		}

		if let (Some(set_version), Some(election_id)) = (description.set_version, description.election_id) {
			if let (Some(max_set_version), Some(max_election_id)) = (self.max_set_version, self.max_election_id) {
				if max_set_version > set_version || (max_set_version == set_version && max_election_id > election_id) {
					// stale primary
					self.servers.insert(description.address.clone(), ServerDescription::new(description.address.clone()));
					self.check_if_has_primary();
					return;
				}
			}
			self.max_election_id = Some(election_id);
		}

		if let Some(set_version) = description.set_version {
			if self.max_set_version.map_or(true, |max| set_version > max) {
				self.max_set_version = Some(set_version);
			}
		}

		// invalidate old primary

		for server in self.servers.values_mut() {
			if server.r#type == ServerType::RSPrimary && server.address != description.address {
				*server = ServerDescription::new(server.address.clone());
			}
		}

		// update servers

		for address in description.members() {
			self.servers.entry(address.clone())
				.or_insert_with(|| ServerDescription::new(address.clone()));
		}

		let members: HashSet<&HostAddress> = description.members().collect();
		self.servers.retain(|address, _| members.contains(address));
		self.check_if_has_primary();
	}

	fn update_rs_without_primary(&mut self, description: &ServerDescription) {
		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		} else if self.set_name != description.set_name {
			self.servers.remove(&description.address);
			return;
		}

		for address in description.members() {
			self.servers.entry(address.clone())
				.or_insert_with(|| ServerDescription::new(address.clone()));
		}

		if description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.servers.remove(&description.address);
		}
	}

	fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
		if self.set_name != description.set_name
			|| description.me.as_ref().map_or(false, |me| me != &description.address) {
			self.servers.remove(&description.address);
		}

		self.check_if_has_primary();
	}

	/// Sets the type to `ReplicaSetWithPrimary` or `ReplicaSetNoPrimary`, depending on whether a primary is known.
	fn check_if_has_primary(&mut self) {
		self.r#type = match self.primary() {
			Some(_) => TopologyType::ReplicaSetWithPrimary,
			None    => TopologyType::ReplicaSetNoPrimary
		};
	}

	fn update_derived(&mut self) {
		let known = || self.servers.values().filter(|s| s.r#type.is_known());

		self.compatibility_error = known().find_map(|s| if s.min_wire_version > wire::MAX_WIRE_VERSION {
			Some(format!("server at {} requires wire version {}, but this driver only supports up to {}",
				s.address, s.min_wire_version, wire::MAX_WIRE_VERSION))
		} else if s.max_wire_version < wire::MIN_WIRE_VERSION {
			Some(format!("server at {} reports wire version {}, but this driver requires at least {}",
				s.address, s.max_wire_version, wire::MIN_WIRE_VERSION))
		} else {
			None
		});

		self.common_wire_version = known().map(|s| s.max_wire_version).min();

		let mut data_bearing = self.servers.values().filter(|s| s.r#type.is_data_bearing()).peekable();
		self.logical_session_timeout_minutes = match data_bearing.peek() {
			None => None,
			Some(_) => data_bearing
				.map(|s| s.logical_session_timeout_minutes)
				.try_fold(i64::MAX, |min, timeout| timeout.map(|t| min.min(t)))
		};
	}
}

#[cfg(test)]
mod tests {
	use {super::*, bson::{doc, Document}};

	fn addr(s: &str) -> HostAddress {
		s.parse().unwrap()
	}

	fn hello(address: &str, reply: Document) -> ServerDescription {
		let mut reply = reply;
		reply.insert("minWireVersion", 0);
		if !reply.contains_key("maxWireVersion") {
			reply.insert("maxWireVersion", 17);
		}
		ServerDescription::from_hello(addr(address), bson::from_document(reply).unwrap(), Duration::from_millis(5))
	}

	fn topology(hosts: &[&str], uri_options: &str) -> TopologyDescription {
		let options: ClientOptions = format!("mongodb://{}/?{}", hosts.join(","), uri_options).parse().unwrap();
		TopologyDescription::new(&options, &options.hosts)
	}

	fn oid(n: u8) -> ObjectId {
		ObjectId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, n])
	}

	#[test]
	fn discover_replica_set_from_primary() {
		let t = topology(&["a:27017"], "");
		let t = t.update(hello("a:27017", doc! {
			"isWritablePrimary": true, "setName": "rs", "hosts": ["a:27017", "b:27017", "c:27017"],
			"setVersion": 1, "electionId": oid(1), "logicalSessionTimeoutMinutes": 30_i64
		}));

		assert_eq!(t.r#type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(t.set_name.as_deref(), Some("rs"));
		assert_eq!(t.servers.len(), 3);
		assert_eq!(t.servers[&addr("b:27017")].r#type, ServerType::Unknown);
		assert_eq!(t.logical_session_timeout_minutes, Some(30));
		assert_eq!(t.common_wire_version, Some(17));
	}

	#[test]
	fn newer_primary_demotes_old_one() {
		let t = topology(&["a:27017", "b:27017"], "replicaSet=rs");
		let members = vec!["a:27017", "b:27017"];
		let t = t.update(hello("a:27017", doc! {
			"isWritablePrimary": true, "setName": "rs", "hosts": members.clone(), "setVersion": 1, "electionId": oid(1)
		}));
		let t = t.update(hello("b:27017", doc! {
			"isWritablePrimary": true, "setName": "rs", "hosts": members.clone(), "setVersion": 1, "electionId": oid(2)
		}));

		assert_eq!(t.primary().map(|s| &s.address), Some(&addr("b:27017")));
		assert_eq!(t.servers[&addr("a:27017")].r#type, ServerType::Unknown);
		assert_eq!(t.max_election_id, Some(oid(2)));

		// a still believes it is primary with the old election id
		let t = t.update(hello("a:27017", doc! {
			"isWritablePrimary": true, "setName": "rs", "hosts": members, "setVersion": 1, "electionId": oid(1)
		}));
		assert_eq!(t.primary().map(|s| &s.address), Some(&addr("b:27017")));
		assert_eq!(t.servers[&addr("a:27017")].r#type, ServerType::Unknown);
		assert_eq!(t.r#type, TopologyType::ReplicaSetWithPrimary);
	}

	#[test]
	fn primary_removes_unlisted_members() {
		let t = topology(&["a:27017", "b:27017", "x:27017"], "");
		let t = t.update(hello("a:27017", doc! {
			"isWritablePrimary": true, "setName": "rs", "hosts": ["a:27017", "b:27017"]
		}));
		assert!(!t.servers.contains_key(&addr("x:27017")));
		assert_eq!(t.servers.len(), 2);
	}

	#[test]
	fn standalone_and_mismatched_members_are_removed() {
		let t = topology(&["a:27017", "b:27017", "c:27017"], "replicaSet=rs");
		let t = t.update(hello("c:27017", doc! {}));
		assert!(!t.servers.contains_key(&addr("c:27017")));
		assert_eq!(t.r#type, TopologyType::ReplicaSetNoPrimary);

		let t = t.update(hello("b:27017", doc! { "secondary": true, "setName": "other", "hosts": ["b:27017"] }));
		assert!(!t.servers.contains_key(&addr("b:27017")));

		let t = t.update(hello("a:27017", doc! {
			"secondary": true, "setName": "rs", "hosts": ["a:27017", "d:27017"], "me": "e:27017"
		}));
		assert!(!t.servers.contains_key(&addr("a:27017")));
		assert!(t.servers.contains_key(&addr("d:27017")));
	}

	#[test]
	fn sharded_discovery() {
		let t = topology(&["a:27017", "b:27017"], "");
		let t = t.update(hello("a:27017", doc! { "msg": "isdbgrid" }));
		assert_eq!(t.r#type, TopologyType::Sharded);

		let t = t.update(hello("b:27017", doc! { "isWritablePrimary": true, "setName": "rs" }));
		assert_eq!(t.servers.len(), 1);
		assert_eq!(t.r#type, TopologyType::Sharded);
	}

	#[test]
	fn standalone_discovery_depends_on_seed_count() {
		let t = topology(&["a:27017"], "").update(hello("a:27017", doc! { "isWritablePrimary": true }));
		assert_eq!(t.r#type, TopologyType::Single);

		let t = topology(&["a:27017", "b:27017"], "").update(hello("a:27017", doc! { "isWritablePrimary": true }));
		assert_eq!(t.r#type, TopologyType::Unknown);
		assert_eq!(t.servers.len(), 1);
	}

	#[test]
	fn single_topology_never_changes_type() {
		let t = topology(&["a:27017"], "directConnection=true");
		let t = t.update(hello("a:27017", doc! { "msg": "isdbgrid" }));
		assert_eq!(t.r#type, TopologyType::Single);
		assert_eq!(t.servers[&addr("a:27017")].r#type, ServerType::Mongos);

		let t = topology(&["a:27017"], "directConnection=true&replicaSet=rs");
		let t = t.update(hello("a:27017", doc! { "secondary": true, "setName": "other" }));
		assert_eq!(t.servers[&addr("a:27017")].r#type, ServerType::Unknown);
		assert!(t.servers[&addr("a:27017")].error.is_some());
	}

	#[test]
	fn wire_version_compatibility() {
		let t = topology(&["a:27017"], "");
		let t = t.update(hello("a:27017", doc! { "isWritablePrimary": true, "maxWireVersion": 2 }));
		assert!(t.compatibility_error.is_some());

		let t = t.update(ServerDescription::new(addr("a:27017")));
		assert!(t.compatibility_error.is_none());
	}

	#[test]
	fn session_timeout_requires_all_data_bearing_servers() {
		let t = topology(&["a:27017", "b:27017"], "");
		let t = t.update(hello("a:27017", doc! { "msg": "isdbgrid", "logicalSessionTimeoutMinutes": 30_i64 }));
		assert_eq!(t.logical_session_timeout_minutes, Some(30));

		let t = t.update(hello("b:27017", doc! { "msg": "isdbgrid", "logicalSessionTimeoutMinutes": 10_i64 }));
		assert_eq!(t.logical_session_timeout_minutes, Some(10));

		let t = t.update(hello("b:27017", doc! { "msg": "isdbgrid" }));
		assert_eq!(t.logical_session_timeout_minutes, None);
	}

	#[test]
	fn stale_topology_version_is_ignored() {
		let process_id = oid(9);
		let t = topology(&["a:27017"], "directConnection=true");
		let t = t.update(hello("a:27017", doc! {
			"isWritablePrimary": true, "topologyVersion": { "processId": process_id, "counter": 2_i64 }
		}));
		let t2 = t.update(hello("a:27017", doc! {
			"isWritablePrimary": true, "tags": { "dc": "ny" },
			"topologyVersion": { "processId": process_id, "counter": 1_i64 }
		}));
		assert!(t2.servers[&addr("a:27017")].tags.is_empty());
		assert!(t.changed_servers(&t2).is_empty());
	}

	#[test]
	fn srv_updates_only_apply_to_sharded_or_unknown() {
		let t = topology(&["a:27017", "b:27017"], "");
		let t = t.update_from_srv(&[addr("b:27017"), addr("c:27017")]);
		let mut hosts: Vec<_> = t.servers.keys().map(ToString::to_string).collect();
		hosts.sort();
		assert_eq!(hosts, vec!["b:27017", "c:27017"]);

		let rs = topology(&["a:27017"], "replicaSet=rs");
		assert_eq!(rs.update_from_srv(&[addr("z:27017")]).servers.len(), 1);
	}

	#[test]
	fn topology_version_ordering() {
		let a = TopologyVersion { process_id: oid(1), counter: 2 };
		let b = TopologyVersion { process_id: oid(1), counter: 3 };
		let c = TopologyVersion { process_id: oid(2), counter: 0 };
		assert!(TopologyVersion::is_stale(Some(&a), Some(&b)));
		assert!(TopologyVersion::is_stale(Some(&b), Some(&b)));
		assert!(!TopologyVersion::is_stale(Some(&b), Some(&a)));
		assert!(!TopologyVersion::is_stale(Some(&c), Some(&b)));
		assert!(!TopologyVersion::is_stale(None, Some(&b)));
	}
}
