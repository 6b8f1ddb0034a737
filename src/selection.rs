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
		common::{HostAddress, ReadPreference, ReadPreferenceMode},
		description::{ServerDescription, ServerType, TopologyDescription, TopologyType},
		utils::DebugWrapper
	},
	std::{sync::Arc, time::{Duration, SystemTime, UNIX_EPOCH}},
	rand::seq::SliceRandom
};

pub type ServerPredicate = Arc<dyn Fn(&ServerDescription) -> bool + Send + Sync>;

/// Describes which servers an operation may run on.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst
#[derive(Debug, Clone)]
pub enum Selector {
	Write,
	Read(ReadPreference),
	/// A specific server, used for cursors pinned to the server that created them.
	Address(HostAddress),
	Predicate(DebugWrapper<ServerPredicate>)
}

impl Default for Selector {
	fn default() -> Self {
		Self::Read(ReadPreference::primary())
	}
}

impl From<ReadPreference> for Selector {
	fn from(read_preference: ReadPreference) -> Self {
		Self::Read(read_preference)
	}
}

impl Selector {
	pub fn predicate(f: impl Fn(&ServerDescription) -> bool + Send + Sync + 'static) -> Self {
		Self::Predicate(DebugWrapper(Arc::new(f)))
	}

	pub fn read_preference(&self) -> Option<&ReadPreference> {
		match self {
			Self::Read(read_preference) => Some(read_preference),
			_ => None
		}
	}

	/// Whether an unsuccessful selection is explained by the lack of a primary.
	pub(crate) fn requires_primary(&self) -> bool {
		match self {
			Self::Write => true,
			Self::Read(read_preference) => read_preference.mode == ReadPreferenceMode::Primary,
			_ => false
		}
	}

	/// All servers that are suitable, before the latency window is applied.
	pub fn suitable_servers<'a>(&self, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
		if topology.compatibility_error.is_some() {
			return Vec::new();
		}

		let available = || topology.servers.values().filter(|s| s.is_available());
		let mut servers = match topology.r#type {
			TopologyType::Unknown => Vec::new(),
			TopologyType::Single | TopologyType::LoadBalanced => available().collect(),
			TopologyType::Sharded => available().filter(|s| s.r#type == ServerType::Mongos).collect(),
			TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => match self {
				Self::Write => topology.primary().into_iter().collect(),
				Self::Read(read_preference) => replica_set_servers(read_preference, topology),
				Self::Address(_) | Self::Predicate(_) => available()
					.filter(|s| s.is_readable() || s.r#type == ServerType::RSArbiter || s.r#type == ServerType::RSOther)
					.collect()
			}
		};

		match self {
			Self::Address(address) => servers.retain(|s| &s.address == address),
			Self::Predicate(predicate) => servers.retain(|s| (predicate.0)(*s)),
			_ => ()
		}

		servers
	}

	/// Picks a random server among the suitable ones within `local_threshold` of the fastest.
	pub fn select<'a>(&self, topology: &'a TopologyDescription, local_threshold: Duration) -> Option<&'a ServerDescription> {
		let servers = self.suitable_servers(topology);
		let fastest = servers.iter()
			.map(|s| s.rtt.unwrap_or_default())
			.min()?;

		servers.into_iter()
			.filter(|s| s.rtt.unwrap_or_default() <= fastest + local_threshold)
			.collect::<Vec<_>>()
			.choose(&mut rand::thread_rng())
			.copied()
	}
}

fn replica_set_servers<'a>(read_preference: &ReadPreference, topology: &'a TopologyDescription) -> Vec<&'a ServerDescription> {
	let primary = topology.primary();
	let secondaries = || {
		let servers = topology.servers.values()
			.filter(|s| s.r#type == ServerType::RSSecondary)
			.collect::<Vec<_>>();
		match_tag_sets(filter_stale(servers, read_preference, topology), &read_preference.tag_sets)
	};

	match read_preference.mode {
		ReadPreferenceMode::Primary => primary.into_iter().collect(),
		ReadPreferenceMode::PrimaryPreferred => match primary {
			Some(primary) => vec![primary],
			None => secondaries()
		},
		ReadPreferenceMode::Secondary => secondaries(),
		ReadPreferenceMode::SecondaryPreferred => {
			let secondaries = secondaries();
			if secondaries.is_empty() {
				primary.into_iter().collect()
			} else {
				secondaries
			}
		}
		ReadPreferenceMode::Nearest => {
			let servers = topology.servers.values()
				.filter(|s| matches!(s.r#type, ServerType::RSPrimary | ServerType::RSSecondary))
				.collect::<Vec<_>>();
			match_tag_sets(filter_stale(servers, read_preference, topology), &read_preference.tag_sets)
		}
	}
}

/// Milliseconds since the epoch, negative for times before it.
fn epoch_millis(time: SystemTime) -> i128 {
	match time.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_millis() as i128,
		Err(e) => -(e.duration().as_millis() as i128)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/max-staleness/max-staleness.rst
fn filter_stale<'a>(
	servers:         Vec<&'a ServerDescription>,
	read_preference: &ReadPreference,
	topology:        &'a TopologyDescription
) -> Vec<&'a ServerDescription> {
	let max_staleness = match read_preference.max_staleness {
		Some(max_staleness) => max_staleness.as_millis() as i128,
		None => return servers
	};
	let heartbeat = topology.heartbeat_frequency.as_millis() as i128;

	let staleness: Box<dyn Fn(&ServerDescription) -> Option<i128>> = match topology.primary() {
		Some(primary) => match primary.last_write_date {
			Some(last_write) => {
				let primary_lag = epoch_millis(primary.last_update_time) - epoch_millis(last_write);
				Box::new(move |s| Some(epoch_millis(s.last_update_time) - epoch_millis(s.last_write_date?) - primary_lag + heartbeat))
			}
			None => return servers
		},
		None => {
			let max_write = servers.iter()
				.filter_map(|s| s.last_write_date)
				.map(epoch_millis)
				.max();
			Box::new(move |s| Some(max_write? - epoch_millis(s.last_write_date?) + heartbeat))
		}
	};

	servers.into_iter()
		.filter(|s| staleness(s).map_or(true, |staleness| staleness <= max_staleness))
		.collect()
}

/// The servers matching the first tag set that matches any server.
fn match_tag_sets<'a>(
	servers:  Vec<&'a ServerDescription>,
	tag_sets: &[std::collections::HashMap<String, String>]
) -> Vec<&'a ServerDescription> {
	if tag_sets.is_empty() {
		return servers;
	}

	tag_sets.iter()
		.map(|tags| servers.iter()
			.copied()
			.filter(|s| tags.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
			.collect::<Vec<_>>())
		.find(|matched| !matched.is_empty())
		.unwrap_or_default()
}
