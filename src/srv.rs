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
		description::TopologyType,
		error::{Error, Result},
		topology::WeakTopology
	},
	std::{sync::Arc, time::Duration},
	async_std::task,
	async_trait::async_trait,
	rand::seq::SliceRandom
};

/// The result of resolving `_mongodb._tcp.<srv_host>`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SrvLookup {
	pub hosts:   Vec<HostAddress>,
	/// Smallest TTL of the returned records.
	pub min_ttl: Option<Duration>
}

/// Resolves SRV records, DNS itself is left to the application.
#[async_trait]
pub trait SrvResolver: Send + Sync {
	async fn resolve(&self, srv_host: &str) -> Result<SrvLookup>;
}

/// Drops hosts that do not share the parent domain of `srv_host`.
///
/// see https://github.com/mongodb/specifications/blob/master/source/initial-dns-seedlist-discovery/initial-dns-seedlist-discovery.rst
pub(crate) fn validate_hosts(srv_host: &str, hosts: Vec<HostAddress>) -> Vec<HostAddress> {
	let parent = match srv_host.split_once('.') {
		Some((_, parent)) => format!(".{}", parent.to_lowercase()),
		None => return Vec::new()
	};

	hosts.into_iter()
		.filter(|host| {
			let valid = host.host.ends_with(&parent);
			if !valid {
				tracing::warn!(%host, srv_host, "ignoring SRV record outside the parent domain");
			}
			valid
		})
		.collect()
}

/// Applies `srvMaxHosts`, keeping current hosts that are still resolved and filling up at random.
pub(crate) fn select_hosts(current: &[HostAddress], resolved: Vec<HostAddress>, max_hosts: usize) -> Vec<HostAddress> {
	if max_hosts == 0 || resolved.len() <= max_hosts {
		return resolved;
	}

	let (mut kept, mut rest): (Vec<_>, Vec<_>) = resolved.into_iter()
		.partition(|host| current.contains(host));
	kept.truncate(max_hosts);
	rest.shuffle(&mut rand::thread_rng());
	let missing = max_hosts - kept.len();
	kept.extend(rest.into_iter().take(missing));
	kept
}

/// Resolves the initial seed list of a `mongodb+srv://` connection string.
pub(crate) async fn resolve_seed_list(options: &ClientOptions) -> Result<(Vec<HostAddress>, Option<Duration>)> {
	let (srv_host, resolver) = match (&options.srv_host, &options.srv_resolver) {
		(None, _) => return Ok((options.hosts.clone(), None)),
		(Some(srv_host), Some(resolver)) => (srv_host, resolver),
		(Some(_), None) => return Err(Error::Srv("mongodb+srv:// requires an SRV resolver".to_string()))
	};

	let lookup = resolver.resolve(srv_host).await?;
	let hosts = validate_hosts(srv_host, lookup.hosts);
	if hosts.is_empty() {
		return Err(Error::Srv(format!("no valid hosts found for {}", srv_host)));
	}

	Ok((select_hosts(&[], hosts, options.srv_max_hosts), lookup.min_ttl))
}

/// Rescans the SRV records while the topology is sharded or still unknown.
///
/// see https://github.com/mongodb/specifications/blob/master/source/polling-srv-records-for-mongos-discovery/polling-srv-records-for-mongos-discovery.rst
pub(crate) fn start_poller(
	topology: WeakTopology,
	resolver: Arc<dyn SrvResolver>,
	srv_host: String,
	options:  &ClientOptions,
	min_ttl:  Option<Duration>
) -> task::JoinHandle<()> {
	let rescan_interval = options.rescan_srv_interval;
	let heartbeat_frequency = options.server_selection.heartbeat_frequency;
	let max_hosts = options.srv_max_hosts;

	task::spawn(async move {
		let mut interval = min_ttl.map_or(rescan_interval, |ttl| ttl.max(rescan_interval));

		loop {
			task::sleep(interval).await;

			let topology = match topology.upgrade() {
				Some(topology) if !topology.is_closed() => topology,
				_ => return
			};

			let description = topology.description();
			if !matches!(description.r#type, TopologyType::Sharded | TopologyType::Unknown) {
				tracing::debug!(srv_host = %srv_host, "topology is no longer sharded, stopping SRV polling");
				return;
			}

			interval = match resolver.resolve(&srv_host).await {
				Ok(lookup) => {
					let hosts = validate_hosts(&srv_host, lookup.hosts);
					if hosts.is_empty() {
						tracing::warn!(srv_host = %srv_host, "SRV rescan returned no valid hosts");
						heartbeat_frequency
					} else {
						let current = description.servers.keys().cloned().collect::<Vec<_>>();
						topology.apply_srv_hosts(&select_hosts(&current, hosts, max_hosts));
						lookup.min_ttl.map_or(rescan_interval, |ttl| ttl.max(rescan_interval))
					}
				}
				Err(e) => {
					tracing::debug!(srv_host = %srv_host, error = %e, "SRV rescan failed");
					heartbeat_frequency
				}
			};
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hosts(names: &[&str]) -> Vec<HostAddress> {
		names.iter().map(|name| HostAddress::new(name, None)).collect()
	}

	#[test]
	fn parent_domain_validation() {
		let valid = validate_hosts("cluster0.example.com", hosts(&["a.example.com", "b.cluster0.example.com", "evil.com", "example.com"]));
		assert_eq!(valid, hosts(&["a.example.com", "b.cluster0.example.com"]));
		assert!(validate_hosts("localhost", hosts(&["a.localhost"])).is_empty());
	}

	#[test]
	fn max_hosts_keeps_current_members() {
		let resolved = hosts(&["a.x.y", "b.x.y", "c.x.y", "d.x.y"]);
		assert_eq!(select_hosts(&[], resolved.clone(), 0), resolved);

		let selected = select_hosts(&hosts(&["c.x.y", "z.x.y"]), resolved.clone(), 2);
		assert_eq!(selected.len(), 2);
		assert_eq!(selected[0], HostAddress::new("c.x.y", None));
		assert!(resolved.contains(&selected[1]));
	}

	#[async_std::test]
	async fn seed_list_resolution() {
		struct Static;

		#[async_trait]
		impl SrvResolver for Static {
			async fn resolve(&self, _: &str) -> Result<SrvLookup> {
				Ok(SrvLookup { hosts: hosts(&["a.example.com", "b.example.com"]), min_ttl: Some(Duration::from_secs(300)) })
			}
		}

		let options = ClientOptions {
			srv_host:      Some("cluster.example.com".to_string()),
			srv_max_hosts: 1,
			..ClientOptions::default()
		}.with_srv_resolver(Arc::new(Static));

		let (seed, ttl) = resolve_seed_list(&options).await.unwrap();
		assert_eq!(seed.len(), 1);
		assert_eq!(ttl, Some(Duration::from_secs(300)));

		let without_resolver = ClientOptions { srv_host: Some("cluster.example.com".to_string()), ..ClientOptions::default() };
		assert!(matches!(resolve_seed_list(&without_resolver).await, Err(Error::Srv(_))));
	}
}
