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
		Client,
		auth::Authenticator,
		connection::Connector,
		description::TopologyType,
		error::{Error, Result, ResumePolicy},
		srv::SrvResolver,
		wire::{Compressor, SUPPORTED_COMPRESSORS},
		utils::DebugWrapper
	},
	std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration},
	serde::{Serialize, Deserialize},
	bson::{doc, Document, Timestamp},
	thiserror::Error
};

pub const DEFAULT_MONGO_PORT:               u16      = 27017;
pub const DEFAULT_CONNECT_TIMEOUT:          Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_POOL_SIZE:            usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:            usize    = 100;
pub const DEFAULT_LOCAL_THRESHOLD:          Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:      Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_HEARTBEAT_FREQUENCY:  Duration = Duration::from_millis(500);
pub const DEFAULT_RESCAN_SRV_INTERVAL:      Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_MESSAGE_SIZE:         usize    = 48_000_000;

/// A `host[:port]` pair, hosts are compared case-insensitively.
#[derive(Debug, Clone, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct HostAddress {
	pub host: String,
	pub port: u16
}

impl HostAddress {
	pub fn new(host: &str, port: Option<u16>) -> Self {
		Self { host: host.to_ascii_lowercase(), port: port.unwrap_or(DEFAULT_MONGO_PORT) }
	}
}

impl fmt::Display for HostAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for HostAddress {
	type Err = ClientOptionsParseError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let invalid = || ClientOptionsParseError::InvalidHost(s.to_string());
		let (host, port) = if let Some(rest) = s.strip_prefix('[') {
			let end = rest.find(']').ok_or_else(invalid)?;
			(&rest[..end], rest[end + 1..].strip_prefix(':'))
		} else {
			match s.rfind(':') {
				Some(i) => (&s[..i], Some(&s[i + 1..])),
				None    => (s, None)
			}
		};

		if host.is_empty() {
			return Err(invalid());
		}

		let port = port.map(|p| p.parse::<u16>().map_err(|_| invalid())).transpose()?;
		if port == Some(0) {
			return Err(invalid());
		}

		Ok(Self::new(host, port))
	}
}

impl Serialize for HostAddress {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for HostAddress {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-string/connection-string-spec.rst,
/// https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.rst
#[derive(Debug, Clone)]
pub struct ClientOptions {
	pub hosts:                     Vec<HostAddress>,
	/// Set for `mongodb+srv://` connection strings, the hosts are resolved through `srv_resolver`.
	pub srv_host:                  Option<String>,
	pub srv_max_hosts:             usize,
	pub appname:                   Option<String>,
	pub compressors:               Vec<Compressor>,
	pub connect_timeout:           Duration,
	pub socket_timeout:            Option<Duration>,
	pub replica_set:               Option<String>,
	pub direct_connection:         Option<bool>,
	pub load_balanced:             bool,
	pub retry_reads:               bool,
	pub retry_writes:              bool,
	pub default_database:          Option<String>,
	pub credential:                Option<Credential>,
	pub server_selection:          ServerSelectionConfig,
	pub pool_options:              ConnectionPoolOptions,
	pub read_preference:           ReadPreference,
	pub read_concern:              Option<ReadConcern>,
	pub server_monitoring_mode:    ServerMonitoringMode,
	pub tls:                       bool,
	pub max_message_size:          usize,
	pub rescan_srv_interval:       Duration,
	pub resume_policy:             ResumePolicy,
	pub connector:                 Option<DebugWrapper<Arc<dyn Connector>>>,
	pub authenticator:             Option<DebugWrapper<Arc<dyn Authenticator>>>,
	pub srv_resolver:              Option<DebugWrapper<Arc<dyn SrvResolver>>>
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ClientOptionsParseError {
	#[error("the connection string must start with `mongodb://` or `mongodb+srv://`")]
	InvalidScheme,
	#[error("unknown option `{0}`")]
	InvalidKey(String),
	#[error("invalid host `{0}`")]
	InvalidHost(String),
	#[error("invalid value `{val}` for option `{key}`")]
	InvalidValue { key: &'static str, val: String },
	#[error("{0}")]
	Conflict(&'static str)
}

impl<T: fmt::Debug> From<(&'static str, T)> for ClientOptionsParseError {
	fn from((key, val): (&'static str, T)) -> Self {
		Self::InvalidValue { key, val: format!("{:?}", val) }
	}
}

impl ClientOptions {
	pub async fn connect(self) -> Result<Client> {
		Client::connect(self).await
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#initial-topologytype
	pub fn initial_topology_type(&self) -> TopologyType {
		if self.load_balanced {
			TopologyType::LoadBalanced
		} else if self.direct_connection == Some(true) {
			TopologyType::Single
		} else if self.replica_set.is_some() {
			TopologyType::ReplicaSetNoPrimary
		} else {
			TopologyType::Unknown
		}
	}

	pub fn validate(&self) -> std::result::Result<(), ClientOptionsParseError> {
		use ClientOptionsParseError::Conflict;

		if self.hosts.is_empty() && self.srv_host.is_none() {
			return Err(Conflict("at least one host is required"));
		}

		if self.direct_connection == Some(true) {
			if self.srv_host.is_some() {
				return Err(Conflict("directConnection=true is incompatible with SRV connection strings"));
			}
			if self.hosts.len() > 1 {
				return Err(Conflict("directConnection=true requires exactly one host"));
			}
		}

		if self.load_balanced {
			if self.hosts.len() > 1 {
				return Err(Conflict("loadBalanced=true requires exactly one host"));
			}
			if self.replica_set.is_some() {
				return Err(Conflict("loadBalanced=true is incompatible with replicaSet"));
			}
			if self.direct_connection == Some(true) {
				return Err(Conflict("loadBalanced=true is incompatible with directConnection=true"));
			}
		}

		if self.pool_options.max_pool_size != 0 && self.pool_options.min_pool_size > self.pool_options.max_pool_size {
			return Err(Conflict("minPoolSize must not exceed maxPoolSize"));
		}

		if self.srv_max_hosts > 0 && self.srv_host.is_none() {
			return Err(Conflict("srvMaxHosts requires an SRV connection string"));
		}

		Ok(())
	}

	pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
		self.connector = Some(DebugWrapper(connector));
		self
	}

	pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
		self.authenticator = Some(DebugWrapper(authenticator));
		self
	}

	pub fn with_srv_resolver(mut self, resolver: Arc<dyn SrvResolver>) -> Self {
		self.srv_resolver = Some(DebugWrapper(resolver));
		self
	}
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			hosts:                     Vec::new(),
			srv_host:                  None,
			srv_max_hosts:             0,
			appname:                   None,
			compressors:               Vec::new(),
			connect_timeout:           DEFAULT_CONNECT_TIMEOUT,
			socket_timeout:            None,
			replica_set:               None,
			direct_connection:         None,
			load_balanced:             false,
			retry_reads:               true,
			retry_writes:              true,
			default_database:          None,
			credential:                None,
			server_selection:          ServerSelectionConfig::default(),
			pool_options:              ConnectionPoolOptions::default(),
			read_preference:           ReadPreference::default(),
			read_concern:              None,
			server_monitoring_mode:    ServerMonitoringMode::Auto,
			tls:                       false,
			max_message_size:          DEFAULT_MAX_MESSAGE_SIZE,
			rescan_srv_interval:       DEFAULT_RESCAN_SRV_INTERVAL,
			resume_policy:             ResumePolicy::default(),
			connector:                 None,
			authenticator:             None,
			srv_resolver:              None
		}
	}
}

fn parse_bool(key: &'static str, value: &str) -> std::result::Result<bool, ClientOptionsParseError> {
	match value {
		"true"  => Ok(true),
		"false" => Ok(false),
		_ => Err(ClientOptionsParseError::from((key, value)))
	}
}

fn parse_millis(key: &'static str, value: &str) -> std::result::Result<Duration, ClientOptionsParseError> {
	value.parse().map(Duration::from_millis).map_err(|e| ClientOptionsParseError::from((key, e)))
}

impl FromStr for ClientOptions {
	type Err = Error;

	fn from_str(mut s: &str) -> std::result::Result<Self, Self::Err> {
		let mut self_ = Self::default();

		let srv = if let Some(rest) = s.strip_prefix("mongodb+srv://") {
			s = rest;
			true
		} else if let Some(rest) = s.strip_prefix("mongodb://") {
			s = rest;
			false
		} else {
			return Err(Error::InvalidClientOptions(ClientOptionsParseError::InvalidScheme));
		};

		let end = s.find(|c| c == '/' || c == '?').unwrap_or(s.len());
		let mut authority = &s[..end];
		s = &s[end..];

		if let Some(i) = authority.rfind('@') {
			let mut split = authority[..i].splitn(2, ':');
			self_.credential = Some(Credential {
				username: split.next().map(str::to_string),
				password: split.next().map(str::to_string),
				..Credential::default()
			});
			authority = &authority[i + 1..];
		}

		if srv {
			if authority.contains(',') || authority.contains(':') {
				return Err(ClientOptionsParseError::InvalidHost(authority.to_string()).into());
			}
			self_.srv_host = Some(authority.to_ascii_lowercase());
			self_.tls = true;
		} else {
			self_.hosts = authority.split(',')
				.map(str::parse)
				.collect::<std::result::Result<_, _>>()?;
		}

		s = s.strip_prefix('/').unwrap_or(s);
		let i = s.find('?').unwrap_or(s.len());
		if i > 0 {
			self_.default_database = Some(s[..i].to_string());
		}
		s = s.get(i + 1..).unwrap_or_default();

		// options

		s.split('&').filter(|s| !s.is_empty()).map(|s| {
			let i = s.find('=').unwrap_or(s.len());
			(&s[..i], s.get(i + 1..).unwrap_or_default())
		}).try_for_each(|(key, value)| Ok::<_, ClientOptionsParseError>(match key {
			"appname"                  => self_.appname = Some(value.to_string()),
			"authMechanism"            => self_.credential
				.get_or_insert_with(Credential::default).mechanism = Some(value.to_string()),
			"authSource"               => self_.credential
				.get_or_insert_with(Credential::default).source = Some(value.to_string()),
			"compressors"              => self_.compressors = value.split(',')
				.filter_map(|s| s.parse().ok())
				.filter(|c| SUPPORTED_COMPRESSORS.contains(c))
				.collect(),
			"connectTimeoutMS"         => self_.connect_timeout = parse_millis("connectTimeoutMS", value)?,
			"directConnection"         => self_.direct_connection = Some(parse_bool("directConnection", value)?),
			"heartbeatFrequencyMS"     => self_.server_selection.heartbeat_frequency =
				parse_millis("heartbeatFrequencyMS", value)?,
			"loadBalanced"             => self_.load_balanced = parse_bool("loadBalanced", value)?,
			"localThresholdMS"         => self_.server_selection.local_threshold =
				parse_millis("localThresholdMS", value)?,
			"maxIdleTimeMS"            => self_.pool_options.max_idle_time = Some(parse_millis("maxIdleTimeMS", value)?)
				.filter(|d| !d.is_zero()),
			"maxPoolSize"              => self_.pool_options.max_pool_size = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("maxPoolSize", e)))?,
			"maxStalenessSeconds"      => self_.read_preference.max_staleness = match value.parse::<i64>()
				.map_err(|e| ClientOptionsParseError::from(("maxStalenessSeconds", e)))? {
				-1 => None,
				v if v < 0 => return Err(ClientOptionsParseError::from(("maxStalenessSeconds", v))),
				v => Some(Duration::from_secs(v as u64))
			},
			"minPoolSize"              => self_.pool_options.min_pool_size = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("minPoolSize", e)))?,
			"readConcernLevel"         => self_.read_concern = Some(ReadConcern { level: Some(value.parse()
				.map_err(|e| ClientOptionsParseError::from(("readConcernLevel", e)))?) }),
			"readPreference"           => self_.read_preference.mode = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("readPreference", e)))?,
			"readPreferenceTags"       => self_.read_preference.tag_sets.push(value.split(',')
				.filter(|s| !s.is_empty())
				.map(|s| {
					let i = s.find(':').unwrap_or(s.len());
					(s[..i].to_string(), s.get(i + 1..).unwrap_or_default().to_string())
				})
				.collect()),
			"replicaSet"               => self_.replica_set = Some(value.to_string()),
			"retryReads"               => self_.retry_reads = parse_bool("retryReads", value)?,
			"retryWrites"              => self_.retry_writes = parse_bool("retryWrites", value)?,
			"serverMonitoringMode"     => self_.server_monitoring_mode = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("serverMonitoringMode", e)))?,
			"serverSelectionTimeoutMS" => self_.server_selection.server_selection_timeout =
				parse_millis("serverSelectionTimeoutMS", value)?,
			"socketTimeoutMS"          => self_.socket_timeout = Some(parse_millis("socketTimeoutMS", value)?)
				.filter(|d| !d.is_zero()),
			"srvMaxHosts"              => self_.srv_max_hosts = value.parse()
				.map_err(|e| ClientOptionsParseError::from(("srvMaxHosts", e)))?,
			"tls" | "ssl"              => self_.tls = parse_bool("tls", value)?,
			"waitQueueTimeoutMS"       => self_.pool_options.wait_queue_timeout =
				Some(parse_millis("waitQueueTimeoutMS", value)?).filter(|d| !d.is_zero()),
			key => return Err(ClientOptionsParseError::InvalidKey(key.to_string()))
		}))?;

		if let Some(credential) = &mut self_.credential {
			if credential.source.is_none() {
				credential.source = self_.default_database.clone();
			}
		}

		self_.validate()?;
		Ok(self_)
	}
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Credential {
	pub username:  Option<String>,
	pub password:  Option<String>,
	pub source:    Option<String>,
	/// Mechanism name as sent to the server, e.g. `SCRAM-SHA-256`.
	pub mechanism: Option<String>
}

impl Credential {
	pub fn resolved_source(&self) -> &str {
		self.source.as_deref().unwrap_or("admin")
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst#connection-pool-options
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolOptions {
	/// 0 means unbounded
	pub max_pool_size:      usize,
	pub min_pool_size:      usize,
	pub max_idle_time:      Option<Duration>,
	pub wait_queue_timeout: Option<Duration>
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:      DEFAULT_MAX_POOL_SIZE,
			min_pool_size:      DEFAULT_MIN_POOL_SIZE,
			max_idle_time:      None,
			wait_queue_timeout: None
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerSelectionConfig {
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration,
	pub min_heartbeat_frequency:  Duration
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY,
			min_heartbeat_frequency:  DEFAULT_MIN_HEARTBEAT_FREQUENCY
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst#servermonitoringmode
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerMonitoringMode {
	Auto,
	Stream,
	Poll
}

impl FromStr for ServerMonitoringMode {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"auto"   => Self::Auto,
			"stream" => Self::Stream,
			"poll"   => Self::Poll,
			_ => return Err(s.to_string())
		})
	}
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:          ReadPreferenceMode,
	pub max_staleness: Option<Duration>,
	pub tag_sets:      Vec<HashMap<String, String>>
}

impl ReadPreference {
	pub fn primary() -> Self {
		Self::default()
	}

	pub fn with_mode(mode: ReadPreferenceMode) -> Self {
		Self { mode, ..Self::default() }
	}

	/// The `$readPreference` document forwarded to mongos.
	pub fn to_document(&self) -> Document {
		let mut doc = doc! { "mode": self.mode.as_str() };

		if !self.tag_sets.is_empty() {
			doc.insert("tags", self.tag_sets.iter()
				.map(|tags| tags.iter()
					.map(|(k, v)| (k.clone(), bson::Bson::String(v.clone())))
					.collect::<Document>())
				.collect::<Vec<_>>());
		}

		if let Some(staleness) = self.max_staleness {
			doc.insert("maxStalenessSeconds", staleness.as_secs() as i64);
		}

		doc
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default)]
pub enum ReadPreferenceMode {
	#[default]
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl ReadPreferenceMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Primary            => "primary",
			Self::PrimaryPreferred   => "primaryPreferred",
			Self::Secondary          => "secondary",
			Self::SecondaryPreferred => "secondaryPreferred",
			Self::Nearest            => "nearest"
		}
	}
}

impl FromStr for ReadPreferenceMode {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(s.to_string())
		})
	}
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct ReadConcern {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub level: Option<ReadConcernLevel>
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadConcernLevel {
	Local,
	Majority,
	Linearizable,
	Available,
	Snapshot
}

impl FromStr for ReadConcernLevel {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"local"        => Self::Local,
			"majority"     => Self::Majority,
			"linearizable" => Self::Linearizable,
			"available"    => Self::Available,
			"snapshot"     => Self::Snapshot,
			_ => return Err(s.to_string())
		})
	}
}

/// see https://docs.mongodb.com/manual/reference/command/aggregate/
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregateOptions {
	/// The number of documents to return per batch, applied to the aggregate command and every `getMore`.
	pub batch_size:        Option<u32>,
	pub max_time:          Option<Duration>,
	/// The time the server waits for new documents on a tailable await cursor, sent as `maxTimeMS` on `getMore`.
	pub max_await_time:    Option<Duration>,
	pub comment:           Option<String>,
	pub read_preference:   Option<ReadPreference>
}

/// see https://github.com/mongodb/specifications/blob/master/source/change-streams/change-streams.rst#options
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangeStreamOptions {
	pub full_document:           Option<FullDocument>,
	pub resume_after:            Option<crate::change_stream::ResumeToken>,
	pub start_after:             Option<crate::change_stream::ResumeToken>,
	pub start_at_operation_time: Option<Timestamp>,
	pub max_await_time:          Option<Duration>,
	pub batch_size:              Option<u32>,
	pub read_preference:         Option<ReadPreference>
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocument {
	Default,
	UpdateLookup,
	WhenAvailable,
	Required
}
