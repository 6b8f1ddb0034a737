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
		common::{ConnectionPoolOptions, HostAddress},
		description::{ServerDescription, TopologyDescription},
		error::Error
	},
	std::{fmt, sync::RwLock, time::Duration},
	bson::Document
};

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

/// Command, connection pool and SDAM monitoring events.
///
/// see https://github.com/mongodb/specifications/blob/master/source/command-logging-and-monitoring/command-logging-and-monitoring.rst,
/// https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst#events,
/// https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring-logging-and-monitoring.rst
#[derive(Debug)]
pub enum Event<'a> {
	CommandStarted {
		address:       &'a HostAddress,
		command:       &'a Document,
		database_name: &'a str,
		command_name:  Command,
		request_id:    i32,
		connection_id: u32
	},
	CommandSucceeded {
		address:       &'a HostAddress,
		duration:      Duration,
		reply:         &'a Document,
		command_name:  Command,
		request_id:    i32,
		connection_id: u32
	},
	CommandFailed {
		address:       &'a HostAddress,
		duration:      Duration,
		failure:       &'a Error,
		command_name:  Command,
		request_id:    i32,
		connection_id: u32
	},
	PoolCreated {
		address:       &'a HostAddress,
		options:       &'a ConnectionPoolOptions
	},
	PoolCleared {
		address:          &'a HostAddress,
		interrupt_in_use: bool
	},
	PoolClosed {
		address:       &'a HostAddress
	},
	ConnectionCreated {
		address:       &'a HostAddress,
		connection_id: u32
	},
	ConnectionReady {
		address:       &'a HostAddress,
		connection_id: u32,
		duration:      Duration
	},
	ConnectionClosed {
		address:       &'a HostAddress,
		connection_id: u32,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address:       &'a HostAddress
	},
	ConnectionCheckOutFailed {
		address:       &'a HostAddress,
		reason:        ConnectionCheckOutFailedReason,
		duration:      Duration
	},
	ConnectionCheckedOut {
		address:       &'a HostAddress,
		connection_id: u32,
		duration:      Duration
	},
	ConnectionCheckedIn {
		address:       &'a HostAddress,
		connection_id: u32
	},
	ServerHeartbeatStarted {
		address:       &'a HostAddress,
		awaited:       bool
	},
	ServerHeartbeatSucceeded {
		address:       &'a HostAddress,
		duration:      Duration,
		reply:         &'a Document,
		awaited:       bool
	},
	ServerHeartbeatFailed {
		address:       &'a HostAddress,
		duration:      Duration,
		failure:       &'a Error,
		awaited:       bool
	},
	ServerOpening {
		address:       &'a HostAddress
	},
	ServerClosed {
		address:       &'a HostAddress
	},
	ServerDescriptionChanged {
		address:       &'a HostAddress,
		previous:      &'a ServerDescription,
		new:           &'a ServerDescription
	},
	TopologyOpening,
	TopologyDescriptionChanged {
		previous:      &'a TopologyDescription,
		new:           &'a TopologyDescription
	},
	TopologyClosed
}

impl Event<'_> {
	pub fn name(&self) -> &'static str {
		match self {
			Self::CommandStarted { .. }             => "CommandStarted",
			Self::CommandSucceeded { .. }           => "CommandSucceeded",
			Self::CommandFailed { .. }              => "CommandFailed",
			Self::PoolCreated { .. }                => "PoolCreated",
			Self::PoolCleared { .. }                => "PoolCleared",
			Self::PoolClosed { .. }                 => "PoolClosed",
			Self::ConnectionCreated { .. }          => "ConnectionCreated",
			Self::ConnectionReady { .. }            => "ConnectionReady",
			Self::ConnectionClosed { .. }           => "ConnectionClosed",
			Self::ConnectionCheckOutStarted { .. }  => "ConnectionCheckOutStarted",
			Self::ConnectionCheckOutFailed { .. }   => "ConnectionCheckOutFailed",
			Self::ConnectionCheckedOut { .. }       => "ConnectionCheckedOut",
			Self::ConnectionCheckedIn { .. }        => "ConnectionCheckedIn",
			Self::ServerHeartbeatStarted { .. }     => "ServerHeartbeatStarted",
			Self::ServerHeartbeatSucceeded { .. }   => "ServerHeartbeatSucceeded",
			Self::ServerHeartbeatFailed { .. }      => "ServerHeartbeatFailed",
			Self::ServerOpening { .. }              => "ServerOpening",
			Self::ServerClosed { .. }               => "ServerClosed",
			Self::ServerDescriptionChanged { .. }   => "ServerDescriptionChanged",
			Self::TopologyOpening                   => "TopologyOpening",
			Self::TopologyDescriptionChanged { .. } => "TopologyDescriptionChanged",
			Self::TopologyClosed                    => "TopologyClosed"
		}
	}

	pub fn address(&self) -> Option<&HostAddress> {
		match self {
			Self::CommandStarted { address, .. }
			| Self::CommandSucceeded { address, .. }
			| Self::CommandFailed { address, .. }
			| Self::PoolCreated { address, .. }
			| Self::PoolCleared { address, .. }
			| Self::PoolClosed { address }
			| Self::ConnectionCreated { address, .. }
			| Self::ConnectionReady { address, .. }
			| Self::ConnectionClosed { address, .. }
			| Self::ConnectionCheckOutStarted { address }
			| Self::ConnectionCheckOutFailed { address, .. }
			| Self::ConnectionCheckedOut { address, .. }
			| Self::ConnectionCheckedIn { address, .. }
			| Self::ServerHeartbeatStarted { address, .. }
			| Self::ServerHeartbeatSucceeded { address, .. }
			| Self::ServerHeartbeatFailed { address, .. }
			| Self::ServerOpening { address }
			| Self::ServerClosed { address }
			| Self::ServerDescriptionChanged { address, .. } => Some(*address),
			Self::TopologyOpening
			| Self::TopologyDescriptionChanged { .. }
			| Self::TopologyClosed => None
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
	Aggregate,
	GetMore,
	KillCursors,
	EndSessions,
	Hello,
	IsMaster,
	Ping,
	SaslStart,
	SaslContinue,
	Other
}

impl From<&str> for Command {
	fn from(s: &str) -> Self {
		use self::Command::*;
		match s {
			"aggregate"            => Aggregate,
			"getMore"              => GetMore,
			"killCursors"          => KillCursors,
			"endSessions"          => EndSessions,
			"hello"                => Hello,
			"isMaster" | "ismaster" => IsMaster,
			"ping"                 => Ping,
			"saslStart"            => SaslStart,
			"saslContinue"         => SaslContinue,
			_                      => Other
		}
	}
}

impl Command {
	/// Commands whose payloads are redacted from monitoring.
	pub fn is_sensitive(self) -> bool {
		matches!(self, Self::SaslStart | Self::SaslContinue)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	ConnectionError
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Error,
	PoolClosed
}

/// The registered listeners of a client, shared with every component that emits events.
#[derive(Default)]
pub struct Listeners(RwLock<Vec<EventListener>>);

impl Listeners {
	pub fn add(&self, listener: EventListener) {
		match self.0.write() {
			Ok(mut listeners) => listeners.push(listener),
			Err(_) => tracing::warn!("event listener lock poisoned, listener dropped")
		}
	}

	pub fn dispatch(&self, event: Event) {
		match event.address() {
			Some(address) => tracing::debug!(target: "mongo_driver_core::apm", %address, "{}", event.name()),
			None => tracing::debug!(target: "mongo_driver_core::apm", "{}", event.name())
		}

		if let Ok(listeners) = self.0.read() {
			for listener in listeners.iter() {
				listener(&event);
			}
		}
	}
}

impl fmt::Debug for Listeners {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Listeners")
			.field("len", &self.0.read().map(|l| l.len()).unwrap_or_default())
			.finish()
	}
}
