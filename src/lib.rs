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

#![warn(clippy::all)]
#![allow(clippy::from_over_into)]
#![forbid(unsafe_code)]

use {
	self::{
		apm::{Event, EventListener, Listeners},
		description::{ServerType, TopologyType},
		error::RETRYABLE_WRITE_ERROR,
		selection::Selector,
		server::Server,
		session::ServerSession,
		topology::Topology
	},
	std::{sync::Arc, time::Duration},
	bson::{doc, Document}
};

pub use self::{
	change_stream::{ChangeStream, ChangeStreamEvent, OperationType, ResumeToken},
	common::*,
	cursor::Cursor,
	db::{Collection, Database, Namespace},
	error::{Error, Result}
};

pub mod apm;
pub mod auth;
pub mod change_stream;
pub mod common;
pub mod connection;
pub mod cursor;
pub mod db;
pub mod description;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod selection;
pub mod server;
pub mod session;
pub mod srv;
pub mod topology;
pub mod utils;
pub mod wire;

pub static DRIVER_NAME: &str = "mongo-driver-core";

/// Server selection timeout for the best-effort `endSessions` on close.
const END_SESSIONS_TIMEOUT: Duration = Duration::from_secs(1);

/// `endSessions` accepts at most this many ids per command.
const END_SESSIONS_BATCH: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

#[derive(Debug)]
pub struct ClientInner {
	topology:  Topology,
	listeners: Arc<Listeners>
}

impl std::ops::Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Client {
	/// Validates the options, resolves the seed list and waits until a server matching the read
	/// preference is selectable, failing after the server selection timeout.
	pub async fn connect(options: ClientOptions) -> Result<Self> {
		Self::connect_with_listeners(options, Vec::new()).await
	}

	/// Like `connect`, but the listeners also observe the events emitted while the topology opens.
	pub async fn connect_with_listeners(options: ClientOptions, listeners: Vec<EventListener>) -> Result<Self> {
		options.validate()?;
		let (seeds, srv_ttl) = srv::resolve_seed_list(&options).await?;

		let registry = Arc::new(Listeners::default());
		listeners.into_iter().for_each(|listener| registry.add(listener));

		tracing::debug!(hosts = seeds.len(), replica_set = ?options.replica_set, "connecting");
		let selector = Selector::Read(options.read_preference.clone());
		let topology = Topology::new(options, registry.clone(), seeds, srv_ttl);

		// resolves once a server matching the read preference was discovered
		if let Err(e) = topology.select_server(&selector, None).await {
			tracing::debug!(error = %e, "initial server selection failed");
			topology.close().await;
			return Err(e);
		}

		Ok(Self(Arc::new(ClientInner { topology, listeners: registry })))
	}

	pub fn options(&self) -> &ClientOptions {
		self.topology.options()
	}

	pub fn topology(&self) -> &Topology {
		&self.topology
	}

	pub fn add_event_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
		self.listeners.add(Box::new(listener));
	}

	pub fn database(&self, name: &str) -> Database {
		Database::new(self.clone(), name)
	}

	/// The database named in the connection string, if any.
	pub fn default_database(&self) -> Option<Database> {
		self.options().default_database.as_deref().map(|name| self.database(name))
	}

	/// Watches all changes of the deployment.
	pub fn watch(&self, pipeline: Vec<Document>, options: ChangeStreamOptions) -> Result<ChangeStream> {
		ChangeStream::new(self.clone(), change_stream::ChangeStreamTarget::Cluster, pipeline, options)
	}

	/// Selects a server and runs `command` on it, retrying once if `retryable` is set, the matching
	/// `retryReads`/`retryWrites` option is enabled and the first attempt failed with a retryable error.
	pub async fn run_command(&self, db: &str, command: Document, selector: &Selector, retryable: bool) -> Result<Document> {
		let is_write = matches!(selector, Selector::Write);
		let retry = retryable && match is_write {
			true  => self.options().retry_writes,
			false => self.options().retry_reads
		};

		let server = self.topology.select_server(selector, None).await?;
		let error = match self.execute_with_implicit_session(&server, db, command.clone(), selector.read_preference()).await {
			Ok(reply) => return Ok(reply),
			Err(e) if retry && (e.is_retryable_read() || (is_write && e.has_label(RETRYABLE_WRITE_ERROR))) => e,
			Err(e) => return Err(e)
		};

		tracing::debug!(%error, command = utils::command_name(&command), "retrying command");
		let server = match self.topology.select_server(selector, None).await {
			Ok(server) => server,
			Err(_) => return Err(error)
		};
		self.execute_with_implicit_session(&server, db, command, selector.read_preference()).await
	}

	async fn execute_with_implicit_session(
		&self,
		server:          &Server,
		db:              &str,
		command:         Document,
		read_preference: Option<&ReadPreference>
	) -> Result<Document> {
		let mut session = self.start_implicit_session()?;
		let result = self.execute(server, db, command, read_preference, session.as_mut()).await;
		self.end_implicit_session(session)?;
		result
	}

	/// A pooled server session if the deployment supports sessions.
	pub(crate) fn start_implicit_session(&self) -> Result<Option<ServerSession>> {
		match self.topology.description().logical_session_timeout_minutes {
			Some(timeout) => self.topology.sessions().acquire(timeout).map(Some),
			None => Ok(None)
		}
	}

	pub(crate) fn end_implicit_session(&self, session: Option<ServerSession>) -> Result<()> {
		match session {
			Some(session) => self.topology.sessions().release(
				session, self.topology.description().logical_session_timeout_minutes),
			None => Ok(())
		}
	}

	/// Runs `command` on a connection of `server`, attaching `$readPreference` and `lsid` as needed.
	pub(crate) async fn execute(
		&self,
		server:          &Server,
		db:              &str,
		mut command:     Document,
		read_preference: Option<&ReadPreference>,
		session:         Option<&mut ServerSession>
	) -> Result<Document> {
		let server_type = server.description().map_or(ServerType::Unknown, |d| d.r#type);
		match read_preference {
			Some(read_preference) if server_type == ServerType::Mongos
				&& read_preference.mode != ReadPreferenceMode::Primary =>
				{ command.insert("$readPreference", read_preference.to_document()); }
			// direct connections may read from any member
			Some(_) if self.topology.description().r#type == TopologyType::Single && server_type != ServerType::Mongos =>
				{ command.insert("$readPreference", doc! { "mode": ReadPreferenceMode::PrimaryPreferred.as_str() }); }
			_ => ()
		}

		let mut connection = server.check_out(None).await?;
		let generation = connection.generation();

		let session = match session {
			Some(session) => {
				command.insert("lsid", session.id().clone());
				session.touch();
				Some(session)
			}
			None => None
		};

		match connection.command(db, command).await {
			Ok(reply) => Ok(reply),
			Err(e) => {
				if let (Some(session), true) = (session, e.is_network_error()) {
					session.dirty = true;
				}
				server.handle_application_error(&e, generation, true);
				Err(e)
			}
		}
	}

	/// Ends pooled sessions on a best-effort basis and closes the topology.
	pub async fn close(&self) {
		let ids = self.topology.sessions().drain();
		if !ids.is_empty() {
			let selector = Selector::Read(ReadPreference::with_mode(ReadPreferenceMode::PrimaryPreferred));
			if let Ok(server) = self.topology.select_server(&selector, Some(END_SESSIONS_TIMEOUT)).await {
				for ids in ids.chunks(END_SESSIONS_BATCH) {
					if let Err(e) = server.run_command("admin", doc! { "endSessions": ids.to_vec() }).await {
						tracing::debug!(error = %e, "endSessions failed");
					}
				}
			}
		}

		self.topology.close().await;
	}
}
