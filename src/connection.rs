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
		apm::{Command, Event, Listeners},
		common::{ClientOptions, Credential, HostAddress},
		description::ServerType,
		error::{check_reply, Error, Result},
		utils::{command_name, DebugWrapper},
		wire::{self, Compressor, ClientMetadata, HelloReply, HelloRequest, Message},
		auth::Authenticator
	},
	std::{fmt, io, sync::Arc, time::{Duration, Instant}},
	async_std::{channel::{self, Receiver, Sender}, net::TcpStream},
	futures::{future::{self, Either}, io::{AsyncRead, AsyncWrite}, pin_mut},
	async_trait::async_trait,
	bson::{Document, oid::ObjectId}
};

/// A bidirectional byte stream a connection runs on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Opens transport streams, the seam for TLS configuration, proxies and tests.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(&self, address: &HostAddress) -> Result<Box<dyn AsyncStream>>;
}

/// Plain TCP, wrapped in TLS if requested.
#[derive(Debug, Copy, Clone, Default)]
pub struct TcpConnector {
	pub tls: bool
}

#[async_trait]
impl Connector for TcpConnector {
	async fn connect(&self, address: &HostAddress) -> Result<Box<dyn AsyncStream>> {
		let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
		stream.set_nodelay(true)?;

		if self.tls {
			#[cfg(feature = "tls")]
			return Ok(Box::new(async_tls::TlsConnector::default().connect(&address.host, stream).await?));
			#[cfg(not(feature = "tls"))]
			return Err(io::Error::new(io::ErrorKind::Unsupported, "tls support is not enabled").into());
		}

		Ok(Box::new(stream))
	}
}

/// What the handshake revealed about the server on the other end of a connection.
#[derive(Debug, Clone)]
pub struct StreamDescription {
	pub address:                         HostAddress,
	pub server_type:                     ServerType,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub max_message_size_bytes:          usize,
	pub logical_session_timeout_minutes: Option<i64>,
	pub hello_ok:                        bool,
	pub service_id:                      Option<ObjectId>
}

impl StreamDescription {
	fn new(address: &HostAddress, reply: &HelloReply, max_message_size: usize) -> Self {
		Self {
			address:                         address.clone(),
			server_type:                     crate::description::ServerDescription::from_hello(
				address.clone(), reply.clone(), Duration::ZERO).r#type,
			min_wire_version:                reply.min_wire_version,
			max_wire_version:                reply.max_wire_version,
			max_message_size_bytes:          reply.max_message_size_bytes
				.map_or(max_message_size, |size| size.max(0) as usize),
			logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
			hello_ok:                        reply.hello_ok,
			service_id:                      reply.service_id
		}
	}
}

/// A single authenticated connection to a server.
///
/// see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst#connection
pub struct Connection {
	pub(crate) id:          u32,
	pub(crate) generation:  u32,
	pub(crate) address:     HostAddress,
	pub(crate) ready_at:    Instant,
	pub(crate) last_used:   Instant,
	stream:                 Box<dyn AsyncStream>,
	description:            Option<StreamDescription>,
	compressor:             Option<Compressor>,
	listeners:              Option<Arc<Listeners>>,
	socket_timeout:         Option<Duration>,
	max_message_size:       usize,
	interrupt:              (Sender<()>, Receiver<()>),
	pending:                bool,
	errored:                bool,
	more_to_come:           bool
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("generation", &self.generation)
			.field("address", &self.address)
			.field("errored", &self.errored)
			.finish_non_exhaustive()
	}
}

impl Connection {
	fn new(
		id:               u32,
		generation:       u32,
		address:          HostAddress,
		stream:           Box<dyn AsyncStream>,
		max_message_size: usize
	) -> Self {
		let now = Instant::now();
		Self {
			id,
			generation,
			address,
			ready_at:         now,
			last_used:        now,
			stream,
			description:      None,
			compressor:       None,
			listeners:        None,
			socket_timeout:   None,
			max_message_size,
			interrupt:        channel::bounded(1),
			pending:          false,
			errored:          false,
			more_to_come:     false
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn generation(&self) -> u32 {
		self.generation
	}

	pub fn address(&self) -> &HostAddress {
		&self.address
	}

	pub fn description(&self) -> Option<&StreamDescription> {
		self.description.as_ref()
	}

	pub fn max_wire_version(&self) -> i32 {
		self.description.as_ref().map_or(0, |d| d.max_wire_version)
	}

	/// `false` once the connection failed at the network level, was interrupted mid-command or
	/// still has an unread reply in flight.
	pub fn is_reusable(&self) -> bool {
		!self.errored && !self.pending && !self.more_to_come
	}

	pub(crate) fn is_streaming(&self) -> bool {
		self.more_to_come && !self.errored
	}

	/// A handle the pool uses to abort whatever this connection is currently waiting for.
	pub(crate) fn interrupt_handle(&self) -> Sender<()> {
		self.interrupt.0.clone()
	}

	/// Runs a command against `db`, returning the reply if it has `ok: 1`.
	pub async fn command(&mut self, db: &str, command: Document) -> Result<Document> {
		let timeout = self.socket_timeout;
		self.execute(db, command, 0, timeout).await
	}

	pub(crate) async fn execute(
		&mut self,
		db:      &str,
		mut command: Document,
		flags:   u32,
		timeout: Option<Duration>
	) -> Result<Document> {
		if self.errored {
			return Err(io::Error::new(io::ErrorKind::NotConnected,
				format!("connection {} to {} is no longer usable", self.id, self.address)).into());
		}

		command.insert("$db", db);
		let name = command_name(&command).to_string();
		let kind = Command::from(name.as_str());
		let compressor = self.compressor.filter(|_| wire::may_compress(&name));
		let message = Message::new(command, flags);

		let redacted = Document::new();
		if let Some(listeners) = &self.listeners {
			listeners.dispatch(Event::CommandStarted {
				address:       &self.address,
				command:       if kind.is_sensitive() { &redacted } else { &message.document },
				database_name: db,
				command_name:  kind,
				request_id:    message.request_id,
				connection_id: self.id
			});
		}

		let start = Instant::now();
		let result = self.exchange(Some(&message), compressor, timeout).await
			.and_then(|reply| check_reply(reply.document));

		if let Some(listeners) = &self.listeners {
			listeners.dispatch(match &result {
				Ok(reply) => Event::CommandSucceeded {
					address:       &self.address,
					duration:      start.elapsed(),
					reply:         if kind.is_sensitive() { &redacted } else { reply },
					command_name:  kind,
					request_id:    message.request_id,
					connection_id: self.id
				},
				Err(failure) => Event::CommandFailed {
					address:       &self.address,
					duration:      start.elapsed(),
					failure,
					command_name:  kind,
					request_id:    message.request_id,
					connection_id: self.id
				}
			});
		}

		self.last_used = Instant::now();
		result
	}

	/// Reads the next reply of an exhaust stream without sending anything.
	pub(crate) async fn receive_more(&mut self, timeout: Option<Duration>) -> Result<Document> {
		let reply = self.exchange(None, None, timeout).await?;
		check_reply(reply.document)
	}

	async fn exchange(
		&mut self,
		message:    Option<&Message>,
		compressor: Option<Compressor>,
		timeout:    Option<Duration>
	) -> Result<Message> {
		self.pending = true;

		let result = {
			let Self { stream, interrupt, address, id, max_message_size, .. } = self;
			let max_message_size = *max_message_size;

			let io = async {
				if let Some(message) = message {
					message.write_to(&mut **stream, compressor).await?;
				}
				Message::read_from(&mut **stream, max_message_size).await
			};

			let io = async {
				match timeout {
					Some(timeout) => match async_std::future::timeout(timeout, io).await {
						Ok(result) => result,
						Err(e) => Err(Error::from(e))
					},
					None => io.await
				}
			};

			let interrupted = interrupt.1.recv();
			pin_mut!(io, interrupted);

			match future::select(io, interrupted).await {
				Either::Left((result, _)) => result,
				Either::Right(_) => Err(Error::PoolCleared { address: address.clone(), connection_id: *id })
			}
		};

		match result {
			Ok(reply) => {
				if let Some(message) = message {
					if reply.response_to != message.request_id {
						self.errored = true;
						return Err(wire::InvalidReplyError::ResponseTo {
							expected: message.request_id,
							actual:   reply.response_to
						}.into());
					}
				}

				self.pending = false;
				self.more_to_come = reply.more_to_come();
				Ok(reply)
			}
			Err(e) => {
				self.errored = true;
				Err(e)
			}
		}
	}
}

/// The result of a successful handshake.
#[derive(Debug, Clone)]
pub(crate) struct Handshake {
	pub reply:    HelloReply,
	pub document: Document,
	pub rtt:      Duration
}

/// Opens connections and runs the handshake and authentication on them.
///
/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug)]
pub(crate) struct ConnectionEstablisher {
	connector:        DebugWrapper<Arc<dyn Connector>>,
	authenticator:    Option<DebugWrapper<Arc<dyn Authenticator>>>,
	credential:       Option<Credential>,
	appname:          Option<String>,
	compressors:      Vec<Compressor>,
	connect_timeout:  Duration,
	socket_timeout:   Option<Duration>,
	max_message_size: usize,
	load_balanced:    bool
}

impl ConnectionEstablisher {
	pub fn new(options: &ClientOptions) -> Self {
		Self {
			connector:        options.connector.clone()
				.unwrap_or_else(|| DebugWrapper(Arc::new(TcpConnector { tls: options.tls }))),
			authenticator:    options.authenticator.clone(),
			credential:       options.credential.clone(),
			appname:          options.appname.clone(),
			compressors:      options.compressors.clone(),
			connect_timeout:  options.connect_timeout,
			socket_timeout:   options.socket_timeout,
			max_message_size: options.max_message_size,
			load_balanced:    options.load_balanced
		}
	}

	pub fn connect_timeout(&self) -> Duration {
		self.connect_timeout
	}

	/// Establishes a pooled application connection.
	pub async fn establish(
		&self,
		address:    &HostAddress,
		id:         u32,
		generation: u32,
		listeners:  Arc<Listeners>
	) -> Result<Connection> {
		let (mut connection, handshake) = self.open(address, id, generation, true).await?;

		if let Some(credential) = self.credential.as_ref().filter(|c| c.username.is_some() || c.mechanism.is_some()) {
			let authenticator = self.authenticator.as_ref()
				.ok_or_else(|| Error::Auth("credentials were given but no authenticator is configured".to_string()))?;
			let mechanism = credential.negotiate_mechanism(&handshake.reply);
			authenticator.authenticate(&mut connection, credential, mechanism, &handshake.reply).await?;
		}

		connection.socket_timeout = self.socket_timeout;
		connection.listeners = Some(listeners);
		Ok(connection)
	}

	/// Establishes a connection used only for heartbeats and RTT measurements,
	/// it is never authenticated and never emits command events.
	pub async fn establish_monitoring(&self, address: &HostAddress) -> Result<(Connection, Handshake)> {
		self.open(address, 0, 0, false).await
	}

	async fn open(
		&self,
		address:    &HostAddress,
		id:         u32,
		generation: u32,
		negotiate:  bool
	) -> Result<(Connection, Handshake)> {
		let start = Instant::now();
		let stream = match async_std::future::timeout(self.connect_timeout, self.connector.connect(address)).await {
			Ok(stream) => stream?,
			Err(e) => return Err(e.into())
		};

		let mut connection = Connection::new(id, generation, address.clone(), stream, self.max_message_size);

		let sasl_supported_mechs = self.credential.as_ref()
			.filter(|_| negotiate)
			.and_then(Credential::sasl_supported_mechs);
		let hello = bson::to_document(&HelloRequest {
			client:           Some(ClientMetadata::new(self.appname.as_deref())),
			compression:      Some(self.compressors.as_slice()).filter(|c| !c.is_empty()),
			sasl_supported_mechs,
			load_balanced:    self.load_balanced,
			..HelloRequest::new(self.load_balanced)
		})?;

		let document = connection.execute("admin", hello, 0, Some(self.connect_timeout)).await?;
		let rtt = start.elapsed();
		let reply: HelloReply = bson::from_document(document.clone())?;

		connection.compressor = self.compressors.iter()
			.find(|c| reply.compression.as_ref().map_or(false, |offered| offered.contains(c)))
			.copied();
		connection.description = Some(StreamDescription::new(address, &reply, self.max_message_size));

		Ok((connection, Handshake { reply, document, rtt }))
	}
}
