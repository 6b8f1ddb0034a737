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
		apm::{ConnectionCheckOutFailedReason, ConnectionClosedReason, Event, Listeners},
		common::{ConnectionPoolOptions, HostAddress},
		connection::{Connection, ConnectionEstablisher},
		error::{Error, Result}
	},
	std::{
		collections::{HashMap, VecDeque},
		ops::{Deref, DerefMut},
		sync::{Arc, Mutex, MutexGuard, Weak},
		time::{Duration, Instant}
	},
	async_std::{channel::{self, Receiver, Sender}, task}
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// Called with establishment errors and the generation the connection was created for.
pub(crate) type ErrorHook = Arc<dyn Fn(&Error, u32) + Send + Sync>;

/// What a waiter in the queue is handed.
enum Grant {
	Connection(Connection),
	/// Permission to establish a new connection, the slot is already counted.
	Create { id: u32, generation: u32 }
}

struct PoolState {
	generation: u32,
	next_id:    u32,
	/// most recently used at the back
	idle:       VecDeque<Connection>,
	/// idle, in use and pending connections
	total:      usize,
	pending:    usize,
	waiters:    VecDeque<Sender<Grant>>,
	in_use:     HashMap<u32, Sender<()>>,
	closed:     bool
}

struct PoolInner {
	address:     HostAddress,
	options:     ConnectionPoolOptions,
	establisher: Arc<ConnectionEstablisher>,
	listeners:   Arc<Listeners>,
	on_error:    ErrorHook,
	state:       Mutex<PoolState>
}

/// A bounded set of connections to a single server.
///
/// see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst
#[derive(Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

impl std::fmt::Debug for ConnectionPool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("address", &self.0.address)
			.field("options", &self.0.options)
			.field("generation", &self.generation())
			.field("total", &self.total_count())
			.finish()
	}
}

impl ConnectionPool {
	pub(crate) fn new(
		address:     HostAddress,
		options:     ConnectionPoolOptions,
		establisher: Arc<ConnectionEstablisher>,
		listeners:   Arc<Listeners>,
		on_error:    ErrorHook
	) -> Self {
		let pool = Self(Arc::new(PoolInner {
			address,
			options,
			establisher,
			listeners,
			on_error,
			state: Mutex::new(PoolState {
				generation: 0,
				next_id:    1,
				idle:       VecDeque::new(),
				total:      0,
				pending:    0,
				waiters:    VecDeque::new(),
				in_use:     HashMap::new(),
				closed:     false
			})
		}));

		pool.0.listeners.dispatch(Event::PoolCreated { address: &pool.0.address, options: &pool.0.options });
		task::spawn(maintain(Arc::downgrade(&pool.0)));
		pool
	}

	pub fn address(&self) -> &HostAddress {
		&self.0.address
	}

	pub fn options(&self) -> &ConnectionPoolOptions {
		&self.0.options
	}

	pub fn generation(&self) -> u32 {
		self.0.state().map_or(0, |state| state.generation)
	}

	/// Number of idle connections.
	pub fn available_count(&self) -> usize {
		self.0.state().map_or(0, |state| state.idle.len())
	}

	/// Number of idle, in use and pending connections.
	pub fn total_count(&self) -> usize {
		self.0.state().map_or(0, |state| state.total)
	}

	pub fn is_closed(&self) -> bool {
		self.0.state().map_or(true, |state| state.closed)
	}

	/// Checks out a connection of the current generation, creating one if the pool is below
	/// `maxPoolSize` and queueing otherwise. `timeout` defaults to `waitQueueTimeoutMS`.
	pub async fn check_out(&self, timeout: Option<Duration>) -> Result<PooledConnection> {
		let start = Instant::now();
		let inner = &self.0;
		inner.listeners.dispatch(Event::ConnectionCheckOutStarted { address: &inner.address });

		match inner.check_out(timeout.or(inner.options.wait_queue_timeout), start).await {
			Ok(connection) => {
				inner.listeners.dispatch(Event::ConnectionCheckedOut {
					address:       &inner.address,
					connection_id: connection.id,
					duration:      start.elapsed()
				});
				Ok(PooledConnection { connection: Some(connection), pool: self.clone() })
			}
			Err(e) => {
				inner.listeners.dispatch(Event::ConnectionCheckOutFailed {
					address:  &inner.address,
					reason:   match e {
						Error::PoolClosed(_)           => ConnectionCheckOutFailedReason::PoolClosed,
						Error::WaitQueueTimeout { .. } => ConnectionCheckOutFailedReason::Timeout,
						_                              => ConnectionCheckOutFailedReason::ConnectionError
					},
					duration: start.elapsed()
				});
				Err(e)
			}
		}
	}

	/// Returns a connection to the pool, destroying it if it is stale, errored or the pool is closed.
	pub fn check_in(&self, connection: Connection) {
		self.0.check_in(connection)
	}

	/// Invalidates all current connections by bumping the generation. Idle connections are closed
	/// right away, in-use ones on check-in, or immediately if `interrupt_in_use` is set.
	pub fn clear(&self, interrupt_in_use: bool) {
		let inner = &self.0;
		let stale = match inner.state() {
			Ok(mut state) if !state.closed => {
				state.generation += 1;
				if interrupt_in_use {
					state.in_use.values().for_each(|handle| { handle.close(); });
				}
				let stale = state.idle.drain(..).collect::<Vec<_>>();
				state.total -= stale.len();
				stale
			}
			_ => return
		};

		tracing::debug!(address = %inner.address, interrupt_in_use, "connection pool cleared");
		inner.listeners.dispatch(Event::PoolCleared { address: &inner.address, interrupt_in_use });
		for connection in stale {
			inner.closed(&connection, ConnectionClosedReason::Stale);
		}
		inner.process_wait_queue();
	}

	/// Closes all idle connections and rejects queued and future check-outs.
	pub fn close(&self) {
		let inner = &self.0;
		let (idle, waiters) = match inner.state() {
			Ok(mut state) if !state.closed => {
				state.closed = true;
				let idle = state.idle.drain(..).collect::<Vec<_>>();
				state.total -= idle.len();
				(idle, state.waiters.drain(..).collect::<Vec<_>>())
			}
			_ => return
		};

		waiters.iter().for_each(|waiter| { waiter.close(); });
		for connection in idle {
			inner.closed(&connection, ConnectionClosedReason::PoolClosed);
		}
		inner.listeners.dispatch(Event::PoolClosed { address: &inner.address });
	}
}

impl PoolInner {
	fn state(&self) -> Result<MutexGuard<PoolState>> {
		Ok(self.state.lock()?)
	}

	async fn check_out(&self, timeout: Option<Duration>, start: Instant) -> Result<Connection> {
		let waiter = {
			let mut state = self.state()?;
			if state.closed {
				return Err(Error::PoolClosed(self.address.clone()));
			}

			let (sender, receiver) = channel::bounded(1);
			state.waiters.push_back(sender);
			Waiter { pool: self, receiver }
		};

		self.process_wait_queue();

		let grant = match timeout {
			Some(timeout) => match async_std::future::timeout(timeout, waiter.receiver.recv()).await {
				Ok(grant) => grant,
				Err(_) => return Err(Error::WaitQueueTimeout { address: self.address.clone(), waited: start.elapsed() })
			},
			None => waiter.receiver.recv().await
		};
		drop(waiter);

		match grant {
			Ok(Grant::Connection(connection)) => {
				self.state()?.in_use.insert(connection.id, connection.interrupt_handle());
				Ok(connection)
			}
			Ok(Grant::Create { id, generation }) => self.create(id, generation).await,
			Err(_) => Err(Error::PoolClosed(self.address.clone()))
		}
	}

	/// Establishes a connection for a reserved slot.
	async fn create(&self, id: u32, generation: u32) -> Result<Connection> {
		let mut reservation = Reservation { pool: self, armed: true };
		let start = Instant::now();
		self.listeners.dispatch(Event::ConnectionCreated { address: &self.address, connection_id: id });

		match self.establisher.establish(&self.address, id, generation, self.listeners.clone()).await {
			Ok(connection) => {
				self.listeners.dispatch(Event::ConnectionReady {
					address:       &self.address,
					connection_id: id,
					duration:      start.elapsed()
				});

				reservation.armed = false;
				let mut state = self.state()?;
				state.pending -= 1;
				state.in_use.insert(id, connection.interrupt_handle());
				Ok(connection)
			}
			Err(e) => {
				tracing::debug!(address = %self.address, connection_id = id, error = %e, "failed to establish connection");
				drop(reservation);
				self.listeners.dispatch(Event::ConnectionClosed {
					address:       &self.address,
					connection_id: id,
					reason:        ConnectionClosedReason::Error
				});
				(self.on_error)(&e, generation);
				Err(e)
			}
		}
	}

	fn check_in(&self, mut connection: Connection) {
		self.listeners.dispatch(Event::ConnectionCheckedIn { address: &self.address, connection_id: connection.id });

		let closed = match self.state() {
			Ok(mut state) => {
				state.in_use.remove(&connection.id);
				let reason = if state.closed {
					Some(ConnectionClosedReason::PoolClosed)
				} else if connection.generation != state.generation {
					Some(ConnectionClosedReason::Stale)
				} else if !connection.is_reusable() {
					Some(ConnectionClosedReason::Error)
				} else {
					None
				};

				match reason {
					Some(reason) => {
						state.total -= 1;
						Some((connection, reason))
					}
					None => {
						connection.last_used = Instant::now();
						state.idle.push_back(connection);
						None
					}
				}
			}
			Err(e) => {
				tracing::warn!(address = %self.address, error = %e, "dropping connection");
				Some((connection, ConnectionClosedReason::Error))
			}
		};

		if let Some((connection, reason)) = closed {
			self.closed(&connection, reason);
		}
		self.process_wait_queue();
	}

	/// Hands out idle connections or creation permits to waiters in FIFO order.
	fn process_wait_queue(&self) {
		loop {
			let mut stale = Vec::new();
			let next = match self.state() {
				Ok(mut state) => 'next: {
					while let Some(waiter) = state.waiters.front() {
						if !waiter.is_closed() {
							break;
						}
						state.waiters.pop_front();
					}

					if state.waiters.is_empty() {
						break 'next None;
					}

					let generation = state.generation;
					let max_idle_time = self.options.max_idle_time;
					let grant = loop {
						match state.idle.pop_back() {
							Some(connection) if connection.generation != generation => {
								state.total -= 1;
								stale.push((connection, ConnectionClosedReason::Stale));
							}
							Some(connection) if max_idle_time.map_or(false, |max| connection.last_used.elapsed() >= max) => {
								state.total -= 1;
								stale.push((connection, ConnectionClosedReason::Idle));
							}
							Some(connection) => break Some(Grant::Connection(connection)),
							None => break None
						}
					};

					let grant = match grant {
						Some(grant) => grant,
						None if self.options.max_pool_size == 0 || state.total < self.options.max_pool_size => {
							let id = state.next_id;
							state.next_id += 1;
							state.total += 1;
							state.pending += 1;
							Grant::Create { id, generation }
						}
						None => break 'next None
					};

					state.waiters.pop_front().map(|waiter| (waiter, grant))
				}
				Err(_) => None
			};

			for (connection, reason) in stale {
				self.closed(&connection, reason);
			}

			match next {
				Some((waiter, grant)) => if let Err(e) = waiter.try_send(grant) {
					self.reclaim(e.into_inner());
				},
				None => return
			}
		}
	}

	/// Takes back a grant nobody received.
	fn reclaim(&self, grant: Grant) {
		match grant {
			Grant::Connection(mut connection) => {
				let reason = match self.state() {
					Ok(mut state) if !state.closed && connection.generation == state.generation => {
						connection.last_used = Instant::now();
						state.idle.push_back(connection);
						return;
					}
					Ok(mut state) => {
						state.total -= 1;
						if state.closed { ConnectionClosedReason::PoolClosed } else { ConnectionClosedReason::Stale }
					}
					Err(_) => ConnectionClosedReason::Error
				};
				self.closed(&connection, reason);
			}
			Grant::Create { .. } => if let Ok(mut state) = self.state() {
				state.total -= 1;
				state.pending -= 1;
			}
		}
	}

	fn closed(&self, connection: &Connection, reason: ConnectionClosedReason) {
		self.listeners.dispatch(Event::ConnectionClosed {
			address:       &self.address,
			connection_id: connection.id,
			reason
		});
	}

	/// Drops expired idle connections and tops the pool up to `minPoolSize`.
	async fn maintain_once(&self) -> Result<()> {
		let expired = {
			let mut state = self.state()?;
			let (generation, max_idle_time) = (state.generation, self.options.max_idle_time);
			let mut expired = Vec::new();
			state.idle.retain_mut(|connection| {
				let reason = if connection.generation != generation {
					Some(ConnectionClosedReason::Stale)
				} else if max_idle_time.map_or(false, |max| connection.last_used.elapsed() >= max) {
					Some(ConnectionClosedReason::Idle)
				} else {
					None
				};
				if let Some(reason) = reason {
					expired.push((connection.id, reason));
				}
				reason.is_none()
			});
			state.total -= expired.len();
			expired
		};

		for (connection_id, reason) in expired {
			self.listeners.dispatch(Event::ConnectionClosed { address: &self.address, connection_id, reason });
		}

		loop {
			let (id, generation) = {
				let mut state = self.state()?;
				let max = self.options.max_pool_size;
				if state.closed || state.total >= self.options.min_pool_size || (max != 0 && state.total >= max) {
					return Ok(());
				}

				let id = state.next_id;
				state.next_id += 1;
				state.total += 1;
				state.pending += 1;
				(id, state.generation)
			};

			let connection = self.create(id, generation).await?;
			self.state()?.in_use.remove(&connection.id);
			self.reclaim(Grant::Connection(connection));
			self.process_wait_queue();
		}
	}
}

/// A queued check-out, grants that arrive after it is abandoned go back to the pool.
struct Waiter<'a> {
	pool:     &'a PoolInner,
	receiver: Receiver<Grant>
}

impl Drop for Waiter<'_> {
	fn drop(&mut self) {
		self.receiver.close();
		let mut reclaimed = false;
		while let Ok(grant) = self.receiver.try_recv() {
			self.pool.reclaim(grant);
			reclaimed = true;
		}
		if reclaimed {
			self.pool.process_wait_queue();
		}
	}
}

/// Releases a reserved slot if establishment does not complete.
struct Reservation<'a> {
	pool:  &'a PoolInner,
	armed: bool
}

impl Drop for Reservation<'_> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}

		if let Ok(mut state) = self.pool.state() {
			state.total -= 1;
			state.pending -= 1;
		}
		self.pool.process_wait_queue();
	}
}

async fn maintain(pool: Weak<PoolInner>) {
	loop {
		task::sleep(MAINTENANCE_INTERVAL).await;

		let pool = match pool.upgrade() {
			Some(pool) => pool,
			None => return
		};

		if pool.state().map_or(true, |state| state.closed) {
			return;
		}

		if let Err(e) = pool.maintain_once().await {
			report_maintenance_failure(&pool.address, &e);
		}
	}
}

fn report_maintenance_failure(address: &HostAddress, error: &Error) {
	tracing::warn!(%address, %error, "connection pool maintenance failed");
}

/// A checked out connection, returned to its pool when dropped.
pub struct PooledConnection {
	connection: Option<Connection>,
	pool:       ConnectionPool
}

impl PooledConnection {
	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}
}

impl std::fmt::Debug for PooledConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("PooledConnection").field(&self.connection).finish()
	}
}

impl Deref for PooledConnection {
	type Target = Connection;

	fn deref(&self) -> &Self::Target {
		match &self.connection {
			Some(connection) => connection,
			None => unreachable!("connection is only taken on drop")
		}
	}
}

impl DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		match &mut self.connection {
			Some(connection) => connection,
			None => unreachable!("connection is only taken on drop")
		}
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			self.pool.check_in(connection);
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, std::io};

	#[derive(Clone, Default)]
	struct Capture(Arc<Mutex<Vec<u8>>>);

	impl io::Write for Capture {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn maintenance_failures_are_warnings() {
		let capture = Capture::default();
		let writer = capture.clone();
		let subscriber = tracing_subscriber::fmt()
			.with_ansi(false)
			.with_max_level(tracing::Level::WARN)
			.with_writer(move || writer.clone())
			.finish();

		let error = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
		tracing::subscriber::with_default(subscriber, ||
			report_maintenance_failure(&HostAddress::new("localhost", None), &error));

		let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
		assert!(output.contains("WARN"), "{}", output);
		assert!(output.contains("connection pool maintenance failed"));
	}
}
