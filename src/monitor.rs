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
		common::{HostAddress, ServerMonitoringMode, ServerSelectionConfig},
		connection::{Connection, ConnectionEstablisher},
		description::{ServerDescription, TopologyVersion},
		error::{Error, Result},
		pool::ConnectionPool,
		topology::WeakTopology,
		utils::duration_millis,
		wire::{flags, HelloReply, HelloRequest}
	},
	std::{
		io,
		sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant}
	},
	async_std::{channel::{self, Receiver, Sender}, task},
	futures::{future::{self, Either}, pin_mut},
	bson::Document
};

/// Exponentially weighted moving average of round trip times.
#[derive(Debug, Default, Copy, Clone)]
struct RttAverage(Option<Duration>);

impl RttAverage {
	const ALPHA: f64 = 0.2;

	fn add_sample(&mut self, sample: Duration) -> Duration {
		let average = match self.0 {
			Some(average) => average.mul_f64(1.0 - Self::ALPHA) + sample.mul_f64(Self::ALPHA),
			None => sample
		};
		self.0 = Some(average);
		average
	}
}

struct MonitorShared {
	check_requests: (Sender<()>, Receiver<()>),
	/// Closing it aborts the check in flight.
	cancel:         Mutex<Option<Sender<()>>>,
	closed:         AtomicBool
}

/// Controls the monitor task of a server.
#[derive(Clone)]
pub(crate) struct MonitorHandle(Arc<MonitorShared>);

impl std::fmt::Debug for MonitorHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MonitorHandle")
			.field("closed", &self.0.closed.load(Ordering::Relaxed))
			.finish()
	}
}

impl MonitorHandle {
	/// Wakes the monitor up, checks are still at least `minHeartbeatFrequencyMS` apart.
	pub fn request_check(&self) {
		let _ = self.0.check_requests.0.try_send(());
	}

	/// Aborts the check in flight, the monitor reconnects for its next check.
	pub fn reset(&self) {
		if let Ok(cancel) = self.0.cancel.lock() {
			if let Some(cancel) = cancel.as_ref() {
				cancel.close();
			}
		}
	}

	pub fn close(&self) {
		self.0.closed.store(true, Ordering::SeqCst);
		self.0.check_requests.0.close();
		self.reset();
	}

	fn is_closed(&self) -> bool {
		self.0.closed.load(Ordering::SeqCst)
	}

	fn begin_check(&self) -> Receiver<()> {
		let (sender, receiver) = channel::bounded(1);
		if let Ok(mut cancel) = self.0.cancel.lock() {
			*cancel = Some(sender);
		}
		receiver
	}
}

/// Checks a single server every `heartbeatFrequencyMS` and publishes what it finds to the topology.
///
/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-monitoring.rst
pub(crate) struct Monitor {
	address:         HostAddress,
	establisher:     Arc<ConnectionEstablisher>,
	topology:        WeakTopology,
	pool:            ConnectionPool,
	listeners:       Arc<Listeners>,
	config:          ServerSelectionConfig,
	mode:            ServerMonitoringMode,
	handle:          MonitorHandle,
	connection:      Option<Connection>,
	rtt:             Arc<Mutex<RttAverage>>,
	pinger:          Option<task::JoinHandle<()>>,
	description:     ServerDescription
}

impl Monitor {
	pub fn start(
		address:     HostAddress,
		establisher: Arc<ConnectionEstablisher>,
		topology:    WeakTopology,
		pool:        ConnectionPool,
		listeners:   Arc<Listeners>,
		config:      ServerSelectionConfig,
		mode:        ServerMonitoringMode
	) -> MonitorHandle {
		let handle = MonitorHandle(Arc::new(MonitorShared {
			check_requests: channel::bounded(1),
			cancel:         Mutex::new(None),
			closed:         AtomicBool::new(false)
		}));

		let monitor = Self {
			description: ServerDescription::new(address.clone()),
			address,
			establisher,
			topology,
			pool,
			listeners,
			config,
			mode,
			handle: handle.clone(),
			connection: None,
			rtt: Arc::default(),
			pinger: None
		};

		task::spawn(monitor.run());
		handle
	}

	async fn run(mut self) {
		tracing::debug!(address = %self.address, "starting server monitor");

		while !self.handle.is_closed() {
			let started = Instant::now();
			let previous_known = self.description.r#type.is_known();

			let outcome = match self.check().await {
				// a known server gets one immediate retry before it waits for the next heartbeat
				Some(Err(e)) if previous_known && e.is_network_error() => self.check().await,
				outcome => outcome
			};

			if outcome.is_none() {
				break;
			}

			if self.is_streaming() {
				continue;
			}

			self.wait(started).await;
		}

		self.stop_pinger().await;
		tracing::debug!(address = %self.address, "server monitor stopped");
	}

	fn is_streaming(&self) -> bool {
		self.connection.as_ref().map_or(false, Connection::is_streaming)
	}

	/// Sleeps until the next heartbeat is due or a check is requested.
	async fn wait(&mut self, started: Instant) {
		let heartbeat = self.config.heartbeat_frequency;
		let remaining = heartbeat.saturating_sub(started.elapsed());

		if async_std::future::timeout(remaining, self.handle.0.check_requests.1.recv()).await.is_ok() {
			let min = self.config.min_heartbeat_frequency.saturating_sub(started.elapsed());
			if !min.is_zero() {
				task::sleep(min).await;
			}
		}
	}

	/// Runs one check and publishes its outcome. Returns `None` once the topology is gone.
	async fn check(&mut self) -> Option<Result<()>> {
		let awaited = self.connection.is_some() && self.awaitable_version().is_some();
		self.listeners.dispatch(Event::ServerHeartbeatStarted { address: &self.address, awaited });

		let cancel = self.handle.begin_check();
		let start = Instant::now();

		let result = {
			let check = self.perform_check(awaited);
			let cancelled = cancel.recv();
			pin_mut!(check, cancelled);

			match future::select(check, cancelled).await {
				Either::Left((result, _)) => result,
				Either::Right(_) => Err(io::Error::new(io::ErrorKind::Interrupted, "server check was cancelled").into())
			}
		};

		let duration = start.elapsed();

		let description = match result {
			Ok((reply, document, sample)) => {
				self.listeners.dispatch(Event::ServerHeartbeatSucceeded {
					address: &self.address,
					duration,
					reply: &document,
					awaited
				});

				let rtt = match (sample, self.rtt.lock()) {
					(Some(sample), Ok(mut rtt)) => rtt.add_sample(sample),
					(None, Ok(rtt)) => rtt.0.unwrap_or(duration),
					(_, Err(_)) => duration
				};

				if self.streaming_enabled() && reply.topology_version.is_some() && self.pinger.is_none() {
					self.start_pinger();
				}

				ServerDescription::from_hello(self.address.clone(), reply, rtt)
			}
			Err(e) => {
				tracing::debug!(address = %self.address, error = %e, "server check failed");
				self.listeners.dispatch(Event::ServerHeartbeatFailed {
					address: &self.address,
					duration,
					failure: &e,
					awaited
				});

				self.connection = None;
				self.stop_pinger().await;
				if let Ok(mut rtt) = self.rtt.lock() {
					*rtt = RttAverage::default();
				}

				if self.handle.is_closed() {
					return None;
				}

				let cancelled = matches!(&e, Error::Io(e) if e.kind() == io::ErrorKind::Interrupted);
				if cancelled {
					return Some(Err(e));
				}

				ServerDescription::from_error(self.address.clone(), e)
			}
		};

		let error = description.error.clone();
		self.description = description.clone();

		let topology = self.topology.upgrade()?;
		topology.apply_server_description(description);

		// the server is published as unknown before its pool is cleared
		if let Some(e) = &error {
			self.pool.clear(e.is_network_timeout());
		}

		Some(match error {
			Some(e) => Err(e),
			None => Ok(())
		})
	}

	fn streaming_enabled(&self) -> bool {
		!matches!(self.mode, ServerMonitoringMode::Poll)
	}

	fn awaitable_version(&self) -> Option<&TopologyVersion> {
		self.description.topology_version.as_ref().filter(|_| self.streaming_enabled())
	}

	/// Returns the hello reply, its raw document and an RTT sample if the check measured one.
	async fn perform_check(&mut self, awaited: bool) -> Result<(HelloReply, Document, Option<Duration>)> {
		let connect_timeout = self.establisher.connect_timeout();
		let heartbeat = self.config.heartbeat_frequency;

		let connection = match &mut self.connection {
			Some(connection) => connection,
			None => {
				let (connection, handshake) = self.establisher.establish_monitoring(&self.address).await?;
				self.connection = Some(connection);
				return Ok((handshake.reply, handshake.document, Some(handshake.rtt)));
			}
		};

		let (document, sample) = if connection.is_streaming() {
			(connection.receive_more(Some(connect_timeout + heartbeat)).await?, None)
		} else {
			let hello_ok = connection.description().map_or(false, |d| d.hello_ok);
			let topology_version = self.description.topology_version.as_ref().filter(|_| awaited);
			let command = bson::to_document(&HelloRequest {
				topology_version,
				max_await_time_ms: topology_version.map(|_| duration_millis(heartbeat)),
				..HelloRequest::new(hello_ok)
			})?;

			let start = Instant::now();
			if awaited {
				let document = connection.execute("admin", command, flags::EXHAUST_ALLOWED,
					Some(connect_timeout + heartbeat)).await?;
				(document, None)
			} else {
				let document = connection.execute("admin", command, 0, Some(connect_timeout)).await?;
				(document, Some(start.elapsed()))
			}
		};

		Ok((bson::from_document(document.clone())?, document, sample))
	}

	fn start_pinger(&mut self) {
		self.pinger = Some(task::spawn(ping(
			self.address.clone(),
			self.establisher.clone(),
			self.rtt.clone(),
			self.config.heartbeat_frequency
		)));
	}

	async fn stop_pinger(&mut self) {
		if let Some(pinger) = self.pinger.take() {
			pinger.cancel().await;
		}
	}
}

/// Measures round trip times on a dedicated connection while the monitor is streaming.
async fn ping(
	address:     HostAddress,
	establisher: Arc<ConnectionEstablisher>,
	rtt:         Arc<Mutex<RttAverage>>,
	interval:    Duration
) {
	let mut connection: Option<Connection> = None;

	loop {
		let sample = match connection.as_mut() {
			Some(connection) => {
				let start = Instant::now();
				let hello_ok = connection.description().map_or(false, |d| d.hello_ok);
				let command = bson::to_document(&HelloRequest::new(hello_ok)).map_err(Error::from);
				let timeout = Some(establisher.connect_timeout());
				match command {
					Ok(command) => connection.execute("admin", command, 0, timeout).await
						.map(|_| start.elapsed()),
					Err(e) => Err(e)
				}
			}
			None => match establisher.establish_monitoring(&address).await {
				Ok((new, handshake)) => {
					connection = Some(new);
					Ok(handshake.rtt)
				}
				Err(e) => Err(e)
			}
		};

		match sample {
			Ok(sample) => if let Ok(mut rtt) = rtt.lock() {
				rtt.add_sample(sample);
			},
			Err(e) => {
				tracing::debug!(%address, error = %e, "rtt measurement failed");
				connection = None;
			}
		}

		task::sleep(interval).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rtt_moving_average() {
		let mut rtt = RttAverage::default();
		assert_eq!(rtt.add_sample(Duration::from_millis(100)), Duration::from_millis(100));
		assert_eq!(rtt.add_sample(Duration::from_millis(200)), Duration::from_millis(120));
		assert_eq!(rtt.add_sample(Duration::from_millis(120)), Duration::from_millis(120));
	}

	#[async_std::test]
	async fn reset_closes_the_cancel_channel() {
		let handle = MonitorHandle(Arc::new(MonitorShared {
			check_requests: channel::bounded(1),
			cancel:         Mutex::new(None),
			closed:         AtomicBool::new(false)
		}));

		let cancel = handle.begin_check();
		handle.reset();
		assert!(cancel.recv().await.is_err());

		handle.request_check();
		handle.request_check();
		assert_eq!(handle.0.check_requests.1.len(), 1);

		handle.close();
		assert!(handle.is_closed());
	}
}
