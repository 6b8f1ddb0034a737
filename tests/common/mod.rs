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

//! An in-process server speaking OP_MSG, answering commands through a handler.

#![allow(dead_code)]

use {
	mongo_driver_core::{
		apm::Event,
		wire::Message,
		ClientOptions, HostAddress
	},
	std::{sync::{Arc, Mutex}, time::Duration},
	async_std::{net::{TcpListener, TcpStream}, task},
	bson::{doc, Document}
};

/// Logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub enum Reply {
	Doc(Document),
	/// Drops the connection without replying.
	Close,
	/// Never replies.
	Hang
}

type Handler = Arc<dyn Fn(&Document) -> Reply + Send + Sync>;

pub struct MockServer {
	pub address: HostAddress,
	received:    Arc<Mutex<Vec<Document>>>,
	hello:       Arc<Mutex<Document>>,
	task:        Option<task::JoinHandle<()>>
}

impl MockServer {
	/// Starts a standalone answering every non-hello command with `handler`.
	pub async fn start(handler: impl Fn(&Document) -> Reply + Send + Sync + 'static) -> Self {
		Self::with_hello(standalone(), handler).await
	}

	pub async fn with_hello(hello: Document, handler: impl Fn(&Document) -> Reply + Send + Sync + 'static) -> Self {
		init_tracing();
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind mock server");
		let port = listener.local_addr().expect("no local address").port();
		let received = Arc::new(Mutex::new(Vec::new()));
		let hello = Arc::new(Mutex::new(hello));
		let handler: Handler = Arc::new(handler);

		let task = {
			let received = received.clone();
			let hello = hello.clone();
			task::spawn(async move {
				while let Ok((stream, _)) = listener.accept().await {
					task::spawn(serve(stream, handler.clone(), received.clone(), hello.clone()));
				}
			})
		};

		Self { address: HostAddress::new("127.0.0.1", Some(port)), received, hello, task: Some(task) }
	}

	/// Replaces the hello reply for subsequent handshakes and heartbeats.
	pub fn set_hello(&self, hello: Document) {
		*self.hello.lock().unwrap() = hello;
	}

	/// Received commands with the given name, hello excluded.
	pub fn received(&self, name: &str) -> Vec<Document> {
		self.received.lock().unwrap().iter()
			.filter(|command| command.keys().next().map(String::as_str) == Some(name))
			.cloned()
			.collect()
	}

	pub fn options(&self) -> ClientOptions {
		let mut options = ClientOptions {
			hosts:             vec![self.address.clone()],
			direct_connection: Some(true),
			..ClientOptions::default()
		};
		options.server_selection.server_selection_timeout = Duration::from_secs(5);
		options
	}

	pub async fn stop(mut self) {
		if let Some(task) = self.task.take() {
			task.cancel().await;
		}
	}
}

async fn serve(mut stream: TcpStream, handler: Handler, received: Arc<Mutex<Vec<Document>>>, hello: Arc<Mutex<Document>>) {
	loop {
		let message = match Message::read_from(&mut stream, 48_000_000).await {
			Ok(message) => message,
			Err(_) => return
		};

		let name = message.document.keys().next().cloned().unwrap_or_default();
		let reply = match name.as_str() {
			"hello" | "isMaster" | "ismaster" => Reply::Doc(hello.lock().unwrap().clone()),
			_ => {
				received.lock().unwrap().push(message.document.clone());
				handler(&message.document)
			}
		};

		match reply {
			Reply::Doc(document) => if Message::reply_to(message.request_id, document, 0)
				.write_to(&mut stream, None).await.is_err() {
				return;
			},
			Reply::Close => return,
			Reply::Hang => futures::future::pending::<()>().await
		}
	}
}

pub fn standalone() -> Document {
	doc! {
		"ok": 1,
		"helloOk": true,
		"isWritablePrimary": true,
		"minWireVersion": 0,
		"maxWireVersion": 13,
		"maxBsonObjectSize": 16_777_216,
		"maxMessageSizeBytes": 48_000_000,
		"logicalSessionTimeoutMinutes": 30
	}
}

/// A cursor reply as sent for `aggregate` and `getMore`.
pub fn cursor_reply(first: bool, id: i64, ns: &str, batch: Vec<Document>, post_batch_resume_token: Option<Document>) -> Document {
	let mut cursor = doc! { "id": id, "ns": ns };
	cursor.insert(if first { "firstBatch" } else { "nextBatch" }, batch);
	if let Some(token) = post_batch_resume_token {
		cursor.insert("postBatchResumeToken", token);
	}
	doc! { "ok": 1, "cursor": cursor }
}

pub fn command_error(code: i32, labels: &[&str]) -> Document {
	let labels = labels.iter().map(|label| label.to_string()).collect::<Vec<_>>();
	doc! { "ok": 0, "code": code, "errmsg": "mock failure", "errorLabels": labels }
}

/// Records the names of all dispatched events.
#[derive(Clone, Default)]
pub struct EventRecorder(Arc<Mutex<Vec<String>>>);

impl EventRecorder {
	pub fn listener(&self) -> impl Fn(&Event) + Send + Sync + 'static {
		let events = self.0.clone();
		move |event: &Event| events.lock().unwrap().push(event.name().to_string())
	}

	pub fn names(&self) -> Vec<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn count(&self, name: &str) -> usize {
		self.0.lock().unwrap().iter().filter(|n| *n == name).count()
	}

	pub fn clear(&self) {
		self.0.lock().unwrap().clear();
	}
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
	let start = std::time::Instant::now();
	while start.elapsed() < timeout {
		if condition() {
			return true;
		}
		task::sleep(Duration::from_millis(10)).await;
	}
	condition()
}
