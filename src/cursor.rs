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
		common::ReadPreference,
		db::Namespace,
		error::{code, Error, Result},
		selection::Selector,
		server::Server,
		session::ServerSession,
		utils::duration_millis,
		HostAddress
	},
	std::{collections::VecDeque, time::Duration},
	serde::{Serialize, Deserialize},
	bson::{doc, Document, Timestamp},
	futures::stream::{self, Stream},
	async_std::task
};

/// `comment` on `getMore` requires 4.4.
const GET_MORE_COMMENT_WIRE_VERSION: i32 = 9;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorOptions {
	pub batch_size:     Option<u32>,
	/// Sent as `maxTimeMS` on every `getMore`.
	pub max_await_time: Option<Duration>,
	pub comment:        Option<String>
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CursorState {
	/// The initiating command was not sent yet.
	Uninitialized,
	Open,
	/// The server reported cursor id 0, buffered documents may remain.
	Exhausted,
	Closed
}

/// A server-side cursor, created lazily by its initiating command and pinned to the server
/// that ran it.
///
/// see https://github.com/mongodb/specifications/blob/master/source/find_getmore_killcursors_commands.rst
#[derive(Debug)]
pub struct Cursor {
	client:                  Client,
	namespace:               Namespace,
	state:                   CursorState,
	command:                 Option<Document>,
	read_preference:         ReadPreference,
	options:                 CursorOptions,
	server:                  Option<Server>,
	id:                      i64,
	buffer:                  VecDeque<Document>,
	post_batch_resume_token: Option<Document>,
	operation_time:          Option<Timestamp>,
	max_wire_version:        i32,
	session:                 Option<ServerSession>
}

impl Cursor {
	pub(crate) fn new(
		client:          Client,
		namespace:       Namespace,
		command:         Document,
		read_preference: ReadPreference,
		options:         CursorOptions
	) -> Self {
		Self {
			client,
			namespace,
			state:                   CursorState::Uninitialized,
			command:                 Some(command),
			read_preference,
			options,
			server:                  None,
			id:                      0,
			buffer:                  VecDeque::new(),
			post_batch_resume_token: None,
			operation_time:          None,
			max_wire_version:        0,
			session:                 None
		}
	}

	pub fn id(&self) -> i64 {
		self.id
	}

	pub fn namespace(&self) -> &Namespace {
		&self.namespace
	}

	pub fn state(&self) -> CursorState {
		self.state
	}

	/// The server the cursor is pinned to, `None` until initialized.
	pub fn address(&self) -> Option<&HostAddress> {
		self.server.as_ref().map(|server| &server.address)
	}

	pub fn post_batch_resume_token(&self) -> Option<&Document> {
		self.post_batch_resume_token.as_ref()
	}

	/// The `operationTime` of the most recent reply.
	pub fn operation_time(&self) -> Option<Timestamp> {
		self.operation_time
	}

	/// The max wire version of the server that created the cursor, 0 until initialized.
	pub fn max_wire_version(&self) -> i32 {
		self.max_wire_version
	}

	pub fn buffered_count(&self) -> usize {
		self.buffer.len()
	}

	/// Sends the initiating command if it was not sent yet.
	pub(crate) async fn initialize(&mut self) -> Result<()> {
		let command = match self.command.take() {
			Some(command) => command,
			None => return Ok(())
		};

		let result = self.run_initial(command).await;
		if result.is_err() {
			self.state = CursorState::Closed;
			self.release_session();
		}
		result
	}

	async fn run_initial(&mut self, command: Document) -> Result<()> {
		let selector = Selector::Read(self.read_preference.clone());
		let server = self.client.topology().select_server(&selector, None).await?;
		self.session = self.client.start_implicit_session()?;

		let reply = self.client.execute(&server, &self.namespace.db, command,
			Some(&self.read_preference), self.session.as_mut()).await?;

		self.max_wire_version = server.description().map_or(0, |d| d.max_wire_version);
		self.server = Some(server);
		self.process_reply(reply)
	}

	fn process_reply(&mut self, reply: Document) -> Result<()> {
		let reply: CursorReply = bson::from_document(reply)?;
		self.id = reply.cursor.id;
		self.namespace = reply.cursor.ns;
		self.buffer.extend(reply.cursor.batch);

		if let Some(token) = reply.cursor.post_batch_resume_token {
			self.post_batch_resume_token = Some(token);
		}

		if let Some(operation_time) = reply.operation_time {
			self.operation_time = Some(operation_time);
		}

		if self.id == 0 {
			self.state = CursorState::Exhausted;
			self.release_session();
		} else {
			self.state = CursorState::Open;
		}
		Ok(())
	}

	async fn get_more(&mut self) -> Result<()> {
		let server = match &self.server {
			Some(server) => server.clone(),
			None => return Err(Error::CursorClosed)
		};

		let command = bson::to_document(&GetMoreCommand {
			get_more:    self.id,
			collection:  &self.namespace.coll,
			batch_size:  self.options.batch_size,
			max_time_ms: self.options.max_await_time.map(duration_millis),
			comment:     self.options.comment.as_deref()
				.filter(|_| self.max_wire_version >= GET_MORE_COMMENT_WIRE_VERSION)
		})?;

		let reply = self.client.execute(&server, &self.namespace.db, command, None, self.session.as_mut()).await;
		match reply {
			Ok(reply) => self.process_reply(reply),
			Err(e) => {
				// the server already discarded the cursor or the connection is gone
				if e.is_network_error() || e.code() == Some(code::CURSOR_NOT_FOUND) {
					self.id = 0;
				}
				self.close().await;
				Err(e)
			}
		}
	}

	/// Returns the next document, sending at most one `getMore`.
	/// `Ok(None)` means that round returned nothing, not that the cursor is exhausted.
	pub async fn try_next(&mut self) -> Result<Option<Document>> {
		match self.state {
			CursorState::Closed => return Err(Error::CursorClosed),
			CursorState::Uninitialized => {
				self.initialize().await?;
				return Ok(self.buffer.pop_front());
			}
			_ => ()
		}

		if let Some(document) = self.buffer.pop_front() {
			return Ok(Some(document));
		}

		if self.state == CursorState::Exhausted {
			return Ok(None);
		}

		self.get_more().await?;
		Ok(self.buffer.pop_front())
	}

	/// Returns the next document, `Ok(None)` once the cursor is exhausted.
	pub async fn next(&mut self) -> Result<Option<Document>> {
		loop {
			if let Some(document) = self.try_next().await? {
				return Ok(Some(document));
			}

			if self.state != CursorState::Open {
				return Ok(None);
			}
		}
	}

	/// Whether another document is available, fetching batches until one arrives or the cursor ends.
	pub async fn has_next(&mut self) -> Result<bool> {
		loop {
			if !self.buffer.is_empty() {
				return Ok(true);
			}

			match self.state {
				CursorState::Uninitialized => self.initialize().await?,
				CursorState::Open => self.get_more().await?,
				CursorState::Exhausted | CursorState::Closed => return Ok(false)
			}
		}
	}

	/// Kills the server-side cursor, later iteration fails with `CursorClosed`.
	pub async fn close(&mut self) {
		if self.state == CursorState::Closed {
			return;
		}

		if let (Some(server), true) = (&self.server, self.id != 0) {
			let command = kill_cursors(&self.namespace, self.id);
			if let Err(e) = self.client.execute(server, &self.namespace.db, command, None, self.session.as_mut()).await {
				tracing::debug!(namespace = %self.namespace, cursor_id = self.id, error = %e, "killCursors failed");
			}
		}

		self.id = 0;
		self.state = CursorState::Closed;
		self.command = None;
		self.buffer.clear();
		self.release_session();
	}

	fn release_session(&mut self) {
		if let Err(e) = self.client.end_implicit_session(self.session.take()) {
			tracing::warn!(error = %e, "failed to return a server session to the pool");
		}
	}

	/// Converts the cursor into a stream that ends with the cursor or after the first error.
	pub fn into_stream(self) -> impl Stream<Item = Result<Document>> {
		stream::unfold(Some(self), |cursor| async move {
			let mut cursor = cursor?;
			match cursor.next().await {
				Ok(Some(document)) => Some((Ok(document), Some(cursor))),
				Ok(None) => None,
				Err(e) => Some((Err(e), None))
			}
		})
	}
}

impl Drop for Cursor {
	fn drop(&mut self) {
		let server = match (self.server.take(), self.state) {
			(Some(server), CursorState::Open) if self.id != 0 => server,
			_ => return self.release_session()
		};

		let client = self.client.clone();
		let namespace = self.namespace.clone();
		let id = self.id;
		let mut session = self.session.take();

		task::spawn(async move {
			let command = kill_cursors(&namespace, id);
			if let Err(e) = client.execute(&server, &namespace.db, command, None, session.as_mut()).await {
				tracing::debug!(%namespace, cursor_id = id, error = %e, "killCursors failed");
			}
			if let Err(e) = client.end_implicit_session(session) {
				tracing::warn!(error = %e, "failed to return a server session to the pool");
			}
		});
	}
}

fn kill_cursors(namespace: &Namespace, id: i64) -> Document {
	doc! { "killCursors": &namespace.coll, "cursors": [id] }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetMoreCommand<'a> {
	get_more:    i64,
	collection:  &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	batch_size:  Option<u32>,
	#[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
	max_time_ms: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	comment:     Option<&'a str>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorReply {
	cursor:         CursorReplyBody,
	operation_time: Option<Timestamp>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorReplyBody {
	#[serde(alias = "firstBatch", alias = "nextBatch")]
	batch:                   Vec<Document>,
	id:                      i64,
	ns:                      Namespace,
	post_batch_resume_token: Option<Document>
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reply_batches() {
		let reply: CursorReply = bson::from_document(doc! {
			"cursor": {
				"firstBatch": [{ "a": 1 }, { "a": 2 }],
				"id": 42i64,
				"ns": "db.coll",
				"postBatchResumeToken": { "_data": "01" }
			},
			"operationTime": Timestamp { time: 1, increment: 2 },
			"ok": 1
		}).unwrap();
		assert_eq!(reply.cursor.batch.len(), 2);
		assert_eq!(reply.cursor.id, 42);
		assert_eq!(reply.cursor.ns, Namespace::new("db", "coll"));
		assert_eq!(reply.cursor.post_batch_resume_token, Some(doc! { "_data": "01" }));
		assert_eq!(reply.operation_time, Some(Timestamp { time: 1, increment: 2 }));

		let reply: CursorReply = bson::from_document(doc! {
			"cursor": { "nextBatch": [], "id": 0, "ns": "db.$cmd.aggregate" },
			"ok": 1
		}).unwrap();
		assert!(reply.cursor.batch.is_empty());
		assert_eq!(reply.cursor.ns.coll, "$cmd.aggregate");
		assert!(reply.operation_time.is_none());
	}

	#[test]
	fn get_more_shape() {
		let command = bson::to_document(&GetMoreCommand {
			get_more:    7,
			collection:  "coll",
			batch_size:  Some(5),
			max_time_ms: Some(1000),
			comment:     None
		}).unwrap();
		assert_eq!(command, doc! { "getMore": 7i64, "collection": "coll", "batchSize": 5i64, "maxTimeMS": 1000i64 });
	}
}
