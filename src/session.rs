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
	crate::error::Result,
	std::{collections::VecDeque, sync::Mutex, time::{Duration, Instant}},
	bson::{doc, Document}
};

/// Sessions within this margin of their logical timeout are not handed out again.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A server session, identified by its `lsid`.
///
/// see https://github.com/mongodb/specifications/blob/master/source/sessions/driver-sessions.rst#server-session-pool
#[derive(Debug, Clone)]
pub struct ServerSession {
	id:        Document,
	last_use:  Instant,
	/// Set when a command using the session failed with a network error.
	pub dirty: bool
}

impl ServerSession {
	fn new() -> Self {
		Self { id: doc! { "id": bson::Uuid::new() }, last_use: Instant::now(), dirty: false }
	}

	pub fn id(&self) -> &Document {
		&self.id
	}

	pub(crate) fn touch(&mut self) {
		self.last_use = Instant::now();
	}

	fn is_about_to_expire(&self, timeout_minutes: i64) -> bool {
		let timeout = Duration::from_secs(timeout_minutes.max(0) as u64 * 60);
		self.last_use.elapsed() + EXPIRY_MARGIN >= timeout
	}
}

/// Most recently used sessions are reused first.
#[derive(Debug, Default)]
pub struct ServerSessionPool(Mutex<VecDeque<ServerSession>>);

impl ServerSessionPool {
	pub fn acquire(&self, timeout_minutes: i64) -> Result<ServerSession> {
		let mut sessions = self.0.lock()?;
		while let Some(session) = sessions.pop_front() {
			if !session.is_about_to_expire(timeout_minutes) {
				return Ok(session);
			}
		}
		Ok(ServerSession::new())
	}

	pub fn release(&self, session: ServerSession, timeout_minutes: Option<i64>) -> Result<()> {
		let mut sessions = self.0.lock()?;
		let timeout_minutes = match timeout_minutes {
			Some(timeout_minutes) => timeout_minutes,
			None => return Ok(())
		};

		// expired sessions at the back go first
		while sessions.back().map_or(false, |s| s.is_about_to_expire(timeout_minutes)) {
			sessions.pop_back();
		}

		if !session.dirty && !session.is_about_to_expire(timeout_minutes) {
			sessions.push_front(session);
		}
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.0.lock().map_or(0, |sessions| sessions.len())
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Removes all pooled sessions, returning their ids for `endSessions`.
	pub(crate) fn drain(&self) -> Vec<Document> {
		self.0.lock()
			.map(|mut sessions| sessions.drain(..).map(|s| s.id).collect())
			.unwrap_or_default()
	}
}
