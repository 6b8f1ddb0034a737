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
		common::{AggregateOptions, ChangeStreamOptions, FullDocument},
		cursor::{Cursor, CursorOptions, CursorState},
		db::{AggregateCommand, Namespace},
		error::{Error, Result}
	},
	std::{
		fmt,
		sync::{Arc, Mutex, MutexGuard, PoisonError, atomic::{AtomicBool, Ordering}}
	},
	serde::{Serialize, Deserialize},
	bson::{doc, Document, Timestamp},
	futures::stream::{self, Stream},
	async_std::task
};

/// `startAtOperationTime` requires 4.0.
const START_AT_OPERATION_TIME_WIRE_VERSION: i32 = 7;

/// The `_id` of a change event, opaque to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Document);

impl ResumeToken {
	pub fn as_document(&self) -> &Document {
		&self.0
	}

	pub fn into_document(self) -> Document {
		self.0
	}
}

impl From<Document> for ResumeToken {
	fn from(document: Document) -> Self {
		Self(document)
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum OperationType {
	Insert,
	Update,
	Replace,
	Delete,
	Drop,
	Rename,
	DropDatabase,
	Invalidate,
	Other(String)
}

impl OperationType {
	pub fn as_str(&self) -> &str {
		match self {
			Self::Insert       => "insert",
			Self::Update       => "update",
			Self::Replace      => "replace",
			Self::Delete       => "delete",
			Self::Drop         => "drop",
			Self::Rename       => "rename",
			Self::DropDatabase => "dropDatabase",
			Self::Invalidate   => "invalidate",
			Self::Other(other) => other
		}
	}
}

impl<'de> Deserialize<'de> for OperationType {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		Ok(match String::deserialize(deserializer)?.as_str() {
			"insert"       => Self::Insert,
			"update"       => Self::Update,
			"replace"      => Self::Replace,
			"delete"       => Self::Delete,
			"drop"         => Self::Drop,
			"rename"       => Self::Rename,
			"dropDatabase" => Self::DropDatabase,
			"invalidate"   => Self::Invalidate,
			other          => Self::Other(other.to_string())
		})
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeNamespace {
	pub db:   String,
	pub coll: Option<String>
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
	pub updated_fields:   Document,
	pub removed_fields:   Vec<String>,
	#[serde(default)]
	pub truncated_arrays: Vec<Document>
}

/// see https://docs.mongodb.com/manual/reference/change-events/
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStreamEvent {
	#[serde(rename = "_id")]
	pub id:                 ResumeToken,
	pub operation_type:     OperationType,
	pub ns:                 Option<ChangeNamespace>,
	/// The new namespace of a `rename`.
	pub to:                 Option<ChangeNamespace>,
	pub document_key:       Option<Document>,
	pub full_document:      Option<Document>,
	pub update_description: Option<UpdateDescription>,
	pub cluster_time:       Option<Timestamp>,
	pub txn_number:         Option<i64>,
	pub lsid:               Option<Document>
}

/// What a change stream observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeStreamTarget {
	Cluster,
	Database(String),
	Collection(Namespace)
}

impl ChangeStreamTarget {
	fn namespace(&self) -> Namespace {
		match self {
			Self::Cluster => Namespace::new("admin", "$cmd.aggregate"),
			Self::Database(db) => Namespace::new(db, "$cmd.aggregate"),
			Self::Collection(namespace) => namespace.clone()
		}
	}

	fn collection(&self) -> Option<&str> {
		match self {
			Self::Collection(namespace) => Some(&namespace.coll),
			_ => None
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeStreamStage<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	full_document:           Option<FullDocument>,
	#[serde(skip_serializing_if = "Option::is_none")]
	resume_after:            Option<&'a ResumeToken>,
	#[serde(skip_serializing_if = "Option::is_none")]
	start_after:             Option<&'a ResumeToken>,
	#[serde(skip_serializing_if = "Option::is_none")]
	start_at_operation_time: Option<Timestamp>,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	all_changes_for_cluster: bool
}

/// How a change stream is consumed, fixed by the first use.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
	Unset,
	Iterator,
	Emitter
}

type ChangeHandler = Arc<dyn Fn(&ChangeStreamEvent) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;
type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
	change:  Vec<ChangeHandler>,
	error:   Vec<ErrorHandler>,
	close:   Vec<CloseHandler>,
	running: bool
}

/// State readable without waiting for an in-flight fetch.
struct Shared {
	mode:         Mutex<Mode>,
	resume_token: Mutex<Option<ResumeToken>>,
	handlers:     Mutex<Handlers>,
	/// Set once the stream ended for any reason.
	closed:       AtomicBool,
	/// Set by `close`, results of fetches still in flight are discarded.
	cancelled:    AtomicBool
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
	fn latch(&self, mode: Mode) -> Result<()> {
		let mut current = lock(&self.mode);
		match *current {
			Mode::Unset => {
				*current = mode;
				Ok(())
			}
			current if current == mode => Ok(()),
			Mode::Iterator => Err(Error::ChangeStreamMode("cannot add a change listener to a change stream in iterator mode")),
			Mode::Emitter => Err(Error::ChangeStreamMode("cannot iterate a change stream in emitter mode"))
		}
	}

	fn resume_token(&self) -> Option<ResumeToken> {
		lock(&self.resume_token).clone()
	}

	fn set_resume_token(&self, token: ResumeToken) {
		*lock(&self.resume_token) = Some(token);
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// Marks the stream closed, close handlers run once.
	fn mark_closed(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		let handlers = lock(&self.handlers).close.clone();
		handlers.iter().for_each(|handler| handler());
	}

	fn emit_change(&self, event: &ChangeStreamEvent) {
		let handlers = lock(&self.handlers).change.clone();
		handlers.iter().for_each(|handler| handler(event));
	}

	fn emit_error(&self, error: &Error) {
		let handlers = lock(&self.handlers).error.clone();
		handlers.iter().for_each(|handler| handler(error));
	}
}

/// The part of a change stream that performs I/O, at most one fetch runs at a time.
struct Core {
	client:                 Client,
	target:                 ChangeStreamTarget,
	pipeline:               Vec<Document>,
	options:                ChangeStreamOptions,
	cursor:                 Option<Cursor>,
	/// An event fetched by `has_next`.
	peeked:                 Option<ChangeStreamEvent>,
	/// Whether any event was received, `startAfter` is only reused before the first one.
	received:               bool,
	initial_operation_time: Option<Timestamp>,
	max_wire_version:       i32,
	shared:                 Arc<Shared>
}

impl Core {
	fn create_cursor(&self, resuming: bool) -> Result<Cursor> {
		let options = match resuming {
			true  => self.resume_options(),
			false => self.options.clone()
		};

		let stage = bson::to_document(&ChangeStreamStage {
			full_document:           options.full_document,
			resume_after:            options.resume_after.as_ref(),
			start_after:             options.start_after.as_ref(),
			start_at_operation_time: options.start_at_operation_time,
			all_changes_for_cluster: self.target == ChangeStreamTarget::Cluster
		})?;

		let mut pipeline = Vec::with_capacity(self.pipeline.len() + 1);
		pipeline.push(doc! { "$changeStream": stage });
		pipeline.extend(self.pipeline.iter().cloned());

		let client_options = self.client.options();
		let aggregate_options = AggregateOptions { batch_size: options.batch_size, ..AggregateOptions::default() };
		let command = AggregateCommand::new(self.target.collection(), &pipeline, &aggregate_options,
			client_options.read_concern).to_document()?;

		Ok(Cursor::new(
			self.client.clone(),
			self.target.namespace(),
			command,
			options.read_preference.unwrap_or_else(|| client_options.read_preference.clone()),
			CursorOptions {
				batch_size:     options.batch_size,
				max_await_time: options.max_await_time,
				comment:        None
			}
		))
	}

	/// The original options with the position replaced by the cached resume token or,
	/// lacking one, the operation time of the initial aggregate.
	fn resume_options(&self) -> ChangeStreamOptions {
		let mut options = self.options.clone();
		match self.shared.resume_token() {
			Some(token) => {
				options.start_at_operation_time = None;
				if self.options.start_after.is_some() && !self.received {
					options.start_after = Some(token);
					options.resume_after = None;
				} else {
					options.resume_after = Some(token);
					options.start_after = None;
				}
			}
			None if self.max_wire_version >= START_AT_OPERATION_TIME_WIRE_VERSION => {
				options.start_at_operation_time = options.start_at_operation_time.or(self.initial_operation_time);
			}
			None => ()
		}
		options
	}

	fn initialized(&mut self) {
		let cursor = match &self.cursor {
			Some(cursor) => cursor,
			None => return
		};

		self.max_wire_version = cursor.max_wire_version();
		if self.initial_operation_time.is_none()
			&& self.options.start_at_operation_time.is_none()
			&& self.shared.resume_token().is_none() {
			self.initial_operation_time = cursor.operation_time();
		}

		if cursor.buffered_count() == 0 {
			self.cache_post_batch_resume_token();
		}
	}

	fn cache_post_batch_resume_token(&self) {
		if let Some(token) = self.cursor.as_ref().and_then(Cursor::post_batch_resume_token) {
			self.shared.set_resume_token(ResumeToken(token.clone()));
		}
	}

	async fn resume(&mut self) -> Result<()> {
		if let Some(mut cursor) = self.cursor.take() {
			cursor.close().await;
		}

		let mut cursor = self.create_cursor(true)?;
		cursor.initialize().await?;
		self.cursor = Some(cursor);
		self.initialized();
		Ok(())
	}

	fn is_resumable(&self, error: &Error, initialized: bool) -> bool {
		match initialized {
			true  => error.is_resumable(self.max_wire_version, &self.client.options().resume_policy),
			// only the initial aggregate can fail before the cursor is initialized
			false => error.is_network_error()
		}
	}

	/// Ends the stream and kills the cursor.
	async fn close(&mut self) {
		self.shared.mark_closed();
		if let Some(mut cursor) = self.cursor.take() {
			cursor.close().await;
		}
	}

	/// Kills the cursor after a fatal error. In emitter mode the stream is marked closed by the
	/// emitter once the error handlers ran.
	async fn fail(&mut self) {
		if *lock(&self.shared.mode) != Mode::Emitter {
			self.shared.mark_closed();
		}
		if let Some(mut cursor) = self.cursor.take() {
			cursor.close().await;
		}
	}

	/// One fetch round with at most one resume.
	async fn try_next(&mut self) -> Result<Option<ChangeStreamEvent>> {
		if let Some(event) = self.peeked.take() {
			return Ok(Some(event));
		}

		if self.shared.is_closed() {
			self.close().await;
			return Err(Error::ChangeStreamClosed);
		}

		if self.cursor.is_none() {
			match self.create_cursor(false) {
				Ok(cursor) => self.cursor = Some(cursor),
				Err(e) => {
					self.fail().await;
					return Err(e);
				}
			}
		}

		let mut resumed = false;
		let result = loop {
			let cursor = match self.cursor.as_mut() {
				Some(cursor) => cursor,
				None => break Err(Error::ChangeStreamClosed)
			};

			let initialized = cursor.state() != CursorState::Uninitialized;
			let result = cursor.try_next().await;
			if !initialized && cursor.state() != CursorState::Uninitialized && cursor.state() != CursorState::Closed {
				self.initialized();
			}

			match result {
				Err(e) if !resumed && !self.shared.is_cancelled() && self.is_resumable(&e, initialized) => {
					tracing::debug!(error = %e, scope = ?self.target, "resuming change stream");
					resumed = true;
					match self.resume().await {
						Ok(()) => continue,
						Err(e) => break Err(e)
					}
				}
				result => break result
			}
		};

		if self.shared.is_cancelled() {
			self.close().await;
			return Err(Error::ChangeStreamClosed);
		}

		let document = match result {
			Ok(Some(document)) => document,
			Ok(None) => {
				if self.cursor.as_ref().map_or(true, |cursor| cursor.state() != CursorState::Open) {
					self.close().await;
				} else {
					self.cache_post_batch_resume_token();
				}
				return Ok(None);
			}
			Err(e) => {
				self.fail().await;
				return Err(e);
			}
		};

		let token = match document.get_document("_id") {
			Ok(id) => ResumeToken(id.clone()),
			Err(_) => {
				self.fail().await;
				return Err(Error::MissingResumeToken);
			}
		};

		let event = match bson::from_document::<ChangeStreamEvent>(document) {
			Ok(event) => event,
			Err(e) => {
				self.fail().await;
				return Err(e.into());
			}
		};

		let post_batch_resume_token = self.cursor.as_ref()
			.filter(|cursor| cursor.buffered_count() == 0)
			.and_then(Cursor::post_batch_resume_token);
		self.shared.set_resume_token(match post_batch_resume_token {
			Some(token) => ResumeToken(token.clone()),
			None => token
		});
		self.received = true;

		if event.operation_type == OperationType::Invalidate {
			tracing::debug!(scope = ?self.target, "change stream invalidated");
			self.close().await;
		}

		Ok(Some(event))
	}

	/// Fetches until an event arrives, `Ok(None)` once the stream ended.
	async fn next(&mut self) -> Result<Option<ChangeStreamEvent>> {
		loop {
			match self.try_next().await? {
				Some(event) => return Ok(Some(event)),
				None if self.shared.is_closed() => return Ok(None),
				None => continue
			}
		}
	}

	async fn has_next(&mut self) -> Result<bool> {
		if self.peeked.is_some() {
			return Ok(true);
		}

		match self.next().await? {
			Some(event) => {
				self.peeked = Some(event);
				Ok(true)
			}
			None => Ok(false)
		}
	}
}

/// A resumable stream of change events, consumed either by iteration or through listeners.
///
/// see https://github.com/mongodb/specifications/blob/master/source/change-streams/change-streams.rst
pub struct ChangeStream {
	shared: Arc<Shared>,
	core:   Arc<async_std::sync::Mutex<Core>>
}

impl ChangeStream {
	pub(crate) fn new(client: Client, target: ChangeStreamTarget, pipeline: Vec<Document>, options: ChangeStreamOptions) -> Result<Self> {
		if options.resume_after.is_some() && options.start_after.is_some() {
			return Err(Error::InvalidArgument("resumeAfter and startAfter cannot both be set"));
		}

		let shared = Arc::new(Shared {
			mode:         Mutex::new(Mode::Unset),
			resume_token: Mutex::new(options.start_after.clone().or_else(|| options.resume_after.clone())),
			handlers:     Mutex::new(Handlers::default()),
			closed:       AtomicBool::new(false),
			cancelled:    AtomicBool::new(false)
		});

		Ok(Self {
			core: Arc::new(async_std::sync::Mutex::new(Core {
				client,
				target,
				pipeline,
				options,
				cursor:                 None,
				peeked:                 None,
				received:               false,
				initial_operation_time: None,
				max_wire_version:       0,
				shared:                 shared.clone()
			})),
			shared
		})
	}

	pub fn mode(&self) -> Mode {
		*lock(&self.shared.mode)
	}

	/// The token to resume after the most recently received event.
	pub fn resume_token(&self) -> Option<ResumeToken> {
		self.shared.resume_token()
	}

	pub fn is_closed(&self) -> bool {
		self.shared.is_closed()
	}

	/// Waits for the next event, `Ok(None)` once the stream ended.
	pub async fn next(&self) -> Result<Option<ChangeStreamEvent>> {
		self.shared.latch(Mode::Iterator)?;
		self.core.lock().await.next().await
	}

	/// Performs at most one fetch round, `Ok(None)` if it returned no event.
	pub async fn try_next(&self) -> Result<Option<ChangeStreamEvent>> {
		self.shared.latch(Mode::Iterator)?;
		self.core.lock().await.try_next().await
	}

	pub async fn has_next(&self) -> Result<bool> {
		self.shared.latch(Mode::Iterator)?;
		self.core.lock().await.has_next().await
	}

	/// Converts the change stream into a stream that ends with the change stream or after the first error.
	pub fn into_stream(self) -> Result<impl Stream<Item = Result<ChangeStreamEvent>>> {
		self.shared.latch(Mode::Iterator)?;
		Ok(stream::unfold(Some(self), |stream| async move {
			let stream = stream?;
			let next = stream.core.lock().await.next().await;
			match next {
				Ok(Some(event)) => Some((Ok(event), Some(stream))),
				Ok(None) | Err(Error::ChangeStreamClosed) => None,
				Err(e) => Some((Err(e), None))
			}
		}))
	}

	/// Switches the stream into emitter mode, events are pushed to `handler` from a background task.
	pub fn on_change(&self, handler: impl Fn(&ChangeStreamEvent) + Send + Sync + 'static) -> Result<()> {
		self.shared.latch(Mode::Emitter)?;
		let start = {
			let mut handlers = lock(&self.shared.handlers);
			handlers.change.push(Arc::new(handler));
			!std::mem::replace(&mut handlers.running, true)
		};

		if start {
			self.spawn_emitter();
		}
		Ok(())
	}

	/// Errors that end an emitter-mode stream.
	pub fn on_error(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
		lock(&self.shared.handlers).error.push(Arc::new(handler));
	}

	pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
		lock(&self.shared.handlers).close.push(Arc::new(handler));
	}

	fn spawn_emitter(&self) {
		let core = self.core.clone();
		let shared = self.shared.clone();

		task::spawn(async move {
			while !shared.is_closed() {
				let next = core.lock().await.next().await;
				match next {
					Ok(Some(_)) | Err(_) if shared.is_cancelled() => break,
					Ok(Some(event)) => shared.emit_change(&event),
					Ok(None) | Err(Error::ChangeStreamClosed) => break,
					Err(e) => {
						shared.emit_error(&e);
						break;
					}
				}
			}
			shared.mark_closed();
			tracing::trace!("change stream emitter stopped");
		});
	}

	/// Closes the stream, a fetch in flight completes with `ChangeStreamClosed`.
	pub async fn close(&self) {
		self.shared.cancelled.store(true, Ordering::SeqCst);
		self.shared.mark_closed();

		// otherwise the fetch in flight kills the cursor once it returns
		if let Some(mut core) = self.core.try_lock() {
			core.close().await;
		}
	}
}

impl fmt::Debug for ChangeStream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ChangeStream")
			.field("mode", &self.mode())
			.field("resume_token", &self.resume_token())
			.field("closed", &self.is_closed())
			.finish()
	}
}
