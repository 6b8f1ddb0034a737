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
		common::{HostAddress, ClientOptionsParseError},
		description::{TopologyDescription, TopologyType, TopologyVersion},
		wire::InvalidReplyError
	},
	std::{io, sync::Arc, time::Duration},
	bson::{Bson, Document},
	thiserror::Error
};

pub type Result<T> = std::result::Result<T, Error>;

/// Server error codes inspected by the driver.
///
/// see https://github.com/mongodb/mongo/blob/master/src/mongo/base/error_codes.yml
pub mod code {
	pub const HOST_UNREACHABLE:                     i32 = 6;
	pub const HOST_NOT_FOUND:                       i32 = 7;
	pub const CURSOR_NOT_FOUND:                     i32 = 43;
	pub const STALE_SHARD_VERSION:                  i32 = 63;
	pub const NETWORK_TIMEOUT:                      i32 = 89;
	pub const SHUTDOWN_IN_PROGRESS:                 i32 = 91;
	pub const FAILED_TO_SATISFY_READ_PREFERENCE:    i32 = 133;
	pub const STALE_EPOCH:                          i32 = 150;
	pub const PRIMARY_STEPPED_DOWN:                 i32 = 189;
	pub const RETRY_CHANGE_STREAM:                  i32 = 234;
	pub const EXCEEDED_TIME_LIMIT:                  i32 = 262;
	pub const CHANGE_STREAM_FATAL_ERROR:            i32 = 280;
	pub const SOCKET_EXCEPTION:                     i32 = 9001;
	pub const LEGACY_NOT_PRIMARY:                   i32 = 10058;
	pub const NOT_WRITABLE_PRIMARY:                 i32 = 10107;
	pub const STALE_CONFIG:                         i32 = 13388;
	pub const NOT_PRIMARY_NO_SECONDARY_OK:          i32 = 13435;
	pub const NOT_PRIMARY_OR_SECONDARY:             i32 = 13436;
	pub const INTERRUPTED_AT_SHUTDOWN:              i32 = 11600;
	pub const INTERRUPTED:                          i32 = 11601;
	pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
}

pub const RETRYABLE_WRITE_ERROR:                 &str = "RetryableWriteError";
pub const RESUMABLE_CHANGE_STREAM_ERROR:         &str = "ResumableChangeStreamError";
pub const NON_RESUMABLE_CHANGE_STREAM_ERROR:     &str = "NonResumableChangeStreamError";

const RECOVERING_CODES: [i32; 5] = [
	code::SHUTDOWN_IN_PROGRESS,
	code::PRIMARY_STEPPED_DOWN,
	code::INTERRUPTED_AT_SHUTDOWN,
	code::INTERRUPTED_DUE_TO_REPL_STATE_CHANGE,
	code::NOT_PRIMARY_OR_SECONDARY
];

const NOT_WRITABLE_PRIMARY_CODES: [i32; 3] = [
	code::NOT_WRITABLE_PRIMARY,
	code::NOT_PRIMARY_NO_SECONDARY_OK,
	code::LEGACY_NOT_PRIMARY
];

const SHUTTING_DOWN_CODES: [i32; 2] = [
	code::INTERRUPTED_AT_SHUTDOWN,
	code::SHUTDOWN_IN_PROGRESS
];

const RETRYABLE_READ_CODES: [i32; 12] = [
	code::INTERRUPTED_AT_SHUTDOWN,
	code::INTERRUPTED_DUE_TO_REPL_STATE_CHANGE,
	code::NOT_WRITABLE_PRIMARY,
	code::NOT_PRIMARY_NO_SECONDARY_OK,
	code::NOT_PRIMARY_OR_SECONDARY,
	code::PRIMARY_STEPPED_DOWN,
	code::SHUTDOWN_IN_PROGRESS,
	code::HOST_NOT_FOUND,
	code::HOST_UNREACHABLE,
	code::NETWORK_TIMEOUT,
	code::SOCKET_EXCEPTION,
	code::EXCEEDED_TIME_LIMIT
];

/// Decides which change stream failures may be retried by reopening the stream.
///
/// Servers at or above `label_wire_version` attach the `ResumableChangeStreamError` label
/// themselves, older servers are judged by `codes`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResumePolicy {
	pub label_wire_version: i32,
	pub codes:              Vec<i32>
}

impl Default for ResumePolicy {
	fn default() -> Self {
		Self {
			label_wire_version: 9,
			codes: vec![
				code::HOST_UNREACHABLE,
				code::HOST_NOT_FOUND,
				code::NETWORK_TIMEOUT,
				code::SHUTDOWN_IN_PROGRESS,
				code::PRIMARY_STEPPED_DOWN,
				code::EXCEEDED_TIME_LIMIT,
				code::SOCKET_EXCEPTION,
				code::NOT_WRITABLE_PRIMARY,
				code::INTERRUPTED_AT_SHUTDOWN,
				code::INTERRUPTED_DUE_TO_REPL_STATE_CHANGE,
				code::NOT_PRIMARY_NO_SECONDARY_OK,
				code::NOT_PRIMARY_OR_SECONDARY,
				code::STALE_SHARD_VERSION,
				code::STALE_EPOCH,
				code::STALE_CONFIG,
				code::RETRY_CHANGE_STREAM,
				code::FAILED_TO_SATISFY_READ_PREFERENCE,
				code::CURSOR_NOT_FOUND
			]
		}
	}
}

#[derive(Debug, Clone, Error)]
pub enum Error {
	#[error("invalid client options: {0}")]
	InvalidClientOptions(#[from] ClientOptionsParseError),
	#[error("a lock was poisoned")]
	Sync,
	#[error("network error: {0}")]
	Io(Arc<io::Error>),
	#[error("connection {connection_id} to {address} was interrupted because its pool was cleared")]
	PoolCleared { address: HostAddress, connection_id: u32 },
	#[error("invalid reply: {0}")]
	InvalidReply(#[from] InvalidReplyError),
	#[error(transparent)]
	Command(#[from] CommandError),
	#[error("server selection failed: {reason}")]
	ServerSelection { reason: SelectionFailure, topology: Arc<TopologyDescription> },
	#[error("connection pool for {0} is closed")]
	PoolClosed(HostAddress),
	#[error("timed out after {waited:?} while waiting for a connection to {address}")]
	WaitQueueTimeout { address: HostAddress, waited: Duration },
	#[error("cursor is closed")]
	CursorClosed,
	#[error("ChangeStream is closed")]
	ChangeStreamClosed,
	#[error("{0}")]
	ChangeStreamMode(&'static str),
	#[error("cannot provide resume functionality when the resume token is missing")]
	MissingResumeToken,
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	#[error("failed to encode bson: {0}")]
	BsonEncode(Arc<bson::ser::Error>),
	#[error("failed to decode bson: {0}")]
	BsonDecode(Arc<bson::de::Error>),
	#[error("authentication failed: {0}")]
	Auth(String),
	#[error("SRV lookup failed: {0}")]
	Srv(String),
	#[error("topology is closed")]
	TopologyClosed
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst
#[derive(Debug, Clone, Error)]
pub enum SelectionFailure {
	#[error("no primary is available")]
	NoPrimary,
	#[error("no server in the {0:?} topology matches the selector")]
	NoMatchingServer(TopologyType),
	#[error("{address}: {error}")]
	ServerError { address: HostAddress, error: Box<Error> },
	#[error("{0}")]
	Incompatible(String)
}

/// A command reply with `ok: 0`.
#[derive(Debug, Clone, Error)]
#[error("command failed ({code_name}, code {code:?}): {message}")]
pub struct CommandError {
	pub code:             Option<i32>,
	pub code_name:        String,
	pub message:          String,
	pub labels:           Vec<String>,
	pub topology_version: Option<TopologyVersion>
}

impl CommandError {
	pub(crate) fn from_reply(reply: &Document) -> Self {
		Self {
			code:             reply.get("code").and_then(bson_to_i64).map(|v| v as i32),
			code_name:        reply.get_str("codeName").unwrap_or_default().to_string(),
			message:          reply.get_str("errmsg").unwrap_or_default().to_string(),
			labels:           reply.get_array("errorLabels")
				.map(|labels| labels.iter().filter_map(Bson::as_str).map(str::to_string).collect())
				.unwrap_or_default(),
			topology_version: reply.get_document("topologyVersion").ok()
				.and_then(|doc| bson::from_document(doc.clone()).ok())
		}
	}
}

/// Reads a numeric reply field regardless of its bson width.
pub(crate) fn bson_to_i64(value: &Bson) -> Option<i64> {
	match value {
		Bson::Int32(v)  => Some(*v as i64),
		Bson::Int64(v)  => Some(*v),
		Bson::Double(v) => Some(*v as i64),
		_ => None
	}
}

/// Checks the `ok` field of a command reply.
pub(crate) fn check_reply(reply: Document) -> Result<Document> {
	match reply.get("ok").and_then(bson_to_i64) {
		Some(1) => Ok(reply),
		_ => Err(Error::Command(CommandError::from_reply(&reply)))
	}
}

impl Error {
	pub fn code(&self) -> Option<i32> {
		match self {
			Self::Command(e) => e.code,
			Self::ServerSelection { reason: SelectionFailure::ServerError { error, .. }, .. } => error.code(),
			_ => None
		}
	}

	pub fn labels(&self) -> &[String] {
		match self {
			Self::Command(e) => &e.labels,
			_ => &[]
		}
	}

	pub fn has_label(&self, label: &str) -> bool {
		self.labels().iter().any(|l| l == label)
	}

	pub fn topology_version(&self) -> Option<&TopologyVersion> {
		match self {
			Self::Command(e) => e.topology_version.as_ref(),
			_ => None
		}
	}

	fn message(&self) -> Option<&str> {
		match self {
			Self::Command(e) if e.code.is_none() => Some(e.message.as_str()),
			_ => None
		}
	}

	pub fn is_network_error(&self) -> bool {
		matches!(self, Self::Io(_) | Self::PoolCleared { .. })
	}

	pub fn is_network_timeout(&self) -> bool {
		matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#not-writable-primary-and-node-is-recovering
	pub fn is_recovering(&self) -> bool {
		match (self.code(), self.message()) {
			(Some(code), _) => RECOVERING_CODES.contains(&code),
			(None, Some(msg)) => msg.contains("not master or secondary") || msg.contains("node is recovering"),
			_ => false
		}
	}

	pub fn is_not_writable_primary(&self) -> bool {
		match (self.code(), self.message()) {
			(Some(code), _) => NOT_WRITABLE_PRIMARY_CODES.contains(&code),
			(None, Some(msg)) => !self.is_recovering() && msg.contains("not master"),
			_ => false
		}
	}

	pub fn is_state_change_error(&self) -> bool {
		self.is_recovering() || self.is_not_writable_primary()
	}

	pub fn is_node_shutting_down(&self) -> bool {
		self.code().map_or(false, |code| SHUTTING_DOWN_CODES.contains(&code))
	}

	pub fn is_retryable_read(&self) -> bool {
		self.is_network_error() || self.code().map_or(false, |code| RETRYABLE_READ_CODES.contains(&code))
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/change-streams/change-streams.rst#resumable-error
	pub fn is_resumable(&self, max_wire_version: i32, policy: &ResumePolicy) -> bool {
		if self.code() == Some(code::INTERRUPTED) || self.has_label(NON_RESUMABLE_CHANGE_STREAM_ERROR) {
			return false;
		}

		if self.is_network_error() {
			return true;
		}

		match self {
			Self::Command(e) => match e.code {
				Some(code::CURSOR_NOT_FOUND) => true,
				_ if max_wire_version >= policy.label_wire_version => self.has_label(RESUMABLE_CHANGE_STREAM_ERROR),
				Some(code) => policy.codes.contains(&code),
				None => false
			},
			_ => false
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::Io(Arc::new(e))
	}
}

impl From<async_std::future::TimeoutError> for Error {
	fn from(_: async_std::future::TimeoutError) -> Self {
		Self::Io(Arc::new(io::Error::new(io::ErrorKind::TimedOut, "operation timed out")))
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

impl From<bson::ser::Error> for Error {
	fn from(e: bson::ser::Error) -> Self {
		Self::BsonEncode(Arc::new(e))
	}
}

impl From<bson::de::Error> for Error {
	fn from(e: bson::de::Error) -> Self {
		Self::BsonDecode(Arc::new(e))
	}
}
