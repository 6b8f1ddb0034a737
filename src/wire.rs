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
		common::HostAddress,
		description::TopologyVersion,
		error::Result,
		utils::next_request_id
	},
	std::{collections::HashMap, io},
	serde::{Serialize, Deserialize},
	bson::{Document, DateTime, oid::ObjectId},
	futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	thiserror::Error
};

pub const MIN_WIRE_VERSION: i32 = 6;
pub const MAX_WIRE_VERSION: i32 = 21;

#[cfg(feature = "compress")]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[Compressor::Zstd, Compressor::Noop];
#[cfg(not(feature = "compress"))]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[Compressor::Noop];

/// OP_MSG flag bits
///
/// see https://github.com/mongodb/specifications/blob/master/source/message/OP_MSG.rst#flag-bits
pub mod flags {
	pub const CHECKSUM_PRESENT: u32 = 1;
	pub const MORE_TO_COME:     u32 = 1 << 1;
	pub const EXHAUST_ALLOWED:  u32 = 1 << 16;
}

const HEADER_LEN:      usize = 16;
const COMPRESSION_LEN: usize = 9;

/// Commands whose payload must never be compressed.
const UNCOMPRESSABLE: [&str; 11] = [
	"hello", "isMaster", "ismaster", "saslStart", "saslContinue", "getnonce",
	"authenticate", "createUser", "updateUser", "copydbSaslStart", "copydbgetnonce"
];

pub(crate) fn may_compress(command_name: &str) -> bool {
	!UNCOMPRESSABLE.contains(&command_name)
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum InvalidReplyError {
	#[error("unexpected op code {0}")]
	OpCode(i32),
	#[error("reply is for request {actual}, expected {expected}")]
	ResponseTo { expected: i32, actual: i32 },
	#[error("unsupported section kind {0}")]
	PayloadType(u8),
	#[error("unsupported compressor id {0}")]
	Compression(u8),
	#[error("message of {0} bytes exceeds the maximum message size")]
	TooLarge(usize),
	#[error("invalid namespace `{0}`")]
	Namespace(String),
	#[error("{0}")]
	Malformed(&'static str)
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Compressed   = 2012,
	Msg          = 2013
}

impl OpCode {
	fn from_i32(v: i32) -> std::result::Result<Self, InvalidReplyError> {
		match v {
			2012 => Ok(Self::Compressed),
			2013 => Ok(Self::Msg),
			v    => Err(InvalidReplyError::OpCode(v))
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: u32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	fn copy_from_slice(buf: &[u8; HEADER_LEN]) -> std::result::Result<Self, InvalidReplyError> {
		Ok(Self {
			message_length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
			request_id:     i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
			response_to:    i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
			op_code:        OpCode::from_i32(i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]))?
		})
	}
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compressor {
	Noop   = 0,
	Snappy = 1,
	Zlib   = 2,
	Zstd   = 3
}

impl Compressor {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Noop   => "noop",
			Self::Snappy => "snappy",
			Self::Zlib   => "zlib",
			Self::Zstd   => "zstd"
		}
	}

	fn from_id(id: u8) -> std::result::Result<Self, InvalidReplyError> {
		match id {
			0 => Ok(Self::Noop),
			3 if cfg!(feature = "compress") => Ok(Self::Zstd),
			id => Err(InvalidReplyError::Compression(id))
		}
	}

	fn compress(self, buf: &[u8]) -> io::Result<Vec<u8>> {
		match self {
			Self::Noop => Ok(buf.to_vec()),
			#[cfg(feature = "compress")]
			Self::Zstd => zstd::stream::encode_all(buf, 0),
			compressor => Err(io::Error::new(io::ErrorKind::Unsupported,
				format!("unsupported compressor: {:?}", compressor)))
		}
	}

	fn decompress(self, buf: &[u8]) -> io::Result<Vec<u8>> {
		match self {
			Self::Noop => Ok(buf.to_vec()),
			#[cfg(feature = "compress")]
			Self::Zstd => zstd::stream::decode_all(buf),
			compressor => Err(io::Error::new(io::ErrorKind::Unsupported,
				format!("unsupported compressor: {:?}", compressor)))
		}
	}
}

impl std::str::FromStr for Compressor {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"noop"   => Self::Noop,
			"snappy" => Self::Snappy,
			"zlib"   => Self::Zlib,
			"zstd"   => Self::Zstd,
			_ => return Err(())
		})
	}
}

impl Serialize for Compressor {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> where
		S: serde::Serializer {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Compressor {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: serde::Deserializer<'de> {
		Ok(String::deserialize(deserializer)?.parse().unwrap_or(Self::Noop))
	}
}

/// A single OP_MSG with one body section.
///
/// see https://github.com/mongodb/specifications/blob/master/source/message/OP_MSG.rst
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub request_id:  i32,
	pub response_to: i32,
	pub flags:       u32,
	pub document:    Document
}

impl Message {
	pub fn new(document: Document, flags: u32) -> Self {
		Self { request_id: next_request_id(), response_to: 0, flags, document }
	}

	pub fn reply_to(request_id: i32, document: Document, flags: u32) -> Self {
		Self { request_id: next_request_id(), response_to: request_id, flags, document }
	}

	pub fn more_to_come(&self) -> bool {
		self.flags & flags::MORE_TO_COME != 0
	}

	/// Writes the message, wrapped in OP_COMPRESSED if a compressor is given.
	pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(
		&self,
		writer:     &mut W,
		compressor: Option<Compressor>
	) -> Result<()> {
		let mut body = Vec::with_capacity(256);
		body.extend_from_slice(&(self.flags & !flags::CHECKSUM_PRESENT).to_le_bytes());
		body.push(0);
		self.document.to_writer(&mut body)?;

		let mut buf = vec![0u8; HEADER_LEN];
		let op_code = match compressor {
			None => {
				buf.extend_from_slice(&body);
				OpCode::Msg
			}
			Some(compressor) => {
				buf.extend_from_slice(&(OpCode::Msg as i32).to_le_bytes());
				buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
				buf.push(compressor as u8);
				buf.extend_from_slice(&compressor.compress(&body)?);
				OpCode::Compressed
			}
		};

		Header {
			message_length: buf.len() as _,
			request_id:     self.request_id,
			response_to:    self.response_to,
			op_code
		}.copy_to_slice(&mut buf[..HEADER_LEN]);

		writer.write_all(&buf).await?;
		writer.flush().await?;
		Ok(())
	}

	/// Reads one message, transparently decompressing OP_COMPRESSED payloads.
	pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, max_size: usize) -> Result<Self> {
		let mut header = [0u8; HEADER_LEN];
		reader.read_exact(&mut header).await?;
		let header = Header::copy_from_slice(&header)?;

		let length = header.message_length as usize;
		if length > max_size {
			return Err(InvalidReplyError::TooLarge(length).into());
		} else if length < HEADER_LEN + 5 {
			return Err(InvalidReplyError::Malformed("message is too short").into());
		}

		let mut buf = vec![0u8; length - HEADER_LEN];
		reader.read_exact(&mut buf).await?;

		if header.op_code == OpCode::Compressed {
			if buf.len() < COMPRESSION_LEN {
				return Err(InvalidReplyError::Malformed("compressed message is too short").into());
			}

			let original = OpCode::from_i32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))?;
			let uncompressed_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
			let compressor = Compressor::from_id(buf[8])?;

			if original != OpCode::Msg {
				return Err(InvalidReplyError::OpCode(original as i32).into());
			} else if uncompressed_size > max_size {
				return Err(InvalidReplyError::TooLarge(uncompressed_size).into());
			}

			buf = compressor.decompress(&buf[COMPRESSION_LEN..])?;
			if buf.len() != uncompressed_size {
				return Err(InvalidReplyError::Malformed("uncompressed size mismatch").into());
			}
		}

		Self::parse_body(header, &buf)
	}

	fn parse_body(header: Header, buf: &[u8]) -> Result<Self> {
		if buf.len() < 5 {
			return Err(InvalidReplyError::Malformed("message is too short").into());
		}

		let flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
		let mut sections = &buf[4..];

		if flags & flags::CHECKSUM_PRESENT != 0 {
			if sections.len() < 4 {
				return Err(InvalidReplyError::Malformed("missing checksum").into());
			}
			sections = &sections[..sections.len() - 4];
		}

		match sections.first() {
			None => Err(InvalidReplyError::Malformed("message has no sections").into()),
			Some(0) => Ok(Self {
				request_id:  header.request_id,
				response_to: header.response_to,
				flags,
				document:    Document::from_reader(&mut &sections[1..])?
			}),
			Some(&kind) => Err(InvalidReplyError::PayloadType(kind).into())
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloRequest<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hello:                Option<i32>,
	#[serde(rename = "isMaster", skip_serializing_if = "Option::is_none")]
	pub is_master:            Option<i32>,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub hello_ok:             bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client:               Option<ClientMetadata<'a>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub compression:          Option<&'a [Compressor]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub sasl_supported_mechs: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub topology_version:     Option<&'a TopologyVersion>,
	#[serde(rename = "maxAwaitTimeMS", skip_serializing_if = "Option::is_none")]
	pub max_await_time_ms:    Option<i64>,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub load_balanced:        bool
}

impl<'a> HelloRequest<'a> {
	/// Handshakes use the legacy command name until the server confirms `helloOk`.
	pub fn new(hello_ok: bool) -> Self {
		Self {
			hello:                hello_ok.then_some(1),
			is_master:            (!hello_ok).then_some(1),
			hello_ok:             true,
			client:               None,
			compression:          None,
			sasl_supported_mechs: None,
			topology_version:     None,
			max_await_time_ms:    None,
			load_balanced:        false
		}
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst#client-metadata
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientMetadata<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub application: Option<ClientMetadataApplication<'a>>,
	pub driver:      ClientMetadataDriver<'a>,
	pub os:          ClientMetadataOs<'a>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub platform:    Option<&'a str>
}

impl<'a> ClientMetadata<'a> {
	pub fn new(appname: Option<&'a str>) -> Self {
		Self {
			application: appname.map(|name| ClientMetadataApplication { name }),
			driver: ClientMetadataDriver {
				name:    crate::DRIVER_NAME,
				version: env!("CARGO_PKG_VERSION")
			},
			os: ClientMetadataOs {
				r#type:       std::env::consts::OS,
				architecture: std::env::consts::ARCH
			},
			platform: Some("async-std")
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ClientMetadataApplication<'a> {
	pub name: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ClientMetadataDriver<'a> {
	pub name:    &'a str,
	pub version: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ClientMetadataOs<'a> {
	#[serde(rename = "type")]
	pub r#type:       &'a str,
	pub architecture: &'a str
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#parsing-a-hello-or-legacy-hello-response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
	#[serde(alias = "ismaster")]
	pub is_writable_primary:             bool,
	pub hello_ok:                        bool,
	pub max_bson_object_size:            Option<i64>,
	pub max_message_size_bytes:          Option<i64>,
	pub max_write_batch_size:            Option<i64>,
	pub local_time:                      Option<DateTime>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub connection_id:                   Option<i64>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub read_only:                       bool,
	pub compression:                     Option<Vec<Compressor>>,
	pub sasl_supported_mechs:            Option<Vec<String>>,
	pub topology_version:                Option<TopologyVersion>,
	pub service_id:                      Option<ObjectId>,
	// sharded instances
	pub msg:                             Option<String>,
	// replica sets
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub secondary:                       bool,
	pub arbiter_only:                    bool,
	pub passive:                         bool,
	pub hidden:                          bool,
	pub hosts:                           Vec<HostAddress>,
	pub passives:                        Vec<HostAddress>,
	pub arbiters:                        Vec<HostAddress>,
	pub primary:                         Option<HostAddress>,
	pub me:                              Option<HostAddress>,
	pub tags:                            HashMap<String, String>,
	pub last_write:                      Option<LastWrite>,
	pub isreplicaset:                    bool
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	pub last_write_date: DateTime
}

#[cfg(test)]
mod tests {
	use {super::*, crate::error::Error, bson::doc, futures::io::Cursor};

	#[async_std::test]
	async fn message_framing() {
		let message = Message::new(doc! { "ping": 1, "$db": "admin" }, flags::EXHAUST_ALLOWED);
		let mut buf = Cursor::new(Vec::new());
		message.write_to(&mut buf, None).await.unwrap();

		let bytes = buf.get_ref();
		assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize, bytes.len());
		assert_eq!(i32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]), 2013);

		buf.set_position(0);
		let read = Message::read_from(&mut buf, 1024).await.unwrap();
		assert_eq!(read, message);
		assert!(!read.more_to_come());
	}

	#[cfg(feature = "compress")]
	#[async_std::test]
	async fn compressed_framing() {
		let message = Message::reply_to(7, doc! { "ok": 1, "payload": "x".repeat(512) }, flags::MORE_TO_COME);
		let mut buf = Cursor::new(Vec::new());
		message.write_to(&mut buf, Some(Compressor::Zstd)).await.unwrap();
		assert_eq!(i32::from_le_bytes(buf.get_ref()[12..16].try_into().unwrap()), 2012);
		assert!(buf.get_ref().len() < 512);

		buf.set_position(0);
		let read = Message::read_from(&mut buf, 1 << 20).await.unwrap();
		assert_eq!(read.response_to, 7);
		assert!(read.more_to_come());
		assert_eq!(read.document, message.document);
	}

	#[async_std::test]
	async fn rejects_oversized_messages() {
		let mut buf = Cursor::new(Vec::new());
		Message::new(doc! { "ping": 1 }, 0).write_to(&mut buf, None).await.unwrap();
		buf.set_position(0);
		assert!(matches!(Message::read_from(&mut buf, 8).await,
			Err(Error::InvalidReply(InvalidReplyError::TooLarge(_)))));
	}

	#[async_std::test]
	async fn checksum_without_sections_is_malformed() {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&24_i32.to_le_bytes());
		bytes.extend_from_slice(&1_i32.to_le_bytes());
		bytes.extend_from_slice(&0_i32.to_le_bytes());
		bytes.extend_from_slice(&2013_i32.to_le_bytes());
		bytes.extend_from_slice(&flags::CHECKSUM_PRESENT.to_le_bytes());
		bytes.extend_from_slice(&[0; 4]);

		assert!(matches!(Message::read_from(&mut Cursor::new(bytes), 1024).await,
			Err(Error::InvalidReply(InvalidReplyError::Malformed(_)))));
	}

	#[test]
	fn hello_request_shape() {
		let doc = bson::to_document(&HelloRequest::new(false)).unwrap();
		assert_eq!(doc.keys().next().map(String::as_str), Some("isMaster"));
		assert_eq!(doc.get_bool("helloOk"), Ok(true));

		let version = TopologyVersion { process_id: ObjectId::new(), counter: 3 };
		let doc = bson::to_document(&HelloRequest {
			topology_version:  Some(&version),
			max_await_time_ms: Some(10_000),
			..HelloRequest::new(true)
		}).unwrap();
		assert_eq!(doc.keys().next().map(String::as_str), Some("hello"));
		assert_eq!(doc.get_i64("maxAwaitTimeMS"), Ok(10_000));
		assert!(doc.get_document("topologyVersion").is_ok());
	}

	#[test]
	fn hello_reply_parsing() {
		let reply: HelloReply = bson::from_document(doc! {
			"ismaster": true, "setName": "rs0", "hosts": ["A:27017", "b:27018"],
			"minWireVersion": 0, "maxWireVersion": 17, "ok": 1.0,
			"compression": ["zstd", "unknown"]
		}).unwrap();
		assert!(reply.is_writable_primary);
		assert_eq!(reply.hosts[0], HostAddress::new("a", Some(27017)));
		assert_eq!(reply.compression.unwrap(), vec![Compressor::Zstd, Compressor::Noop]);
	}
}
