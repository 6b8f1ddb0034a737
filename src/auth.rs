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
		common::Credential,
		connection::Connection,
		error::Result,
		wire::HelloReply
	},
	async_trait::async_trait
};

pub const SCRAM_SHA_1:   &str = "SCRAM-SHA-1";
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Performs the authentication conversation on a freshly handshaked connection.
///
/// Concrete mechanisms live outside this crate; the connection is ready for `Connection::command`
/// and the handshake reply carries the mechanisms the server offered for the user.
///
/// see https://github.com/mongodb/specifications/blob/master/source/auth/auth.rst
#[async_trait]
pub trait Authenticator: Send + Sync {
	async fn authenticate(
		&self,
		connection: &mut Connection,
		credential: &Credential,
		mechanism:  &str,
		hello:      &HelloReply
	) -> Result<()>;
}

impl Credential {
	/// The `saslSupportedMechs` value sent with the handshake when no mechanism is configured.
	pub(crate) fn sasl_supported_mechs(&self) -> Option<String> {
		match (&self.mechanism, &self.username) {
			(None, Some(user)) => Some(format!("{}.{}", self.resolved_source(), user)),
			_ => None
		}
	}

	/// see https://github.com/mongodb/specifications/blob/master/source/auth/auth.rst#defaults
	pub fn negotiate_mechanism<'a>(&'a self, hello: &HelloReply) -> &'a str {
		match &self.mechanism {
			Some(mechanism) => mechanism.as_str(),
			None if hello.sasl_supported_mechs.as_ref()
				.map_or(false, |mechs| mechs.iter().any(|m| m == SCRAM_SHA_256)) => SCRAM_SHA_256,
			None => SCRAM_SHA_1
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mechanism_negotiation() {
		let credential = Credential {
			username: Some("alice".to_string()),
			source:   Some("db".to_string()),
			..Credential::default()
		};
		assert_eq!(credential.sasl_supported_mechs().as_deref(), Some("db.alice"));

		let mut hello = HelloReply::default();
		assert_eq!(credential.negotiate_mechanism(&hello), SCRAM_SHA_1);

		hello.sasl_supported_mechs = Some(vec![SCRAM_SHA_1.to_string(), SCRAM_SHA_256.to_string()]);
		assert_eq!(credential.negotiate_mechanism(&hello), SCRAM_SHA_256);

		let explicit = Credential { mechanism: Some("PLAIN".to_string()), ..credential };
		assert_eq!(explicit.negotiate_mechanism(&hello), "PLAIN");
		assert_eq!(explicit.sasl_supported_mechs(), None);
	}
}
