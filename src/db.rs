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
		change_stream::{ChangeStream, ChangeStreamTarget},
		common::{AggregateOptions, ChangeStreamOptions, ReadConcern, ReadPreference},
		cursor::{Cursor, CursorOptions},
		error::{Error, Result},
		selection::Selector,
		utils::duration_millis,
		wire::InvalidReplyError
	},
	std::{fmt, str::FromStr, sync::Arc},
	serde::{Serialize, Deserialize},
	bson::{Bson, Document}
};

/// A `db.collection` pair, collection-less operations use `$cmd.aggregate` as the collection.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Namespace {
	pub db:   String,
	pub coll: String
}

impl Namespace {
	pub fn new(db: &str, coll: &str) -> Self {
		Self { db: db.to_string(), coll: coll.to_string() }
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.db, self.coll)
	}
}

impl FromStr for Namespace {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.split_once('.') {
			Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
			_ => Err(InvalidReplyError::Namespace(s.to_string()).into())
		}
	}
}

impl Serialize for Namespace {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for Namespace {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
	}
}

/// see https://docs.mongodb.com/manual/reference/command/aggregate/
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AggregateCommand<'a> {
	/// The collection name or `1` for collection-less aggregations.
	pub aggregate:    Bson,
	pub pipeline:     &'a [Document],
	pub cursor:       AggregateCommandCursor,
	#[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
	pub max_time_ms:  Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub comment:      Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub read_concern: Option<ReadConcern>
}

#[derive(Debug, Copy, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AggregateCommandCursor {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub batch_size: Option<u32>
}

impl<'a> AggregateCommand<'a> {
	pub fn new(collection: Option<&str>, pipeline: &'a [Document], options: &'a AggregateOptions, read_concern: Option<ReadConcern>) -> Self {
		Self {
			aggregate:    collection.map_or(Bson::Int32(1), |coll| Bson::String(coll.to_string())),
			pipeline,
			cursor:       AggregateCommandCursor { batch_size: options.batch_size },
			max_time_ms:  options.max_time.map(duration_millis),
			comment:      options.comment.as_deref(),
			read_concern: read_concern.filter(|rc| rc.level.is_some())
		}
	}

	pub fn to_document(&self) -> Result<Document> {
		Ok(bson::to_document(self)?)
	}
}

#[derive(Debug, Clone)]
pub struct Database(Arc<DatabaseInner>);

#[derive(Debug)]
pub struct DatabaseInner {
	pub client:          Client,
	pub name:            String,
	pub read_preference: ReadPreference,
	pub read_concern:    Option<ReadConcern>
}

impl std::ops::Deref for Database {
	type Target = DatabaseInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Database {
	pub(crate) fn new(client: Client, name: &str) -> Self {
		Self(Arc::new(DatabaseInner {
			read_preference: client.options().read_preference.clone(),
			read_concern:    client.options().read_concern,
			name:            name.to_string(),
			client
		}))
	}

	pub fn with_read_preference(&self, read_preference: ReadPreference) -> Self {
		Self(Arc::new(DatabaseInner {
			client:          self.client.clone(),
			name:            self.name.clone(),
			read_concern:    self.read_concern,
			read_preference
		}))
	}

	pub fn collection(&self, name: &str) -> Collection {
		Collection { db: self.clone(), name: name.to_string(), read_preference: self.read_preference.clone() }
	}

	/// Runs a command using the database's read preference, commands are not retried.
	pub async fn run_command(&self, command: Document) -> Result<Document> {
		self.client.run_command(&self.name, command, &Selector::Read(self.read_preference.clone()), false).await
	}

	/// Runs a collection-less aggregation such as `$currentOp`, the cursor is created on first use.
	pub fn aggregate(&self, pipeline: Vec<Document>, options: AggregateOptions) -> Result<Cursor> {
		aggregate(self, None, &pipeline, options, &self.read_preference)
	}

	/// Watches all changes of this database, system collections excluded.
	pub fn watch(&self, pipeline: Vec<Document>, options: ChangeStreamOptions) -> Result<ChangeStream> {
		ChangeStream::new(self.client.clone(), ChangeStreamTarget::Database(self.name.clone()), pipeline, options)
	}
}

#[derive(Debug, Clone)]
pub struct Collection {
	db:                  Database,
	name:                String,
	pub read_preference: ReadPreference
}

impl Collection {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn database(&self) -> &Database {
		&self.db
	}

	pub fn namespace(&self) -> Namespace {
		Namespace::new(&self.db.name, &self.name)
	}

	pub fn aggregate(&self, pipeline: Vec<Document>, options: AggregateOptions) -> Result<Cursor> {
		aggregate(&self.db, Some(&self.name), &pipeline, options, &self.read_preference)
	}

	pub fn watch(&self, pipeline: Vec<Document>, options: ChangeStreamOptions) -> Result<ChangeStream> {
		ChangeStream::new(self.db.client.clone(), ChangeStreamTarget::Collection(self.namespace()), pipeline, options)
	}
}

fn aggregate(
	db:              &Database,
	collection:      Option<&str>,
	pipeline:        &[Document],
	options:         AggregateOptions,
	read_preference: &ReadPreference
) -> Result<Cursor> {
	let command = AggregateCommand::new(collection, pipeline, &options, db.read_concern).to_document()?;
	let namespace = Namespace::new(&db.name, collection.unwrap_or("$cmd.aggregate"));

	Ok(Cursor::new(
		db.client.clone(),
		namespace,
		command,
		options.read_preference.unwrap_or_else(|| read_preference.clone()),
		CursorOptions {
			batch_size:     options.batch_size,
			max_await_time: options.max_await_time,
			comment:        options.comment
		}
	))
}

#[cfg(test)]
mod tests {
	use {super::*, bson::doc};

	#[test]
	fn namespace_parsing() {
		let ns = "db.coll.with.dots".parse::<Namespace>().unwrap();
		assert_eq!(ns, Namespace::new("db", "coll.with.dots"));
		assert_eq!(ns.to_string(), "db.coll.with.dots");
		assert!("nodot".parse::<Namespace>().is_err());
		assert!(".coll".parse::<Namespace>().is_err());
	}

	#[test]
	fn aggregate_command_shape() {
		let pipeline = vec![doc! { "$match": { "x": 1 } }];
		let options = AggregateOptions {
			batch_size: Some(10),
			max_time:   Some(std::time::Duration::from_millis(500)),
			..AggregateOptions::default()
		};

		let command = AggregateCommand::new(Some("coll"), &pipeline, &options, None).to_document().unwrap();
		assert_eq!(command, doc! {
			"aggregate": "coll",
			"pipeline": [{ "$match": { "x": 1 } }],
			"cursor": { "batchSize": 10i64 },
			"maxTimeMS": 500i64
		});

		let command = AggregateCommand::new(None, &pipeline, &AggregateOptions::default(), None).to_document().unwrap();
		assert_eq!(command.get("aggregate"), Some(&Bson::Int32(1)));
		assert_eq!(command.get_document("cursor").unwrap(), &doc! {});
	}
}
