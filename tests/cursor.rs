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

mod common;

use {
	self::common::{cursor_reply, wait_for, MockServer, Reply},
	mongo_driver_core::{cursor::CursorState, AggregateOptions, Client, Error},
	std::{sync::{Arc, atomic::{AtomicUsize, Ordering}}, time::Duration},
	futures::TryStreamExt,
	bson::{doc, Document}
};

/// Serves `batches` for `db.coll`, the cursor id drops to 0 with the last one.
async fn serve_batches(batches: Vec<Vec<Document>>) -> MockServer {
	let get_mores = Arc::new(AtomicUsize::new(0));
	MockServer::start(move |command| {
		let name = command.keys().next().map(String::as_str).unwrap_or_default();
		let last = batches.len() - 1;
		match name {
			"aggregate" => Reply::Doc(cursor_reply(true, if last == 0 { 0 } else { 42 }, "db.coll", batches[0].clone(), None)),
			"getMore" => {
				let i = (get_mores.fetch_add(1, Ordering::SeqCst) + 1).min(last);
				Reply::Doc(cursor_reply(false, if i == last { 0 } else { 42 }, "db.coll", batches[i].clone(), None))
			}
			_ => Reply::Doc(doc! { "ok": 1 })
		}
	}).await
}

fn values(range: std::ops::Range<i32>) -> Vec<Document> {
	range.map(|a| doc! { "a": a }).collect()
}

#[async_std::test]
async fn iterates_all_batches() {
	let mock = serve_batches(vec![values(0..2), values(2..3), values(3..5)]).await;
	let client = Client::connect(mock.options()).await.unwrap();
	let mut cursor = client.database("db").collection("coll")
		.aggregate(vec![doc! { "$match": {} }], AggregateOptions { batch_size: Some(2), ..AggregateOptions::default() })
		.unwrap();

	assert_eq!(cursor.state(), CursorState::Uninitialized);
	assert!(mock.received("aggregate").is_empty());

	let mut seen = Vec::new();
	while let Some(document) = cursor.next().await.unwrap() {
		seen.push(document.get_i32("a").unwrap());
	}
	assert_eq!(seen, [0, 1, 2, 3, 4]);
	assert_eq!(cursor.state(), CursorState::Exhausted);
	assert!(cursor.next().await.unwrap().is_none());

	let aggregate = mock.received("aggregate").pop().unwrap();
	let get_mores = mock.received("getMore");
	assert_eq!(get_mores.len(), 2);
	assert_eq!(get_mores[0].get_i64("getMore").unwrap(), 42);
	assert_eq!(get_mores[0].get_str("collection").unwrap(), "coll");
	assert_eq!(get_mores[0].get_i64("batchSize").unwrap(), 2);
	assert_eq!(get_mores[0].get_document("lsid").unwrap(), aggregate.get_document("lsid").unwrap());

	// the session returns to the pool once the cursor is exhausted
	assert_eq!(client.topology().sessions().len(), 1);
	client.close().await;
}

#[async_std::test]
async fn try_next_returns_none_for_an_empty_batch() {
	let mock = serve_batches(vec![values(0..1), Vec::new(), values(1..2)]).await;
	let client = Client::connect(mock.options()).await.unwrap();
	let mut cursor = client.database("db").collection("coll").aggregate(Vec::new(), AggregateOptions::default()).unwrap();

	assert_eq!(cursor.try_next().await.unwrap().unwrap().get_i32("a").unwrap(), 0);
	assert!(cursor.try_next().await.unwrap().is_none());
	assert_eq!(cursor.state(), CursorState::Open);
	assert!(cursor.has_next().await.unwrap());
	assert_eq!(cursor.try_next().await.unwrap().unwrap().get_i32("a").unwrap(), 1);
	assert!(!cursor.has_next().await.unwrap());
	client.close().await;
}

#[async_std::test]
async fn close_kills_the_cursor() {
	let mock = serve_batches(vec![values(0..2), values(2..4)]).await;
	let client = Client::connect(mock.options()).await.unwrap();
	let mut cursor = client.database("db").collection("coll").aggregate(Vec::new(), AggregateOptions::default()).unwrap();

	assert!(cursor.next().await.unwrap().is_some());
	cursor.close().await;
	assert_eq!(cursor.state(), CursorState::Closed);
	assert!(matches!(cursor.next().await, Err(Error::CursorClosed)));

	let kill = mock.received("killCursors");
	assert_eq!(kill.len(), 1);
	assert_eq!(kill[0].get_str("killCursors").unwrap(), "coll");
	assert_eq!(kill[0].get_array("cursors").unwrap(), &vec![bson::Bson::Int64(42)]);
	client.close().await;
}

#[async_std::test]
async fn dropping_an_open_cursor_kills_it() {
	let mock = serve_batches(vec![values(0..2), values(2..4)]).await;
	let client = Client::connect(mock.options()).await.unwrap();
	let mut cursor = client.database("db").collection("coll").aggregate(Vec::new(), AggregateOptions::default()).unwrap();
	assert!(cursor.next().await.unwrap().is_some());
	drop(cursor);

	assert!(wait_for(Duration::from_secs(2), || mock.received("killCursors").len() == 1).await);

	// exhausted cursors are not killed
	let mut cursor = client.database("db").collection("coll").aggregate(Vec::new(), AggregateOptions::default()).unwrap();
	while cursor.next().await.unwrap().is_some() {}
	drop(cursor);
	async_std::task::sleep(Duration::from_millis(100)).await;
	assert_eq!(mock.received("killCursors").len(), 1);
	client.close().await;
}

#[async_std::test]
async fn into_stream() {
	let mock = serve_batches(vec![values(0..3), values(3..6)]).await;
	let client = Client::connect(mock.options()).await.unwrap();
	let documents = client.database("db").aggregate(Vec::new(), AggregateOptions::default()).unwrap()
		.into_stream()
		.try_collect::<Vec<_>>()
		.await
		.unwrap();
	assert_eq!(documents, values(0..6));

	let aggregate = mock.received("aggregate").pop().unwrap();
	assert_eq!(aggregate.get_i32("aggregate").unwrap(), 1);
	client.close().await;
}

#[async_std::test]
async fn get_more_errors_close_the_cursor() {
	let mock = MockServer::start(|command| match command.keys().next().map(String::as_str) {
		Some("aggregate") => Reply::Doc(cursor_reply(true, 42, "db.coll", Vec::new(), None)),
		Some("getMore") => Reply::Doc(common::command_error(mongo_driver_core::error::code::CURSOR_NOT_FOUND, &[])),
		_ => Reply::Doc(doc! { "ok": 1 })
	}).await;
	let client = Client::connect(mock.options()).await.unwrap();
	let mut cursor = client.database("db").collection("coll").aggregate(Vec::new(), AggregateOptions::default()).unwrap();

	assert!(cursor.try_next().await.unwrap().is_none());
	let err = cursor.try_next().await.unwrap_err();
	assert_eq!(err.code(), Some(mongo_driver_core::error::code::CURSOR_NOT_FOUND));
	assert_eq!(cursor.state(), CursorState::Closed);
	// the server already discarded it
	assert!(mock.received("killCursors").is_empty());
	client.close().await;
}
