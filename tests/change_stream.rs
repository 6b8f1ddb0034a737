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
	self::common::{command_error, cursor_reply, standalone, wait_for, MockServer, Reply},
	mongo_driver_core::{
		error::code,
		ChangeStreamOptions, Client, Error, FullDocument, OperationType, ResumeToken
	},
	std::{sync::{Arc, Mutex, atomic::{AtomicUsize, Ordering}}, time::Duration},
	futures::StreamExt,
	bson::{doc, Document}
};

fn token(data: &str) -> Document {
	doc! { "_data": data }
}

fn event(n: i32) -> Document {
	doc! {
		"_id": token(&n.to_string()),
		"operationType": "insert",
		"ns": { "db": "db", "coll": "coll" },
		"documentKey": { "_id": n },
		"fullDocument": { "_id": n, "f": 128 }
	}
}

fn command_name(command: &Document) -> &str {
	command.keys().next().map(String::as_str).unwrap_or_default()
}

fn change_stream_stage(aggregate: &Document) -> Document {
	aggregate.get_array("pipeline").unwrap()[0].as_document().unwrap()
		.get_document("$changeStream").unwrap().clone()
}

/// Answers the n-th `aggregate` with `aggregates[n]` and every `getMore` with `get_more(n)`.
async fn script(
	max_wire_version: i32,
	aggregates:       Vec<Document>,
	get_more:         impl Fn(usize) -> Reply + Send + Sync + 'static
) -> MockServer {
	let mut hello = standalone();
	hello.insert("maxWireVersion", max_wire_version);

	let aggregate_count = Arc::new(AtomicUsize::new(0));
	let get_more_count = Arc::new(AtomicUsize::new(0));
	MockServer::with_hello(hello, move |command| match command_name(command) {
		"aggregate" => {
			let n = aggregate_count.fetch_add(1, Ordering::SeqCst).min(aggregates.len() - 1);
			Reply::Doc(aggregates[n].clone())
		}
		"getMore" => get_more(get_more_count.fetch_add(1, Ordering::SeqCst)),
		_ => Reply::Doc(doc! { "ok": 1 })
	}).await
}

async fn connect(mock: &MockServer) -> Client {
	let mut options = mock.options();
	options.server_selection.heartbeat_frequency = Duration::from_millis(600);
	Client::connect(options).await.unwrap()
}

#[async_std::test]
async fn resumes_once_after_a_resumable_get_more_error() {
	let mock = script(8, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1)], None),
		cursor_reply(true, 43, "db.coll", vec![event(2)], None)
	], |_| Reply::Doc(command_error(code::SHUTDOWN_IN_PROGRESS, &[]))).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	let first = stream.next().await.unwrap().unwrap();
	assert_eq!(first.id, ResumeToken::from(token("1")));
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("1"))));

	let second = stream.next().await.unwrap().unwrap();
	assert_eq!(second.id, ResumeToken::from(token("2")));
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("2"))));

	let aggregates = mock.received("aggregate");
	assert_eq!(aggregates.len(), 2);
	assert_eq!(mock.received("getMore").len(), 1);
	assert_eq!(change_stream_stage(&aggregates[0]), doc! {});
	assert_eq!(change_stream_stage(&aggregates[1]), doc! { "resumeAfter": token("1") });

	stream.close().await;
	client.close().await;
}

#[async_std::test]
async fn label_decides_resumability_on_newer_servers() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1)], None)
	], |_| Reply::Doc(command_error(code::SHUTDOWN_IN_PROGRESS, &[]))).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	assert!(stream.next().await.unwrap().is_some());
	let err = stream.next().await.unwrap_err();
	assert_eq!(err.code(), Some(code::SHUTDOWN_IN_PROGRESS));
	assert!(stream.is_closed());
	assert!(matches!(stream.next().await, Err(Error::ChangeStreamClosed)));
	assert_eq!(mock.received("aggregate").len(), 1);
	client.close().await;
}

#[async_std::test]
async fn failed_resume_closes_the_stream() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", Vec::new(), None),
		command_error(code::INTERRUPTED, &[])
	], |_| Reply::Doc(command_error(code::CURSOR_NOT_FOUND, &[]))).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	assert!(stream.try_next().await.unwrap().is_none());
	let err = stream.try_next().await.unwrap_err();
	assert_eq!(err.code(), Some(code::INTERRUPTED));
	assert!(stream.is_closed());
	assert_eq!(mock.received("aggregate").len(), 2);
	assert!(matches!(stream.try_next().await, Err(Error::ChangeStreamClosed)));
	client.close().await;
}

#[async_std::test]
async fn start_after_is_kept_until_the_first_event() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", Vec::new(), None),
		cursor_reply(true, 43, "db.coll", vec![event(7)], None),
		cursor_reply(true, 44, "db.coll", Vec::new(), None)
	], |n| match n {
		0 | 1 => Reply::Doc(command_error(code::CURSOR_NOT_FOUND, &[])),
		_ => Reply::Doc(cursor_reply(false, 44, "db.coll", Vec::new(), None))
	}).await;
	let client = connect(&mock).await;
	let options = ChangeStreamOptions { start_after: Some(ResumeToken::from(token("0"))), ..ChangeStreamOptions::default() };
	let stream = client.database("db").collection("coll").watch(Vec::new(), options).unwrap();
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("0"))));

	// the initial aggregate returns nothing, then the first getMore fails and the resumed stream yields event 7
	assert!(stream.try_next().await.unwrap().is_none());
	assert_eq!(stream.next().await.unwrap().unwrap().id, ResumeToken::from(token("7")));

	// the second getMore fails, an event was received so resumeAfter is used
	assert!(stream.try_next().await.unwrap().is_none());

	let aggregates = mock.received("aggregate");
	assert_eq!(aggregates.len(), 3);
	assert_eq!(change_stream_stage(&aggregates[0]), doc! { "startAfter": token("0") });
	assert_eq!(change_stream_stage(&aggregates[1]), doc! { "startAfter": token("0") });
	assert_eq!(change_stream_stage(&aggregates[2]), doc! { "resumeAfter": token("7") });
	stream.close().await;
	client.close().await;
}

#[async_std::test]
async fn post_batch_resume_token_is_cached() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", Vec::new(), Some(token("p1")))
	], |n| Reply::Doc(match n {
		0 => cursor_reply(false, 42, "db.coll", vec![event(1), event(2)], Some(token("p2"))),
		_ => cursor_reply(false, 42, "db.coll", Vec::new(), Some(token("p3")))
	})).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	assert!(stream.try_next().await.unwrap().is_none());
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("p1"))));

	stream.try_next().await.unwrap().unwrap();
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("1"))));
	stream.try_next().await.unwrap().unwrap();
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("p2"))));

	assert!(stream.try_next().await.unwrap().is_none());
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("p3"))));
	stream.close().await;
	client.close().await;
}

#[async_std::test]
async fn missing_resume_token_is_fatal() {
	let mut projected = event(1);
	projected.remove("_id");
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![projected], None)
	], |_| Reply::Doc(cursor_reply(false, 42, "db.coll", Vec::new(), None))).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll")
		.watch(vec![doc! { "$project": { "_id": 0 } }], ChangeStreamOptions::default())
		.unwrap();

	assert!(matches!(stream.next().await, Err(Error::MissingResumeToken)));
	assert!(stream.is_closed());
	assert!(matches!(stream.next().await, Err(Error::ChangeStreamClosed)));
	assert_eq!(mock.received("aggregate").len(), 1);
	assert_eq!(mock.received("killCursors").len(), 1);
	client.close().await;
}

#[async_std::test]
async fn invalidate_ends_the_stream() {
	let invalidate = doc! { "_id": token("9"), "operationType": "invalidate" };
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1), invalidate], None)
	], |_| Reply::Doc(cursor_reply(false, 0, "db.coll", Vec::new(), None))).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	assert_eq!(stream.next().await.unwrap().unwrap().operation_type, OperationType::Insert);
	assert_eq!(stream.next().await.unwrap().unwrap().operation_type, OperationType::Invalidate);
	assert!(stream.is_closed());
	assert!(matches!(stream.next().await, Err(Error::ChangeStreamClosed)));
	assert_eq!(mock.received("aggregate").len(), 1);
	client.close().await;
}

#[async_std::test]
async fn full_document_update_lookup() {
	let update = doc! {
		"_id": token("2"),
		"operationType": "update",
		"ns": { "db": "db", "coll": "coll" },
		"documentKey": { "_id": 1 },
		"updateDescription": { "updatedFields": { "c": 2 }, "removedFields": [] },
		"fullDocument": { "_id": 1, "f": 128, "c": 2 }
	};
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1)], None)
	], move |_| Reply::Doc(cursor_reply(false, 42, "db.coll", vec![update.clone()], None))).await;
	let client = connect(&mock).await;
	let options = ChangeStreamOptions { full_document: Some(FullDocument::UpdateLookup), ..ChangeStreamOptions::default() };
	let stream = client.database("db").collection("coll").watch(Vec::new(), options).unwrap();

	let insert = stream.next().await.unwrap().unwrap();
	assert_eq!(insert.operation_type, OperationType::Insert);
	assert_eq!(insert.full_document.unwrap().get_i32("f").unwrap(), 128);

	let update = stream.next().await.unwrap().unwrap();
	assert_eq!(update.operation_type, OperationType::Update);
	let full_document = update.full_document.unwrap();
	assert_eq!(full_document.get_i32("c").unwrap(), 2);
	assert_eq!(full_document.get_i32("f").unwrap(), 128);

	let aggregate = mock.received("aggregate").pop().unwrap();
	assert_eq!(change_stream_stage(&aggregate), doc! { "fullDocument": "updateLookup" });
	assert_eq!(aggregate.get_str("aggregate").unwrap(), "coll");
	stream.close().await;
	client.close().await;
}

#[async_std::test]
async fn cluster_watch_runs_on_admin() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "admin.$cmd.aggregate", vec![event(1)], None)
	], |_| Reply::Doc(cursor_reply(false, 42, "admin.$cmd.aggregate", Vec::new(), None))).await;
	let client = connect(&mock).await;
	let stream = client.watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	assert!(stream.next().await.unwrap().is_some());
	assert!(stream.try_next().await.unwrap().is_none());

	let aggregate = mock.received("aggregate").pop().unwrap();
	assert_eq!(aggregate.get_str("$db").unwrap(), "admin");
	assert_eq!(aggregate.get_i32("aggregate").unwrap(), 1);
	assert_eq!(change_stream_stage(&aggregate), doc! { "allChangesForCluster": true });
	assert_eq!(mock.received("getMore")[0].get_str("collection").unwrap(), "$cmd.aggregate");
	stream.close().await;
	client.close().await;
}

#[async_std::test]
async fn emitter_mode() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1), event(2)], None)
	], |n| Reply::Doc(match n {
		0 => cursor_reply(false, 42, "db.coll", vec![event(3)], None),
		_ => cursor_reply(false, 42, "db.coll", Vec::new(), None)
	})).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	let received = Arc::new(Mutex::new(Vec::new()));
	let closes = Arc::new(AtomicUsize::new(0));
	{
		let closes = closes.clone();
		stream.on_close(move || { closes.fetch_add(1, Ordering::SeqCst); });
	}
	{
		let received = received.clone();
		stream.on_change(move |event| received.lock().unwrap().push(event.id.clone())).unwrap();
	}

	assert!(matches!(stream.next().await, Err(Error::ChangeStreamMode(_))));
	assert!(matches!(stream.try_next().await, Err(Error::ChangeStreamMode(_))));

	assert!(wait_for(Duration::from_secs(3), || received.lock().unwrap().len() == 3).await);
	assert_eq!(stream.resume_token(), Some(ResumeToken::from(token("3"))));

	stream.close().await;
	assert!(stream.is_closed());
	assert!(wait_for(Duration::from_secs(3), || !mock.received("killCursors").is_empty()).await);
	assert_eq!(closes.load(Ordering::SeqCst), 1);
	assert_eq!(*received.lock().unwrap(), [token("1"), token("2"), token("3")].map(ResumeToken::from));
	client.close().await;
}

#[async_std::test]
async fn iterator_mode_rejects_listeners() {
	let mock = script(13, vec![
		cursor_reply(true, 0, "db.coll", vec![event(1)], None)
	], |_| Reply::Close).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	let events = stream.into_stream().unwrap().collect::<Vec<_>>().await;
	assert_eq!(events.len(), 1);
	assert!(events[0].is_ok());

	let stream = client.database("db").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();
	assert!(stream.has_next().await.unwrap());
	assert!(matches!(stream.on_change(|_| ()), Err(Error::ChangeStreamMode(_))));

	let conflicting = ChangeStreamOptions {
		resume_after: Some(ResumeToken::from(token("1"))),
		start_after:  Some(ResumeToken::from(token("1"))),
		..ChangeStreamOptions::default()
	};
	assert!(matches!(client.watch(Vec::new(), conflicting), Err(Error::InvalidArgument(_))));
	client.close().await;
}

#[async_std::test]
async fn resumes_after_a_network_error() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1)], None),
		cursor_reply(true, 43, "db.coll", vec![event(2)], None)
	], |_| Reply::Close).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	assert_eq!(stream.next().await.unwrap().unwrap().id, ResumeToken::from(token("1")));
	assert_eq!(stream.next().await.unwrap().unwrap().id, ResumeToken::from(token("2")));

	let aggregates = mock.received("aggregate");
	assert_eq!(aggregates.len(), 2);
	assert_eq!(change_stream_stage(&aggregates[1]), doc! { "resumeAfter": token("1") });
	assert!(!stream.is_closed());

	stream.close().await;
	client.close().await;
}

#[async_std::test]
async fn emitter_reports_errors_before_closing() {
	let mock = script(13, vec![
		cursor_reply(true, 42, "db.coll", vec![event(1)], None)
	], |_| Reply::Doc(command_error(2, &[]))).await;
	let client = connect(&mock).await;
	let stream = client.database("db").collection("coll").watch(Vec::new(), ChangeStreamOptions::default()).unwrap();

	let order = Arc::new(Mutex::new(Vec::new()));
	{
		let order = order.clone();
		stream.on_error(move |e| {
			assert_eq!(e.code(), Some(2));
			order.lock().unwrap().push("error");
		});
	}
	{
		let order = order.clone();
		stream.on_close(move || order.lock().unwrap().push("close"));
	}
	{
		let order = order.clone();
		stream.on_change(move |_| order.lock().unwrap().push("change")).unwrap();
	}

	assert!(wait_for(Duration::from_secs(3), || order.lock().unwrap().len() == 3).await);
	assert_eq!(*order.lock().unwrap(), ["change", "error", "close"]);
	assert!(stream.is_closed());
	assert_eq!(mock.received("aggregate").len(), 1);
	client.close().await;
}
