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
	bson::Document,
	std::{sync::atomic::{AtomicI32, Ordering}, time::Duration}
};

/// A wrapper that implements `Debug` for a type that doesn't.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default)]
pub struct DebugWrapper<T>(pub T);

impl<T> std::fmt::Debug for DebugWrapper<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct(std::any::type_name::<T>())
			.finish_non_exhaustive()
	}
}

impl<T> std::ops::Deref for DebugWrapper<T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T> std::ops::DerefMut for DebugWrapper<T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.0
	}
}

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Process wide request ids, shared by all clients.
pub(crate) fn next_request_id() -> i32 {
	REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The command name is always the first key of a command document.
pub(crate) fn command_name(command: &Document) -> &str {
	command.keys().next().map(String::as_str).unwrap_or_default()
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
	duration.as_millis().min(i64::MAX as u128) as i64
}
