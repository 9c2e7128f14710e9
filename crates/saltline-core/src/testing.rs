//! In-memory `Transport` for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::api::error::Result;
use crate::api::transport::{LineStream, Request, Transport};

/// Replays queued replies in order and records every call with its token.
#[derive(Default)]
pub(crate) struct FakeTransport {
    replies: Mutex<VecDeque<Result<Value>>>,
    stream_lines: Mutex<Option<Vec<String>>>,
    calls: Mutex<Vec<(Request, Option<String>)>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, reply: Result<Value>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn stream(self, lines: &[&str]) -> Self {
        *self.stream_lines.lock().unwrap() = Some(lines.iter().map(|l| l.to_string()).collect());
        self
    }

    pub(crate) fn calls(&self) -> Vec<(Request, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, request: &Request, token: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), token.map(str::to_string)));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, request: &Request, token: Option<&str>) -> Result<Value> {
        self.record(request, token);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected call to {}", request.path))
    }

    async fn open_stream(&self, request: &Request, token: Option<&str>) -> Result<LineStream> {
        self.record(request, token);
        let lines = self.stream_lines.lock().unwrap().take().unwrap_or_default();
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
