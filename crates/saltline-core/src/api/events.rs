//! Decoding of the `/events` server-push feed.
//!
//! The feed is newline-delimited text: a `tag: <name>` line followed by one
//! or more `data: <json>` lines. Comment lines (`:`), `retry:` hints, blank
//! lines and unknown fields are skipped. A `data:` payload that is not JSON
//! ends the stream with an error.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use super::error::{Error, Result};
use super::transport::LineStream;

/// Longest payload excerpt quoted in a decode error
const MAX_PAYLOAD_EXCERPT: usize = 120;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub tag: String,
    pub data: Value,
}

/// Line-at-a-time decoder. Holds nothing but the most recent tag.
#[derive(Debug, Default, Clone)]
pub struct EventDecoder {
    tag: Option<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Feed one line; returns an event when the line completes one.
    pub fn feed(&mut self, line: &str) -> Result<Option<Event>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || line.starts_with("retry:") {
            return Ok(None);
        }

        if let Some(tag) = line.strip_prefix("tag:") {
            self.tag = Some(tag.trim_start().to_string());
            return Ok(None);
        }

        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim_start();
            let data = serde_json::from_str(payload).map_err(|e| {
                Error::MalformedEvent(format!(
                    "tag {:?}: {} in {:?}",
                    self.tag.as_deref().unwrap_or(""),
                    e,
                    excerpt(payload)
                ))
            })?;
            // A data line with no preceding tag is kept with an empty tag.
            let tag = self.tag.clone().unwrap_or_default();
            return Ok(Some(Event { tag, data }));
        }

        trace!(line, "Ignoring unrecognized event-stream line");
        Ok(None)
    }
}

fn excerpt(payload: &str) -> &str {
    if payload.len() <= MAX_PAYLOAD_EXCERPT {
        return payload;
    }
    let mut end = MAX_PAYLOAD_EXCERPT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}

/// Decoded events pulled from an open stream.
///
/// Ends after the first error. Call `close` to release the connection
/// before the server ends the feed.
pub struct EventStream {
    lines: Option<LineStream>,
    decoder: EventDecoder,
}

impl EventStream {
    pub fn new(lines: LineStream) -> Self {
        Self {
            lines: Some(lines),
            decoder: EventDecoder::new(),
        }
    }

    /// Drop the underlying connection. Later polls yield `None`.
    pub fn close(&mut self) {
        if self.lines.take().is_some() {
            trace!("Event stream closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lines.is_none()
    }
}

impl Stream for EventStream {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(lines) = this.lines.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(lines.poll_next_unpin(cx)) {
                Some(Ok(line)) => match this.decoder.feed(&line) {
                    Ok(Some(event)) => return Poll::Ready(Some(Ok(event))),
                    Ok(None) => continue,
                    Err(e) => {
                        this.close();
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Some(Err(e)) => {
                    this.close();
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.close();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::api::error::{TransportError, TransportErrorKind};

    fn lines(items: &[&str]) -> LineStream {
        let owned: Vec<Result<String>> = items.iter().map(|l| Ok(l.to_string())).collect();
        stream::iter(owned).boxed()
    }

    #[tokio::test]
    async fn test_decodes_tagged_frames_in_order() {
        let mut events = EventStream::new(lines(&[
            "tag: salt/job/new",
            r#"data: {"jid": "123"}"#,
            "",
            "tag: salt/job/ret",
            r#"data: {"jid": "123", "return": 0}"#,
        ]));

        let mut decoded = Vec::new();
        while let Some(event) = events.next().await {
            decoded.push(event.unwrap());
        }

        assert_eq!(
            decoded,
            vec![
                Event {
                    tag: "salt/job/new".into(),
                    data: json!({"jid": "123"})
                },
                Event {
                    tag: "salt/job/ret".into(),
                    data: json!({"jid": "123", "return": 0})
                },
            ]
        );
        assert!(events.is_closed());
    }

    #[tokio::test]
    async fn test_bad_payload_ends_stream() {
        let mut events = EventStream::new(lines(&[
            "tag: salt/auth",
            "data: {not-json}",
            "tag: salt/job/new",
            r#"data: {"jid": "1"}"#,
        ]));

        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(ref msg) if msg.contains("salt/auth")));
        assert!(events.next().await.is_none());
    }

    #[test]
    fn test_comments_and_retry_keep_pending_tag() {
        let mut decoder = EventDecoder::new();
        assert_eq!(decoder.feed("tag: salt/minion/web1/start").unwrap(), None);

        for line in [": keepalive", "retry: 400", ":", "   ", "id: 7", "event: x"] {
            assert_eq!(decoder.feed(line).unwrap(), None, "line {:?}", line);
            assert_eq!(decoder.pending_tag(), Some("salt/minion/web1/start"));
        }

        let event = decoder.feed(r#"data: {"id": "web1"}"#).unwrap().unwrap();
        assert_eq!(event.tag, "salt/minion/web1/start");
    }

    #[test]
    fn test_tag_is_reused_for_following_data_lines() {
        let mut decoder = EventDecoder::new();
        decoder.feed("tag: salt/job/ret").unwrap();
        let first = decoder.feed("data: 1").unwrap().unwrap();
        let second = decoder.feed("data: 2").unwrap().unwrap();
        assert_eq!(first.tag, "salt/job/ret");
        assert_eq!(second.tag, "salt/job/ret");
        assert_eq!(second.data, json!(2));
    }

    #[test]
    fn test_data_before_any_tag_has_empty_tag() {
        let mut decoder = EventDecoder::new();
        let event = decoder.feed(r#"data: {"a": true}"#).unwrap().unwrap();
        assert_eq!(event.tag, "");
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream_is_surfaced() {
        let items: Vec<Result<String>> = vec![
            Ok("tag: a".to_string()),
            Ok("data: {}".to_string()),
            Err(TransportError::new(TransportErrorKind::NetworkError, "connection reset").into()),
            Ok("data: {}".to_string()),
        ];
        let mut events = EventStream::new(stream::iter(items).boxed());

        assert!(events.next().await.unwrap().is_ok());
        let err = events.next().await.unwrap().unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::NetworkError));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_stops_iteration() {
        let mut events = EventStream::new(lines(&["tag: a", "data: 1", "data: 2"]));
        assert!(events.next().await.is_some());
        events.close();
        assert!(events.next().await.is_none());
    }
}
