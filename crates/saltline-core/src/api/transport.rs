//! HTTP transport for the Salt REST API.
//!
//! `Transport` is the seam between session handling and the network. The
//! HTTP implementation keeps two clients: one for buffered request/response
//! calls, bounded by the configured timeout, and one for long-lived
//! streams, which only bounds connection setup.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{header, Client, Url};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::{Error, Result, TransportError, TransportErrorKind};
use crate::config::ClientConfig;
use crate::diagnostics::DiagnosticSink;

/// Header carrying the session token on authenticated calls
pub const AUTH_HEADER: &str = "X-Auth-Token";

const ACCEPT_JSON: &str = "application/json";
const ACCEPT_EVENT_STREAM: &str = "text/event-stream";

/// Raw lines from a streaming response, in arrival order.
pub type LineStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            other => Err(Error::Usage(format!(
                "unsupported HTTP method {:?}, expected GET or POST",
                other
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// One call against the API: where, how, and with what data.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            params: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            params: Some(body),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Resolve against `base`. GET params are URL-encoded into the query.
    pub fn url(&self, base: &Url) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined)
            .map_err(|e| Error::Usage(format!("invalid request URL {}: {}", joined, e)))?;

        if self.method == Method::Get {
            let pairs = query_pairs(self.params.as_ref())?;
            if !pairs.is_empty() {
                url.query_pairs_mut().extend_pairs(pairs);
            }
        }
        Ok(url)
    }

    /// Build the concrete HTTP request without sending it.
    pub fn build(
        &self,
        client: &Client,
        base: &Url,
        accept: &str,
        token: Option<&str>,
    ) -> Result<reqwest::Request> {
        let url = self.url(base)?;
        let mut builder = client
            .request(self.method.as_reqwest(), url)
            .header(header::ACCEPT, accept);

        if let Some(token) = token {
            builder = builder.header(AUTH_HEADER, token);
        }
        if self.method == Method::Post {
            if let Some(ref body) = self.params {
                builder = builder.json(body);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Usage(format!("could not build request: {}", e)))
    }
}

fn query_pairs(params: Option<&Value>) -> Result<Vec<(String, String)>> {
    let map = match params {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(Error::Usage(format!(
                "GET parameters must be a JSON object, got {}",
                other
            )))
        }
    };

    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), query_scalar(key, item)?));
                }
            }
            Value::Null => {}
            scalar => pairs.push((key.clone(), query_scalar(key, scalar)?)),
        }
    }
    Ok(pairs)
}

fn query_scalar(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => Err(Error::Usage(format!(
            "GET parameter {:?} cannot hold nested values",
            key
        ))),
    }
}

/// Capability used by the session layer to reach the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Buffered call returning the decoded JSON response body.
    async fn request(&self, request: &Request, token: Option<&str>) -> Result<Value>;

    /// Long-lived call returning the response body as a line stream.
    async fn open_stream(&self, request: &Request, token: Option<&str>) -> Result<LineStream>;
}

pub struct HttpTransport {
    base_url: Url,
    client: Client,
    stream_client: Client,
    debug: bool,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig, diagnostics: Arc<dyn DiagnosticSink>) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid API URL {:?}: {}", config.url, e)))?;

        if config.insecure {
            warn!(url = %base_url, "TLS certificate verification is disabled");
        }

        let client = Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| Error::Config(format!("could not build HTTP client: {}", e)))?;

        // No overall timeout: the event feed stays open indefinitely.
        let stream_client = Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| Error::Config(format!("could not build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            client,
            stream_client,
            debug: config.debug,
            diagnostics,
        })
    }

    async fn send(&self, client: &Client, request: reqwest::Request) -> Result<reqwest::Response> {
        if self.debug {
            self.echo_request(&request);
        }
        let method = request.method().clone();
        let url = request.url().clone();

        let response = client.execute(request).await.map_err(|e| {
            debug!(%method, %url, error = %e, "Request failed before a response");
            TransportError::network(&e)
        })?;

        if self.debug {
            self.echo_response(&response);
        }
        Self::check_response(response, self.diagnostics.as_ref()).await
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(
        response: reqwest::Response,
        diagnostics: &dyn DiagnosticSink,
    ) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let err = TransportError::from_status(status, &body);
        match err.kind {
            TransportErrorKind::AuthDenied => {
                diagnostics.line(&format!("Authentication denied: {}", err.detail))
            }
            TransportErrorKind::ServerError => {
                diagnostics.line(&format!("Server error: {}", err.detail))
            }
            _ => {}
        }
        Err(err.into())
    }

    fn echo_request(&self, request: &reqwest::Request) {
        self.diagnostics
            .line(&format!("> {} {}", request.method(), request.url()));
        for (name, value) in request.headers() {
            let shown = if name.as_str().eq_ignore_ascii_case(AUTH_HEADER) {
                "<redacted>"
            } else {
                value.to_str().unwrap_or("<binary>")
            };
            self.diagnostics.line(&format!("> {}: {}", name, shown));
        }
        if let Some(body) = request.body().and_then(|b| b.as_bytes()) {
            if !body.is_empty() {
                self.diagnostics
                    .line(&format!("> ({} byte body)", body.len()));
            }
        }
    }

    fn echo_response(&self, response: &reqwest::Response) {
        self.diagnostics.line(&format!("< {}", response.status()));
        for (name, value) in response.headers() {
            self.diagnostics.line(&format!(
                "< {}: {}",
                name,
                value.to_str().unwrap_or("<binary>")
            ));
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: &Request, token: Option<&str>) -> Result<Value> {
        let http = request.build(&self.client, &self.base_url, ACCEPT_JSON, token)?;
        let response = self.send(&self.client, http).await?;

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::network(&e))?;
        serde_json::from_slice(&body).map_err(|e| {
            Error::Protocol(format!(
                "{} {} returned a non-JSON body: {}",
                request.method, request.path, e
            ))
        })
    }

    async fn open_stream(&self, request: &Request, token: Option<&str>) -> Result<LineStream> {
        let http = request.build(
            &self.stream_client,
            &self.base_url,
            ACCEPT_EVENT_STREAM,
            token,
        )?;
        let response = self.send(&self.stream_client, http).await?;
        debug!(path = %request.path, "Stream opened");

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::from(TransportError::network(&e))));
        Ok(split_lines(chunks))
    }
}

/// Split a chunked byte stream into `\n`-terminated lines.
///
/// Only the unterminated tail of the most recent chunk is held. A trailing
/// `\r` is stripped and invalid UTF-8 is replaced. An error from the
/// underlying stream is yielded once and ends the sequence.
pub fn split_lines<S, B>(chunks: S) -> LineStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<S> {
        chunks: std::pin::Pin<Box<S>>,
        pending: Vec<u8>,
        finished: bool,
    }

    fn finish_line(mut raw: Vec<u8>) -> String {
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    let state = State {
        chunks: Box::pin(chunks),
        pending: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.pending.iter().position(|b| *b == b'\n') {
                let mut raw: Vec<u8> = state.pending.drain(..=pos).collect();
                raw.pop();
                return Some((Ok(finish_line(raw)), state));
            }
            if state.finished {
                if state.pending.is_empty() {
                    return None;
                }
                let raw = std::mem::take(&mut state.pending);
                return Some((Ok(finish_line(raw)), state));
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.pending.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(e), state));
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}

/// `{}` as a JSON value, for POSTs that carry only the session header.
pub fn empty_body() -> Value {
    Value::Object(Map::new())
}
