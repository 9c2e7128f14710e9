//! Typed operations against the Salt REST API.
//!
//! Every ordinary response arrives wrapped as `{"return": [value]}`; the
//! operations here strip that envelope and hand back `value`.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::error::{Error, Result};
use super::events::EventStream;
use super::transport::{HttpTransport, Method, Request, Transport};
use crate::auth::{Credential, CredentialStore, LoginParams, SessionManager};
use crate::config::ClientConfig;
use crate::diagnostics::DiagnosticSink;

/// Take the first element of the `return` array.
pub fn unwrap_return(value: Value) -> Result<Value> {
    return_list(value)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("\"return\" array is empty".to_string()))
}

/// The whole `return` array.
pub fn return_list(value: Value) -> Result<Vec<Value>> {
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            return Err(Error::Protocol(format!(
                "expected a JSON object envelope, got {}",
                kind_of(&other)
            )))
        }
    };
    match map.remove("return") {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(Error::Protocol(format!(
            "\"return\" should be an array, got {}",
            kind_of(&other)
        ))),
        None => Err(Error::Protocol(
            "response has no \"return\" key".to_string(),
        )),
    }
}

/// `/collection` or `/collection/<id>`, with the ID kept to one path segment.
fn item_path(collection: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("/{}/{}", collection, urlencoding::encode(id)),
        None => format!("/{}", collection),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct SaltClient<T = HttpTransport> {
    session: SessionManager<T>,
}

impl SaltClient<HttpTransport> {
    /// Build an HTTP-backed client from resolved configuration.
    pub fn from_config(
        config: &ClientConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let transport = HttpTransport::new(config, diagnostics)?;
        let token_path = match config.token_file {
            Some(ref path) => path.clone(),
            None => CredentialStore::default_path()?,
        };
        let params = LoginParams {
            username: config.username.clone(),
            password: config.password.clone(),
            eauth: config.eauth.clone(),
        };
        Ok(Self::new(SessionManager::new(
            transport,
            CredentialStore::new(token_path),
            params,
        )))
    }
}

impl<T: Transport> SaltClient<T> {
    pub fn new(session: SessionManager<T>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionManager<T> {
        &self.session
    }

    pub async fn login(&mut self, force_remove: bool) -> Result<Credential> {
        self.session.login(force_remove).await
    }

    /// Pick up a still-valid cached token without any network call.
    pub fn resume(&mut self) -> bool {
        self.session.resume()
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.session.logout().await
    }

    /// All minions' grains, or one minion's when `id` is given.
    pub async fn list_minions(&self, id: Option<&str>) -> Result<Value> {
        self.call(Request::get(item_path("minions", id))).await
    }

    /// Dispatch `function` to the minions matched by `target`. Returns the
    /// scheduler's reply, typically `{"jid": .., "minions": [..]}`.
    pub async fn submit_job(
        &self,
        target: &str,
        function: &str,
        extra: Map<String, Value>,
    ) -> Result<Value> {
        let mut body = extra;
        body.insert("tgt".to_string(), json!(target));
        body.insert("fun".to_string(), json!(function));
        debug!(tgt = target, fun = function, "Submitting job");
        self.call(Request::post("/minions", Value::Object(body)))
            .await
    }

    pub async fn list_jobs(&self, jid: Option<&str>) -> Result<Value> {
        self.call(Request::get(item_path("jobs", jid))).await
    }

    pub async fn lookup_job(&self, jid: &str) -> Result<Value> {
        self.list_jobs(Some(jid)).await
    }

    pub async fn stats(&self) -> Result<Value> {
        self.call(Request::get("/stats")).await
    }

    /// Open the event feed. Pull events with `StreamExt::next` and `close`
    /// the stream when done.
    pub async fn events(&self) -> Result<EventStream> {
        let lines = self.session.open_stream(&Request::get("/events")).await?;
        Ok(EventStream::new(lines))
    }

    /// Execute low-state chunks (`{"client": .., "fun": .., ...}`) against
    /// the root endpoint. One result per chunk.
    pub async fn run(&self, lowstate: Vec<Value>) -> Result<Vec<Value>> {
        let response = self
            .session
            .request(&Request::post("/", Value::Array(lowstate)))
            .await?;
        return_list(response)
    }

    /// Run a master-side runner function.
    pub async fn runner(&self, function: &str, kwargs: Map<String, Value>) -> Result<Value> {
        let mut chunk = kwargs;
        chunk.insert("client".to_string(), json!("runner"));
        chunk.insert("fun".to_string(), json!(function));
        self.run(vec![Value::Object(chunk)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("\"return\" array is empty".to_string()))
    }

    /// Arbitrary call. The response is returned as-is, envelope included.
    pub async fn raw(&self, method: &str, path: &str, params: Option<Value>) -> Result<Value> {
        let request = Request {
            method: method.parse::<Method>()?,
            path: path.to_string(),
            params,
        };
        self.session.request(&request).await
    }

    async fn call(&self, request: Request) -> Result<Value> {
        let response = self.session.request(&request).await?;
        unwrap_return(response)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::api::error::{TransportError, TransportErrorKind};
    use crate::testing::FakeTransport;

    fn client(dir: &tempfile::TempDir, transport: FakeTransport) -> SaltClient<FakeTransport> {
        SaltClient::new(SessionManager::new(
            transport,
            CredentialStore::new(dir.path().join("token")),
            LoginParams::default(),
        ))
    }

    #[test]
    fn test_unwrap_return() {
        assert_eq!(
            unwrap_return(json!({"return": [{"jid": "1"}, {"jid": "2"}]})).unwrap(),
            json!({"jid": "1"})
        );
        assert!(matches!(
            unwrap_return(json!({"data": []})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            unwrap_return(json!({"return": []})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            unwrap_return(json!({"return": {"jid": "1"}})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(unwrap_return(json!([1])), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_item_path_encodes_id() {
        assert_eq!(item_path("jobs", None), "/jobs");
        assert_eq!(item_path("minions", Some("web1.example.com")), "/minions/web1.example.com");
        assert_eq!(item_path("minions", Some("a/b?c#d")), "/minions/a%2Fb%3Fc%23d");
    }

    #[tokio::test]
    async fn test_submit_job_unwraps_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            FakeTransport::new().reply(Ok(json!({"return": [{"jid": "20230101"}]})));
        let client = client(&dir, transport);

        let reply = client
            .submit_job("web*", "state.highstate", Map::new())
            .await
            .unwrap();
        assert_eq!(reply, json!({"jid": "20230101"}));

        let calls = client.session().transport().calls();
        assert_eq!(calls[0].0.method, Method::Post);
        assert_eq!(calls[0].0.path, "/minions");
        assert_eq!(
            calls[0].0.params,
            Some(json!({"tgt": "web*", "fun": "state.highstate"}))
        );
    }

    #[tokio::test]
    async fn test_submit_job_extra_params_cannot_replace_target() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new().reply(Ok(json!({"return": [{}]})));
        let client = client(&dir, transport);

        let mut extra = Map::new();
        extra.insert("arg".into(), json!(["ls /"]));
        extra.insert("tgt".into(), json!("*"));
        client.submit_job("db1", "cmd.run", extra).await.unwrap();

        let params = client.session().transport().calls()[0].0.params.clone().unwrap();
        assert_eq!(params["tgt"], json!("db1"));
        assert_eq!(params["arg"], json!(["ls /"]));
    }

    #[tokio::test]
    async fn test_missing_return_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new().reply(Ok(json!({"jid": "20230101"})));
        let client = client(&dir, transport);

        let err = client
            .submit_job("web*", "state.highstate", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_paths_for_single_resources() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new()
            .reply(Ok(json!({"return": [{}]})))
            .reply(Ok(json!({"return": [{}]})))
            .reply(Ok(json!({"return": [{}]})))
            .reply(Ok(json!({"return": [{}]})))
            .reply(Ok(json!({"return": [{}]})));
        let client = client(&dir, transport);

        client.list_minions(None).await.unwrap();
        client.list_minions(Some("web1")).await.unwrap();
        client.list_jobs(None).await.unwrap();
        client.lookup_job("20230101").await.unwrap();
        client.stats().await.unwrap();

        let paths: Vec<String> = client
            .session()
            .transport()
            .calls()
            .into_iter()
            .map(|(req, _)| req.path)
            .collect();
        assert_eq!(
            paths,
            vec!["/minions", "/minions/web1", "/jobs", "/jobs/20230101", "/stats"]
        );
    }

    #[tokio::test]
    async fn test_auth_denied_surfaces_as_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new().reply(Err(TransportError::new(
            TransportErrorKind::AuthDenied,
            "401 Unauthorized",
        )
        .into()));
        let client = client(&dir, transport);

        let err = client.stats().await.unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::AuthDenied));
    }

    #[tokio::test]
    async fn test_run_returns_all_results() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            FakeTransport::new().reply(Ok(json!({"return": [{"web1": true}, {"db1": true}]})));
        let client = client(&dir, transport);

        let results = client
            .run(vec![
                json!({"client": "local", "tgt": "web1", "fun": "test.ping"}),
                json!({"client": "local", "tgt": "db1", "fun": "test.ping"}),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(client.session().transport().calls()[0].0.path, "/");
    }

    #[tokio::test]
    async fn test_runner_builds_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new().reply(Ok(json!({"return": [["web1", "db1"]]})));
        let client = client(&dir, transport);

        let up = client.runner("manage.up", Map::new()).await.unwrap();
        assert_eq!(up, json!(["web1", "db1"]));
        assert_eq!(
            client.session().transport().calls()[0].0.params,
            Some(json!([{"client": "runner", "fun": "manage.up"}]))
        );
    }

    #[tokio::test]
    async fn test_raw_rejects_unsupported_method_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, FakeTransport::new());

        let err = client.raw("DELETE", "/jobs", None).await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(client.session().transport().call_count(), 0);
    }

    #[tokio::test]
    async fn test_events_decode_from_stream() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new().stream(&[
            ": connected",
            "retry: 400",
            "tag: salt/job/20230101/new",
            r#"data: {"jid": "20230101", "tgt": "web*"}"#,
            "",
        ]);
        let client = client(&dir, transport);

        let mut events = client.events().await.unwrap();
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.tag, "salt/job/20230101/new");
        assert_eq!(event.data["tgt"], json!("web*"));
        assert!(events.next().await.is_none());
        assert_eq!(client.session().transport().calls()[0].0.path, "/events");
    }
}
