use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::credentials::{now_epoch, Credential, CredentialStore};
use crate::api::client::unwrap_return;
use crate::api::error::{Error, Result, TransportErrorKind};
use crate::api::transport::{empty_body, LineStream, Request, Transport};

/// What the caller knows about itself when the cached token can't be used.
#[derive(Debug, Clone, Default)]
pub struct LoginParams {
    pub username: Option<String>,
    pub password: Option<String>,
    /// External authentication backend (`pam`, `ldap`, `auto`, ...)
    pub eauth: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Start of a session, given the cached credential and the current time
    Login { stored: Credential, now: f64 },
    /// The service issued a fresh credential
    Authenticated(Credential),
    Logout,
}

/// Side effect the manager must carry out after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    Authenticate,
    Persist(Credential),
    DropStore,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub credential: Option<Credential>,
}

impl SessionState {
    pub fn apply(self, action: Action) -> (SessionState, Effect) {
        match action {
            Action::Login { stored, now } => {
                if stored.is_valid_at(now) {
                    (
                        SessionState {
                            credential: Some(stored),
                        },
                        Effect::None,
                    )
                } else {
                    (SessionState { credential: None }, Effect::Authenticate)
                }
            }
            Action::Authenticated(credential) => (
                SessionState {
                    credential: Some(credential.clone()),
                },
                Effect::Persist(credential),
            ),
            Action::Logout => (SessionState { credential: None }, Effect::DropStore),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.token.as_str())
    }
}

/// Owns the session for one client: the cached token, how to renew it, and
/// the transport every call goes through.
///
/// Not safe for concurrent `login`/`logout`; those take `&mut self`.
pub struct SessionManager<T> {
    transport: T,
    store: CredentialStore,
    params: LoginParams,
    state: SessionState,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: T, store: CredentialStore, params: LoginParams) -> Self {
        Self {
            transport,
            store,
            params,
            state: SessionState::default(),
        }
    }

    /// Reuse the cached token if it is still good, otherwise authenticate
    /// and cache the new one.
    pub async fn login(&mut self, force_remove: bool) -> Result<Credential> {
        if force_remove {
            self.store.drop()?;
        }

        let stored = self.store.read();
        let (state, effect) = std::mem::take(&mut self.state).apply(Action::Login {
            stored,
            now: now_epoch(),
        });
        self.state = state;

        if effect != Effect::Authenticate {
            if let Some(credential) = self.state.credential.clone() {
                debug!(expiry = credential.expiry, "Reusing cached session token");
                return Ok(credential);
            }
        }

        let credential = self.authenticate().await?;
        let (state, effect) = std::mem::take(&mut self.state)
            .apply(Action::Authenticated(credential.clone()));
        self.state = state;
        if let Effect::Persist(ref c) = effect {
            self.store.write(c)?;
        }
        info!(expiry = credential.expiry, "Logged in");
        Ok(credential)
    }

    /// Adopt the cached token if it is still valid, without authenticating.
    pub fn resume(&mut self) -> bool {
        let stored = self.store.read();
        let (state, effect) = std::mem::take(&mut self.state).apply(Action::Login {
            stored,
            now: now_epoch(),
        });
        self.state = state;
        effect == Effect::None
    }

    /// Forget the local token, then tell the service. Only the local part
    /// can fail the call.
    pub async fn logout(&mut self) -> Result<()> {
        let token = self.state.token().map(str::to_string);
        let (state, effect) = std::mem::take(&mut self.state).apply(Action::Logout);
        self.state = state;

        let dropped = match effect {
            Effect::DropStore => self.store.drop(),
            _ => Ok(()),
        };

        match token {
            Some(token) => {
                let request = Request::post("/logout", empty_body());
                if let Err(e) = self.transport.request(&request, Some(&token)).await {
                    warn!(error = %e, "Remote logout failed, local token already removed");
                }
            }
            None => debug!("No active token, skipping remote logout"),
        }
        dropped
    }

    pub fn token(&self) -> Option<&str> {
        self.state.token()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Buffered call carrying the active token, if any.
    pub async fn request(&self, request: &Request) -> Result<Value> {
        self.transport.request(request, self.token()).await
    }

    pub async fn open_stream(&self, request: &Request) -> Result<LineStream> {
        self.transport.open_stream(request, self.token()).await
    }

    async fn authenticate(&self) -> Result<Credential> {
        let (Some(username), Some(password)) = (&self.params.username, &self.params.password)
        else {
            return Err(Error::Authentication(
                "no valid cached token and no username/password supplied".to_string(),
            ));
        };

        debug!(username = %username, eauth = %self.params.eauth, "Authenticating");
        let request = Request::post(
            "/login",
            json!({
                "username": username,
                "password": password,
                "eauth": self.params.eauth,
            }),
        );

        let response = match self.transport.request(&request, None).await {
            Ok(response) => response,
            Err(Error::Transport(e)) if e.kind == TransportErrorKind::AuthDenied => {
                return Err(Error::Authentication(e.detail))
            }
            Err(e) => return Err(e),
        };

        parse_login(response)
    }
}

fn parse_login(response: Value) -> Result<Credential> {
    let body = unwrap_return(response)?;
    let token = body
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("login response has no token".to_string()))?;
    let expiry = body
        .get("expire")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Protocol("login response has no expire time".to_string()))?;
    Ok(Credential::new(token, expiry))
}
