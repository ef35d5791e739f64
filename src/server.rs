//! Local token server.
//!
//! Two routes are served:
//!
//! - `GET /` builds a fresh assertion and exchanges it for a token, or serves
//!   the cached response when `cache=1|true` is given and it is still valid.
//!   When a person login has delivered an authorization code, the exchange
//!   uses the authorization code grant with PKCE, otherwise the JWT bearer
//!   grant.
//! - `GET /response` is the OAuth redirect target in person mode. It stores
//!   the authorization code and sends the browser on to `/?cache=true`.
//!
//! Everything else is answered with 404 and never reaches the token endpoint.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{RawQuery, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::{
    assertion::{AssertionBuilder, ClaimSet},
    cache::TokenCache,
    config::{Config, Mode},
    error::{Error, Result},
    exchange::{GrantRequest, TokenExchanger},
    key::SigningIdentity,
    pkce::Pkce,
};

/// Response header carrying the exact form body sent to the token endpoint.
pub const TOKEN_REQUEST_HEADER: &str = "X-TokenRequest";

/// Where `/response` sends the browser after capturing a code.
pub const AFTER_LOGIN_LOCATION: &str = "/?cache=true";

/// Settings for the authorization code exchange of person mode.
#[derive(Debug)]
pub struct PersonLogin {
    pub client_id: String,
    pub redirect_uri: String,
    pub pkce: Pkce,
}

struct ServerState {
    assertions: AssertionBuilder,
    exchanger: TokenExchanger,
    cache: TokenCache,
    person: Option<PersonLogin>,
    pending_code: Mutex<Option<String>>,
    /// Held by a cached request from its cache miss until the new token is
    /// stored, so concurrent misses run one exchange.
    refresh: Mutex<()>,
}

impl ServerState {
    async fn grant_request(&self, assertion: String) -> GrantRequest {
        let code = self.pending_code.lock().await.clone();
        match (code, &self.person) {
            (Some(code), Some(person)) => GrantRequest::AuthorizationCode {
                assertion,
                code,
                client_id: person.client_id.clone(),
                redirect_uri: person.redirect_uri.clone(),
                code_verifier: person.pkce.verifier().to_string(),
            },
            _ => GrantRequest::JwtBearer { assertion },
        }
    }
}

/// The local token server. Cloning shares the underlying state.
#[derive(Clone)]
pub struct CallbackServer {
    state: Arc<ServerState>,
}

impl CallbackServer {
    /// A server that exchanges JWT bearer grants.
    pub fn new(assertions: AssertionBuilder, exchanger: TokenExchanger) -> Self {
        Self::build(assertions, exchanger, None)
    }

    /// A server that also accepts the person login redirect.
    pub fn with_person_login(
        assertions: AssertionBuilder,
        exchanger: TokenExchanger,
        person: PersonLogin,
    ) -> Self {
        Self::build(assertions, exchanger, Some(person))
    }

    fn build(
        assertions: AssertionBuilder,
        exchanger: TokenExchanger,
        person: Option<PersonLogin>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                assertions,
                exchanger,
                cache: TokenCache::new(),
                person,
                pending_code: Mutex::new(None),
                refresh: Mutex::new(()),
            }),
        }
    }

    /// Wire up a server for the configured mode. Person mode needs the PKCE
    /// pair whose challenge went into the authorization URL.
    pub fn from_config(
        config: &Config,
        identity: SigningIdentity,
        pkce: Option<Pkce>,
    ) -> Result<Self> {
        let assertions = AssertionBuilder::new(identity, ClaimSet::from_config(config));
        let exchanger = TokenExchanger::new(config.token_endpoint.clone(), config.timeout)?;

        match (config.mode, pkce) {
            (Mode::Person, Some(pkce)) => Ok(Self::with_person_login(
                assertions,
                exchanger,
                PersonLogin {
                    client_id: config.client_id.clone(),
                    redirect_uri: config.redirect_uri(),
                    pkce,
                },
            )),
            (Mode::Person, None) => Err(Error::Configuration(
                "Person mode requires a PKCE verifier".to_string(),
            )),
            _ => Ok(Self::new(assertions, exchanger)),
        }
    }

    pub fn is_person_mode(&self) -> bool {
        self.state.person.is_some()
    }

    /// The authorization code waiting to be exchanged, if any.
    pub async fn pending_code(&self) -> Option<String> {
        self.state.pending_code.lock().await.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(token_route))
            .route("/response", get(response_route))
            .fallback(not_found)
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind `addr` and serve until the returned handle is stopped.
    pub async fn serve(&self, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {addr}: {e}")))?;

        // Port 0 resolves to the actual port here.
        let bound_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local address: {e}")))?;

        let router = self.router();
        let shutdown = CancellationToken::new();
        let shutdown_task = shutdown.clone();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_task.cancelled().await;
                })
                .await
                .map_err(|e| Error::Transport(format!("Server error: {e}")))
        });

        info!("Server started, serving tokens at http://{}/", bound_addr);
        Ok(ServerHandle {
            handle,
            bound_addr,
            shutdown,
        })
    }
}

pub struct ServerHandle {
    pub handle: JoinHandle<Result<()>>,
    /// The actual bound address.
    pub bound_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.bound_addr)
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle
            .await
            .map_err(|e| Error::Transport(format!("Server task failed: {e}")))?
    }
}

// HTTP handlers

async fn token_route(
    State(state): State<Arc<ServerState>>,
    RawQuery(query): RawQuery,
) -> Response {
    if !cache_requested(query.as_deref()) {
        return issue_token(&state, false).await;
    }

    if let Some(body) = state.cache.get().await {
        debug!("Serving cached token");
        return token_response(body, None);
    }

    let _refresh = state.refresh.lock().await;
    // Another request may have refreshed the cache while we waited.
    if let Some(body) = state.cache.get().await {
        debug!("Serving token cached by a concurrent request");
        return token_response(body, None);
    }
    issue_token(&state, true).await
}

async fn issue_token(state: &ServerState, use_cache: bool) -> Response {
    let assertion = match state.assertions.build() {
        Ok(assertion) => assertion,
        Err(e) => {
            error!("Failed to build assertion: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let grant = state.grant_request(assertion).await;
    let exchange = state.exchanger.exchange(&grant).await;

    if exchange.is_error() {
        error!("Failed getting token\n{}", exchange.diagnostics());
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body = exchange.body.clone().unwrap_or_default();
    if use_cache {
        match exchange.expires_in() {
            Some(seconds) => {
                if state
                    .cache
                    .store(body.clone(), Duration::from_secs(seconds))
                    .await
                {
                    debug!("Cached token for {} seconds", seconds);
                }
            }
            None => warn!("Token response has no usable expires_in, not caching"),
        }
    }

    info!("Issued token using grant {}", grant.grant_type());
    token_response(body, Some(&exchange.request_body))
}

async fn response_route(
    State(state): State<Arc<ServerState>>,
    RawQuery(query): RawQuery,
) -> Response {
    if state.person.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match query_param(query.as_deref(), "code") {
        Some(code) if !code.is_empty() => {
            info!("Received authorization code");
            *state.pending_code.lock().await = Some(code);
            (
                StatusCode::FOUND,
                [(header::LOCATION, HeaderValue::from_static(AFTER_LOGIN_LOCATION))],
            )
                .into_response()
        }
        _ => {
            warn!("Redirect callback without authorization code");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn token_response(body: String, request_body: Option<&str>) -> Response {
    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response();

    if let Some(request_body) = request_body {
        match HeaderValue::from_str(request_body) {
            Ok(value) => {
                response.headers_mut().insert(TOKEN_REQUEST_HEADER, value);
            }
            Err(e) => warn!("Token request not representable as header: {}", e),
        }
    }
    response
}

/// `cache=1` or `cache=true`, case-insensitive.
pub fn cache_requested(query: Option<&str>) -> bool {
    query_param(query, "cache")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_flag() {
        assert!(cache_requested(Some("cache=1")));
        assert!(cache_requested(Some("cache=true")));
        assert!(cache_requested(Some("cache=TRUE")));
        assert!(cache_requested(Some("other=x&cache=True")));
        assert!(!cache_requested(Some("cache=0")));
        assert!(!cache_requested(Some("cache=false")));
        assert!(!cache_requested(Some("cache=yes")));
        assert!(!cache_requested(Some("")));
        assert!(!cache_requested(None));
    }

    #[test]
    fn test_query_param_decodes() {
        assert_eq!(
            query_param(Some("code=a%2Fb&state=x"), "code").as_deref(),
            Some("a/b")
        );
        assert_eq!(query_param(Some("state=x"), "code"), None);
    }

    #[test]
    fn test_token_response_headers() {
        let response = token_response("{}".to_string(), Some("grant_type=x"));
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[TOKEN_REQUEST_HEADER], "grant_type=x");

        let cached = token_response("{}".to_string(), None);
        assert!(cached.headers().get(TOKEN_REQUEST_HEADER).is_none());
    }
}
