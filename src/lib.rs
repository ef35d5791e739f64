//! # maskinporten-token
//!
//! Acquire OAuth2 access tokens from a Maskinporten or ID-porten style
//! authorization server by signing JWT client assertions (RFC 7523).
//!
//! ## Overview
//!
//! A process loads one signing identity at startup (PEM files, a PKCS#12
//! keystore or an RSA JSON Web Key) and then either:
//!
//! - fetches a single token with the JWT bearer grant and exits,
//! - serves JWT bearer tokens over a local HTTP endpoint, or
//! - logs a person in through the browser and serves tokens obtained with
//!   the authorization code grant and PKCE.
//!
//! The local endpoint keeps a single cached token response that is served
//! on request with `?cache=true` until its `expires_in` has elapsed.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use maskinporten_token::{
//!     AssertionBuilder, ClaimSet, Config, GrantRequest, Result, SigningIdentity, TokenExchanger,
//! };
//!
//! async fn fetch(config: &Config) -> Result<String> {
//!     let identity = SigningIdentity::load(&config.identity)?;
//!     let assertions = AssertionBuilder::new(identity, ClaimSet::from_config(config));
//!     let exchanger = TokenExchanger::new(config.token_endpoint.clone(), config.timeout)?;
//!
//!     let grant = GrantRequest::JwtBearer {
//!         assertion: assertions.build()?,
//!     };
//!     exchanger.exchange(&grant).await.into_result()
//! }
//! ```

mod assertion;
mod cache;
mod config;
mod error;
mod exchange;
mod key;
mod pkce;
mod server;

pub mod testutils;

pub use assertion::{kid_header, AssertionBuilder, AssertionClaims, ClaimSet, THUMBPRINT_KID};
pub use cache::{CachedToken, TokenCache};
pub use config::{
    join_scopes, redirect_uri_for_port, Config, ConfigInput, IdentitySource, Mode,
    DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT, DEFAULT_TOKEN_TTL, MAX_TOKEN_TTL,
};
pub use error::{Error, Result};
pub use exchange::{
    curl_command, GrantRequest, TokenExchange, TokenExchanger, CLIENT_ASSERTION_TYPE,
    JWT_BEARER_GRANT_TYPE,
};
pub use key::{CertificateIdentity, JwkIdentity, SigningIdentity};
pub use pkce::{authorize_url, Pkce, ACR_VALUES, UI_LOCALES, VERIFIER_LEN};
pub use server::{
    cache_requested, CallbackServer, PersonLogin, ServerHandle, AFTER_LOGIN_LOCATION,
    TOKEN_REQUEST_HEADER,
};
