//! Runtime configuration.
//!
//! Raw option values arrive as a [`ConfigInput`] (normally filled in by the
//! command line parser) and are turned into a validated [`Config`] by
//! [`Config::validate`]. Every problem found is reported at once, so the
//! operator can fix the whole command line in one go.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_SERVER_PORT: u16 = 17823;
pub const DEFAULT_TOKEN_TTL: u64 = 120;
/// Upper bound for `--token-ttl`, one day.
pub const MAX_TOKEN_TTL: u64 = 86_400;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the signing key (and certificate, if any) is loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// PEM encoded certificate chain and private key. Both may live in the
    /// same file.
    Pem {
        certificate: PathBuf,
        private_key: PathBuf,
    },
    /// PKCS#12 keystore holding a certificate chain and its private key.
    Pkcs12 { path: PathBuf, password: String },
    /// RSA private key in JSON Web Key format, for pre-registered clients.
    Jwk { path: PathBuf },
}

/// Which grant the process performs, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fetch one token with the JWT bearer grant and exit.
    OneShot,
    /// Serve JWT bearer tokens over local HTTP.
    Server,
    /// Log a person in through the browser and serve authorization code
    /// tokens over local HTTP.
    Person,
}

impl Mode {
    pub fn serves_http(self) -> bool {
        !matches!(self, Mode::OneShot)
    }
}

/// Unvalidated option values.
#[derive(Debug, Clone, Default)]
pub struct ConfigInput {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub keystore_path: Option<PathBuf>,
    pub keystore_password: Option<String>,
    pub jwk_path: Option<PathBuf>,
    pub kid: Option<String>,
    pub client_id: Option<String>,
    pub audience: Option<String>,
    pub resource: Option<String>,
    /// Comma separated, as given on the command line.
    pub scopes: Option<String>,
    pub token_endpoint: Option<String>,
    pub authorize_endpoint: Option<String>,
    pub token_ttl: Option<u64>,
    pub consumer_org: Option<String>,
    pub server_mode: bool,
    pub person_mode: bool,
    pub bind: Option<IpAddr>,
    pub server_port: Option<u16>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub identity: IdentitySource,
    /// Client id, used as `iss` and `sub` of the assertion.
    pub client_id: String,
    pub audience: String,
    pub resource: Option<String>,
    /// Space separated scope list.
    pub scopes: String,
    pub token_endpoint: Url,
    pub authorize_endpoint: Option<Url>,
    pub token_ttl: u64,
    pub kid: Option<String>,
    pub consumer_org: Option<String>,
    pub mode: Mode,
    pub bind: IpAddr,
    pub server_port: u16,
    pub timeout: Duration,
}

impl Config {
    /// Check the raw input and build a configuration from it.
    pub fn validate(input: ConfigInput) -> Result<Self> {
        let mut problems = Vec::new();

        let identity = match identity_source(&input) {
            Ok(identity) => Some(identity),
            Err(problem) => {
                problems.push(problem);
                None
            }
        };

        let client_id = required(input.client_id, "--client-id", &mut problems);
        let audience = required(input.audience, "--audience", &mut problems);
        let scopes = required(input.scopes, "--scopes", &mut problems).map(|s| join_scopes(&s));
        if matches!(scopes.as_deref(), Some("")) {
            problems.push("--scopes must name at least one scope".to_string());
        }

        let token_endpoint = required(input.token_endpoint, "--token-endpoint", &mut problems)
            .and_then(|raw| parse_url(&raw, "--token-endpoint", &mut problems));

        let mode = if input.person_mode {
            Mode::Person
        } else if input.server_mode {
            Mode::Server
        } else {
            Mode::OneShot
        };

        let authorize_endpoint = match input.authorize_endpoint {
            Some(raw) => parse_url(&raw, "--authorize-endpoint", &mut problems),
            None => {
                if mode == Mode::Person {
                    problems.push("Person mode requires --authorize-endpoint".to_string());
                }
                None
            }
        };

        let token_ttl = input.token_ttl.unwrap_or(DEFAULT_TOKEN_TTL);
        if token_ttl == 0 {
            problems.push("--token-ttl must be greater than zero".to_string());
        } else if token_ttl > MAX_TOKEN_TTL {
            problems.push(format!("--token-ttl must be at most {MAX_TOKEN_TTL} seconds"));
        }

        if !problems.is_empty() {
            return Err(Error::Configuration(problems.join("; ")));
        }

        // All required values are present once no problems were recorded.
        let (
            Some(identity),
            Some(client_id),
            Some(audience),
            Some(scopes),
            Some(token_endpoint),
        ) = (identity, client_id, audience, scopes, token_endpoint)
        else {
            return Err(Error::Configuration("Incomplete configuration".to_string()));
        };

        Ok(Config {
            identity,
            client_id,
            audience,
            resource: non_empty(input.resource),
            scopes,
            token_endpoint,
            authorize_endpoint,
            token_ttl,
            kid: non_empty(input.kid),
            consumer_org: non_empty(input.consumer_org),
            mode,
            bind: input.bind.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            server_port: input.server_port.unwrap_or(DEFAULT_SERVER_PORT),
            timeout: input.timeout.unwrap_or(DEFAULT_TIMEOUT),
        })
    }

    /// Address the token server listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.server_port)
    }

    /// Redirect target registered for the person login.
    pub fn redirect_uri(&self) -> String {
        redirect_uri_for_port(self.server_port)
    }
}

pub fn redirect_uri_for_port(port: u16) -> String {
    format!("http://localhost:{port}/response")
}

/// Turn `a,b, c` into `a b c`.
pub fn join_scopes(raw: &str) -> String {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn identity_source(input: &ConfigInput) -> std::result::Result<IdentitySource, String> {
    let selected = [
        input.certificate.is_some(),
        input.keystore_path.is_some(),
        input.jwk_path.is_some(),
    ]
    .iter()
    .filter(|s| **s)
    .count();

    if selected != 1 {
        return Err(
            "Requires exactly one of --certificate, --keystore-path or --jwk-path".to_string(),
        );
    }

    if let Some(certificate) = &input.certificate {
        // The key may be bundled with the certificate.
        let private_key = input
            .private_key
            .clone()
            .unwrap_or_else(|| certificate.clone());
        return Ok(IdentitySource::Pem {
            certificate: certificate.clone(),
            private_key,
        });
    }

    if let Some(path) = &input.keystore_path {
        let password = input
            .keystore_password
            .clone()
            .ok_or_else(|| "--keystore-path requires --keystore-password".to_string())?;
        return Ok(IdentitySource::Pkcs12 {
            path: path.clone(),
            password,
        });
    }

    match &input.jwk_path {
        Some(path) => Ok(IdentitySource::Jwk { path: path.clone() }),
        None => Err("No signing identity configured".to_string()),
    }
}

fn required(value: Option<String>, flag: &str, problems: &mut Vec<String>) -> Option<String> {
    match non_empty(value) {
        Some(value) => Some(value),
        None => {
            problems.push(format!("Requires {flag}"));
            None
        }
    }
}

fn parse_url(raw: &str, flag: &str, problems: &mut Vec<String>) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(e) => {
            problems.push(format!("Invalid {flag} '{raw}': {e}"));
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
