//! Test utilities for `maskinporten_token`.
//!
//! This module aggregates the helpers that are useful when writing unit and
//! integration tests against this crate: loading the checked-in key
//! fixtures, building configurations that point at a mock token endpoint and
//! wiring up a [`CallbackServer`]. Everything is kept behind the `testutils`
//! module so the public API stays clean while external test crates can still
//! `use maskinporten_token::testutils::*`.
//!
//! The fixtures under `tests/fixtures/` are a 2048-bit RSA key (PKCS#1 and
//! PKCS#8 PEM), a self-signed certificate for it, the same pair as a PKCS#12
//! bundle (password [`PKCS12_PASSWORD`]), the key as a private JWK and the
//! certificate's public key.

use std::{
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tracing::subscriber::DefaultGuard;

use crate::{
    config::{Config, ConfigInput},
    key::{CertificateIdentity, JwkIdentity, SigningIdentity},
    pkce::Pkce,
    server::CallbackServer,
};

pub const PKCS12_PASSWORD: &str = "changeit";
pub const TEST_CLIENT_ID: &str = "test-client";
pub const TEST_AUDIENCE: &str = "https://test.maskinporten.no/";

/// Absolute path of a file in `tests/fixtures`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Contents of a fixture file with surrounding whitespace removed.
pub fn fixture_string(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name))
        .unwrap_or_else(|e| panic!("fixture {name}: {e}"))
        .trim()
        .to_string()
}

pub fn pem_identity() -> SigningIdentity {
    SigningIdentity::Certificate(
        CertificateIdentity::from_pem_files(
            &fixture_path("client.crt"),
            &fixture_path("client.key"),
        )
        .expect("PEM fixture loads"),
    )
}

pub fn pkcs12_identity() -> SigningIdentity {
    SigningIdentity::Certificate(
        CertificateIdentity::from_pkcs12_file(&fixture_path("client.p12"), PKCS12_PASSWORD)
            .expect("PKCS#12 fixture loads"),
    )
}

pub fn jwk_identity() -> SigningIdentity {
    SigningIdentity::Jwk(
        JwkIdentity::from_file(&fixture_path("client.jwk.json")).expect("JWK fixture loads"),
    )
}

/// Input for a configuration that uses the PEM fixtures and the given token
/// endpoint. Tweak the returned value before validating it.
pub fn test_input(token_endpoint: &str) -> ConfigInput {
    ConfigInput {
        certificate: Some(fixture_path("client.crt")),
        private_key: Some(fixture_path("client.key")),
        client_id: Some(TEST_CLIENT_ID.to_string()),
        audience: Some(TEST_AUDIENCE.to_string()),
        scopes: Some("test:read,test:write".to_string()),
        token_endpoint: Some(token_endpoint.to_string()),
        ..Default::default()
    }
}

/// Server mode configuration against `token_endpoint`.
pub fn test_config(token_endpoint: &str) -> Config {
    let mut input = test_input(token_endpoint);
    input.server_mode = true;
    Config::validate(input).expect("test configuration is valid")
}

/// Person mode configuration against `token_endpoint`.
pub fn person_config(token_endpoint: &str) -> Config {
    let mut input = test_input(token_endpoint);
    input.person_mode = true;
    input.authorize_endpoint = Some("https://login.test.idporten.no/authorize".to_string());
    Config::validate(input).expect("test configuration is valid")
}

/// A JWT bearer token server using the PEM fixtures.
pub fn jwt_bearer_server(token_endpoint: &str) -> CallbackServer {
    CallbackServer::from_config(&test_config(token_endpoint), pem_identity(), None)
        .expect("server builds")
}

/// A person mode token server using the PEM fixtures and `pkce`.
pub fn person_server(token_endpoint: &str, pkce: Pkce) -> CallbackServer {
    CallbackServer::from_config(&person_config(token_endpoint), pem_identity(), Some(pkce))
        .expect("server builds")
}

/// Install a fmt subscriber once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Log lines written while a [`capture_logs`] guard is alive.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        let buffer = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Record everything logged on the current thread until the guard drops.
///
/// `#[tokio::test]` runs spawned server tasks on the test thread, so their
/// logs are captured too.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
