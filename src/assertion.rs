//! Signed JWT client assertions (RFC 7523).
//!
//! Every call to [`AssertionBuilder::build`] produces a new assertion with a
//! fresh `jti` and `iat`/`exp` pair. Assertions are single use and are never
//! cached.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{Error, Result},
    key::SigningIdentity,
};

/// `--kid` value that keeps the default certificate based key selection.
pub const THUMBPRINT_KID: &str = "thumbprint";

/// Claim inputs that stay the same for every assertion of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet {
    pub issuer: String,
    pub audience: String,
    /// Space separated.
    pub scopes: String,
    pub resource: Option<String>,
    pub consumer_org: Option<String>,
    pub ttl_seconds: u64,
    pub kid: Option<String>,
}

impl ClaimSet {
    pub fn from_config(config: &Config) -> Self {
        Self {
            issuer: config.client_id.clone(),
            audience: config.audience.clone(),
            scopes: config.scopes.clone(),
            resource: config.resource.clone(),
            consumer_org: config.consumer_org.clone(),
            ttl_seconds: config.token_ttl,
            kid: config.kid.clone(),
        }
    }
}

/// Payload of a client assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub aud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub scope: String,
    pub iss: String,
    /// Always equal to `iss`.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_org: Option<String>,
}

impl AssertionClaims {
    /// Claims for an assertion issued at `now`.
    pub fn issue(claims: &ClaimSet, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            aud: claims.audience.clone(),
            resource: claims.resource.clone(),
            scope: claims.scopes.clone(),
            iss: claims.issuer.clone(),
            sub: claims.issuer.clone(),
            exp: iat.saturating_add(i64::try_from(claims.ttl_seconds).unwrap_or(i64::MAX)),
            iat,
            jti: Uuid::new_v4().to_string(),
            consumer_org: claims.consumer_org.clone(),
        }
    }
}

/// Resolve the `kid` header from the configured override.
///
/// No override and the [`THUMBPRINT_KID`] sentinel both leave `kid` out; any
/// other value is used verbatim.
pub fn kid_header(kid_override: Option<&str>) -> Option<String> {
    match kid_override {
        None | Some(THUMBPRINT_KID) => None,
        Some(kid) => Some(kid.to_string()),
    }
}

/// Builds and signs client assertions.
#[derive(Debug, Clone)]
pub struct AssertionBuilder {
    identity: SigningIdentity,
    claims: ClaimSet,
}

impl AssertionBuilder {
    pub fn new(identity: SigningIdentity, claims: ClaimSet) -> Self {
        Self { identity, claims }
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// RS256 header, with `x5c` for certificate identities and no `typ`.
    pub fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::RS256);
        header.typ = None;
        header.x5c = self.identity.x5c();
        header.kid = kid_header(self.claims.kid.as_deref());
        header
    }

    /// Build a new signed assertion.
    pub fn build(&self) -> Result<String> {
        self.build_at(Utc::now())
    }

    /// Build a new signed assertion issued at `now`.
    pub fn build_at(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = AssertionClaims::issue(&self.claims, now);
        debug!("Signing assertion jti={} exp={}", claims.jti, claims.exp);
        jsonwebtoken::encode(&self.header(), &claims, self.identity.encoding_key())
            .map_err(|e| Error::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use chrono::TimeZone;

    fn claim_set() -> ClaimSet {
        ClaimSet {
            issuer: "my-client".to_string(),
            audience: "https://test.maskinporten.no/".to_string(),
            scopes: "prefix:read prefix:write".to_string(),
            resource: None,
            consumer_org: None,
            ttl_seconds: 120,
            kid: None,
        }
    }

    fn payload(token: &str) -> serde_json::Value {
        let part = token.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn test_kid_policy() {
        assert_eq!(kid_header(None), None);
        assert_eq!(kid_header(Some("thumbprint")), None);
        assert_eq!(kid_header(Some("my-key-1")), Some("my-key-1".to_string()));
    }

    #[test]
    fn test_issue_sets_expiry_and_subject() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let claims = AssertionClaims::issue(&claim_set(), now);
        assert_eq!(claims.iat, 1_700_000_000);
        assert_eq!(claims.exp, 1_700_000_120);
        assert_eq!(claims.sub, claims.iss);
        assert_eq!(claims.scope, "prefix:read prefix:write");
    }

    #[test]
    fn test_oversized_ttl_saturates() {
        let mut set = claim_set();
        set.ttl_seconds = u64::MAX;
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(AssertionClaims::issue(&set, now).exp, i64::MAX);
    }

    #[test]
    fn test_optional_claims_omitted_when_unset() {
        let builder = AssertionBuilder::new(testutils::jwk_identity(), claim_set());
        let body = payload(&builder.build().unwrap());
        assert!(body.get("resource").is_none());
        assert!(body.get("consumer_org").is_none());
        for key in ["aud", "scope", "iss", "sub", "exp", "iat", "jti"] {
            assert!(body.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_optional_claims_included_when_set() {
        let mut claims = claim_set();
        claims.resource = Some("https://api.example.no/".to_string());
        claims.consumer_org = Some("991825827".to_string());
        let builder = AssertionBuilder::new(testutils::jwk_identity(), claims);
        let body = payload(&builder.build().unwrap());
        assert_eq!(body["resource"], "https://api.example.no/");
        assert_eq!(body["consumer_org"], "991825827");
    }

    #[test]
    fn test_certificate_header() {
        let builder = AssertionBuilder::new(testutils::pem_identity(), claim_set());
        let header = builder.header();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.typ, None);
        assert_eq!(header.kid, None);
        assert_eq!(header.x5c.map(|c| c.len()), Some(1));
    }

    #[test]
    fn test_jwk_header_uses_override_kid() {
        let mut claims = claim_set();
        claims.kid = Some("jwk-test-key".to_string());
        let builder = AssertionBuilder::new(testutils::jwk_identity(), claims);
        let header = builder.header();
        assert_eq!(header.kid.as_deref(), Some("jwk-test-key"));
        assert!(header.x5c.is_none());
    }

    #[test]
    fn test_iat_follows_issue_time() {
        let builder = AssertionBuilder::new(testutils::jwk_identity(), claim_set());
        let first = payload(
            &builder
                .build_at(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
                .unwrap(),
        );
        let second = payload(
            &builder
                .build_at(Utc.timestamp_opt(1_700_000_001, 0).unwrap())
                .unwrap(),
        );
        assert_ne!(first["iat"], second["iat"]);
        assert_ne!(first["exp"], second["exp"]);
    }
}
