//! Signing key material.
//!
//! A [`SigningIdentity`] is either a certificate backed identity (PEM files or
//! a PKCS#12 keystore) or a raw RSA JSON Web Key. Whatever the source, the
//! private key is normalised to an RSA key that can sign RS256 assertions.

use std::{fmt, fs, io::BufReader, path::Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::EncodingKey;
use p12_keystore::KeyStore;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::DecodePrivateKey,
    BigUint, RsaPrivateKey,
};
use rustls_pemfile::Item;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    config::IdentitySource,
    error::{Error, Result},
};

/// The key used to sign client assertions. Built once at startup.
#[derive(Clone)]
pub enum SigningIdentity {
    Certificate(CertificateIdentity),
    Jwk(JwkIdentity),
}

impl SigningIdentity {
    /// Load key material from the configured source.
    pub fn load(source: &IdentitySource) -> Result<Self> {
        let identity = match source {
            IdentitySource::Pem {
                certificate,
                private_key,
            } => SigningIdentity::Certificate(CertificateIdentity::from_pem_files(
                certificate,
                private_key,
            )?),
            IdentitySource::Pkcs12 { path, password } => {
                SigningIdentity::Certificate(CertificateIdentity::from_pkcs12_file(path, password)?)
            }
            IdentitySource::Jwk { path } => SigningIdentity::Jwk(JwkIdentity::from_file(path)?),
        };
        info!("Loaded signing identity: {:?}", identity);
        Ok(identity)
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        match self {
            SigningIdentity::Certificate(cert) => &cert.key,
            SigningIdentity::Jwk(jwk) => &jwk.key,
        }
    }

    /// Value of the `x5c` header: the base64 DER leaf certificate, if any.
    pub fn x5c(&self) -> Option<Vec<String>> {
        match self {
            SigningIdentity::Certificate(cert) => Some(vec![STANDARD.encode(cert.leaf())]),
            SigningIdentity::Jwk(_) => None,
        }
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningIdentity::Certificate(cert) => cert.fmt(f),
            SigningIdentity::Jwk(jwk) => jwk.fmt(f),
        }
    }
}

/// An X.509 certificate chain with the private key of its leaf.
#[derive(Clone)]
pub struct CertificateIdentity {
    chain: Vec<Vec<u8>>,
    subject: Option<String>,
    key: EncodingKey,
}

impl CertificateIdentity {
    /// Build from a DER chain, leaf first.
    pub fn new(chain: Vec<Vec<u8>>, private_key: &RsaPrivateKey) -> Result<Self> {
        if chain.is_empty() {
            return Err(Error::Configuration(
                "Certificate chain is empty".to_string(),
            ));
        }
        Ok(Self {
            chain,
            subject: None,
            key: encoding_key(private_key)?,
        })
    }

    /// Read a PEM certificate chain and a PKCS#1 or PKCS#8 private key. The
    /// two paths may point at the same file.
    pub fn from_pem_files(certificate: &Path, private_key: &Path) -> Result<Self> {
        let mut chain = Vec::new();
        let mut key = None;

        let mut paths = vec![certificate];
        if private_key != certificate {
            paths.push(private_key);
        }

        for path in paths {
            for item in read_pem(path)? {
                match item {
                    Item::X509Certificate(der) if path == certificate => {
                        chain.push(der.as_ref().to_vec())
                    }
                    Item::Pkcs1Key(der) if key.is_none() => {
                        key = Some(
                            RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der()).map_err(|e| {
                                Error::Configuration(format!(
                                    "Invalid RSA key in {}: {e}",
                                    path.display()
                                ))
                            })?,
                        );
                    }
                    Item::Pkcs8Key(der) if key.is_none() => {
                        key = Some(pkcs8_rsa_key(der.secret_pkcs8_der(), path)?);
                    }
                    Item::Sec1Key(_) => {
                        return Err(Error::Configuration(format!(
                            "{} holds an EC key, only RSA keys can sign RS256 assertions",
                            path.display()
                        )));
                    }
                    other => debug!("Ignoring PEM section in {}: {:?}", path.display(), other),
                }
            }
        }

        let key = key.ok_or_else(|| {
            Error::Configuration(format!("No private key found in {}", private_key.display()))
        })?;
        if chain.is_empty() {
            return Err(Error::Configuration(format!(
                "No certificate found in {}",
                certificate.display()
            )));
        }

        Self::new(chain, &key)
    }

    /// Read the first key entry of a PKCS#12 keystore.
    pub fn from_pkcs12_file(path: &Path, password: &str) -> Result<Self> {
        let data = read_file(path)?;
        let keystore = KeyStore::from_pkcs12(&data, password).map_err(|e| {
            Error::Configuration(format!("Unable to open keystore {}: {e}", path.display()))
        })?;

        let (alias, entry) = keystore.private_key_chain().ok_or_else(|| {
            Error::Configuration(format!("Keystore {} holds no private key", path.display()))
        })?;
        debug!("Using keystore entry '{}'", alias);

        let key = pkcs8_rsa_key(entry.key(), path)?;
        let chain: Vec<Vec<u8>> = entry
            .chain()
            .iter()
            .map(|cert| cert.as_der().to_vec())
            .collect();
        let subject = entry.chain().first().map(|cert| cert.subject().to_string());

        let mut identity = Self::new(chain, &key)?;
        identity.subject = subject;
        Ok(identity)
    }

    /// DER encoding of the leaf certificate.
    pub fn leaf(&self) -> &[u8] {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }
}

impl fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("subject", &self.subject)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// A pre-registered RSA key in JSON Web Key format.
#[derive(Clone)]
pub struct JwkIdentity {
    kid: Option<String>,
    key: EncodingKey,
}

#[derive(Deserialize)]
struct RsaJwk {
    kty: String,
    kid: Option<String>,
    n: String,
    e: String,
    d: Option<String>,
    p: Option<String>,
    q: Option<String>,
}

impl JwkIdentity {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = read_file(path)?;
        let json = String::from_utf8(data).map_err(|_| {
            Error::Configuration(format!("{} is not valid UTF-8", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let jwk: RsaJwk = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid JWK: {e}")))?;

        if jwk.kty != "RSA" {
            return Err(Error::Configuration(format!(
                "Unsupported JWK key type '{}', only RSA keys can sign RS256 assertions",
                jwk.kty
            )));
        }
        let d = jwk.d.as_deref().ok_or_else(|| {
            Error::Configuration("JWK holds a public key, a private key is required".to_string())
        })?;

        let mut primes = Vec::new();
        if let (Some(p), Some(q)) = (&jwk.p, &jwk.q) {
            primes.push(jwk_uint(p, "p")?);
            primes.push(jwk_uint(q, "q")?);
        }

        let key = RsaPrivateKey::from_components(
            jwk_uint(&jwk.n, "n")?,
            jwk_uint(&jwk.e, "e")?,
            jwk_uint(d, "d")?,
            primes,
        )
        .map_err(|e| Error::Configuration(format!("Invalid RSA JWK: {e}")))?;

        if let Some(kid) = &jwk.kid {
            info!(
                "JWK carries kid '{}'; pass it with --kid if the client is registered with it",
                kid
            );
        }

        Ok(Self {
            kid: jwk.kid,
            key: encoding_key(&key)?,
        })
    }

    /// The `kid` stored in the JWK file, if any.
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }
}

impl fmt::Debug for JwkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwkIdentity")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

fn encoding_key(key: &RsaPrivateKey) -> Result<EncodingKey> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| Error::Configuration(format!("Unable to encode RSA key: {e}")))?;
    Ok(EncodingKey::from_rsa_der(der.as_bytes()))
}

fn pkcs8_rsa_key(der: &[u8], path: &Path) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der).map_err(|e| {
        Error::Configuration(format!(
            "Private key in {} is not a usable RSA key: {e}",
            path.display()
        ))
    })
}

fn jwk_uint(value: &str, member: &str) -> Result<BigUint> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| Error::Configuration(format!("Invalid JWK member '{member}': {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn read_pem(path: &Path) -> Result<Vec<Item>> {
    let data = read_file(path)?;
    rustls_pemfile::read_all(&mut BufReader::new(data.as_slice()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Configuration(format!("Invalid PEM file {}: {e}", path.display())))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| Error::Configuration(format!("Unable to read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;

    #[test]
    fn test_pem_identity_has_leaf_certificate() {
        let identity = testutils::pem_identity();
        let x5c = identity.x5c().unwrap();
        assert_eq!(x5c, vec![testutils::fixture_string("client.crt.b64")]);
    }

    #[test]
    fn test_pkcs8_key_is_accepted() {
        let identity = CertificateIdentity::from_pem_files(
            &testutils::fixture_path("client.crt"),
            &testutils::fixture_path("client.pk8.pem"),
        )
        .unwrap();
        assert_eq!(identity.chain().len(), 1);
    }

    #[test]
    fn test_pkcs12_identity_matches_pem_certificate() {
        let identity = testutils::pkcs12_identity();
        let pem = testutils::pem_identity();
        assert_eq!(identity.x5c(), pem.x5c());
    }

    #[test]
    fn test_pkcs12_wrong_password() {
        let err = CertificateIdentity::from_pkcs12_file(
            &testutils::fixture_path("client.p12"),
            "wrong",
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_jwk_identity_has_no_x5c() {
        let identity = testutils::jwk_identity();
        assert!(identity.x5c().is_none());
        match identity {
            SigningIdentity::Jwk(jwk) => assert_eq!(jwk.kid(), Some("jwk-test-key")),
            other => panic!("unexpected identity {other:?}"),
        }
    }

    #[test]
    fn test_public_jwk_rejected() {
        let err = JwkIdentity::from_json(r#"{"kty":"RSA","n":"AQAB","e":"AQAB"}"#).unwrap_err();
        assert!(err.to_string().contains("private key is required"));
    }

    #[test]
    fn test_ec_jwk_rejected() {
        let err =
            JwkIdentity::from_json(r#"{"kty":"EC","n":"AQAB","e":"AQAB","d":"AQAB"}"#).unwrap_err();
        assert!(err.to_string().contains("Unsupported JWK key type"));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = SigningIdentity::load(&IdentitySource::Jwk {
            path: testutils::fixture_path("does-not-exist.json"),
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_certificate_file_without_key() {
        let cert = testutils::fixture_path("client.crt");
        let err = CertificateIdentity::from_pem_files(&cert, &cert).unwrap_err();
        assert!(err.to_string().contains("No private key"));
    }
}
