//! PKCE (RFC 7636) and the browser authorization URL for person mode.

use oauth2::{PkceCodeChallenge, PkceCodeVerifier};
use rand::{distributions::Alphanumeric, Rng};
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Assurance level requested from the person login.
pub const ACR_VALUES: &str = "Level3";
pub const UI_LOCALES: &str = "nb";
pub const VERIFIER_LEN: usize = 64;

/// A code verifier and its S256 challenge.
pub struct Pkce {
    verifier: PkceCodeVerifier,
    challenge: PkceCodeChallenge,
}

impl Pkce {
    /// Generate a fresh 64 character alphanumeric verifier.
    pub fn generate() -> Self {
        let verifier: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(VERIFIER_LEN)
            .map(char::from)
            .collect();
        Self::from_verifier(verifier)
    }

    /// The verifier must be 43 to 128 characters long.
    pub fn from_verifier(verifier: String) -> Self {
        let verifier = PkceCodeVerifier::new(verifier);
        let challenge = PkceCodeChallenge::from_code_verifier_sha256(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn verifier(&self) -> &str {
        self.verifier.secret()
    }

    pub fn challenge(&self) -> &str {
        self.challenge.as_str()
    }

    pub fn method(&self) -> &str {
        self.challenge.method().as_str()
    }
}

impl std::fmt::Debug for Pkce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkce")
            .field("challenge", &self.challenge())
            .finish_non_exhaustive()
    }
}

/// URL the person is sent to for login and consent.
pub fn authorize_url(config: &Config, pkce: &Pkce) -> Result<Url> {
    let mut url = config.authorize_endpoint.clone().ok_or_else(|| {
        Error::Configuration("Person mode requires --authorize-endpoint".to_string())
    })?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("scope", &config.scopes)
            .append_pair("acr_values", ACR_VALUES)
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri())
            .append_pair("response_type", "code")
            .append_pair("ui_locales", UI_LOCALES)
            .append_pair("code_challenge", pkce.challenge())
            .append_pair("code_challenge_method", pkce.method());
        if let Some(resource) = &config.resource {
            query.append_pair("resource", resource);
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigInput, Mode};
    use std::collections::HashMap;

    fn person_config(resource: Option<&str>) -> Config {
        Config::validate(ConfigInput {
            jwk_path: Some("client.jwk.json".into()),
            client_id: Some("my-client".to_string()),
            audience: Some("https://test.idporten.no/".to_string()),
            scopes: Some("openid,profile".to_string()),
            resource: resource.map(str::to_string),
            token_endpoint: Some("https://test.idporten.no/token".to_string()),
            authorize_endpoint: Some("https://login.test.idporten.no/authorize".to_string()),
            person_mode: true,
            server_port: Some(18000),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_verifier_shape() {
        let pkce = Pkce::generate();
        assert_eq!(pkce.verifier().len(), VERIFIER_LEN);
        assert!(pkce.verifier().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pkce.verifier(), Pkce::generate().verifier());
    }

    #[test]
    fn test_rfc7636_appendix_b_challenge() {
        let pkce = Pkce::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string());
        assert_eq!(pkce.challenge(), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert_eq!(pkce.method(), "S256");
    }

    #[test]
    fn test_authorize_url_parameters() {
        let config = person_config(None);
        assert_eq!(config.mode, Mode::Person);
        let pkce = Pkce::generate();
        let url = authorize_url(&config, &pkce).unwrap();

        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["scope"], "openid profile");
        assert_eq!(query["acr_values"], "Level3");
        assert_eq!(query["client_id"], "my-client");
        assert_eq!(query["redirect_uri"], "http://localhost:18000/response");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["ui_locales"], "nb");
        assert_eq!(query["code_challenge"], pkce.challenge());
        assert_eq!(query["code_challenge_method"], "S256");
        assert!(!query.contains_key("resource"));
        assert!(url
            .as_str()
            .contains("redirect_uri=http%3A%2F%2Flocalhost%3A18000%2Fresponse"));
    }

    #[test]
    fn test_authorize_url_with_resource() {
        let config = person_config(Some("https://api.example.no/"));
        let url = authorize_url(&config, &Pkce::generate()).unwrap();
        assert!(url
            .as_str()
            .ends_with("&resource=https%3A%2F%2Fapi.example.no%2F"));
    }
}
