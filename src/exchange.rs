//! Token endpoint exchanges.
//!
//! Two grants are supported: the JWT bearer grant (RFC 7523 §2.1) for
//! machine to machine access, and the authorization code grant with PKCE
//! where the assertion authenticates the client (RFC 7523 §2.2).

use std::{error::Error as StdError, fmt::Write as _, time::Duration};

use http::header;
use reqwest::{tls, Client as HttpClient};
use tracing::{debug, error};
use url::{form_urlencoded, Url};

use crate::error::{Error, Result};

pub const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// A single grant request. The assertion is freshly built for each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantRequest {
    JwtBearer {
        assertion: String,
    },
    AuthorizationCode {
        assertion: String,
        code: String,
        client_id: String,
        redirect_uri: String,
        code_verifier: String,
    },
}

impl GrantRequest {
    pub fn grant_type(&self) -> &'static str {
        match self {
            GrantRequest::JwtBearer { .. } => JWT_BEARER_GRANT_TYPE,
            GrantRequest::AuthorizationCode { .. } => "authorization_code",
        }
    }

    /// The `application/x-www-form-urlencoded` request body.
    pub fn form_body(&self) -> String {
        let mut form = form_urlencoded::Serializer::new(String::new());
        match self {
            GrantRequest::JwtBearer { assertion } => {
                form.append_pair("grant_type", self.grant_type())
                    .append_pair("assertion", assertion);
            }
            GrantRequest::AuthorizationCode {
                assertion,
                code,
                client_id,
                redirect_uri,
                code_verifier,
            } => {
                form.append_pair("client_id", client_id)
                    .append_pair("grant_type", self.grant_type())
                    .append_pair("code", code)
                    .append_pair("redirect_uri", redirect_uri)
                    .append_pair("code_verifier", code_verifier)
                    .append_pair("client_assertion_type", CLIENT_ASSERTION_TYPE)
                    .append_pair("client_assertion", assertion);
            }
        }
        form.finish()
    }
}

/// Outcome of one exchange, together with what was sent.
#[derive(Debug, Clone)]
pub struct TokenExchange {
    /// Exact form body posted to the token endpoint.
    pub request_body: String,
    /// The same request as a curl command line.
    pub curl_command: String,
    /// HTTP status, absent when the endpoint was never reached.
    pub status: Option<u16>,
    /// Raw response body, absent when the endpoint was never reached.
    pub body: Option<String>,
    /// Transport failure with its source chain.
    pub transport_error: Option<String>,
}

impl TokenExchange {
    /// True unless the endpoint answered with a 2xx status and the whole
    /// body was read.
    pub fn is_error(&self) -> bool {
        self.transport_error.is_some()
            || !matches!(self.status, Some(status) if (200..300).contains(&status))
    }

    /// `expires_in` of a successful response, as a number or numeric string.
    pub fn expires_in(&self) -> Option<u64> {
        let value = self.json_field("expires_in")?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
    }

    pub fn access_token(&self) -> Option<String> {
        self.json_field("access_token")?
            .as_str()
            .map(str::to_string)
    }

    fn json_field(&self, name: &str) -> Option<serde_json::Value> {
        let body = self.body.as_deref()?;
        let mut json: serde_json::Value = serde_json::from_str(body).ok()?;
        json.get_mut(name).map(serde_json::Value::take)
    }

    /// The response body of a successful exchange, or the matching error.
    pub fn into_result(self) -> Result<String> {
        if let Some(e) = self.transport_error {
            return Err(Error::Transport(e));
        }
        match (self.status, self.body) {
            (Some(status), Some(body)) if (200..300).contains(&status) => Ok(body),
            (Some(status), body) => Err(Error::Grant {
                status,
                body: body.unwrap_or_default(),
            }),
            (None, _) => Err(Error::Transport("No response from token endpoint".to_string())),
        }
    }

    /// Operator facing report of a failed exchange.
    pub fn diagnostics(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "############");
        match self.status {
            Some(status) => {
                let _ = writeln!(out, "Token endpoint returned HTTP {status}");
            }
            None => {
                let _ = writeln!(out, "Failed request to token endpoint");
            }
        }
        if let Some(e) = &self.transport_error {
            let _ = writeln!(out, "Error: {e}");
        }
        let _ = writeln!(
            out,
            "Response: {}",
            self.body.as_deref().unwrap_or("<no response>")
        );
        let _ = writeln!(out, "Request body: {}", self.request_body);
        let _ = writeln!(out, "Call made (formatted as curl command):");
        let _ = writeln!(out, "{}", self.curl_command);
        let _ = write!(out, "############");
        out
    }
}

/// Build the curl equivalent of a token request.
pub fn curl_command(request_body: &str, token_endpoint: &Url) -> String {
    format!("curl -v -X POST -d '{request_body}' {token_endpoint}")
}

/// Posts grant requests to the token endpoint. One request per exchange,
/// no retries.
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    client: HttpClient,
    token_endpoint: Url,
}

impl TokenExchanger {
    pub fn new(token_endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .min_tls_version(tls::Version::TLS_1_2)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            token_endpoint,
        })
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    pub async fn exchange(&self, grant: &GrantRequest) -> TokenExchange {
        let request_body = grant.form_body();
        let mut exchange = TokenExchange {
            curl_command: curl_command(&request_body, &self.token_endpoint),
            request_body,
            status: None,
            body: None,
            transport_error: None,
        };

        debug!(
            "Requesting token from {} with grant {}",
            self.token_endpoint,
            grant.grant_type()
        );

        let response = self
            .client
            .post(self.token_endpoint.clone())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(exchange.request_body.clone())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                error!("Failed request to {}: {}", self.token_endpoint, e);
                exchange.transport_error = Some(error_chain(&e));
                return exchange;
            }
        };

        exchange.status = Some(response.status().as_u16());
        match response.text().await {
            Ok(body) => exchange.body = Some(body),
            Err(e) => {
                error!("Failed to read token response: {}", e);
                exchange.transport_error = Some(error_chain(&e));
            }
        }

        debug!(
            "Token endpoint answered {:?} (error: {})",
            exchange.status,
            exchange.is_error()
        );
        exchange
    }
}

fn error_chain(e: &dyn StdError) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        let _ = write!(message, ": {inner}");
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(body: &str) -> HashMap<String, String> {
        form_urlencoded::parse(body.as_bytes()).into_owned().collect()
    }

    fn exchange_with(status: Option<u16>, body: Option<&str>) -> TokenExchange {
        TokenExchange {
            request_body: "grant_type=x".to_string(),
            curl_command: "curl -v -X POST -d 'grant_type=x' https://example.com/token".to_string(),
            status,
            body: body.map(str::to_string),
            transport_error: None,
        }
    }

    #[test]
    fn test_jwt_bearer_form() {
        let grant = GrantRequest::JwtBearer {
            assertion: "a.b.c".to_string(),
        };
        let body = grant.form_body();
        assert_eq!(
            body,
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion=a.b.c"
        );
    }

    #[test]
    fn test_authorization_code_form() {
        let grant = GrantRequest::AuthorizationCode {
            assertion: "a.b.c".to_string(),
            code: "ABC".to_string(),
            client_id: "my-client".to_string(),
            redirect_uri: "http://localhost:17823/response".to_string(),
            code_verifier: "verifier".to_string(),
        };
        let form = parse(&grant.form_body());
        assert_eq!(form.len(), 7);
        assert_eq!(form["client_id"], "my-client");
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code"], "ABC");
        assert_eq!(form["redirect_uri"], "http://localhost:17823/response");
        assert_eq!(form["code_verifier"], "verifier");
        assert_eq!(form["client_assertion_type"], CLIENT_ASSERTION_TYPE);
        assert_eq!(form["client_assertion"], "a.b.c");
    }

    #[test]
    fn test_curl_command() {
        let endpoint = Url::parse("https://test.maskinporten.no/token").unwrap();
        assert_eq!(
            curl_command("grant_type=x&assertion=y", &endpoint),
            "curl -v -X POST -d 'grant_type=x&assertion=y' https://test.maskinporten.no/token"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(!exchange_with(Some(200), Some("{}")).is_error());
        assert!(!exchange_with(Some(204), None).is_error());
        assert!(exchange_with(Some(400), Some("{}")).is_error());
        assert!(exchange_with(Some(500), None).is_error());
        assert!(exchange_with(None, None).is_error());

        // Headers arrived but reading the body failed.
        let mut truncated = exchange_with(Some(200), None);
        truncated.transport_error = Some("connection reset while reading body".to_string());
        assert!(truncated.is_error());
        assert!(matches!(truncated.into_result(), Err(Error::Transport(_))));
    }

    #[test]
    fn test_expires_in_parsing() {
        let ok = exchange_with(Some(200), Some(r#"{"access_token":"t","expires_in":120}"#));
        assert_eq!(ok.expires_in(), Some(120));
        assert_eq!(ok.access_token().as_deref(), Some("t"));

        let string = exchange_with(Some(200), Some(r#"{"expires_in":"60"}"#));
        assert_eq!(string.expires_in(), Some(60));

        let missing = exchange_with(Some(200), Some(r#"{"access_token":"t"}"#));
        assert_eq!(missing.expires_in(), None);

        let garbage = exchange_with(Some(200), Some("not json"));
        assert_eq!(garbage.expires_in(), None);
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            exchange_with(Some(200), Some("{}")).into_result().unwrap(),
            "{}"
        );
        match exchange_with(Some(401), Some("denied")).into_result() {
            Err(Error::Grant { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "denied");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let mut failed = exchange_with(None, None);
        failed.transport_error = Some("connection refused".to_string());
        assert!(matches!(failed.into_result(), Err(Error::Transport(_))));
    }

    #[test]
    fn test_diagnostics_contains_body_and_curl() {
        let exchange = exchange_with(Some(500), Some(r#"{"error":"server_error"}"#));
        let report = exchange.diagnostics();
        assert!(report.contains("HTTP 500"));
        assert!(report.contains(r#"{"error":"server_error"}"#));
        assert!(report.contains(&exchange.curl_command));
        assert!(report.contains("Request body: grant_type=x"));
    }
}
