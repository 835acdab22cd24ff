//! Registry token authentication
//!
//! Probes the `/v2/` endpoint, parses the `WWW-Authenticate` Bearer
//! challenge and requests a repository-scoped token from the auth service.
//! Registries answering with Basic challenges get the credentials attached
//! directly to each request instead.

use crate::error::{Result, TransmitError};
use reqwest::blocking::Client;
use serde::Deserialize;

#[derive(Debug)]
struct AuthChallenge {
    realm: String,
    service: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// How requests against the registry must authenticate.
#[derive(Debug, Clone)]
pub enum Credential {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

/// Resolve the credential for one repository. `scope_actions` is
/// `"pull"` for sources and `"pull,push"` for destinations.
pub fn resolve_credential(
    client: &Client,
    endpoint: &str,
    repository: &str,
    username: &str,
    password: &str,
    scope_actions: &str,
) -> Result<Credential> {
    let v2_url = format!("{}/v2/", endpoint);
    let response = client
        .get(&v2_url)
        .send()
        .map_err(|e| TransmitError::Network(format!("failed to access registry API: {}", e)))?;

    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return Ok(Credential::None);
    }

    let auth_header = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if auth_header.starts_with("Bearer ") {
        let challenge = parse_auth_challenge(&auth_header)?;
        let scope = format!("repository:{}:{}", repository, scope_actions);
        let token = request_token(client, &challenge, &scope, username, password)?;
        Ok(Credential::Bearer(token))
    } else if auth_header.starts_with("Basic") {
        if username.is_empty() {
            return Err(TransmitError::Auth(format!(
                "registry {} requires basic credentials",
                endpoint
            )));
        }
        Ok(Credential::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    } else {
        Ok(Credential::None)
    }
}

fn request_token(
    client: &Client,
    challenge: &AuthChallenge,
    scope: &str,
    username: &str,
    password: &str,
) -> Result<String> {
    let mut token_url = url::Url::parse(&challenge.realm)?;
    token_url
        .query_pairs_mut()
        .append_pair("service", &challenge.service)
        .append_pair("scope", scope);

    let mut request = client.get(token_url.as_str());
    if !username.is_empty() {
        request = request.basic_auth(username, Some(password));
    }
    let response = request
        .send()
        .map_err(|e| TransmitError::Network(format!("failed to request auth token: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().unwrap_or_default();
        return Err(TransmitError::Auth(format!(
            "token request failed (status {}): {}",
            status, text
        )));
    }

    let token: TokenResponse = response
        .json()
        .map_err(|e| TransmitError::Auth(format!("failed to parse token response: {}", e)))?;
    token
        .token
        .or(token.access_token)
        .ok_or_else(|| TransmitError::Auth("no token in auth response".to_string()))
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_auth_challenge(auth_header: &str) -> Result<AuthChallenge> {
    let params = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| TransmitError::Auth("invalid Bearer auth header".to_string()))?;

    let mut realm = String::new();
    let mut service = String::new();
    for param in params.split(',') {
        if let Some((key, value)) = param.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = value.to_string(),
                "service" => service = value.to_string(),
                _ => {}
            }
        }
    }

    if realm.is_empty() {
        return Err(TransmitError::Auth("invalid auth challenge format".to_string()));
    }
    Ok(AuthChallenge { realm, service })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let c = parse_auth_challenge(
            "Bearer realm=\"https://auth.x.io/token\",service=\"registry.x.io\",scope=\"repository:ns/img:pull\"",
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.x.io/token");
        assert_eq!(c.service, "registry.x.io");
    }

    #[test]
    fn test_parse_challenge_rejects_basic() {
        assert!(parse_auth_challenge("Basic realm=\"x\"").is_err());
        assert!(parse_auth_challenge("Bearer service=\"x\"").is_err());
    }
}
