use super::{AuthorityError, CredentialRequest, CredentialResponse, IdentityAuthority};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

const AUTH_ENDPOINT: &str = "api/remote/sftp/auth";

/// Connection settings for the remote panel
#[derive(Debug, Clone)]
pub struct HttpAuthorityConfig {
    /// Base URL of the panel, e.g. `https://panel.example.com`
    pub url: String,
    /// Bearer token identifying this gateway to the panel
    pub token: String,
    pub timeout: Duration,
}

/// Identity authority reached over HTTP
pub struct HttpAuthority {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(config: HttpAuthorityConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            endpoint: format!("{}/{}", config.url.trim_end_matches('/'), AUTH_ENDPOINT),
            token: config.token,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Statuses the panel answers a bad username or password with
fn is_invalid_credentials(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY
    )
}

#[async_trait]
impl IdentityAuthority for HttpAuthority {
    async fn validate(
        &self,
        request: &CredentialRequest,
    ) -> Result<CredentialResponse, AuthorityError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;

        let status = response.status();
        debug!(status = %status, user = %request.user, "Identity authority responded");

        if is_invalid_credentials(status) {
            return Err(AuthorityError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(AuthorityError::Unavailable(format!(
                "unexpected status {}",
                status
            )));
        }

        let body: CredentialResponse = response
            .json()
            .await
            .map_err(|e| AuthorityError::Unavailable(format!("malformed response: {}", e)))?;
        if body.server.is_empty() {
            return Err(AuthorityError::Unavailable(
                "response did not name a tenant".to_string(),
            ));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::request;

    #[test]
    fn test_endpoint_joins_base_url() {
        let authority = HttpAuthority::new(HttpAuthorityConfig {
            url: "https://panel.example.com/".into(),
            token: "t".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            authority.endpoint(),
            "https://panel.example.com/api/remote/sftp/auth"
        );
    }

    #[test]
    fn test_invalid_credential_statuses() {
        assert!(is_invalid_credentials(StatusCode::FORBIDDEN));
        assert!(is_invalid_credentials(StatusCode::UNAUTHORIZED));
        assert!(!is_invalid_credentials(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_invalid_credentials(StatusCode::OK));
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(request("bob", "pw")).unwrap();
        assert_eq!(body["user"], "bob");
        assert_eq!(body["pass"], "pw");
        assert_eq!(body["client_version"], "SSH-2.0-OpenSSH_9.6");
        assert!(body.get("session_id").is_some());
    }

    #[test]
    fn test_response_without_permissions() {
        let parsed: CredentialResponse =
            serde_json::from_str(r#"{"server":"tenant-42"}"#).unwrap();
        assert_eq!(parsed.server, "tenant-42");
        assert!(parsed.permissions.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_authority_is_unavailable() {
        let authority = HttpAuthority::new(HttpAuthorityConfig {
            url: "http://127.0.0.1:1".into(),
            token: "t".into(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let result = authority.validate(&request("bob", "pw")).await;
        assert!(matches!(result, Err(AuthorityError::Unavailable(_))));
    }
}
