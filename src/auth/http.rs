//! Client for the things service's HTTP authorization API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AuthClient, AuthError};
use crate::config::AuthSettings;

#[derive(Serialize)]
struct AccessRequest<'a> {
    channel: &'a str,
    key: &'a str,
}

#[derive(Serialize)]
struct IdentifyRequest<'a> {
    key: &'a str,
}

#[derive(Deserialize)]
struct IdentityResponse {
    id: String,
}

pub struct HttpAuthClient {
    http: reqwest::Client,
    base: String,
}

impl HttpAuthClient {
    pub fn new(settings: &AuthSettings) -> Result<Self, AuthError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .https_only(settings.client_tls);

        if let Some(path) = &settings.ca_certs {
            let pem = std::fs::read(path)
                .map_err(|e| AuthError::Setup(format!("reading CA certs {path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| AuthError::Setup(format!("parsing CA certs {path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| AuthError::Setup(e.to_string()))?;
        Ok(Self {
            http,
            base: settings.url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<String, AuthError> {
        let url = format!("{}/{path}", self.base);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let identity: IdentityResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Unavailable(format!("bad auth response: {e}")))?;
            return Ok(identity.id);
        }

        debug!(%url, %status, "auth request rejected");
        match status {
            s if s.is_server_error() => Err(AuthError::Unavailable(format!("auth service returned {s}"))),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                Err(AuthError::Unavailable(format!("auth service returned {status}")))
            }
            _ => Err(AuthError::Unauthorized),
        }
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn can_access(&self, channel: &str, key: &str) -> Result<String, AuthError> {
        if key.is_empty() {
            return Err(AuthError::Unauthorized);
        }
        self.post("access", &AccessRequest { channel, key }).await
    }

    async fn identify(&self, key: &str) -> Result<String, AuthError> {
        if key.is_empty() {
            return Err(AuthError::Unauthorized);
        }
        self.post("identify", &IdentifyRequest { key }).await
    }
}
