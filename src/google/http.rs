//! Authenticated HTTP transport shared by the Google API adapters.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use crate::error::RemoteError;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY_LEN: usize = 300;

/// `reqwest` client plus the bearer token every call carries.
#[derive(Clone)]
pub struct GoogleHttp {
    client: reqwest::Client,
    token: SecretString,
}

impl GoogleHttp {
    pub fn new(token: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Start a request with the bearer token attached.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.token.expose_secret())
    }

    /// Send a request and decode a JSON response body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        service: &str,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = self.send(service, resource, request).await?;
        response.json::<T>().await.map_err(|e| RemoteError::Decode {
            service: service.to_string(),
            reason: format!("{resource}: {e}"),
        })
    }

    /// Send a request whose response body is irrelevant.
    pub async fn send_empty(
        &self,
        service: &str,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<(), RemoteError> {
        self.send(service, resource, request).await.map(|_| ())
    }

    async fn send(
        &self,
        service: &str,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(|e| RemoteError::Transport {
            service: service.to_string(),
            reason: e.to_string(),
        })?;
        check_status(service, resource, response).await
    }
}

/// Map non-success statuses onto `RemoteError`.
///
/// 404 and 410 become `NotFound`; the history API uses 404 for an expired
/// start position, the message API for a deleted message.
async fn check_status(
    service: &str,
    resource: &str,
    response: Response,
) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(RemoteError::NotFound {
            service: service.to_string(),
            resource: resource.to_string(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        service: service.to_string(),
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_LEN {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
    truncated.push_str("...");
    truncated
}

/// Percent-encode one URL path segment (calendar ids contain `@` and `#`).
pub fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
