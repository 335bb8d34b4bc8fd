//! Client for the remote content API
//!
//! Two calls are used: token issuance and content lookup. Every response is
//! wrapped in a `{status, data}` envelope; non-`ok` statuses are mapped onto
//! [`FetchError`] here so callers never inspect raw status strings.

use crate::error::{FetchError, ResolveErrorKind};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    token: String,
}

/// Node kind as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    File,
    Folder,
}

/// Raw content description returned by a lookup
#[derive(Debug, Clone, Deserialize)]
pub struct ContentInfo {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub link: Option<String>,
    /// Child summaries keyed by id, in API enumeration order
    #[serde(default)]
    pub children: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, rename = "childrenIds")]
    pub children_ids: Option<Vec<String>>,
}

impl ContentInfo {
    /// Child summaries in enumeration order
    ///
    /// `childrenIds` is authoritative when present; otherwise the order of
    /// the `children` object is used. Malformed children are skipped.
    pub fn ordered_children(&self) -> Vec<ContentInfo> {
        let Some(children) = &self.children else {
            return Vec::new();
        };

        let entries: Vec<(&String, &serde_json::Value)> = match &self.children_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| children.get(id).map(|value| (id, value)))
                .collect(),
            None => children.iter().collect(),
        };

        entries
            .into_iter()
            .filter_map(|(id, value)| match parse_child(id, value) {
                Ok(child) => Some(child),
                Err(e) => {
                    warn!("Skipping child of {}: {}", self.name, e);
                    None
                }
            })
            .collect()
    }
}

fn parse_child(id: &str, value: &serde_json::Value) -> Result<ContentInfo, FetchError> {
    let mut child: ContentInfo = serde_json::from_value(value.clone())
        .map_err(|e| FetchError::Protocol(format!("malformed child {}: {}", id, e)))?;
    if child.id.is_empty() {
        child.id = id.to_string();
    }
    Ok(child)
}

/// HTTP client for the content API
#[derive(Debug, Clone)]
pub struct ContentApi {
    client: Client,
    base: String,
    website_token: Option<String>,
    timeout: Duration,
}

impl ContentApi {
    pub fn new(
        client: Client,
        base: impl Into<String>,
        website_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            website_token,
            timeout,
        }
    }

    /// Issue a new guest account token
    pub async fn issue_token(&self) -> Result<String, FetchError> {
        let url = format!("{}/accounts", self.base);
        debug!("Issuing account token via {}", url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::Auth(format!("token request failed: {}", e)))?;

        let data: TokenData = self
            .read_envelope(response, "accounts")
            .await
            .map_err(|e| match e {
                FetchError::Auth(_) => e,
                other => FetchError::Auth(other.to_string()),
            })?;

        if data.token.is_empty() {
            return Err(FetchError::Auth("issued token is empty".to_string()));
        }
        Ok(data.token)
    }

    /// Look up a file or folder by id
    pub async fn get_content(
        &self,
        content_id: &str,
        token: &str,
        password_hash: Option<&str>,
    ) -> Result<ContentInfo, FetchError> {
        let url = format!("{}/contents/{}", self.base, content_id);
        let mut request = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(self.timeout);
        if let Some(wt) = &self.website_token {
            request = request.query(&[("wt", wt.as_str())]);
        }
        if let Some(hash) = password_hash {
            request = request.query(&[("password", hash)]);
        }

        let response = request.send().await?;
        let mut info: ContentInfo = self.read_envelope(response, content_id).await?;
        if info.id.is_empty() {
            info.id = content_id.to_string();
        }
        Ok(info)
    }

    async fn read_envelope<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        subject: &str,
    ) -> Result<T, FetchError> {
        let http_status = response.status();
        let body = response.text().await?;

        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !http_status.is_success() => {
                return Err(status_error(http_status.as_u16(), subject));
            }
            Err(e) => {
                return Err(FetchError::Protocol(format!(
                    "malformed response for {}: {}",
                    subject, e
                )))
            }
        };

        match envelope.status.as_str() {
            "ok" => serde_json::from_value(envelope.data).map_err(|e| {
                FetchError::Protocol(format!("unexpected payload for {}: {}", subject, e))
            }),
            "error-notFound" => Err(FetchError::Resolve {
                id: subject.to_string(),
                kind: ResolveErrorKind::NotFound,
            }),
            "error-passwordRequired" | "error-passwordWrong" => Err(FetchError::Resolve {
                id: subject.to_string(),
                kind: ResolveErrorKind::PasswordRejected,
            }),
            "error-auth" => Err(FetchError::Server {
                status: 401,
                message: format!("token rejected for {}", subject),
            }),
            other if !http_status.is_success() => Err(FetchError::Server {
                status: http_status.as_u16(),
                message: format!("{} for {}", other, subject),
            }),
            other => Err(FetchError::Resolve {
                id: format!("{} ({})", subject, other),
                kind: ResolveErrorKind::Unavailable,
            }),
        }
    }
}

fn status_error(status: u16, subject: &str) -> FetchError {
    match status {
        404 => FetchError::Resolve {
            id: subject.to_string(),
            kind: ResolveErrorKind::NotFound,
        },
        _ => FetchError::Server {
            status,
            message: format!("lookup of {} failed", subject),
        },
    }
}
