//! Worker API over HTTP.
//!
//! `GET {base}/decisions`, `GET {base}/tenants`, `GET {base}/inbox`,
//! `POST {base}/tenants/{tenant}/approve|reject`, and
//! `POST {base}/commands` with `{"args": [...]}` → `{"output": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::Backend;
use crate::error::{ActionError, FetchError};

/// User-Agent header sent with requests.
const USER_AGENT: &str = concat!("guardian-console/", env!("CARGO_PKG_VERSION"));

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Serialize)]
struct CommandRequest<'a> {
    args: &'a [String],
}

#[derive(Deserialize)]
struct CommandResponse {
    #[serde(default)]
    output: String,
}

pub struct HttpBackend {
    client: Client,
    base: Url,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid backend URL {base_url}: {e}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Backend URL {base_url} cannot be used as a base");
        }
        // Joining relative paths needs a trailing slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base,
            api_token: api_token.filter(|t| !t.is_empty()),
        })
    }

    /// `{base}/seg1/seg2/...` with every segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json(&self, source_name: &'static str, path: &str) -> Result<Value, FetchError> {
        let url = self.endpoint(&[path]);
        debug!("GET {url}");

        let unavailable = |message: String| FetchError::Unavailable {
            source_name,
            message,
        };

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(unavailable(format!("HTTP {status}: {body}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed {
            source_name,
            message: e.to_string(),
        })
    }

    async fn tenant_action(&self, action: &'static str, tenant: &str) -> Result<(), ActionError> {
        let url = self.endpoint(&["tenants", tenant, action]);
        debug!("POST {url}");

        let response = self
            .authorize(self.client.post(url))
            .send()
            .await
            .map_err(|e| ActionError::Backend {
                action,
                message: e.to_string(),
            })?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ActionError::NotFound {
                tenant: tenant.to_string(),
            }),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ActionError::Backend {
                    action,
                    message: if body.is_empty() {
                        format!("HTTP {status}")
                    } else {
                        body
                    },
                })
            }
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_decisions(&self) -> Result<Value, FetchError> {
        self.get_json("decisions", "decisions").await
    }

    async fn fetch_tenant_states(&self) -> Result<Value, FetchError> {
        self.get_json("tenants", "tenants").await
    }

    async fn fetch_inbox(&self) -> Result<Value, FetchError> {
        self.get_json("inbox", "inbox").await
    }

    async fn approve_tenant(&self, tenant: &str) -> Result<(), ActionError> {
        self.tenant_action("approve", tenant).await
    }

    async fn reject_tenant(&self, tenant: &str) -> Result<(), ActionError> {
        self.tenant_action("reject", tenant).await
    }

    async fn run_command(&self, args: &[String]) -> Result<String, ActionError> {
        let url = self.endpoint(&["commands"]);
        debug!("POST {url} {args:?}");

        let failed = |message: String| ActionError::Backend {
            action: "run",
            message,
        };

        let response = self
            .authorize(self.client.post(url))
            .json(&CommandRequest { args })
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body
            }));
        }

        let parsed: CommandResponse = response.json().await.map_err(|e| failed(e.to_string()))?;
        Ok(parsed.output)
    }

    fn description(&self) -> String {
        format!("http ({})", self.base)
    }
}
