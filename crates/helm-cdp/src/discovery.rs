//! HTTP target discovery against the debugging endpoint's `/json` routes.

use std::time::Duration;

use tracing::debug;

use crate::error::CdpError;
use crate::types::TargetInfo;

/// Client for the discovery HTTP endpoints.
#[derive(Clone, Debug)]
pub struct Discovery {
    http: reqwest::Client,
    base_url: String,
}

impl Discovery {
    /// Discovery client for `http://host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_base_url(format!("http://{host}:{port}"))
    }

    /// Discovery client for an explicit base URL (no trailing slash).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// URL of the target list.
    pub fn list_url(&self) -> String {
        format!("{}/json", self.base_url)
    }

    /// `GET /json`.
    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>, CdpError> {
        let endpoint = self.list_url();
        let targets: Vec<TargetInfo> = self.fetch(self.http.get(&endpoint), &endpoint).await?;
        debug!(count = targets.len(), "listed targets");
        Ok(targets)
    }

    /// `PUT /json/new?<url>`: open a new page.
    pub async fn new_page(&self, url: &str) -> Result<TargetInfo, CdpError> {
        let endpoint = format!("{}/json/new?{url}", self.base_url);
        self.fetch(self.http.put(&endpoint), &endpoint).await
    }

    /// `GET /json/close/<id>`: close a target.
    pub async fn close_target(&self, id: &str) -> Result<(), CdpError> {
        let endpoint = format!("{}/json/close/{id}", self.base_url);
        let resp = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| discovery_err(&endpoint, &e))?;
        if !resp.status().is_success() {
            return Err(CdpError::Discovery {
                endpoint,
                reason: format!("status {}", resp.status()),
            });
        }
        Ok(())
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<T, CdpError> {
        let resp = req.send().await.map_err(|e| discovery_err(endpoint, &e))?;
        if !resp.status().is_success() {
            return Err(CdpError::Discovery {
                endpoint: endpoint.to_string(),
                reason: format!("status {}", resp.status()),
            });
        }
        resp.json().await.map_err(|e| discovery_err(endpoint, &e))
    }
}

fn discovery_err(endpoint: &str, err: &reqwest::Error) -> CdpError {
    CdpError::Discovery {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    }
}

/// First `"page"` target with a socket URL, else the first target with one.
pub fn select_target(targets: &[TargetInfo]) -> Option<&TargetInfo> {
    let attachable = || targets.iter().filter(|t| t.web_socket_debugger_url.is_some());
    attachable().find(|t| t.is_page()).or_else(|| attachable().next())
}
