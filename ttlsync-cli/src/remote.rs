//! HTTP client for the platform record API.
//!
//! Endpoints (relative to the environment's API host):
//! - `POST /account/api/session`: token and secret for a session token, also the probe
//! - `POST /datasets/{dataset}/models/{model}/records`: bulk insert
//! - `DELETE /datasets/{dataset}/models/{model}/records`: delete all records
//! - `POST /datasets/{dataset}/models/{model}/links`: create record links, existing ones are kept
//!
//! Bulk responses list per-record failures; they are passed through as
//! [`BulkResult`] failures instead of errors.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use ttlsync_core::{
    AssignedId, BulkResult, Error, OutgoingRecord, PlatformApi, RecordFailure, RecordLink,
};

use crate::config::Credentials;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    token_id: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    session_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    source_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    values: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct InsertRequest<'a> {
    records: Vec<WireRecord<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAssigned {
    source_id: String,
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFailure {
    record_id: String,
    reason: String,
}

#[derive(Deserialize)]
struct InsertResponse {
    #[serde(default)]
    records: Vec<WireAssigned>,
    #[serde(default)]
    failures: Vec<WireFailure>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireLink<'a> {
    from: &'a str,
    name: &'a str,
    target_model: &'a str,
    to: &'a str,
}

#[derive(Serialize)]
struct LinkRequest<'a> {
    links: Vec<WireLink<'a>>,
}

#[derive(Deserialize)]
struct LinkResponse {
    #[serde(default)]
    linked: usize,
    #[serde(default)]
    failures: Vec<WireFailure>,
}

#[derive(Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    deleted: usize,
    #[serde(default)]
    failures: Vec<WireFailure>,
}

fn convert_failures(failures: Vec<WireFailure>) -> Vec<RecordFailure> {
    failures
        .into_iter()
        .map(|f| RecordFailure {
            record_id: f.record_id,
            reason: f.reason,
        })
        .collect()
}

fn platform_error(e: anyhow::Error) -> Error {
    Error::Platform(format!("{:#}", e))
}

pub struct HttpPlatform {
    api_host: Url,
    credentials: Credentials,
    http: reqwest::Client,
    session: Mutex<Option<String>>,
}

impl HttpPlatform {
    pub fn new(api_host: &str, credentials: Credentials, timeout: Duration) -> anyhow::Result<Self> {
        let api_host =
            Url::parse(api_host).with_context(|| format!("Invalid API host {}", api_host))?;
        if api_host.cannot_be_a_base() {
            return Err(anyhow!("Invalid API host {}", api_host));
        }
        Ok(Self {
            api_host,
            credentials,
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?,
            session: Mutex::new(None),
        })
    }

    /// Build `{host}/seg/seg/...` with every segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.api_host.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("API host cannot carry a path"))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn session_token(&self) -> anyhow::Result<String> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }

        let url = self.endpoint(&["account", "api", "session"])?;
        let resp = self
            .http
            .post(url.clone())
            .json(&SessionRequest {
                token_id: &self.credentials.token,
                secret: &self.credentials.secret,
            })
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST {} failed ({}): {}", url.path(), status, body));
        }
        let parsed: SessionResponse = resp
            .json()
            .await
            .context("Failed to parse session response")?;
        *session = Some(parsed.session_token.clone());
        Ok(parsed.session_token)
    }

    async fn send<B: Serialize + Sync>(&self, method: Method, url: Url, body: Option<&B>) -> anyhow::Result<reqwest::Response> {
        let token = self.session_token().await?;
        let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("{} {} failed to send", method, url.path()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} {} failed ({}): {}", method, url.path(), status, text));
        }
        Ok(resp)
    }

    async fn insert(&self, dataset_id: &str, model: &str, records: &[OutgoingRecord]) -> anyhow::Result<BulkResult> {
        let url = self.endpoint(&["datasets", dataset_id, "models", model, "records"])?;
        let body = InsertRequest {
            records: records
                .iter()
                .map(|r| WireRecord {
                    source_id: &r.source_id,
                    id: r.platform_id.as_deref(),
                    values: &r.values,
                })
                .collect(),
        };
        let resp = self.send(Method::POST, url, Some(&body)).await?;
        let parsed: InsertResponse = resp
            .json()
            .await
            .context("Failed to parse insert response")?;
        Ok(BulkResult {
            succeeded: parsed.records.len(),
            assigned: parsed
                .records
                .into_iter()
                .map(|r| AssignedId {
                    source_id: r.source_id,
                    platform_id: r.id,
                })
                .collect(),
            failures: convert_failures(parsed.failures),
        })
    }

    async fn delete(&self, dataset_id: &str, model: &str) -> anyhow::Result<BulkResult> {
        let url = self.endpoint(&["datasets", dataset_id, "models", model, "records"])?;
        let resp = self.send::<()>(Method::DELETE, url, None).await?;
        let parsed: DeleteResponse = resp
            .json()
            .await
            .context("Failed to parse delete response")?;
        Ok(BulkResult {
            succeeded: parsed.deleted,
            assigned: Vec::new(),
            failures: convert_failures(parsed.failures),
        })
    }

    async fn link(&self, dataset_id: &str, model: &str, links: &[RecordLink]) -> anyhow::Result<BulkResult> {
        let url = self.endpoint(&["datasets", dataset_id, "models", model, "links"])?;
        let body = LinkRequest {
            links: links
                .iter()
                .map(|l| WireLink {
                    from: &l.from,
                    name: &l.field,
                    target_model: &l.target_model,
                    to: &l.to,
                })
                .collect(),
        };
        let resp = self.send(Method::POST, url, Some(&body)).await?;
        let parsed: LinkResponse = resp
            .json()
            .await
            .context("Failed to parse link response")?;
        Ok(BulkResult {
            succeeded: parsed.linked,
            assigned: Vec::new(),
            failures: convert_failures(parsed.failures),
        })
    }
}

#[async_trait]
impl PlatformApi for HttpPlatform {
    async fn probe(&self) -> ttlsync_core::Result<()> {
        self.session_token().await.map_err(platform_error)?;
        tracing::info!("Connected to {}", self.api_host);
        Ok(())
    }

    async fn insert_records(
        &self,
        dataset_id: &str,
        model: &str,
        records: &[OutgoingRecord],
    ) -> ttlsync_core::Result<BulkResult> {
        tracing::debug!("Inserting {} records into {}/{}", records.len(), dataset_id, model);
        self.insert(dataset_id, model, records)
            .await
            .map_err(platform_error)
    }

    async fn delete_records(&self, dataset_id: &str, model: &str) -> ttlsync_core::Result<BulkResult> {
        tracing::debug!("Deleting records of {}/{}", dataset_id, model);
        self.delete(dataset_id, model).await.map_err(platform_error)
    }

    async fn link_records(
        &self,
        dataset_id: &str,
        model: &str,
        links: &[RecordLink],
    ) -> ttlsync_core::Result<BulkResult> {
        tracing::debug!("Linking {} records of {}/{}", links.len(), dataset_id, model);
        self.link(dataset_id, model, links).await.map_err(platform_error)
    }
}
