//! Control-plane transport: node identity and the mTLS HTTP client.
//!
//! The client is intentionally non-retrying; retry policy belongs to the
//! callers (the emitter buffers, the crash guard drops).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;

use crate::models::{BatchMetricsPayload, CrashEvent, Heartbeat};

pub const DEFAULT_API_URL: &str = "https://api.mambahost.local:3001";

const NODE_ID_HEADER: &str = "X-Node-ID";
const USER_AGENT_VALUE: &str = "Wings-Node/1.0";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Immutable node identity sourced from the environment at startup.
///
/// If any required variable is missing the crash guard and metrics emitter
/// do not start; the agent still serves local operator requests.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub api_base_url: String,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

impl NodeIdentity {
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => Ok(value),
                _ => bail!("{name} is required"),
            }
        };

        Ok(Self {
            cert_file: required("WINGS_TLS_CERT_FILE")?,
            key_file: required("WINGS_TLS_KEY_FILE")?,
            ca_file: required("WINGS_API_CA_CERT")?,
            node_id: required("WINGS_NODE_ID")?,
            api_base_url: std::env::var("WINGS_API_URL")
                .ok()
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        })
    }
}

/// The control-plane sink shared by the metrics emitter and crash guard.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn post_metrics(&self, payload: &BatchMetricsPayload) -> Result<()>;
    async fn post_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
    async fn post_event(&self, event: &CrashEvent) -> Result<()>;
}

/// Mutually-authenticated HTTP client for the control-plane API.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
}

impl ControlPlaneClient {
    pub fn new(identity: &NodeIdentity) -> Result<Self> {
        let cert = std::fs::read(&identity.cert_file)
            .with_context(|| format!("read client certificate {}", identity.cert_file))?;
        let key = std::fs::read(&identity.key_file)
            .with_context(|| format!("read client key {}", identity.key_file))?;
        let ca = std::fs::read(&identity.ca_file)
            .with_context(|| format!("read CA certificate {}", identity.ca_file))?;

        let mut identity_pem = cert;
        identity_pem.extend_from_slice(&key);
        let client_identity = reqwest::Identity::from_pem(&identity_pem)
            .context("parse client certificate and key")?;
        let ca_cert =
            reqwest::Certificate::from_pem(&ca).context("parse CA certificate")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            NODE_ID_HEADER,
            HeaderValue::from_str(&identity.node_id).context("node id is not a valid header")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(client_identity)
            .add_root_certificate(ca_cert)
            .tls_built_in_root_certs(false)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .max_tls_version(reqwest::tls::Version::TLS_1_3)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .context("build mTLS client")?;

        Ok(Self {
            client,
            base_url: identity.api_base_url.trim_end_matches('/').to_string(),
            node_id: identity.node_id.clone(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .context("send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("control plane returned {status}: {body}");
        }
        response.json().await.context("parse response")
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .context("send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("control plane returned {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn post_metrics(&self, payload: &BatchMetricsPayload) -> Result<()> {
        self.post(&format!("/nodes/{}/metrics", self.node_id), payload)
            .await
    }

    async fn post_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.post(&format!("/nodes/{}/heartbeat", self.node_id), heartbeat)
            .await
    }

    async fn post_event(&self, event: &CrashEvent) -> Result<()> {
        self.post(&format!("/nodes/{}/events", self.node_id), event)
            .await
    }
}
