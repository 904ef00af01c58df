//! The platform HTTP client.
//!
//! All calls carry `Authorization: Bearer <token>` and a versioned user
//! agent. Transient failures (transport errors and 5xx responses) are
//! retried with exponential backoff; API errors arrive as a JSON envelope
//! `{"error": "...", "statusCode": N}`. Safe for concurrent use.

use hub_agent_k8s_api::AccessControlPolicySpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const VERSION_HEADER: &str = "Last-Known-Version";

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform holds a newer version of the resource than the one the
    /// caller based its change on. The message is surfaced verbatim to
    /// admitting users.
    #[error("platform conflict: a more recent version of this resource is available")]
    Conflict,

    #[error("platform returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("platform request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("platform request cannot be retried")]
    NotRetryable,
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::Api { status: 404, .. })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)] // statusCode is part of the wire format
struct ApiErrorEnvelope {
    #[serde(default)]
    error: String,
    #[serde(default)]
    status_code: u16,
}

/// A platform-held access control policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcpResource {
    pub name: String,
    pub version: String,
    #[serde(flatten)]
    pub spec: AccessControlPolicySpec,
}

/// A platform-held edge ingress.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressResource {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub service: EdgeIngressServiceRef,
    #[serde(default)]
    pub acp: Option<EdgeIngressAcpRef>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    /// Platform-issued domain.
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressServiceRef {
    pub name: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeIngressAcpRef {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    pub tunnel_id: String,
    #[serde(default)]
    pub broker_endpoint: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    pub id: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Failure,
}

/// A platform-issued TLS certificate.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub certificate: String,
    pub private_key: String,
}

#[derive(Deserialize)]
struct VersionedResponse {
    version: String,
}

#[derive(Debug)]
pub struct PlatformClient {
    base_url: Url,
    token: String,
    http: reqwest::Client,
}

impl PlatformClient {
    pub fn new(base_url: Url, token: String) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hub-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().expect("base URL cannot be opaque");
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        url
    }

    /// Sends a request, retrying transport errors and 5xx responses.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, PlatformError> {
        let request = request.bearer_auth(&self.token);
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 1;

        loop {
            let cloned = request.try_clone().ok_or(PlatformError::NotRetryable)?;
            let outcome = match cloned.send().await {
                Ok(rsp) if rsp.status().is_server_error() => {
                    Err(PlatformError::Api {
                        status: rsp.status().as_u16(),
                        message: read_error(rsp).await,
                    })
                }
                Ok(rsp) if !rsp.status().is_success() => {
                    let status = rsp.status().as_u16();
                    if status == 409 {
                        return Err(PlatformError::Conflict);
                    }
                    return Err(PlatformError::Api {
                        status,
                        message: read_error(rsp).await,
                    });
                }
                Ok(rsp) => Ok(rsp),
                Err(error) => Err(PlatformError::Transport(error)),
            };

            match outcome {
                Ok(rsp) => return Ok(rsp),
                Err(error) if attempt < MAX_ATTEMPTS => {
                    debug!(%error, attempt, "Retrying platform request");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    attempt += 1;
                }
                Err(error) => {
                    warn!(%error, attempt, "Platform request failed");
                    return Err(error);
                }
            }
        }
    }

    // === Access control policies ===

    pub async fn get_acps(&self) -> Result<Vec<AcpResource>, PlatformError> {
        let rsp = self.execute(self.http.get(self.endpoint("acps"))).await?;
        Ok(rsp.json().await?)
    }

    pub async fn create_acp(
        &self,
        name: &str,
        spec: &AccessControlPolicySpec,
    ) -> Result<String, PlatformError> {
        let body = acp_payload(name, spec);
        let rsp = self
            .execute(self.http.post(self.endpoint("acps")).json(&body))
            .await?;
        Ok(rsp.json::<VersionedResponse>().await?.version)
    }

    pub async fn update_acp(
        &self,
        name: &str,
        last_known_version: &str,
        spec: &AccessControlPolicySpec,
    ) -> Result<String, PlatformError> {
        let body = acp_payload(name, spec);
        let rsp = self
            .execute(
                self.http
                    .patch(self.endpoint(&format!("acps/{name}")))
                    .header(VERSION_HEADER, last_known_version)
                    .json(&body),
            )
            .await?;
        Ok(rsp.json::<VersionedResponse>().await?.version)
    }

    pub async fn delete_acp(
        &self,
        name: &str,
        last_known_version: &str,
    ) -> Result<(), PlatformError> {
        self.execute(
            self.http
                .delete(self.endpoint(&format!("acps/{name}")))
                .header(VERSION_HEADER, last_known_version),
        )
        .await?;
        Ok(())
    }

    // === Edge ingresses ===

    pub async fn get_edge_ingresses(&self) -> Result<Vec<EdgeIngressResource>, PlatformError> {
        let rsp = self
            .execute(self.http.get(self.endpoint("edge-ingresses")))
            .await?;
        Ok(rsp.json().await?)
    }

    pub async fn create_edge_ingress(
        &self,
        resource: &serde_json::Value,
    ) -> Result<String, PlatformError> {
        let rsp = self
            .execute(self.http.post(self.endpoint("edge-ingresses")).json(resource))
            .await?;
        Ok(rsp.json::<VersionedResponse>().await?.version)
    }

    pub async fn update_edge_ingress(
        &self,
        namespace: &str,
        name: &str,
        last_known_version: &str,
        resource: &serde_json::Value,
    ) -> Result<String, PlatformError> {
        let rsp = self
            .execute(
                self.http
                    .patch(self.endpoint(&format!("edge-ingresses/{namespace}/{name}")))
                    .header(VERSION_HEADER, last_known_version)
                    .json(resource),
            )
            .await?;
        Ok(rsp.json::<VersionedResponse>().await?.version)
    }

    pub async fn delete_edge_ingress(
        &self,
        namespace: &str,
        name: &str,
        last_known_version: &str,
    ) -> Result<(), PlatformError> {
        self.execute(
            self.http
                .delete(self.endpoint(&format!("edge-ingresses/{namespace}/{name}")))
                .header(VERSION_HEADER, last_known_version),
        )
        .await?;
        Ok(())
    }

    // === APIs ===

    pub async fn create_api(&self, resource: &serde_json::Value) -> Result<String, PlatformError> {
        let rsp = self
            .execute(self.http.post(self.endpoint("apis")).json(resource))
            .await?;
        Ok(rsp.json::<VersionedResponse>().await?.version)
    }

    pub async fn update_api(
        &self,
        namespace: &str,
        name: &str,
        last_known_version: &str,
        resource: &serde_json::Value,
    ) -> Result<String, PlatformError> {
        let rsp = self
            .execute(
                self.http
                    .patch(self.endpoint(&format!("apis/{namespace}/{name}")))
                    .header(VERSION_HEADER, last_known_version)
                    .json(resource),
            )
            .await?;
        Ok(rsp.json::<VersionedResponse>().await?.version)
    }

    pub async fn delete_api(
        &self,
        namespace: &str,
        name: &str,
        last_known_version: &str,
    ) -> Result<(), PlatformError> {
        self.execute(
            self.http
                .delete(self.endpoint(&format!("apis/{namespace}/{name}")))
                .header(VERSION_HEADER, last_known_version),
        )
        .await?;
        Ok(())
    }

    // === Certificates ===

    pub async fn get_wildcard_certificate(&self) -> Result<Certificate, PlatformError> {
        let rsp = self
            .execute(self.http.get(self.endpoint("wildcard-certificate")))
            .await?;
        Ok(rsp.json().await?)
    }

    pub async fn obtain_certificate(&self, domains: &[String]) -> Result<Certificate, PlatformError> {
        let rsp = self
            .execute(
                self.http
                    .post(self.endpoint("certificates"))
                    .json(&serde_json::json!({ "domains": domains })),
            )
            .await?;
        Ok(rsp.json().await?)
    }

    // === Tunnels ===

    pub async fn get_tunnel_endpoints(&self) -> Result<Vec<TunnelEndpoint>, PlatformError> {
        let rsp = self
            .execute(self.http.get(self.endpoint("tunnel-endpoints")))
            .await?;
        Ok(rsp.json().await?)
    }

    // === Commands ===

    pub async fn list_pending_commands(&self) -> Result<Vec<Command>, PlatformError> {
        let rsp = self.execute(self.http.get(self.endpoint("commands"))).await?;
        Ok(rsp.json().await?)
    }

    pub async fn submit_command_reports(
        &self,
        reports: &[CommandReport],
    ) -> Result<(), PlatformError> {
        self.execute(self.http.patch(self.endpoint("commands")).json(&reports))
            .await?;
        Ok(())
    }
}

fn acp_payload(name: &str, spec: &AccessControlPolicySpec) -> serde_json::Value {
    let mut body = serde_json::to_value(spec).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("name".to_string(), serde_json::Value::String(name.to_string()));
    }
    body
}

async fn read_error(rsp: reqwest::Response) -> String {
    let status = rsp.status();
    match rsp.json::<ApiErrorEnvelope>().await {
        Ok(envelope) if !envelope.error.is_empty() => envelope.error,
        _ => format!("unexpected status {status}"),
    }
}
