//! Platform-sync reviewers.
//!
//! User edits to hub resources flow through the webhook to the platform:
//! creates push and stamp a fresh status, updates push with the last known
//! version (surfacing platform conflicts verbatim), deletes tell the
//! platform and emit no patch. A resource whose status hash already
//! matches its spec is a no-op echo of the watchers' own writes.

use super::AdmissionRequest;
use chrono::{SecondsFormat, Utc};
use hub_agent_core::spec_hash;
use hub_agent_k8s_api::api::ApiSpec;
use hub_agent_k8s_api::edge_ingress::EdgeIngressSpec;
use hub_agent_k8s_api::AccessControlPolicySpec;
use hub_agent_platform::PlatformClient;
use kube::core::admission::Operation;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SyncReviewer {
    platform: Arc<PlatformClient>,
}

impl SyncReviewer {
    pub fn new(platform: Arc<PlatformClient>) -> Self {
        Self { platform }
    }

    pub async fn review_acp(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        match req.operation {
            Operation::Create => {
                let obj = object(req)?;
                let spec: AccessControlPolicySpec = parse_spec(obj)?;
                let hash = spec_hash(&spec)?;
                if is_synced(obj, &hash) {
                    debug!(name = %req.name, "Access control policy already synced");
                    return Ok(None);
                }
                let version = self.platform.create_acp(&req.name, &spec).await?;
                info!(name = %req.name, %version, "Created access control policy on the platform");
                Ok(Some(status_patch(&version, &hash)))
            }
            Operation::Update => {
                let obj = object(req)?;
                let spec: AccessControlPolicySpec = parse_spec(obj)?;
                let hash = spec_hash(&spec)?;
                if is_synced(obj, &hash) {
                    debug!(name = %req.name, "Access control policy already synced");
                    return Ok(None);
                }
                let last_known = status_version(req.old_object.as_ref()).unwrap_or_default();
                let version = self
                    .platform
                    .update_acp(&req.name, &last_known, &spec)
                    .await?;
                info!(name = %req.name, %version, "Updated access control policy on the platform");
                Ok(Some(status_patch(&version, &hash)))
            }
            Operation::Delete => {
                let last_known = status_version(req.old_object.as_ref()).unwrap_or_default();
                match self.platform.delete_acp(&req.name, &last_known).await {
                    Ok(()) => {
                        info!(name = %req.name, "Deleted access control policy on the platform")
                    }
                    // The platform may already have dropped it (our own
                    // watcher-driven deletes land here too).
                    Err(error) if error.is_not_found() => {
                        debug!(name = %req.name, "Access control policy already gone")
                    }
                    Err(error) => return Err(error.into()),
                }
                Ok(None)
            }
            Operation::Connect => Ok(None),
        }
    }

    pub async fn review_edge_ingress(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        let namespace = req.namespace.clone().unwrap_or_default();
        match req.operation {
            Operation::Create => {
                let obj = object(req)?;
                let spec: EdgeIngressSpec = parse_spec(obj)?;
                let hash = spec_hash(&spec)?;
                if is_synced(obj, &hash) {
                    return Ok(None);
                }
                let version = self
                    .platform
                    .create_edge_ingress(&namespaced_payload(&namespace, &req.name, &spec)?)
                    .await?;
                info!(%namespace, name = %req.name, %version, "Created edge ingress on the platform");
                Ok(Some(status_patch(&version, &hash)))
            }
            Operation::Update => {
                let obj = object(req)?;
                let spec: EdgeIngressSpec = parse_spec(obj)?;
                let hash = spec_hash(&spec)?;
                if is_synced(obj, &hash) {
                    return Ok(None);
                }
                let last_known = status_version(req.old_object.as_ref()).unwrap_or_default();
                let version = self
                    .platform
                    .update_edge_ingress(
                        &namespace,
                        &req.name,
                        &last_known,
                        &namespaced_payload(&namespace, &req.name, &spec)?,
                    )
                    .await?;
                info!(%namespace, name = %req.name, %version, "Updated edge ingress on the platform");
                Ok(Some(status_patch(&version, &hash)))
            }
            Operation::Delete => {
                let last_known = status_version(req.old_object.as_ref()).unwrap_or_default();
                match self
                    .platform
                    .delete_edge_ingress(&namespace, &req.name, &last_known)
                    .await
                {
                    Ok(()) => info!(%namespace, name = %req.name, "Deleted edge ingress on the platform"),
                    Err(error) if error.is_not_found() => {
                        debug!(%namespace, name = %req.name, "Edge ingress already gone")
                    }
                    Err(error) => return Err(error.into()),
                }
                Ok(None)
            }
            Operation::Connect => Ok(None),
        }
    }

    pub async fn review_api(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        let namespace = req.namespace.clone().unwrap_or_default();
        match req.operation {
            Operation::Create => {
                let obj = object(req)?;
                let spec: ApiSpec = parse_spec(obj)?;
                let hash = spec_hash(&spec)?;
                if is_synced(obj, &hash) {
                    return Ok(None);
                }
                let version = self
                    .platform
                    .create_api(&namespaced_payload(&namespace, &req.name, &spec)?)
                    .await?;
                info!(%namespace, name = %req.name, %version, "Created API on the platform");
                Ok(Some(status_patch(&version, &hash)))
            }
            Operation::Update => {
                let obj = object(req)?;
                let spec: ApiSpec = parse_spec(obj)?;
                let hash = spec_hash(&spec)?;
                if is_synced(obj, &hash) {
                    return Ok(None);
                }
                let last_known = status_version(req.old_object.as_ref()).unwrap_or_default();
                let version = self
                    .platform
                    .update_api(
                        &namespace,
                        &req.name,
                        &last_known,
                        &namespaced_payload(&namespace, &req.name, &spec)?,
                    )
                    .await?;
                info!(%namespace, name = %req.name, %version, "Updated API on the platform");
                Ok(Some(status_patch(&version, &hash)))
            }
            Operation::Delete => {
                let last_known = status_version(req.old_object.as_ref()).unwrap_or_default();
                match self
                    .platform
                    .delete_api(&namespace, &req.name, &last_known)
                    .await
                {
                    Ok(()) => info!(%namespace, name = %req.name, "Deleted API on the platform"),
                    Err(error) if error.is_not_found() => {
                        debug!(%namespace, name = %req.name, "API already gone")
                    }
                    Err(error) => return Err(error.into()),
                }
                Ok(None)
            }
            Operation::Connect => Ok(None),
        }
    }
}

fn object(req: &AdmissionRequest) -> anyhow::Result<&DynamicObject> {
    req.object
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("admission request is missing 'object'"))
}

fn parse_spec<T: DeserializeOwned>(obj: &DynamicObject) -> anyhow::Result<T> {
    let spec = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("admission request is missing 'spec'"))?;
    Ok(serde_json::from_value(spec)?)
}

fn status_spec_hash(obj: &DynamicObject) -> Option<&str> {
    obj.data.get("status")?.get("specHash")?.as_str()
}

fn is_synced(obj: &DynamicObject, hash: &str) -> bool {
    status_spec_hash(obj) == Some(hash)
}

fn status_version(obj: Option<&DynamicObject>) -> Option<String> {
    obj?.data
        .get("status")?
        .get("version")?
        .as_str()
        .map(str::to_string)
}

fn namespaced_payload<T: Serialize>(
    namespace: &str,
    name: &str,
    spec: &T,
) -> anyhow::Result<Value> {
    let mut payload = serde_json::to_value(spec)?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("namespace".to_string(), Value::String(namespace.to_string()));
        obj.insert("name".to_string(), Value::String(name.to_string()));
    }
    Ok(payload)
}

fn status_patch(version: &str, hash: &str) -> Value {
    serde_json::json!({
        "op": "replace",
        "path": "/status",
        "value": {
            "version": version,
            "syncedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "specHash": hash,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_object(spec: Value, status: Option<Value>) -> DynamicObject {
        let mut obj = serde_json::json!({
            "apiVersion": "hub.traefik.io/v1alpha1",
            "kind": "AccessControlPolicy",
            "metadata": {"name": "acp1"},
            "spec": spec,
        });
        if let Some(status) = status {
            obj["status"] = status;
        }
        serde_json::from_value(obj).unwrap()
    }

    #[test]
    fn synced_objects_are_detected_by_hash() {
        let spec = serde_json::json!({"jwt": {"publicKey": "secret"}});
        let parsed: AccessControlPolicySpec = serde_json::from_value(spec.clone()).unwrap();
        let hash = spec_hash(&parsed).unwrap();

        let synced = mk_object(spec.clone(), Some(serde_json::json!({"specHash": hash})));
        assert!(is_synced(&synced, &hash));

        let stale = mk_object(spec.clone(), Some(serde_json::json!({"specHash": "old"})));
        assert!(!is_synced(&stale, &hash));

        let fresh = mk_object(spec, None);
        assert!(!is_synced(&fresh, &hash));
    }

    #[test]
    fn status_patch_shape() {
        let patch = status_patch("v1", "abc");
        assert_eq!(patch["op"], "replace");
        assert_eq!(patch["path"], "/status");
        assert_eq!(patch["value"]["version"], "v1");
        assert_eq!(patch["value"]["specHash"], "abc");
        assert!(patch["value"]["syncedAt"].as_str().is_some());
    }

    #[test]
    fn namespaced_payload_carries_identity() {
        let spec: EdgeIngressSpec = serde_json::from_value(serde_json::json!({
            "service": {"name": "whoami", "port": 8080}
        }))
        .unwrap();
        let payload = namespaced_payload("apps", "edge", &spec).unwrap();
        assert_eq!(payload["namespace"], "apps");
        assert_eq!(payload["name"], "edge");
        assert_eq!(payload["service"]["name"], "whoami");
    }

    #[test]
    fn old_object_version_is_read_from_status() {
        let obj = mk_object(
            serde_json::json!({"jwt": {"signingSecret": "s"}}),
            Some(serde_json::json!({"version": "v7"})),
        );
        assert_eq!(status_version(Some(&obj)).as_deref(), Some("v7"));
        assert_eq!(status_version(None), None);
    }
}
