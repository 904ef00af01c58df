//! The NGINX reviewer: auth-url annotations.

use super::traefik::resolve_class;
use super::{
    auth_response_headers, object_annotations, policy_annotation, replace_annotations_op,
    AdmissionRequest, IngressReviewer,
};
use hub_agent_k8s_api::annotations;
use hub_agent_k8s_index::{acp, ControllerTag, SharedRegistry};
use serde_json::Value;
use std::collections::BTreeMap;

pub struct NginxIngressReviewer {
    registry: SharedRegistry,
    policies: acp::SharedIndex,
    auth_server_url: String,
}

impl NginxIngressReviewer {
    pub fn new(registry: SharedRegistry, policies: acp::SharedIndex, auth_server_url: String) -> Self {
        Self {
            registry,
            policies,
            auth_server_url: auth_server_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl IngressReviewer for NginxIngressReviewer {
    fn name(&self) -> &'static str {
        "Nginx"
    }

    fn can_review(&self, req: &AdmissionRequest) -> anyhow::Result<bool> {
        if !req.kind.kind.eq_ignore_ascii_case("Ingress") {
            return Ok(false);
        }
        let Some(obj) = req.object.as_ref().or(req.old_object.as_ref()) else {
            return Ok(false);
        };
        Ok(resolve_class(&self.registry, obj) == ControllerTag::Nginx)
    }

    async fn review(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        let Some(obj) = req.object.as_ref() else {
            return Ok(None);
        };
        let current = object_annotations(obj);
        let mut updated: BTreeMap<String, String> = current
            .iter()
            .filter(|(key, _)| {
                key.as_str() != annotations::NGINX_AUTH_URL
                    && key.as_str() != annotations::NGINX_AUTH_RESPONSE_HEADERS
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(policy) = policy_annotation(Some(obj)) {
            let spec = self
                .policies
                .read()
                .get(&policy)
                .ok_or_else(|| anyhow::anyhow!("access control policy {policy:?} not found"))?;
            updated.insert(
                annotations::NGINX_AUTH_URL.to_string(),
                format!("{}/{policy}", self.auth_server_url),
            );
            updated.insert(
                annotations::NGINX_AUTH_RESPONSE_HEADERS.to_string(),
                auth_response_headers(&spec).join(","),
            );
        }

        if updated == current {
            return Ok(None);
        }
        Ok(Some(replace_annotations_op(&updated)))
    }
}
