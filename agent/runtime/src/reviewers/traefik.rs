//! The Traefik reviewer: forward-auth middlewares for Ingresses and
//! IngressRoutes.

use super::{
    auth_response_headers, ingress_class_of, object_annotations, policy_annotation,
    remove_annotation_op, set_annotation_op, AdmissionRequest, IngressReviewer,
};
use hub_agent_k8s_api::traefik::{ForwardAuth, Middleware, MiddlewareRef, MiddlewareSpec, Route};
use hub_agent_k8s_api::{annotations, Api, Client, ObjectMeta, Patch, PatchParams};
use hub_agent_k8s_index::{acp, ControllerTag, SharedRegistry};
use kube::core::DynamicObject;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

const TRAEFIK_GROUPS: &[&str] = &["traefik.io", "traefik.containo.us"];

/// Injected middleware names carry this prefix so they can be told apart
/// from user-managed ones.
const MIDDLEWARE_PREFIX: &str = "zz";

const FIELD_MANAGER: &str = "hub-agent";

pub struct TraefikIngressReviewer {
    client: Client,
    registry: SharedRegistry,
    policies: acp::SharedIndex,
    auth_server_url: String,
}

impl TraefikIngressReviewer {
    pub fn new(
        client: Client,
        registry: SharedRegistry,
        policies: acp::SharedIndex,
        auth_server_url: String,
    ) -> Self {
        Self {
            client,
            registry,
            policies,
            auth_server_url: auth_server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Whether the Traefik `Middleware` kind is served by the cluster.
    async fn has_middleware_crd(&self) -> anyhow::Result<bool> {
        for group in TRAEFIK_GROUPS {
            let resources = match self
                .client
                .list_api_group_resources(&format!("{group}/v1alpha1"))
                .await
            {
                Ok(resources) => resources,
                Err(_) => continue,
            };
            if resources.resources.iter().any(|r| r.kind == "Middleware") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Creates or updates the forward-auth middleware for a policy and
    /// returns its name.
    async fn ensure_middleware(&self, namespace: &str, policy: &str) -> anyhow::Result<String> {
        anyhow::ensure!(
            self.has_middleware_crd().await?,
            "traefik Middleware CRD is not installed in this cluster",
        );

        let spec = self
            .policies
            .read()
            .get(policy)
            .ok_or_else(|| anyhow::anyhow!("access control policy {policy:?} not found"))?;

        let address = format!("{}/{policy}", self.auth_server_url);
        let headers = auth_response_headers(&spec);
        let name = middleware_name(policy, &address, &headers);

        let middleware = Middleware {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    annotations::APP_MANAGED_BY.to_string(),
                    annotations::MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            spec: MiddlewareSpec {
                forward_auth: Some(ForwardAuth {
                    address,
                    auth_response_headers: headers,
                }),
            },
        };

        let api: Api<Middleware> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&middleware)).await?;
        debug!(%namespace, %name, %policy, "Ensured forward-auth middleware");
        Ok(name)
    }

    async fn review_ingress(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        let Some(obj) = req.object.as_ref() else {
            return Ok(None);
        };
        let namespace = req.namespace.clone().unwrap_or_default();
        let annotations_map = object_annotations(obj);
        let current = annotations_map
            .get(annotations::TRAEFIK_MIDDLEWARES)
            .cloned()
            .unwrap_or_default();

        match policy_annotation(Some(obj)) {
            Some(policy) => {
                let middleware = self.ensure_middleware(&namespace, &policy).await?;
                let reference = format!("{namespace}-{middleware}@kubernetescrd");
                let value = merge_middleware_refs(&current, Some(&reference));
                if value == current && !annotations_map.is_empty() {
                    return Ok(None);
                }
                Ok(Some(set_annotation_op(
                    !annotations_map.is_empty(),
                    annotations::TRAEFIK_MIDDLEWARES,
                    &value,
                )))
            }
            None => {
                // Unwire a previously injected middleware, if any.
                if !has_injected_ref(&current) {
                    return Ok(None);
                }
                let value = merge_middleware_refs(&current, None);
                if value.is_empty() {
                    Ok(Some(remove_annotation_op(annotations::TRAEFIK_MIDDLEWARES)))
                } else {
                    Ok(Some(set_annotation_op(
                        true,
                        annotations::TRAEFIK_MIDDLEWARES,
                        &value,
                    )))
                }
            }
        }
    }

    async fn review_ingress_route(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        let Some(obj) = req.object.as_ref() else {
            return Ok(None);
        };
        let namespace = req.namespace.clone().unwrap_or_default();
        let spec: hub_agent_k8s_api::traefik::IngressRouteSpec = obj
            .data
            .get("spec")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| anyhow::anyhow!("IngressRoute has no spec"))?;

        let injected = match policy_annotation(Some(obj)) {
            Some(policy) => {
                let middleware = self.ensure_middleware(&namespace, &policy).await?;
                Some(MiddlewareRef {
                    name: middleware,
                    namespace: Some(namespace.clone()),
                })
            }
            None => None,
        };

        let had_injected = spec
            .routes
            .iter()
            .flat_map(|route| route.middlewares.iter())
            .any(|m| is_injected_middleware(&m.name));
        if injected.is_none() && !had_injected {
            return Ok(None);
        }

        let routes: Vec<Route> = spec
            .routes
            .into_iter()
            .map(|mut route| {
                route
                    .middlewares
                    .retain(|m| !is_injected_middleware(&m.name));
                if let Some(reference) = &injected {
                    route.middlewares.insert(0, reference.clone());
                }
                route
            })
            .collect();

        Ok(Some(serde_json::json!({
            "op": "add",
            "path": "/spec/routes",
            "value": routes,
        })))
    }
}

#[async_trait::async_trait]
impl IngressReviewer for TraefikIngressReviewer {
    fn name(&self) -> &'static str {
        "Traefik"
    }

    fn can_review(&self, req: &AdmissionRequest) -> anyhow::Result<bool> {
        if req.kind.kind.eq_ignore_ascii_case("IngressRoute")
            && TRAEFIK_GROUPS.contains(&req.kind.group.as_str())
        {
            return Ok(true);
        }
        if !req.kind.kind.eq_ignore_ascii_case("Ingress") {
            return Ok(false);
        }
        let Some(obj) = req.object.as_ref().or(req.old_object.as_ref()) else {
            return Ok(false);
        };
        Ok(resolve_class(&self.registry, obj) == ControllerTag::Traefik)
    }

    async fn review(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>> {
        if req.kind.kind.eq_ignore_ascii_case("IngressRoute") {
            self.review_ingress_route(req).await
        } else {
            self.review_ingress(req).await
        }
    }
}

pub(crate) fn resolve_class(registry: &SharedRegistry, obj: &DynamicObject) -> ControllerTag {
    let (class, legacy) = ingress_class_of(obj);
    registry.read().resolve(class.as_deref(), legacy.as_deref())
}

/// `zz-<policy>-<digest>`; the digest pins the middleware to its exact
/// forward-auth configuration.
fn middleware_name(policy: &str, address: &str, headers: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    for header in headers {
        hasher.update(header.as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(10);
    for byte in digest.iter().take(5) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{MIDDLEWARE_PREFIX}-{policy}-{hex}")
}

fn is_injected_middleware(name: &str) -> bool {
    name.starts_with("zz-")
}

fn has_injected_ref(value: &str) -> bool {
    value
        .split(',')
        .filter(|r| !r.is_empty())
        .any(|r| r.contains("-zz-"))
}

/// Rebuilds the middlewares annotation, dropping any previously injected
/// reference and optionally prepending a new one.
fn merge_middleware_refs(current: &str, injected: Option<&str>) -> String {
    let mut refs: Vec<&str> = current
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty() && !r.contains("-zz-"))
        .collect();
    if let Some(reference) = injected {
        refs.insert(0, reference);
    }
    refs.join(",")
}
