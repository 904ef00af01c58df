//! Admission reviewers.
//!
//! `/ingress` requests are offered to a list of candidate reviewers; each
//! declares whether it owns the resource based on the resource kind and
//! the ingress-class registry. Exactly one claimant reviews; zero claimants
//! fall back to the default reviewer with a warning; several claimants are
//! a configuration bug and fail the admission.

mod haproxy;
mod nginx;
mod sync;
mod traefik;

pub use self::haproxy::HaproxyIngressReviewer;
pub use self::nginx::NginxIngressReviewer;
pub use self::sync::SyncReviewer;
pub use self::traefik::TraefikIngressReviewer;

use hub_agent_k8s_api::access_control_policy::AcpVariant;
use hub_agent_k8s_api::{annotations, AccessControlPolicySpec};
use kube::core::DynamicObject;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;

/// What a review produced: at most one JSON-Patch operation, plus
/// admission warnings.
#[derive(Debug, Default)]
pub struct ReviewOutcome {
    pub patch: Option<Value>,
    pub warnings: Vec<String>,
}

#[async_trait::async_trait]
pub trait IngressReviewer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this reviewer owns the resource under review.
    fn can_review(&self, req: &AdmissionRequest) -> anyhow::Result<bool>;

    /// Produces the single patch operation wiring (or unwiring) the
    /// resource to the auth server, or None when nothing changes.
    async fn review(&self, req: &AdmissionRequest) -> anyhow::Result<Option<Value>>;
}

/// Runs reviewer selection and the chosen review.
pub async fn review_ingress(
    reviewers: &[Arc<dyn IngressReviewer>],
    default: &Arc<dyn IngressReviewer>,
    req: &AdmissionRequest,
) -> anyhow::Result<ReviewOutcome> {
    let mut claimants = Vec::new();
    for reviewer in reviewers {
        if reviewer.can_review(req)? {
            claimants.push(reviewer);
        }
    }

    match claimants.len() {
        1 => Ok(ReviewOutcome {
            patch: claimants[0].review(req).await?,
            warnings: Vec::new(),
        }),
        0 => {
            let warning = format!(
                "unsupported or ambiguous Ingress Controller for resource {}/{}; defaulting to {}",
                req.namespace.as_deref().unwrap_or_default(),
                req.name,
                default.name(),
            );
            Ok(ReviewOutcome {
                patch: default.review(req).await?,
                warnings: vec![warning],
            })
        }
        _ => {
            let names: Vec<_> = claimants.iter().map(|r| r.name()).collect();
            anyhow::bail!(
                "multiple reviewers claim resource {}/{}: {}",
                req.namespace.as_deref().unwrap_or_default(),
                req.name,
                names.join(", "),
            )
        }
    }
}

/// The access-control-policy annotation on the object under review.
pub(crate) fn policy_annotation(obj: Option<&DynamicObject>) -> Option<String> {
    obj?.metadata
        .annotations
        .as_ref()?
        .get(annotations::ACCESS_CONTROL_POLICY)
        .filter(|value| !value.is_empty())
        .cloned()
}

pub(crate) fn object_annotations(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.annotations.clone().unwrap_or_default()
}

/// The class reference of an Ingress: `spec.ingressClassName` and the
/// legacy annotation value.
pub(crate) fn ingress_class_of(obj: &DynamicObject) -> (Option<String>, Option<String>) {
    let spec_class = obj
        .data
        .get("spec")
        .and_then(|spec| spec.get("ingressClassName"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let legacy = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::INGRESS_CLASS))
        .cloned();
    (spec_class, legacy)
}

/// RFC 6901 escaping for annotation keys inside a JSON pointer.
pub(crate) fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// One JSON-Patch op setting a single annotation, creating the annotations
/// object when the resource has none.
pub(crate) fn set_annotation_op(has_annotations: bool, key: &str, value: &str) -> Value {
    if has_annotations {
        serde_json::json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape_pointer(key)),
            "value": value,
        })
    } else {
        serde_json::json!({
            "op": "add",
            "path": "/metadata/annotations",
            "value": { key: value },
        })
    }
}

pub(crate) fn remove_annotation_op(key: &str) -> Value {
    serde_json::json!({
        "op": "remove",
        "path": format!("/metadata/annotations/{}", escape_pointer(key)),
    })
}

/// One JSON-Patch op replacing the whole annotations object.
pub(crate) fn replace_annotations_op(annotations: &BTreeMap<String, String>) -> Value {
    serde_json::json!({
        "op": "add",
        "path": "/metadata/annotations",
        "value": annotations,
    })
}

/// The response headers a controller must copy upstream for a policy.
pub(crate) fn auth_response_headers(spec: &AccessControlPolicySpec) -> Vec<String> {
    let mut headers = vec!["Authorization".to_string()];
    match spec.variant() {
        Ok(AcpVariant::Jwt(cfg)) => headers.extend(cfg.forward_headers.keys().cloned()),
        Ok(AcpVariant::BasicAuth(cfg)) => {
            headers.extend(cfg.forward_username_header.iter().cloned())
        }
        Ok(AcpVariant::ApiKey(cfg)) => headers.extend(cfg.forward_headers.keys().cloned()),
        Ok(AcpVariant::Oidc(cfg)) => headers.extend(cfg.forward_headers.keys().cloned()),
        Ok(AcpVariant::OidcGoogle(cfg)) => headers.extend(cfg.forward_headers.keys().cloned()),
        Ok(AcpVariant::OAuthIntro(cfg)) => headers.extend(cfg.forward_headers.keys().cloned()),
        Err(_) => {}
    }
    headers
}
