//! The admission webhook service.
//!
//! One TLS server, multiplexed by URL path: `/ingress` wires ingress-like
//! resources to the auth server, `/acp`, `/edge-ingress` and `/api`(`-*`)
//! sync hub resources to the platform. Responses always carry the request
//! UID; errors become a Failure status with the Kubernetes reason
//! preserved when there is one.

use crate::reviewers::{
    self, HaproxyIngressReviewer, IngressReviewer, NginxIngressReviewer, ReviewOutcome,
    SyncReviewer, TraefikIngressReviewer,
};
use futures::future;
use http_body_util::BodyExt;
use hub_agent_platform::{PlatformClient, PlatformError};
use hub_agent_k8s_index::{acp, SharedRegistry};
use hyper::{http, Request, Response};
use kube::core::DynamicObject;
use kube::Client;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Body = http_body_util::Full<bytes::Bytes>;

#[derive(Clone)]
pub struct Admission {
    ingress_reviewers: Arc<Vec<Arc<dyn IngressReviewer>>>,
    default_reviewer: Arc<dyn IngressReviewer>,
    sync: Arc<SyncReviewer>,
}

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let path = req.uri().path().to_string();
        if req.method() != http::Method::POST || !is_webhook_path(&path) {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(&path, req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(
        client: Client,
        platform: Arc<PlatformClient>,
        registry: SharedRegistry,
        policies: acp::SharedIndex,
        auth_server_url: String,
    ) -> Self {
        let traefik: Arc<dyn IngressReviewer> = Arc::new(TraefikIngressReviewer::new(
            client,
            registry.clone(),
            policies.clone(),
            auth_server_url.clone(),
        ));
        let ingress_reviewers: Vec<Arc<dyn IngressReviewer>> = vec![
            traefik.clone(),
            Arc::new(NginxIngressReviewer::new(
                registry.clone(),
                policies.clone(),
                auth_server_url.clone(),
            )),
            Arc::new(HaproxyIngressReviewer::new(registry, policies, auth_server_url)),
        ];

        Self {
            ingress_reviewers: Arc::new(ingress_reviewers),
            default_reviewer: traefik,
            sync: Arc::new(SyncReviewer::new(platform)),
        }
    }

    async fn admit(&self, path: &str, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        // Nothing is persisted on a dry run, so nothing is pushed or
        // patched either.
        if req.dry_run {
            return rsp;
        }

        let outcome = match path {
            "/ingress" => {
                reviewers::review_ingress(&self.ingress_reviewers, &self.default_reviewer, &req)
                    .await
            }
            "/acp" if is_kind(&req, "AccessControlPolicy") => self
                .sync
                .review_acp(&req)
                .await
                .map(ReviewOutcome::from_patch),
            "/edge-ingress" if is_kind(&req, "EdgeIngress") => self
                .sync
                .review_edge_ingress(&req)
                .await
                .map(ReviewOutcome::from_patch),
            _ if path == "/api" || path.starts_with("/api-") => {
                if is_kind(&req, "Api") {
                    self.sync.review_api(&req).await.map(ReviewOutcome::from_patch)
                } else {
                    Err(anyhow::anyhow!(
                        "unsupported resource type: {}.{}.{}",
                        req.kind.group,
                        req.kind.version,
                        req.kind.kind
                    ))
                }
            }
            _ => Err(anyhow::anyhow!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group,
                req.kind.version,
                req.kind.kind
            )),
        };

        match outcome {
            Ok(outcome) => {
                let ns = req.namespace.as_deref().unwrap_or_default();
                info!(%path, %ns, name = %req.name, patched = outcome.patch.is_some(), "Admitted");
                finalize(rsp, outcome)
            }
            Err(error) => {
                info!(%path, %error, name = %req.name, "Denied");
                deny_with_reason(rsp, error)
            }
        }
    }
}

impl ReviewOutcome {
    fn from_patch(patch: Option<Value>) -> Self {
        Self {
            patch,
            warnings: Vec::new(),
        }
    }
}

fn is_webhook_path(path: &str) -> bool {
    matches!(path, "/ingress" | "/edge-ingress" | "/acp" | "/api") || path.starts_with("/api-")
}

fn is_kind(req: &AdmissionRequest, kind: &str) -> bool {
    req.kind.kind.eq_ignore_ascii_case(kind)
}

/// Wraps the reviewer's single patch operation into a JSON-Patch response.
fn finalize(rsp: AdmissionResponse, outcome: ReviewOutcome) -> AdmissionResponse {
    let mut rsp = match outcome.patch {
        Some(op) => {
            let patch = match serde_json::from_value::<json_patch::Patch>(Value::Array(vec![op])) {
                Ok(patch) => patch,
                Err(error) => {
                    warn!(%error, "Reviewer produced an invalid patch operation");
                    return rsp.deny("internal error: invalid patch operation");
                }
            };
            match rsp.with_patch(patch) {
                Ok(rsp) => rsp,
                Err(error) => {
                    warn!(%error, "Failed to encode patch");
                    return AdmissionResponse::invalid(error);
                }
            }
        }
        None => rsp,
    };
    if !outcome.warnings.is_empty() {
        rsp.warnings = Some(outcome.warnings);
    }
    rsp
}

/// Denies the request, preserving well-known failure reasons so kubectl
/// renders e.g. `NotFound` cleanly.
fn deny_with_reason(rsp: AdmissionResponse, error: anyhow::Error) -> AdmissionResponse {
    if let Some(kube::Error::Api(api_error)) = error.downcast_ref::<kube::Error>() {
        let mut rsp = rsp.deny(&api_error.message);
        rsp.result = kube::core::Status::failure(&api_error.message, &api_error.reason);
        return rsp;
    }
    if let Some(platform_error) = error.downcast_ref::<PlatformError>() {
        let reason = match platform_error {
            PlatformError::Conflict => "Conflict",
            _ => "PlatformError",
        };
        let message = platform_error.to_string();
        let mut rsp = rsp.deny(&message);
        rsp.result = kube::core::Status::failure(&message, reason);
        return rsp;
    }
    rsp.deny(error)
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_agent_core::spec_hash;
    use hub_agent_k8s_api::AccessControlPolicySpec;

    fn mk_sync() -> SyncReviewer {
        // Unreachable endpoint: tests below must never actually call it.
        let platform = PlatformClient::new(
            url::Url::parse("http://127.0.0.1:1").unwrap(),
            "token".to_string(),
        )
        .unwrap();
        SyncReviewer::new(Arc::new(platform))
    }

    fn mk_acp_request(operation: &str, spec: Value, status: Option<Value>) -> AdmissionRequest {
        let mut object = serde_json::json!({
            "apiVersion": "hub.traefik.io/v1alpha1",
            "kind": "AccessControlPolicy",
            "metadata": {"name": "acp1"},
            "spec": spec,
        });
        if let Some(status) = status {
            object["status"] = status;
        }
        let review: Review = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u2",
                "kind": {"group": "hub.traefik.io", "version": "v1alpha1", "kind": "AccessControlPolicy"},
                "resource": {"group": "hub.traefik.io", "version": "v1alpha1", "resource": "accesscontrolpolicies"},
                "name": "acp1",
                "operation": operation,
                "userInfo": {},
                "object": object,
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[tokio::test]
    async fn synced_create_is_a_no_op() {
        let spec = serde_json::json!({"jwt": {"publicKey": "secret"}});
        let parsed: AccessControlPolicySpec = serde_json::from_value(spec.clone()).unwrap();
        let hash = spec_hash(&parsed).unwrap();

        let req = mk_acp_request(
            "CREATE",
            spec,
            Some(serde_json::json!({"specHash": hash, "version": "v1"})),
        );
        let patch = mk_sync().review_acp(&req).await.unwrap();
        assert!(patch.is_none());
    }

    #[tokio::test]
    async fn responses_carry_the_request_uid() {
        let req = mk_acp_request("CREATE", serde_json::json!({}), None);
        let rsp = AdmissionResponse::from(&req);
        assert_eq!(rsp.uid, "u2");
    }

    #[test]
    fn finalize_wraps_the_patch_and_warnings() {
        let req = mk_acp_request("CREATE", serde_json::json!({}), None);
        let rsp = finalize(
            AdmissionResponse::from(&req),
            ReviewOutcome {
                patch: Some(serde_json::json!({
                    "op": "replace",
                    "path": "/status",
                    "value": {"version": "v1"},
                })),
                warnings: vec!["careful".to_string()],
            },
        );

        assert!(rsp.allowed);
        let patch: Value = serde_json::from_slice(rsp.patch.as_deref().unwrap()).unwrap();
        assert_eq!(patch[0]["op"], "replace");
        assert_eq!(patch[0]["path"], "/status");
        assert_eq!(rsp.warnings, Some(vec!["careful".to_string()]));
    }

    #[test]
    fn empty_outcome_has_no_patch() {
        let req = mk_acp_request("CREATE", serde_json::json!({}), None);
        let rsp = finalize(AdmissionResponse::from(&req), ReviewOutcome::default());
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
        assert!(rsp.warnings.is_none());
    }

    #[test]
    fn platform_conflicts_surface_verbatim() {
        let req = mk_acp_request("UPDATE", serde_json::json!({}), None);
        let rsp = deny_with_reason(
            AdmissionResponse::from(&req),
            anyhow::Error::from(PlatformError::Conflict),
        );
        assert!(!rsp.allowed);
        assert_eq!(
            rsp.result.message,
            "platform conflict: a more recent version of this resource is available"
        );
        assert_eq!(rsp.result.reason, "Conflict");
    }

    #[test]
    fn webhook_paths() {
        assert!(is_webhook_path("/ingress"));
        assert!(is_webhook_path("/edge-ingress"));
        assert!(is_webhook_path("/acp"));
        assert!(is_webhook_path("/api"));
        assert!(is_webhook_path("/api-access"));
        assert!(!is_webhook_path("/"));
        assert!(!is_webhook_path("/other"));
    }
}
