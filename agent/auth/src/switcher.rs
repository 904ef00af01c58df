//! The hot-swapped handler router and its HTTP server.
//!
//! The ingress controller calls this server as its forward-auth endpoint;
//! the URL path is the policy name. The routing table is an immutable
//! snapshot swapped wholesale whenever the policy set changes, so requests
//! dispatch against a consistent view while a swap happens.

use crate::handler::AcpHandler;
use crate::headers::{self, Response};
use ahash::AHashMap as HashMap;
use http::StatusCode;
use hub_agent_k8s_index::AcpSnapshot;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Routes = HashMap<String, Arc<AcpHandler>>;

#[derive(Clone)]
pub struct Switcher {
    routes: Arc<RwLock<Arc<Routes>>>,
    http: reqwest::Client,
}

impl Switcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            routes: Arc::new(RwLock::new(Arc::new(Routes::default()))),
            http,
        }
    }

    /// Rebuilds the routing table from a policy snapshot and swaps it in.
    /// Policies that fail to compile are skipped and logged; the rest of
    /// the table still swaps.
    pub fn update(&self, policies: &AcpSnapshot) {
        let mut routes = Routes::with_capacity(policies.len());
        for (name, spec) in policies.iter() {
            match AcpHandler::new(name, spec, self.http.clone()) {
                Ok(handler) => {
                    routes.insert(name.clone(), Arc::new(handler));
                }
                Err(error) => {
                    warn!(policy = %name, %error, "Skipping uncompilable access control policy")
                }
            }
        }
        let count = routes.len();
        *self.routes.write() = Arc::new(routes);
        debug!(policies = count, "Swapped access control handler table");
    }

    fn snapshot(&self) -> Arc<Routes> {
        self.routes.read().clone()
    }

    async fn handle(&self, req: http::Request<Incoming>) -> Response {
        let (parts, _body) = req.into_parts();
        let Some(policy) = policy_name(&parts) else {
            return headers::status(StatusCode::NOT_FOUND);
        };

        // Take the snapshot before dispatching; a concurrent swap must not
        // change the handler mid-request.
        let routes = self.snapshot();
        let Some(handler) = routes.get(policy) else {
            debug!(%policy, "No handler for policy");
            return headers::status(StatusCode::NOT_FOUND);
        };
        handler.serve(&parts).await
    }
}

/// The policy name is the whole path, slashes trimmed.
fn policy_name(parts: &http::request::Parts) -> Option<&str> {
    let trimmed = parts.uri.path().trim_matches('/');
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Rebuilds the switcher whenever the policy index publishes a snapshot.
pub async fn watch_policies(switcher: Switcher, mut snapshots: watch::Receiver<AcpSnapshot>) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        switcher.update(&snapshot);
        if snapshots.changed().await.is_err() {
            debug!("Policy index is gone, stopping handler swaps");
            return;
        }
    }
}

/// Serves the forward-auth endpoint until shutdown is signalled.
pub async fn serve(addr: SocketAddr, switcher: Switcher, drain: drain::Watch) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Access control server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };
                let switcher = switcher.clone();
                tokio::spawn(async move {
                    let service = service_fn(|req| {
                        let switcher = switcher.clone();
                        async move { Ok::<_, std::convert::Infallible>(switcher.handle(req).await) }
                    });
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    if let Err(error) = conn.await {
                        debug!(%peer, %error, "Connection error");
                    }
                });
            }
            _ = drain.clone().signaled() => {
                info!("Access control server shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_agent_k8s_api::AccessControlPolicySpec;

    fn mk_snapshot(entries: &[(&str, serde_json::Value)]) -> AcpSnapshot {
        let mut map = HashMap::default();
        for (name, spec) in entries {
            let spec: AccessControlPolicySpec = serde_json::from_value(spec.clone()).unwrap();
            map.insert(name.to_string(), spec);
        }
        Arc::new(map)
    }

    #[test]
    fn swap_replaces_the_whole_table() {
        let switcher = Switcher::new(reqwest::Client::new());

        switcher.update(&mk_snapshot(&[(
            "a",
            serde_json::json!({"jwt": {"signingSecret": "s"}}),
        )]));
        assert!(switcher.snapshot().contains_key("a"));

        switcher.update(&mk_snapshot(&[(
            "b",
            serde_json::json!({"jwt": {"signingSecret": "s"}}),
        )]));
        let routes = switcher.snapshot();
        assert!(!routes.contains_key("a"));
        assert!(routes.contains_key("b"));
    }

    #[test]
    fn snapshots_survive_a_swap() {
        let switcher = Switcher::new(reqwest::Client::new());
        switcher.update(&mk_snapshot(&[(
            "a",
            serde_json::json!({"jwt": {"signingSecret": "s"}}),
        )]));

        let before = switcher.snapshot();
        switcher.update(&mk_snapshot(&[]));

        // The old snapshot still dispatches even though the table swapped.
        assert!(before.contains_key("a"));
        assert!(switcher.snapshot().is_empty());
    }

    #[test]
    fn uncompilable_policy_is_skipped() {
        let switcher = Switcher::new(reqwest::Client::new());
        switcher.update(&mk_snapshot(&[
            ("bad", serde_json::json!({})),
            ("good", serde_json::json!({"jwt": {"signingSecret": "s"}})),
        ]));
        let routes = switcher.snapshot();
        assert!(!routes.contains_key("bad"));
        assert!(routes.contains_key("good"));
    }

    #[test]
    fn policy_path_extraction() {
        let parts = http::Request::builder()
            .uri("/my-acp")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(policy_name(&parts), Some("my-acp"));

        let root = http::Request::builder()
            .uri("/")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(policy_name(&root), None);
    }
}
