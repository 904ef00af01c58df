//! Re-stamps Ingresses when their access-control policy changes.
//!
//! Controllers only reload forward-auth configuration when the Ingress
//! itself changes, so a policy edit must touch every Ingress referencing
//! it. Updates for one policy are cancellable: a newer change for the same
//! policy cancels the in-flight pass before starting its own.

use ahash::AHashMap as HashMap;
use chrono::{SecondsFormat, Utc};
use hub_agent_k8s_api::{annotations, Api, Client, Ingress, ListParams, Patch, PatchParams, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "hub-agent";

pub struct IngressUpdater {
    client: Client,
    changes: mpsc::UnboundedReceiver<String>,
    cancels: HashMap<String, CancellationToken>,
}

impl IngressUpdater {
    pub fn new(client: Client, changes: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            client,
            changes,
            cancels: HashMap::default(),
        }
    }

    /// Consumes policy-change notifications until the channel closes.
    pub async fn run(mut self) {
        while let Some(policy) = self.changes.recv().await {
            let token = CancellationToken::new();
            if let Some(previous) = self.cancels.insert(policy.clone(), token.clone()) {
                previous.cancel();
            }

            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(error) = update_ingresses(client, &policy, token).await {
                    warn!(%policy, %error, "Failed to update ingresses for policy");
                }
            });
        }
    }
}

/// Whether an Ingress references the given policy by annotation.
pub fn references_policy(ingress: &Ingress, policy: &str) -> bool {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::ACCESS_CONTROL_POLICY))
        .map(|value| value == policy)
        .unwrap_or(false)
}

async fn update_ingresses(
    client: Client,
    policy: &str,
    token: CancellationToken,
) -> kube::Result<()> {
    let all: Api<Ingress> = Api::all(client.clone());
    let ingresses = all.list(&ListParams::default()).await?;

    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { annotations::LAST_POLICY_UPDATE: stamp }
        }
    });
    let params = PatchParams::apply(FIELD_MANAGER);

    for ingress in ingresses.items.into_iter() {
        if !references_policy(&ingress, policy) {
            continue;
        }
        let Some(namespace) = ingress.namespace() else {
            continue;
        };
        let name = ingress.name_unchecked();
        let api: Api<Ingress> = Api::namespaced(client.clone(), &namespace);

        let merge_patch = Patch::Merge(&patch);
        tokio::select! {
            _ = token.cancelled() => {
                debug!(%policy, "Policy update pass superseded");
                return Ok(());
            }
            res = api.patch(&name, &params, &merge_patch) => {
                match res {
                    Ok(_) => info!(%namespace, %name, %policy, "Re-stamped ingress"),
                    Err(error) => warn!(%namespace, %name, %policy, %error, "Failed to re-stamp ingress"),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_agent_k8s_api::ObjectMeta;
    use std::collections::BTreeMap;

    fn mk_ingress(annotations: &[(&str, &str)]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("ing".to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn matches_annotated_ingress() {
        let ing = mk_ingress(&[(annotations::ACCESS_CONTROL_POLICY, "my-acp")]);
        assert!(references_policy(&ing, "my-acp"));
        assert!(!references_policy(&ing, "other-acp"));
    }

    #[test]
    fn ignores_unannotated_ingress() {
        let ing = mk_ingress(&[]);
        assert!(!references_policy(&ing, "my-acp"));
    }
}
