//! Converges platform-held edge ingresses into cluster resources.
//!
//! Each edge ingress materialises as its custom resource, a child Ingress
//! bound to the tunnel entry point, and TLS secrets holding the
//! platform-issued certificates. Children carry owner references so
//! deleting the EdgeIngress garbage-collects the rest.

use crate::client::{EdgeIngressResource, PlatformClient};
use crate::secrets;
use ahash::AHashMap as HashMap;
use chrono::{SecondsFormat, Utc};
use hub_agent_core::spec_hash;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, IngressTLS, ServiceBackendPort,
};
use hub_agent_k8s_api::edge_ingress::{
    EdgeIngressAcp, EdgeIngressConnection, EdgeIngressService, EdgeIngressSpec, EdgeIngressStatus,
};
use hub_agent_k8s_api::{
    annotations, Api, Client, DeleteParams, EdgeIngress, Ingress, ObjectMeta, OwnerReference,
    Patch, PatchParams, PostParams, Resource, ResourceExt,
};
use kube::runtime::reflector::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "hub-agent";

pub struct EdgeIngressWatcher {
    platform: Arc<PlatformClient>,
    client: Client,
    store: Store<EdgeIngress>,
    agent_namespace: String,
    period: Duration,
}

impl EdgeIngressWatcher {
    pub fn new(
        platform: Arc<PlatformClient>,
        client: Client,
        store: Store<EdgeIngress>,
        agent_namespace: String,
        period: Duration,
    ) -> Self {
        Self {
            platform,
            client,
            store,
            agent_namespace,
            period,
        }
    }

    pub async fn run(self) {
        if let Err(error) = self.store.wait_until_ready().await {
            warn!(%error, "Edge ingress cache never became ready");
            return;
        }
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(error) = self.tick().await {
                warn!(%error, "Edge ingress sync aborted");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let fetched = self.platform.get_edge_ingresses().await?;
        let desired = key_by_namespace_name(fetched);

        self.sync_wildcard_certificate().await;

        let existing: HashMap<String, Arc<EdgeIngress>> = self
            .store
            .state()
            .into_iter()
            .filter_map(|obj| {
                let ns = obj.namespace()?;
                Some((format!("{ns}/{}", obj.name_unchecked()), obj))
            })
            .collect();

        for (key, resource) in &desired {
            if let Err(error) = self.sync_one(existing.get(key), resource).await {
                warn!(namespace = %resource.namespace, name = %resource.name, %error,
                    "Failed to sync edge ingress");
                self.mark_connection(resource, EdgeIngressConnection::Down)
                    .await;
            }
        }

        // Deletions happen after all creates and updates.
        for (key, obj) in existing.iter().filter(|(key, _)| !desired.contains_key(*key)) {
            let Some(namespace) = obj.namespace() else {
                continue;
            };
            let api: Api<EdgeIngress> = Api::namespaced(self.client.clone(), &namespace);
            match api.delete(&obj.name_unchecked(), &DeleteParams::default()).await {
                Ok(_) => info!(%key, "Deleted edge ingress"),
                Err(error) => warn!(%key, %error, "Failed to delete edge ingress"),
            }
        }

        Ok(())
    }

    async fn sync_wildcard_certificate(&self) {
        let certificate = match self.platform.get_wildcard_certificate().await {
            Ok(certificate) => certificate,
            Err(error) => {
                warn!(%error, "Failed to fetch wildcard certificate");
                return;
            }
        };
        if let Err(error) = secrets::upsert_tls_secret(
            self.client.clone(),
            &self.agent_namespace,
            secrets::WILDCARD_CERT_SECRET,
            &certificate,
            None,
        )
        .await
        {
            warn!(%error, "Failed to store wildcard certificate");
        }
    }

    async fn sync_one(
        &self,
        current: Option<&Arc<EdgeIngress>>,
        resource: &EdgeIngressResource,
    ) -> anyhow::Result<()> {
        let spec = desired_spec(resource);
        let hash = spec_hash(&spec)?;

        let api: Api<EdgeIngress> = Api::namespaced(self.client.clone(), &resource.namespace);
        let edge_ingress = match current {
            None => {
                let mut obj = EdgeIngress::new(&resource.name, spec);
                obj.metadata.namespace = Some(resource.namespace.clone());
                obj.status = Some(sync_status(resource, &hash));
                let created = api.create(&PostParams::default(), &obj).await?;
                info!(namespace = %resource.namespace, name = %resource.name, "Created edge ingress");
                created
            }
            Some(existing) if !is_synced(existing, &hash) => {
                let patch = serde_json::json!({
                    "spec": spec,
                    "status": sync_status(resource, &hash),
                });
                let updated = api
                    .patch(&resource.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                info!(namespace = %resource.namespace, name = %resource.name, "Updated edge ingress");
                updated
            }
            Some(existing) => {
                debug!(namespace = %resource.namespace, name = %resource.name, "Edge ingress up to date");
                existing.as_ref().clone()
            }
        };

        let owner = edge_ingress
            .controller_owner_ref(&())
            .expect("edge ingress has a name and uid");

        if !resource.custom_domains.is_empty() {
            let certificate = self.platform.obtain_certificate(&resource.custom_domains).await?;
            secrets::upsert_tls_secret(
                self.client.clone(),
                &resource.namespace,
                &secrets::custom_domains_secret_name(&resource.name),
                &certificate,
                Some(owner.clone()),
            )
            .await?;
        }

        let ingress = materialise_ingress(resource, owner);
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &resource.namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        ingresses
            .patch(&resource.name, &params, &Patch::Apply(&ingress))
            .await?;

        self.mark_connection(resource, EdgeIngressConnection::Up).await;
        Ok(())
    }

    async fn mark_connection(&self, resource: &EdgeIngressResource, state: EdgeIngressConnection) {
        let api: Api<EdgeIngress> = Api::namespaced(self.client.clone(), &resource.namespace);
        let patch = serde_json::json!({"status": {"connection": state}});
        if let Err(error) = api
            .patch(&resource.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(namespace = %resource.namespace, name = %resource.name, %error,
                "Failed to update edge ingress connection state");
        }
    }
}

/// Later entries win when the platform returns the same key twice.
fn key_by_namespace_name(
    resources: Vec<EdgeIngressResource>,
) -> HashMap<String, EdgeIngressResource> {
    let mut keyed = HashMap::with_capacity(resources.len());
    for resource in resources {
        keyed.insert(format!("{}/{}", resource.namespace, resource.name), resource);
    }
    keyed
}

fn desired_spec(resource: &EdgeIngressResource) -> EdgeIngressSpec {
    EdgeIngressSpec {
        service: EdgeIngressService {
            name: resource.service.name.clone(),
            port: resource.service.port,
        },
        acp: resource
            .acp
            .as_ref()
            .map(|acp| EdgeIngressAcp {
                name: acp.name.clone(),
            }),
        custom_domains: resource.custom_domains.clone(),
    }
}

fn is_synced(existing: &EdgeIngress, hash: &str) -> bool {
    existing
        .status
        .as_ref()
        .and_then(|status| status.spec_hash.as_deref())
        .map(|current| current == hash)
        .unwrap_or(false)
}

fn sync_status(resource: &EdgeIngressResource, hash: &str) -> EdgeIngressStatus {
    EdgeIngressStatus {
        version: Some(resource.version.clone()),
        synced_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        spec_hash: Some(hash.to_string()),
        domain: (!resource.domain.is_empty()).then(|| resource.domain.clone()),
        urls: resource.urls.clone(),
        connection: None,
    }
}

/// Builds the child Ingress bound to the tunnel entry point.
fn materialise_ingress(resource: &EdgeIngressResource, owner: OwnerReference) -> Ingress {
    let mut hosts = Vec::new();
    if !resource.domain.is_empty() {
        hosts.push(resource.domain.clone());
    }
    hosts.extend(resource.custom_domains.iter().cloned());

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: resource.service.name.clone(),
            port: Some(ServiceBackendPort {
                number: Some(i32::from(resource.service.port)),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };

    let rules = hosts
        .iter()
        .map(|host| IngressRule {
            host: Some(host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: backend.clone(),
                }],
            }),
        })
        .collect();

    let tls = (!resource.custom_domains.is_empty()).then(|| {
        vec![IngressTLS {
            hosts: Some(resource.custom_domains.clone()),
            secret_name: Some(secrets::custom_domains_secret_name(&resource.name)),
        }]
    });

    Ingress {
        metadata: ObjectMeta {
            name: Some(resource.name.clone()),
            namespace: Some(resource.namespace.clone()),
            labels: Some(BTreeMap::from([(
                annotations::MANAGED_BY.to_string(),
                annotations::MANAGED_BY_VALUE.to_string(),
            )])),
            annotations: Some(BTreeMap::from([
                (
                    annotations::TRAEFIK_ENTRY_POINTS.to_string(),
                    annotations::EDGE_INGRESS_ENTRY_POINT.to_string(),
                ),
                (
                    annotations::TRAEFIK_ROUTER_TLS.to_string(),
                    "true".to_string(),
                ),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(annotations::EDGE_INGRESS_CLASS.to_string()),
            rules: Some(rules),
            tls,
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{EdgeIngressAcpRef, EdgeIngressServiceRef};

    fn mk_resource(name: &str, domains: &[&str]) -> EdgeIngressResource {
        EdgeIngressResource {
            namespace: "apps".to_string(),
            name: name.to_string(),
            version: "v1".to_string(),
            service: EdgeIngressServiceRef {
                name: "whoami".to_string(),
                port: 8080,
            },
            acp: Some(EdgeIngressAcpRef {
                name: "my-acp".to_string(),
            }),
            custom_domains: domains.iter().map(|d| d.to_string()).collect(),
            domain: "abc123.hub.example.com".to_string(),
            urls: vec!["https://abc123.hub.example.com".to_string()],
        }
    }

    fn mk_owner() -> OwnerReference {
        OwnerReference {
            api_version: "hub.traefik.io/v1alpha1".to_string(),
            kind: "EdgeIngress".to_string(),
            name: "my-edge".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn second_entry_wins_on_duplicate_keys() {
        let mut a = mk_resource("edge", &[]);
        a.version = "v1".to_string();
        let mut b = mk_resource("edge", &[]);
        b.version = "v2".to_string();

        let keyed = key_by_namespace_name(vec![a, b]);
        assert_eq!(keyed.len(), 1);
        assert_eq!(keyed["apps/edge"].version, "v2");
    }

    #[test]
    fn materialised_ingress_is_owned_and_labelled() {
        let ingress = materialise_ingress(&mk_resource("my-edge", &[]), mk_owner());

        let labels = ingress.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[annotations::MANAGED_BY], annotations::MANAGED_BY_VALUE);

        let owners = ingress.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "EdgeIngress");

        let spec = ingress.spec.as_ref().unwrap();
        assert_eq!(
            spec.ingress_class_name.as_deref(),
            Some(annotations::EDGE_INGRESS_CLASS)
        );
        let annotations_map = ingress.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations_map[annotations::TRAEFIK_ENTRY_POINTS],
            annotations::EDGE_INGRESS_ENTRY_POINT
        );
    }

    #[test]
    fn platform_domain_and_custom_domains_become_rules() {
        let ingress = materialise_ingress(
            &mk_resource("my-edge", &["www.example.com"]),
            mk_owner(),
        );
        let rules = ingress.spec.as_ref().unwrap().rules.as_ref().unwrap();
        let hosts: Vec<_> = rules.iter().filter_map(|r| r.host.as_deref()).collect();
        assert_eq!(hosts, vec!["abc123.hub.example.com", "www.example.com"]);
    }

    #[test]
    fn custom_domains_get_a_dedicated_tls_secret() {
        let ingress = materialise_ingress(
            &mk_resource("my-edge", &["www.example.com"]),
            mk_owner(),
        );
        let tls = ingress.spec.as_ref().unwrap().tls.as_ref().unwrap();
        assert_eq!(
            tls[0].secret_name.as_deref(),
            Some("hub-certificate-custom-domains-my-edge")
        );

        let plain = materialise_ingress(&mk_resource("my-edge", &[]), mk_owner());
        assert!(plain.spec.as_ref().unwrap().tls.is_none());
    }

    #[test]
    fn desired_spec_hash_is_stable_across_fetches() {
        let a = spec_hash(&desired_spec(&mk_resource("edge", &["www.example.com"]))).unwrap();
        let b = spec_hash(&desired_spec(&mk_resource("edge", &["www.example.com"]))).unwrap();
        assert_eq!(a, b);
    }
}
