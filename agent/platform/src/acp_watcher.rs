//! Converges platform-held access control policies into cluster resources.

use crate::client::{AcpResource, PlatformClient};
use ahash::AHashMap as HashMap;
use chrono::{SecondsFormat, Utc};
use hub_agent_core::spec_hash;
use hub_agent_k8s_api::access_control_policy::AccessControlPolicyStatus;
use hub_agent_k8s_api::{
    AccessControlPolicy, Api, Client, DeleteParams, Patch, PatchParams, PostParams, ResourceExt,
};
use kube::runtime::reflector::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

pub struct AcpWatcher {
    platform: Arc<PlatformClient>,
    client: Client,
    store: Store<AccessControlPolicy>,
    period: Duration,
}

impl AcpWatcher {
    pub fn new(
        platform: Arc<PlatformClient>,
        client: Client,
        store: Store<AccessControlPolicy>,
        period: Duration,
    ) -> Self {
        Self {
            platform,
            client,
            store,
            period,
        }
    }

    pub async fn run(self) {
        if let Err(error) = self.store.wait_until_ready().await {
            warn!(%error, "Access control policy cache never became ready");
            return;
        }
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(error) = self.tick().await {
                warn!(%error, "Access control policy sync aborted");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let fetched = self.platform.get_acps().await?;
        let desired = key_by_name(fetched);

        let api: Api<AccessControlPolicy> = Api::all(self.client.clone());
        let existing: HashMap<String, Arc<AccessControlPolicy>> = self
            .store
            .state()
            .into_iter()
            .map(|obj| (obj.name_unchecked(), obj))
            .collect();

        for (name, resource) in &desired {
            if let Err(error) = self.sync_one(&api, existing.get(name), resource).await {
                warn!(%name, %error, "Failed to sync access control policy");
            }
        }

        // Deletions happen after all creates and updates.
        for (name, _) in existing.iter().filter(|(name, _)| !desired.contains_key(*name)) {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(%name, "Deleted access control policy"),
                Err(error) => warn!(%name, %error, "Failed to delete access control policy"),
            }
        }

        Ok(())
    }

    async fn sync_one(
        &self,
        api: &Api<AccessControlPolicy>,
        current: Option<&Arc<AccessControlPolicy>>,
        resource: &AcpResource,
    ) -> anyhow::Result<()> {
        let hash = spec_hash(&resource.spec)?;
        let status = sync_status(&resource.version, &hash);

        match current {
            None => {
                let mut policy = AccessControlPolicy::new(
                    &resource.name,
                    resource.spec.clone(),
                );
                policy.status = Some(status);
                api.create(&PostParams::default(), &policy).await?;
                info!(name = %resource.name, "Created access control policy");
            }
            Some(existing) if !is_synced(existing, &hash) => {
                let patch = serde_json::json!({
                    "spec": resource.spec,
                    "status": status,
                });
                api.patch(
                    &resource.name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
                info!(name = %resource.name, "Updated access control policy");
            }
            Some(_) => debug!(name = %resource.name, "Access control policy up to date"),
        }

        Ok(())
    }
}

/// Later entries win when the platform returns the same name twice.
fn key_by_name(resources: Vec<AcpResource>) -> HashMap<String, AcpResource> {
    let mut keyed = HashMap::with_capacity(resources.len());
    for resource in resources {
        keyed.insert(resource.name.clone(), resource);
    }
    keyed
}

fn is_synced(existing: &AccessControlPolicy, hash: &str) -> bool {
    existing
        .status
        .as_ref()
        .and_then(|status| status.spec_hash.as_deref())
        .map(|current| current == hash)
        .unwrap_or(false)
}

fn sync_status(version: &str, hash: &str) -> AccessControlPolicyStatus {
    AccessControlPolicyStatus {
        version: Some(version.to_string()),
        synced_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        spec_hash: Some(hash.to_string()),
    }
}
