//! The access-control-policy index.
//!
//! Holds the current policy set and publishes it two ways: full snapshots
//! on a watch channel (consumed by the auth server's handler switcher) and
//! changed policy names on an unbounded channel (consumed by the
//! IngressUpdater). Event handlers stay non-blocking; all heavy work
//! happens on the consumer side.

use ahash::AHashMap as HashMap;
use hub_agent_k8s_api::{AccessControlPolicy, AccessControlPolicySpec, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub type SharedIndex = Arc<RwLock<Index>>;

/// An immutable view of the policy set at one point in time.
pub type AcpSnapshot = Arc<HashMap<String, AccessControlPolicySpec>>;

#[derive(Debug)]
pub struct Index {
    policies: HashMap<String, AccessControlPolicySpec>,
    snapshots: watch::Sender<AcpSnapshot>,
    changes: mpsc::UnboundedSender<String>,
}

impl Index {
    pub fn shared() -> (
        SharedIndex,
        watch::Receiver<AcpSnapshot>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (snapshots, snapshots_rx) = watch::channel(AcpSnapshot::default());
        let (changes, changes_rx) = mpsc::unbounded_channel();
        let index = Arc::new(RwLock::new(Self {
            policies: HashMap::default(),
            snapshots,
            changes,
        }));
        (index, snapshots_rx, changes_rx)
    }

    /// The current spec of one policy, if indexed.
    pub fn get(&self, name: &str) -> Option<AccessControlPolicySpec> {
        self.policies.get(name).cloned()
    }

    fn publish(&self, name: String) {
        self.snapshots
            .send_replace(Arc::new(self.policies.clone()));
        if self.changes.send(name).is_err() {
            debug!("IngressUpdater is gone, dropping policy change notification");
        }
    }
}

impl kubert::index::IndexClusterResource<AccessControlPolicy> for Index {
    fn apply(&mut self, policy: AccessControlPolicy) {
        let name = policy.name_unchecked();
        if self.policies.get(&name) == Some(&policy.spec) {
            return;
        }
        debug!(%name, "Indexed access control policy");
        self.policies.insert(name.clone(), policy.spec);
        self.publish(name);
    }

    fn delete(&mut self, name: String) {
        if self.policies.remove(&name).is_some() {
            debug!(%name, "Removed access control policy");
            self.publish(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_agent_k8s_api::access_control_policy::JwtConfig;
    use hub_agent_k8s_api::ObjectMeta;
    use kubert::index::IndexClusterResource;

    fn mk_acp(name: &str, secret: &str) -> AccessControlPolicy {
        AccessControlPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: AccessControlPolicySpec {
                jwt: Some(JwtConfig {
                    signing_secret: Some(secret.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn apply_publishes_snapshot_and_change() {
        let (index, mut snapshots, mut changes) = Index::shared();

        index.write().apply(mk_acp("acp-1", "s1"));

        assert!(snapshots.has_changed().unwrap());
        let snap = snapshots.borrow_and_update().clone();
        assert!(snap.contains_key("acp-1"));
        assert_eq!(changes.try_recv().unwrap(), "acp-1");
    }

    #[test]
    fn unchanged_spec_does_not_republish() {
        let (index, mut snapshots, mut changes) = Index::shared();

        index.write().apply(mk_acp("acp-1", "s1"));
        snapshots.borrow_and_update();
        changes.try_recv().unwrap();

        index.write().apply(mk_acp("acp-1", "s1"));
        assert!(!snapshots.has_changed().unwrap());
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn changed_spec_republishes() {
        let (index, mut snapshots, mut changes) = Index::shared();

        index.write().apply(mk_acp("acp-1", "s1"));
        snapshots.borrow_and_update();
        changes.try_recv().unwrap();

        index.write().apply(mk_acp("acp-1", "s2"));
        assert!(snapshots.has_changed().unwrap());
        assert_eq!(changes.try_recv().unwrap(), "acp-1");
    }

    #[test]
    fn delete_publishes_removal() {
        let (index, mut snapshots, mut changes) = Index::shared();

        index.write().apply(mk_acp("acp-1", "s1"));
        snapshots.borrow_and_update();
        changes.try_recv().unwrap();

        index.write().delete("acp-1".to_string());
        assert!(snapshots.borrow_and_update().is_empty());
        assert_eq!(changes.try_recv().unwrap(), "acp-1");

        // Deleting an unknown policy is silent.
        index.write().delete("acp-1".to_string());
        assert!(changes.try_recv().is_err());
    }
}
