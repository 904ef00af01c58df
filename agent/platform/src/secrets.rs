//! Secrets the agent owns: the platform token and platform-issued TLS
//! certificates.

use crate::client::Certificate;
use hub_agent_k8s_api::{
    annotations, Api, ByteString, Client, ObjectMeta, OwnerReference, Patch, PatchParams,
    PostParams, Secret,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const HUB_SECRET: &str = "hub-secret";
pub const WILDCARD_CERT_SECRET: &str = "hub-certificate";

const FIELD_MANAGER: &str = "hub-agent";

pub fn custom_domains_secret_name(edge_ingress: &str) -> String {
    format!("hub-certificate-custom-domains-{edge_ingress}")
}

/// Creates the Opaque Secret carrying the platform token. Run once at
/// startup; an existing secret is left untouched.
pub async fn ensure_hub_secret(client: Client, namespace: &str, token: &str) -> kube::Result<()> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(HUB_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(token.as_bytes().to_vec()),
        )])),
        ..Default::default()
    };

    match api.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!(%namespace, name = HUB_SECRET, "Created platform token secret");
            Ok(())
        }
        Err(kube::Error::Api(rsp)) if rsp.reason == "AlreadyExists" => {
            debug!(%namespace, name = HUB_SECRET, "Platform token secret already exists");
            Ok(())
        }
        Err(error) => Err(error),
    }
}

/// Creates or updates a TLS Secret holding a platform-issued certificate.
pub async fn upsert_tls_secret(
    client: Client,
    namespace: &str,
    name: &str,
    certificate: &Certificate,
    owner: Option<OwnerReference>,
) -> kube::Result<()> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                annotations::APP_MANAGED_BY.to_string(),
                annotations::MANAGED_BY_VALUE.to_string(),
            )])),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (
                "tls.crt".to_string(),
                ByteString(certificate.certificate.as_bytes().to_vec()),
            ),
            (
                "tls.key".to_string(),
                ByteString(certificate.private_key.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    };

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(&secret)).await?;
    debug!(%namespace, %name, "Stored platform certificate");
    Ok(())
}
