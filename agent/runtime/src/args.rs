use crate::admission::Admission;
use anyhow::Result;
use clap::Parser;
use futures::prelude::*;
use hub_agent_auth as auth;
use hub_agent_k8s_api::{AccessControlPolicy, EdgeIngress, IngressClass};
use hub_agent_k8s_index::{AcpIndex, IngressUpdater, Registry};
use hub_agent_platform::{secrets, AcpWatcher, CommandWatcher, EdgeIngressWatcher, PlatformClient};
use hub_agent_tunnel::TunnelManager;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info_span, warn, Instrument};
use url::Url;

/// How often the platform watchers and the tunnel manager reconcile.
const SYNC_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[clap(name = "hub-agent", about = "In-cluster agent for the hub platform")]
pub struct Args {
    #[clap(long, default_value = "hub_agent=info,warn", env = "HUB_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Platform access token.
    #[clap(long, env = "HUB_TOKEN", hide_env_values = true)]
    token: String,

    #[clap(long, default_value = "https://platform.hub.traefik.io/agent")]
    platform_url: Url,

    /// Address the access-control forward-auth server listens on.
    #[clap(long, default_value = "0.0.0.0:80")]
    auth_server_listen_addr: SocketAddr,

    /// URL under which ingress controllers reach the auth server.
    #[clap(
        long,
        default_value = "http://hub-agent-auth-server.hub.svc.cluster.local"
    )]
    auth_server_url: String,

    /// Namespace the agent runs in; holds the hub secrets.
    #[clap(long, default_value = "hub", env = "POD_NAMESPACE")]
    namespace: String,

    /// Local ingress-controller endpoint tunnel streams are proxied to.
    /// Platform-advertised cluster endpoints are advisory only.
    #[clap(
        long = "traefik-tunnel-endpoint",
        default_value = "traefik.hub.svc.cluster.local:9901"
    )]
    tunnel_endpoint: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            token,
            platform_url,
            auth_server_listen_addr,
            auth_server_url,
            namespace,
            tunnel_endpoint,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        let platform = Arc::new(PlatformClient::new(platform_url, token.clone())?);
        let client = runtime.client();

        secrets::ensure_hub_secret(client.clone(), &namespace, &token).await?;

        // In-memory indexes fed by informer events.
        let registry = Registry::shared();
        let classes = runtime.watch_all::<IngressClass>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(registry.clone(), classes)
                .instrument(info_span!("ingressclasses")),
        );

        let (acp_index, acp_snapshots, acp_changes) = AcpIndex::shared();
        let acps = runtime.watch_all::<AccessControlPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(acp_index.clone(), acps)
                .instrument(info_span!("accesscontrolpolicies")),
        );

        // The access-control runtime: hot-swapped handlers behind an HTTP
        // server consulted by ingress controllers.
        let handler_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let switcher = auth::Switcher::new(handler_http);
        tokio::spawn(
            auth::watch_policies(switcher.clone(), acp_snapshots)
                .instrument(info_span!("acp_switcher")),
        );
        let auth_drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if let Err(error) = auth::serve(auth_server_listen_addr, switcher, auth_drain).await
                {
                    error!(%error, "Access control server failed");
                }
            }
            .instrument(info_span!("auth_server")),
        );

        // Policy changes re-stamp the ingresses referencing them.
        let updater = IngressUpdater::new(client.clone(), acp_changes);
        tokio::spawn(updater.run().instrument(info_span!("ingress_updater")));

        // Reflector-backed stores give the watchers a cached lister.
        let acp_store =
            spawn_reflector::<AccessControlPolicy>(kube::Api::all(client.clone()), "acps");
        let edge_store = spawn_reflector::<EdgeIngress>(kube::Api::all(client.clone()), "edgeingresses");

        tokio::spawn(
            AcpWatcher::new(platform.clone(), client.clone(), acp_store, SYNC_PERIOD)
                .run()
                .instrument(info_span!("acp_watcher")),
        );
        tokio::spawn(
            EdgeIngressWatcher::new(
                platform.clone(),
                client.clone(),
                edge_store,
                namespace.clone(),
                SYNC_PERIOD,
            )
            .run()
            .instrument(info_span!("edge_ingress_watcher")),
        );
        tokio::spawn(
            CommandWatcher::new(platform.clone(), client.clone(), SYNC_PERIOD)
                .run()
                .instrument(info_span!("command_watcher")),
        );

        tokio::spawn(
            TunnelManager::new(platform.clone(), token, tunnel_endpoint, SYNC_PERIOD)
                .run(runtime.shutdown_handle())
                .instrument(info_span!("tunnel_manager")),
        );

        let admission = Admission::new(client, platform, registry, acp_index, auth_server_url);
        let runtime = runtime.spawn_server(move || admission);

        // Block on the shutdown signal; background tasks drain with it.
        if runtime.run().await.is_err() {
            anyhow::bail!("Aborted");
        }

        Ok(())
    }
}

/// Spawns a reflector and returns its store.
fn spawn_reflector<K>(api: kube::Api<K>, kind: &'static str) -> reflector::Store<K>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store::<K>();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects();
    tokio::spawn(
        async move {
            futures::pin_mut!(stream);
            loop {
                match stream.try_next().await {
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(error) => warn!(%error, kind, "Reflector stream error"),
                }
            }
        }
        .instrument(info_span!("reflector")),
    );
    store
}
