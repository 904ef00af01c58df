//! The outbound tunnel manager.
//!
//! Keeps the set of running tunnels exactly matching the platform's
//! advertised tunnel endpoints. Each tunnel dials a WebSocket to its
//! broker, runs a yamux client session over it, and proxies every accepted
//! stream to the local ingress-controller endpoint.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ws;

use ahash::AHashMap as HashMap;
use hub_agent_platform::client::{PlatformClient, TunnelEndpoint};
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ws::WsConn;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel was closed on purpose; `Accept` surfaces this instead of
    /// a generic EOF so the serve loop can exit cleanly.
    #[error("listener closed")]
    ListenerClosed,

    #[error("invalid broker endpoint: {0}")]
    BrokerEndpoint(#[from] http::Error),

    #[error("broker handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("multiplexer failed: {0}")]
    Mux(#[from] yamux::ConnectionError),
}

struct RunningTunnel {
    broker_endpoint: String,
    shutdown: CancellationToken,
    generation: u64,
}

struct Inner {
    platform: Arc<PlatformClient>,
    token: String,
    /// The in-cluster ingress-controller address streams proxy to. Always
    /// taken from the agent's own configuration; platform-provided cluster
    /// endpoints are advisory only.
    local_endpoint: String,
    tunnels: Mutex<HashMap<String, RunningTunnel>>,
    generations: std::sync::atomic::AtomicU64,
}

pub struct TunnelManager {
    inner: Arc<Inner>,
    period: Duration,
}

impl TunnelManager {
    pub fn new(
        platform: Arc<PlatformClient>,
        token: String,
        local_endpoint: String,
        period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                token,
                local_endpoint,
                tunnels: Mutex::new(HashMap::default()),
                generations: std::sync::atomic::AtomicU64::new(0),
            }),
            period,
        }
    }

    /// Reconciles on start and then periodically until shutdown.
    pub async fn run(self, drain: drain::Watch) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.reconcile().await {
                        warn!(%error, "Tunnel reconciliation aborted");
                    }
                }
                _ = drain.clone().signaled() => {
                    self.close_all().await;
                    return;
                }
            }
        }
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        let advertised = self.inner.platform.get_tunnel_endpoints().await?;

        let mut tunnels = self.inner.tunnels.lock().await;
        let running: HashMap<String, String> = tunnels
            .iter()
            .map(|(id, tunnel)| (id.clone(), tunnel.broker_endpoint.clone()))
            .collect();

        let plan = plan(&running, &advertised);
        for id in plan.close {
            if let Some(tunnel) = tunnels.remove(&id) {
                info!(tunnel = %id, "Closing tunnel");
                tunnel.shutdown.cancel();
            }
        }
        for endpoint in plan.launch {
            info!(tunnel = %endpoint.tunnel_id, broker = %endpoint.broker_endpoint, "Launching tunnel");
            let shutdown = CancellationToken::new();
            let generation = self
                .inner
                .generations
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tunnels.insert(
                endpoint.tunnel_id.clone(),
                RunningTunnel {
                    broker_endpoint: endpoint.broker_endpoint.clone(),
                    shutdown: shutdown.clone(),
                    generation,
                },
            );
            tokio::spawn(run_tunnel(self.inner.clone(), endpoint, shutdown, generation));
        }

        Ok(())
    }

    async fn close_all(&self) {
        let mut tunnels = self.inner.tunnels.lock().await;
        for (id, tunnel) in tunnels.drain() {
            debug!(tunnel = %id, "Closing tunnel on shutdown");
            tunnel.shutdown.cancel();
        }
    }
}

struct Plan {
    launch: Vec<TunnelEndpoint>,
    close: Vec<String>,
}

/// Decides which tunnels to launch and close so the running set matches
/// the advertised set. An advertised tunnel with an empty broker endpoint
/// is skipped, closing any running tunnel with the same ID.
fn plan(running: &HashMap<String, String>, advertised: &[TunnelEndpoint]) -> Plan {
    let mut desired: HashMap<&str, &TunnelEndpoint> = HashMap::default();
    for endpoint in advertised {
        desired.insert(endpoint.tunnel_id.as_str(), endpoint);
    }

    let mut launch = Vec::new();
    let mut close = Vec::new();

    for (id, endpoint) in &desired {
        if endpoint.broker_endpoint.is_empty() {
            if running.contains_key(*id) {
                close.push((*id).to_string());
            }
            continue;
        }
        match running.get(*id) {
            None => launch.push((*endpoint).clone()),
            Some(broker) if broker != &endpoint.broker_endpoint => {
                close.push((*id).to_string());
                launch.push((*endpoint).clone());
            }
            Some(_) => {}
        }
    }

    for id in running.keys() {
        if !desired.contains_key(id.as_str()) {
            close.push(id.clone());
        }
    }

    Plan { launch, close }
}

async fn run_tunnel(
    inner: Arc<Inner>,
    endpoint: TunnelEndpoint,
    shutdown: CancellationToken,
    generation: u64,
) {
    match serve_tunnel(&inner, &endpoint, &shutdown).await {
        Ok(()) | Err(TunnelError::ListenerClosed) => {
            info!(tunnel = %endpoint.tunnel_id, "Tunnel closed")
        }
        Err(error) => {
            warn!(tunnel = %endpoint.tunnel_id, %error, "Tunnel failed; next reconciliation will retry")
        }
    }

    // Drop our registration unless a newer tunnel took the slot.
    let mut tunnels = inner.tunnels.lock().await;
    if tunnels
        .get(&endpoint.tunnel_id)
        .map(|tunnel| tunnel.generation == generation)
        .unwrap_or(false)
    {
        tunnels.remove(&endpoint.tunnel_id);
    }
}

async fn serve_tunnel(
    inner: &Inner,
    endpoint: &TunnelEndpoint,
    shutdown: &CancellationToken,
) -> Result<(), TunnelError> {
    let url = format!(
        "{}/{}",
        endpoint.broker_endpoint.trim_end_matches('/'),
        endpoint.tunnel_id
    );
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        http::HeaderValue::from_str(&format!("Bearer {}", inner.token))
            .map_err(http::Error::from)?,
    );

    // The handshake either upgrades (101) or errors out.
    let (ws, _rsp) = connect_async(request).await?;
    debug!(tunnel = %endpoint.tunnel_id, "Broker handshake complete");

    let mut connection =
        yamux::Connection::new(WsConn::new(ws), yamux::Config::default(), yamux::Mode::Client);

    loop {
        let inbound = poll_fn(|cx| connection.poll_next_inbound(cx));
        tokio::select! {
            _ = shutdown.cancelled() => return Err(TunnelError::ListenerClosed),
            stream = inbound => match stream {
                Some(Ok(stream)) => {
                    let local = inner.local_endpoint.clone();
                    let tunnel_id = endpoint.tunnel_id.clone();
                    tokio::spawn(proxy_stream(stream, local, tunnel_id));
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Ok(()),
            }
        }
    }
}

/// Copies bytes both ways between a tunnel stream and the local endpoint;
/// an error on either side tears down both.
async fn proxy_stream(stream: yamux::Stream, local_endpoint: String, tunnel_id: String) {
    let mut tcp = match TcpStream::connect(&local_endpoint).await {
        Ok(tcp) => tcp,
        Err(error) => {
            warn!(tunnel = %tunnel_id, %local_endpoint, %error, "Failed to dial local endpoint");
            return;
        }
    };

    let mut stream = stream.compat();
    match tokio::io::copy_bidirectional(&mut stream, &mut tcp).await {
        Ok((up, down)) => debug!(tunnel = %tunnel_id, up, down, "Stream closed"),
        Err(error) => debug!(tunnel = %tunnel_id, %error, "Stream failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str, broker: &str) -> TunnelEndpoint {
        serde_json::from_value::<TunnelEndpoint>(serde_json::json!({
            "tunnelId": id,
            "brokerEndpoint": broker,
        }))
        .unwrap()
    }

    fn running(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(id, broker)| (id.to_string(), broker.to_string()))
            .collect()
    }

    #[test]
    fn launches_new_and_closes_stale_tunnels() {
        // Running {A: b1, C: b3}; advertised [{A, b1}, {B, b2}].
        let plan = plan(
            &running(&[("A", "wss://b1"), ("C", "wss://b3")]),
            &[ep("A", "wss://b1"), ep("B", "wss://b2")],
        );

        let launched: Vec<_> = plan.launch.iter().map(|e| e.tunnel_id.as_str()).collect();
        assert_eq!(launched, vec!["B"]);
        assert_eq!(plan.close, vec!["C".to_string()]);
    }

    #[test]
    fn broker_change_closes_and_relaunches() {
        let plan = plan(&running(&[("A", "wss://old")]), &[ep("A", "wss://new")]);
        assert_eq!(plan.close, vec!["A".to_string()]);
        assert_eq!(plan.launch.len(), 1);
        assert_eq!(plan.launch[0].broker_endpoint, "wss://new");
    }

    #[test]
    fn empty_broker_endpoint_skips_and_closes() {
        let first = plan(&running(&[("A", "wss://b1")]), &[ep("A", "")]);
        assert_eq!(first.close, vec!["A".to_string()]);
        assert!(first.launch.is_empty());

        // Not running yet: nothing to do.
        let second = plan(&running(&[]), &[ep("A", "")]);
        assert!(second.close.is_empty());
        assert!(second.launch.is_empty());
    }

    #[test]
    fn unchanged_set_is_a_no_op() {
        let plan = plan(&running(&[("A", "wss://b1")]), &[ep("A", "wss://b1")]);
        assert!(plan.launch.is_empty());
        assert!(plan.close.is_empty());
    }

    #[test]
    fn listener_closed_error_is_distinct() {
        assert_eq!(TunnelError::ListenerClosed.to_string(), "listener closed");
    }
}
