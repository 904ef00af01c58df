//! Executes platform commands against the cluster.

use crate::client::{Command, CommandReport, CommandStatus, PlatformClient};
use hub_agent_k8s_api::{annotations, Api, Client, DeleteParams, Ingress, Patch, PatchParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

const SET_INGRESS_ACP: &str = "set-ingress-acp";
const DELETE_INGRESS: &str = "delete-ingress";

pub struct CommandWatcher {
    platform: Arc<PlatformClient>,
    client: Client,
    period: Duration,
}

impl CommandWatcher {
    pub fn new(platform: Arc<PlatformClient>, client: Client, period: Duration) -> Self {
        Self {
            platform,
            client,
            period,
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(error) = self.tick().await {
                warn!(%error, "Command sync aborted");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let mut commands = self.platform.list_pending_commands().await?;
        if commands.is_empty() {
            return Ok(());
        }
        commands.sort_by_key(|command| command.created_at);

        let mut reports = Vec::with_capacity(commands.len());
        for command in commands {
            let report = match self.execute(&command).await {
                Ok(()) => {
                    info!(id = %command.id, command = %command.command_type, "Executed command");
                    CommandReport {
                        id: command.id.clone(),
                        status: CommandStatus::Success,
                        error: None,
                    }
                }
                Err(error) => {
                    warn!(id = %command.id, command = %command.command_type, %error,
                        "Command failed");
                    CommandReport {
                        id: command.id.clone(),
                        status: CommandStatus::Failure,
                        error: Some(error.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        self.platform.submit_command_reports(&reports).await?;
        Ok(())
    }

    async fn execute(&self, command: &Command) -> anyhow::Result<()> {
        match command.command_type.as_str() {
            SET_INGRESS_ACP => {
                let (namespace, name) = ingress_id(&command.data)?;
                let policy = command
                    .data
                    .get("acpName")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("command is missing acpName"))?;

                let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
                let patch = serde_json::json!({
                    "metadata": {
                        "annotations": { annotations::ACCESS_CONTROL_POLICY: policy }
                    }
                });
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            DELETE_INGRESS => {
                let (namespace, name) = ingress_id(&command.data)?;
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
                api.delete(&name, &DeleteParams::default()).await?;
                Ok(())
            }
            other => anyhow::bail!("unsupported command type {other:?}"),
        }
    }
}

/// Commands address ingresses as `namespace/name`.
fn ingress_id(data: &serde_json::Value) -> anyhow::Result<(String, String)> {
    let id = data
        .get("ingressId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("command is missing ingressId"))?;
    match id.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => anyhow::bail!("malformed ingressId {id:?}, expected namespace/name"),
    }
}
