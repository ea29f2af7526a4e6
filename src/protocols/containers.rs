//! Container and network orders, executed as docker CLI calls on the target host.

use crate::core::registry::{OrderHandler, PluginError};
use crate::core::types::{Command, OrderType, Server};
use crate::transport::{exec_script, shell_quote};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::info;

/// Payload of `createContainer`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    /// `host:container` port mappings
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Payload of `createNetwork`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Payload naming an existing container or network.
#[derive(Debug, Clone, Deserialize)]
pub struct Named {
    pub name: String,
}

fn payload<T: DeserializeOwned>(command: &Command) -> Result<T, PluginError> {
    serde_json::from_value(command.order.payload.clone()).map_err(|e| {
        PluginError::fatal(format!(
            "invalid {} payload: {}",
            command.order.order_type, e
        ))
    })
}

/// Render the docker CLI invocation for a container or network order.
pub fn docker_script(command: &Command) -> Result<String, PluginError> {
    match command.order.order_type {
        OrderType::CreateContainer => {
            let spec: ContainerSpec = payload(command)?;
            Ok(create_container(&spec))
        }
        OrderType::StartContainer => {
            let n: Named = payload(command)?;
            Ok(format!("docker start {}", shell_quote(&n.name)))
        }
        OrderType::RemoveContainer => {
            let n: Named = payload(command)?;
            Ok(format!("docker rm -f {}", shell_quote(&n.name)))
        }
        OrderType::CreateNetwork => {
            let spec: NetworkSpec = payload(command)?;
            let mut script = "docker network create".to_string();
            if let Some(subnet) = &spec.subnet {
                script.push_str(&format!(" --subnet {}", shell_quote(subnet)));
            }
            if let Some(gateway) = &spec.gateway {
                script.push_str(&format!(" --gateway {}", shell_quote(gateway)));
            }
            script.push_str(&format!(" {}", shell_quote(&spec.name)));
            Ok(script)
        }
        OrderType::RemoveNetwork => {
            let n: Named = payload(command)?;
            Ok(format!("docker network rm {}", shell_quote(&n.name)))
        }
        other => Err(PluginError::fatal(format!(
            "{} is not a container order",
            other
        ))),
    }
}

fn create_container(spec: &ContainerSpec) -> String {
    let mut parts = vec![
        "docker create".to_string(),
        format!("--name {}", shell_quote(&spec.name)),
        format!("--hostname {}", shell_quote(&spec.name)),
    ];
    // docker create takes a single network; the rest are attached afterwards
    if let Some(first) = spec.network.first() {
        parts.push(format!("--network {}", shell_quote(first)));
    }
    for (k, v) in &spec.environment {
        parts.push(format!("-e {}", shell_quote(&format!("{}={}", k, v))));
    }
    for (k, v) in &spec.labels {
        parts.push(format!("--label {}", shell_quote(&format!("{}={}", k, v))));
    }
    for port in &spec.ports {
        parts.push(format!("-p {}", shell_quote(port)));
    }
    if let Some(cpus) = &spec.cpus {
        parts.push(format!("--cpus {}", shell_quote(cpus)));
    }
    if let Some(memory) = &spec.memory {
        parts.push(format!("--memory {}", shell_quote(memory)));
    }
    if let Some(entrypoint) = &spec.entrypoint {
        parts.push(format!("--entrypoint {}", shell_quote(entrypoint)));
    }
    parts.push(shell_quote(&spec.image));
    parts.extend(spec.args.iter().map(|a| shell_quote(a)));

    let mut script = parts.join(" ");
    for extra in spec.network.iter().skip(1) {
        script.push_str(&format!(
            " && docker network connect {} {}",
            shell_quote(extra),
            shell_quote(&spec.name)
        ));
    }
    script
}

/// The docker host a command targets: its IP, or this machine.
pub fn target_server(command: &Command) -> Server {
    match &command.target.ip {
        Some(ip) => Server {
            id: ip.clone(),
            addr: ip.clone(),
            ..Server::local(ip)
        },
        None => Server::local("local"),
    }
}

/// Handles every container and network order type.
#[derive(Debug, Default)]
pub struct ContainerOrders;

#[async_trait]
impl OrderHandler for ContainerOrders {
    async fn handle(&self, command: &Command) -> Result<Option<serde_json::Value>, PluginError> {
        let script = docker_script(command)?;
        let server = target_server(command);
        info!(
            id = %command.id,
            order = %command.order.order_type,
            server = %server.addr,
            "running docker order"
        );
        exec_script(&server, &script)
            .await?
            .into_result()
            .map_err(|e| PluginError::from(format!("{}: {}", command.order.order_type, e)))?;
        Ok(None)
    }
}
