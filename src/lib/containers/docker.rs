use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
        StatsOptions, StopContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{
        DeviceMapping, EndpointSettings, HostConfig, PortBinding, RestartPolicy,
        RestartPolicyNameEnum,
    },
    network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::runtime::{ContainerRuntime, RuntimeError, RuntimeResult};
use super::spec::{LaunchSpec, split_image_reference};
use super::types::{ContainerStatus, ContainerSummary, RuntimeContainer};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker Engine over its unix socket.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Builds a client for `socket_path`. The connection itself is lazy; use
    /// `ping` to verify the daemon is reachable.
    pub fn connect(socket_path: &str) -> RuntimeResult<Self> {
        let client =
            Docker::connect_with_unix(socket_path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(DockerRuntime { client })
    }
}

fn classify(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Failed(format!("{status_code}: {message}")),
        err @ (DockerError::IOError { .. } | DockerError::RequestTimeoutError) => {
            RuntimeError::Unavailable(err.to_string())
        }
        other => RuntimeError::Failed(other.to_string()),
    }
}

/// Stop/start of a container already in the target state answers 304.
fn not_modified_ok(result: Result<(), DockerError>) -> RuntimeResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(DockerError::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        Err(e) => Err(classify(e)),
    }
}

fn host_config(spec: &LaunchSpec) -> HostConfig {
    let restart_policy = RestartPolicy {
        name: Some(
            spec.restart_policy
                .parse()
                .unwrap_or(RestartPolicyNameEnum::NO),
        ),
        maximum_retry_count: None,
    };

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .ports
        .iter()
        .map(|p| {
            let binding = PortBinding {
                host_ip: None,
                host_port: Some(p.host_port.unwrap_or(p.container_port).to_string()),
            };
            (p.key(), Some(vec![binding]))
        })
        .collect();

    let devices: Vec<DeviceMapping> = spec
        .devices
        .iter()
        .map(|d| DeviceMapping {
            path_on_host: Some(d.host_path.clone()),
            path_in_container: Some(d.container_path.clone()),
            cgroup_permissions: Some(d.permissions.clone()),
        })
        .collect();

    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

    HostConfig {
        restart_policy: Some(restart_policy),
        memory: spec.memory_bytes,
        cpu_quota: spec.cpu_quota,
        cpu_period: spec.cpu_period,
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        binds: non_empty(&spec.binds),
        cap_add: non_empty(&spec.cap_add),
        cap_drop: non_empty(&spec.cap_drop),
        devices: (!devices.is_empty()).then_some(devices),
        privileged: Some(spec.privileged),
        network_mode: Some(spec.network.clone()),
        ..Default::default()
    }
}

fn container_config(spec: &LaunchSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .iter()
        .map(|p| (p.key(), HashMap::new()))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        cmd: spec.cmd.clone(),
        entrypoint: spec.entrypoint.clone(),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config(spec)),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn network_exists(&self, name: &str) -> RuntimeResult<bool> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_network(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> RuntimeResult<()> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            labels: labels.into_iter().collect(),
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.client
            .connect_network(network, options)
            .await
            .map_err(classify)
    }

    async fn list_labelled(&self, label: &str) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    status: c
                        .state
                        .as_deref()
                        .map(ContainerStatus::from_runtime)
                        .unwrap_or(ContainerStatus::Unknown),
                    labels: c.labels.unwrap_or_default().into_iter().collect(),
                })
            })
            .collect())
    }

    async fn create_container(&self, spec: &LaunchSpec) -> RuntimeResult<String> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });

        let resp = self
            .client
            .create_container(options, container_config(spec))
            .await
            .map_err(classify)?;
        for warning in &resp.warnings {
            debug!(container = %spec.name, "runtime warning: {}", warning);
        }
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        not_modified_ok(
            self.client
                .start_container(id, None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        not_modified_ok(self.client.stop_container(id, Some(options)).await)
    }

    async fn restart_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = RestartContainerOptions {
            t: timeout.as_secs() as isize,
        };
        self.client
            .restart_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<RuntimeContainer> {
        let resp = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let status = resp
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| ContainerStatus::from_runtime(&s.to_string()))
            .unwrap_or(ContainerStatus::Unknown);

        let (image, labels) = match resp.config {
            Some(config) => (config.image, config.labels.unwrap_or_default()),
            None => (None, HashMap::new()),
        };

        let ports = resp
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let hosts = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| {
                        format!(
                            "{}:{}",
                            b.host_ip.unwrap_or_default(),
                            b.host_port.unwrap_or_default()
                        )
                    })
                    .collect();
                (port, hosts)
            })
            .collect();

        Ok(RuntimeContainer {
            id: resp.id.unwrap_or_else(|| id.to_string()),
            name: resp
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            status,
            image: image.or(resp.image).unwrap_or_default(),
            created: resp.created,
            ports,
            labels: labels.into_iter().collect(),
        })
    }

    async fn container_logs(&self, id: &str, tail: usize) -> RuntimeResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            logs.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(logs)
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => {
                serde_json::to_value(stats).map_err(|e| RuntimeError::Failed(e.to_string()))
            }
            Some(Err(e)) => Err(classify(e)),
            None => Err(RuntimeError::Failed(format!("no stats reported for {id}"))),
        }
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        let (from_image, tag) = split_image_reference(reference);
        info!(image = %reference, "pulling image");

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let info = msg.map_err(classify)?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Failed(error));
            }
            if let Some(status) = info.status {
                debug!(image = %reference, "{}", status);
            }
        }

        info!(image = %reference, "image pulled");
        Ok(())
    }
}
