//! In-memory runtime used by tests across the crate.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::runtime::{ContainerRuntime, RuntimeError, RuntimeResult};
use super::spec::{LaunchSpec, MANAGED_LABEL, SERVICE_LABEL, container_name};
use super::types::{ContainerStatus, ContainerSummary, RuntimeContainer};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
}

struct FakeState {
    reachable: bool,
    next_id: u64,
    networks: BTreeMap<String, BTreeMap<String, String>>,
    containers: BTreeMap<String, FakeContainer>,
    failures: HashSet<String>,
    calls: Vec<String>,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime {
            state: Mutex::new(FakeState {
                reachable: true,
                next_id: 1,
                networks: BTreeMap::new(),
                containers: BTreeMap::new(),
                failures: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Makes every later call to `op` fail until `heal` is called.
    pub fn fail(&self, op: &str) {
        self.state.lock().unwrap().failures.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.state.lock().unwrap().failures.remove(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == op)
            .count()
    }

    pub fn network_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().unwrap().networks.get(name).cloned()
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Adds a container that looks like one created by a previous run.
    pub fn seed_managed(&self, service: &str, status: ContainerStatus) -> String {
        let labels = BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (SERVICE_LABEL.to_string(), service.to_string()),
        ]);
        self.seed(&container_name(service), labels, status)
    }

    pub fn seed_unmanaged(&self, name: &str) -> String {
        self.seed(name, BTreeMap::new(), ContainerStatus::Running)
    }

    fn seed(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        status: ContainerStatus,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("c{:04}", state.next_id);
        state.next_id += 1;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image: "seeded:latest".to_string(),
                status,
                labels,
                networks: Vec::new(),
            },
        );
        id
    }

    /// Removes a container behind the orchestrator's back.
    pub fn vanish(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .retain(|_, c| c.name != name);
    }

    /// Changes a container's state behind the orchestrator's back.
    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.values_mut().find(|c| c.name == name) {
            c.status = status;
        }
    }

    fn enter(&self, op: &str) -> RuntimeResult<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op.to_string());
        if !state.reachable {
            return Err(RuntimeError::Unavailable("connection refused".to_string()));
        }
        if state.failures.contains(op) {
            return Err(RuntimeError::Failed(format!("injected {op} failure")));
        }
        Ok(state)
    }
}

fn missing(id: &str) -> RuntimeError {
    RuntimeError::NotFound(format!("no such container: {id}"))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.enter("ping").map(|_| ())
    }

    async fn network_exists(&self, name: &str) -> RuntimeResult<bool> {
        Ok(self.enter("network_exists")?.networks.contains_key(name))
    }

    async fn create_network(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> RuntimeResult<()> {
        let mut state = self.enter("create_network")?;
        if state.networks.contains_key(name) {
            return Err(RuntimeError::Conflict(format!("network {name} exists")));
        }
        state.networks.insert(name.to_string(), labels);
        Ok(())
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()> {
        let mut state = self.enter("connect_network")?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| missing(container_id))?;
        container.networks.push(network.to_string());
        Ok(())
    }

    async fn list_labelled(&self, label: &str) -> RuntimeResult<Vec<ContainerSummary>> {
        let state = self.enter("list_labelled")?;
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        Ok(state
            .containers
            .values()
            .filter(|c| c.labels.get(key).is_some_and(|v| v == value))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                status: c.status,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &LaunchSpec) -> RuntimeResult<String> {
        let mut state = self.enter("create_container")?;
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let id = format!("c{:04}", state.next_id);
        state.next_id += 1;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                status: ContainerStatus::Created,
                labels: spec.labels.clone(),
                networks: vec![spec.network.clone()],
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.enter("start_container")?;
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        let mut state = self.enter("stop_container")?;
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        let mut state = self.enter("restart_container")?;
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let mut state = self.enter("remove_container")?;
        let container = state.containers.get(id).ok_or_else(|| missing(id))?;
        if container.status == ContainerStatus::Running && !force {
            return Err(RuntimeError::Conflict(format!(
                "cannot remove running container {id}"
            )));
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<RuntimeContainer> {
        let state = self.enter("inspect_container")?;
        let container = state.containers.get(id).ok_or_else(|| missing(id))?;
        Ok(RuntimeContainer {
            id: container.id.clone(),
            name: container.name.clone(),
            status: container.status,
            image: container.image.clone(),
            created: Some("2026-01-01T00:00:00Z".to_string()),
            ports: BTreeMap::new(),
            labels: container.labels.clone(),
        })
    }

    async fn container_logs(&self, id: &str, tail: usize) -> RuntimeResult<String> {
        let state = self.enter("container_logs")?;
        let container = state.containers.get(id).ok_or_else(|| missing(id))?;
        Ok((0..tail.min(3))
            .map(|i| format!("{} line {i}\n", container.name))
            .collect())
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<serde_json::Value> {
        let state = self.enter("container_stats")?;
        state.containers.get(id).ok_or_else(|| missing(id))?;
        Ok(serde_json::json!({ "id": id, "memory_stats": { "usage": 1024 } }))
    }

    async fn pull_image(&self, _reference: &str) -> RuntimeResult<()> {
        self.enter("pull_image").map(|_| ())
    }
}
