use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{error, info, warn};

use super::runtime::{ContainerRuntime, RuntimeError};
use super::spec::{LaunchSpec, NETWORK_LABEL, SERVICE_LABEL, managed_filter};
use super::types::{ContainerInfo, ContainerStatus, ManagedService, ServiceConfig};
use crate::lib::error::{OrchestratorError, Result};

/// One registry entry. `op` serialises lifecycle operations on the name;
/// `state` is only held for short reads and writes, never across a runtime call.
struct ServiceSlot {
    op: Arc<Mutex<()>>,
    state: Mutex<ManagedService>,
    retired: AtomicBool,
}

impl ServiceSlot {
    fn new(name: &str) -> Self {
        ServiceSlot {
            op: Arc::new(Mutex::new(())),
            state: Mutex::new(ManagedService::absent(name)),
            retired: AtomicBool::new(false),
        }
    }

    async fn handle(&self) -> Option<String> {
        self.state.lock().await.handle.clone()
    }

    async fn set_status(&self, status: ContainerStatus) {
        let mut state = self.state.lock().await;
        if state.handle.is_some() {
            state.status = status;
        }
    }

    /// Records a status observed for `handle`, unless the slot moved on to
    /// another instance in the meantime.
    async fn observe(&self, handle: &str, status: ContainerStatus) {
        let mut state = self.state.lock().await;
        if state.handle.as_deref() == Some(handle) {
            state.status = status;
        }
    }
}

type Locked = (Arc<ServiceSlot>, OwnedMutexGuard<()>);

/// Authoritative mapping from service name to its runtime container.
///
/// The runtime is the durable source of truth: the registry is rebuilt from
/// labelled containers on `initialize` and otherwise updated only by the
/// operations below, so drift caused outside the orchestrator surfaces lazily
/// through `list_containers` and `get_container_status`.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    network: String,
    stop_timeout: Duration,
    services: RwLock<HashMap<String, Arc<ServiceSlot>>>,
    released: AtomicBool,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, network: &str, stop_timeout: Duration) -> Self {
        LifecycleManager {
            runtime,
            network: network.to_string(),
            stop_timeout,
            services: RwLock::new(HashMap::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Verifies the runtime connection, ensures the managed network exists and
    /// repopulates the registry from containers labelled as managed.
    ///
    /// An unreachable runtime is returned as `RuntimeUnavailable` and must
    /// abort start-up.
    pub async fn initialize(&self) -> Result<()> {
        if let Err(e) = self.runtime.ping().await {
            error!(error = %e, "container runtime is not reachable");
            return Err(OrchestratorError::RuntimeUnavailable(e.to_string()));
        }
        info!("container runtime connection verified");
        self.released.store(false, Ordering::SeqCst);

        self.ensure_network().await?;

        match self.discover().await {
            Ok(count) => info!(count, "discovered managed containers"),
            Err(e) => error!(error = %e, "failed to discover managed containers"),
        }
        Ok(())
    }

    async fn ensure_network(&self) -> Result<()> {
        if self.runtime.network_exists(&self.network).await? {
            info!(network = %self.network, "using existing network");
            return Ok(());
        }
        let labels = BTreeMap::from([(NETWORK_LABEL.to_string(), "true".to_string())]);
        match self.runtime.create_network(&self.network, labels).await {
            Ok(()) => {
                info!(network = %self.network, "created network");
                Ok(())
            }
            Err(e) => {
                error!(network = %self.network, error = %e, "failed to create network");
                Err(e.into())
            }
        }
    }

    async fn discover(&self) -> Result<usize> {
        let containers = self.runtime.list_labelled(&managed_filter()).await?;
        let mut services = self.services.write().await;
        let mut count = 0;

        for container in containers {
            let Some(name) = container.labels.get(SERVICE_LABEL) else {
                warn!(id = %container.id, "managed container has no service label");
                continue;
            };
            if services.contains_key(name) {
                warn!(service = %name, id = %container.id, "duplicate container for service, ignoring");
                continue;
            }

            let mut service = ManagedService::absent(name);
            service.attach(container.id.clone(), container.status);
            let slot = ServiceSlot {
                op: Arc::new(Mutex::new(())),
                state: Mutex::new(service),
                retired: AtomicBool::new(false),
            };
            services.insert(name.clone(), Arc::new(slot));
            info!(service = %name, id = %container.id, "discovered managed container");
            count += 1;
        }
        Ok(count)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(OrchestratorError::RuntimeUnavailable(
                "runtime connection has been released".to_string(),
            ));
        }
        Ok(())
    }

    async fn lock_existing(&self, name: &str) -> Result<Locked> {
        loop {
            let slot = self
                .services
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| OrchestratorError::not_found(format!("service {name}")))?;
            let guard = slot.op.clone().lock_owned().await;
            if !slot.retired.load(Ordering::SeqCst) {
                return Ok((slot, guard));
            }
        }
    }

    async fn lock_or_insert(&self, name: &str) -> Locked {
        loop {
            let slot = self
                .services
                .write()
                .await
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServiceSlot::new(name)))
                .clone();
            let guard = slot.op.clone().lock_owned().await;
            if !slot.retired.load(Ordering::SeqCst) {
                return (slot, guard);
            }
        }
    }

    /// Drops the registry entry if it no longer references a container.
    /// Must be called while holding the slot's operation lock.
    async fn release_if_absent(&self, name: &str, slot: &Arc<ServiceSlot>) {
        if slot.handle().await.is_some() {
            return;
        }
        slot.retired.store(true, Ordering::SeqCst);
        let mut services = self.services.write().await;
        if services.get(name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            services.remove(name);
        }
    }

    async fn slot(&self, name: &str) -> Option<Arc<ServiceSlot>> {
        self.services.read().await.get(name).cloned()
    }

    async fn require_handle(name: &str, slot: &ServiceSlot) -> Result<String> {
        slot.handle()
            .await
            .ok_or_else(|| OrchestratorError::not_found(format!("service {name} has no container")))
    }

    /// Creates, but does not start, the container for `name`.
    pub async fn create_container(&self, name: &str, config: ServiceConfig) -> Result<()> {
        self.ensure_connected()?;
        let (slot, _guard) = self.lock_or_insert(name).await;
        let result = self.create_locked(name, &slot, &config).await;
        self.release_if_absent(name, &slot).await;
        logged("create", name, result)
    }

    async fn create_locked(
        &self,
        name: &str,
        slot: &ServiceSlot,
        config: &ServiceConfig,
    ) -> Result<()> {
        if let Some(id) = slot.handle().await {
            return Err(OrchestratorError::conflict(format!(
                "service {name} already has container {id}"
            )));
        }

        let spec = LaunchSpec::build(name, config, &self.network)?;
        let id = self.runtime.create_container(&spec).await?;

        for network in config.networks.iter().filter(|n| **n != self.network) {
            if let Err(e) = self.runtime.connect_network(network, &id).await {
                if let Err(undo) = self.runtime.remove_container(&id, true).await {
                    error!(service = name, id = %id, error = %undo, "failed to discard half-created container");
                }
                return Err(OrchestratorError::failed(format!(
                    "failed to attach {name} to network {network}: {e}"
                )));
            }
        }

        let mut state = slot.state.lock().await;
        state.attach(id, ContainerStatus::Created);
        state.config = Some(config.clone());
        Ok(())
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        let result = match self.lock_existing(name).await {
            Ok((slot, _guard)) => self.start_locked(name, &slot).await,
            Err(e) => Err(e),
        };
        logged("start", name, result)
    }

    async fn start_locked(&self, name: &str, slot: &ServiceSlot) -> Result<()> {
        let id = Self::require_handle(name, slot).await?;
        self.runtime.start_container(&id).await?;
        slot.set_status(ContainerStatus::Running).await;
        Ok(())
    }

    pub async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let result = match self.lock_existing(name).await {
            Ok((slot, _guard)) => self.stop_locked(name, &slot, timeout).await,
            Err(e) => Err(e),
        };
        logged("stop", name, result)
    }

    async fn stop_locked(&self, name: &str, slot: &ServiceSlot, timeout: Duration) -> Result<()> {
        let id = Self::require_handle(name, slot).await?;
        let previous = slot.state.lock().await.status;
        slot.set_status(ContainerStatus::Stopping).await;

        match self.runtime.stop_container(&id, timeout).await {
            Ok(()) => {
                slot.set_status(ContainerStatus::Stopped).await;
                Ok(())
            }
            Err(e) => {
                slot.set_status(previous).await;
                Err(e.into())
            }
        }
    }

    pub async fn restart_container(&self, name: &str, timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let result = match self.lock_existing(name).await {
            Ok((slot, _guard)) => self.restart_locked(name, &slot, timeout).await,
            Err(e) => Err(e),
        };
        logged("restart", name, result)
    }

    async fn restart_locked(
        &self,
        name: &str,
        slot: &ServiceSlot,
        timeout: Duration,
    ) -> Result<()> {
        let id = Self::require_handle(name, slot).await?;
        let previous = slot.state.lock().await.status;
        slot.set_status(ContainerStatus::Restarting).await;

        match self.runtime.restart_container(&id, timeout).await {
            Ok(()) => {
                slot.set_status(ContainerStatus::Running).await;
                Ok(())
            }
            Err(e) => {
                slot.set_status(previous).await;
                Err(e.into())
            }
        }
    }

    /// Removes the container and its registry entry. A running container is
    /// stopped first unless `force` is set, in which case removal is forced.
    pub async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        self.ensure_connected()?;
        let result = match self.lock_existing(name).await {
            Ok((slot, _guard)) => {
                let result = self.remove_locked(name, &slot, force).await;
                self.release_if_absent(name, &slot).await;
                result
            }
            Err(e) => Err(e),
        };
        logged("remove", name, result)
    }

    async fn remove_locked(&self, name: &str, slot: &ServiceSlot, force: bool) -> Result<()> {
        let id = Self::require_handle(name, slot).await?;

        if !force {
            match self.runtime.inspect_container(&id).await {
                Ok(container)
                    if matches!(
                        container.status,
                        ContainerStatus::Running | ContainerStatus::Restarting
                    ) =>
                {
                    self.stop_locked(name, slot, self.stop_timeout).await?;
                }
                Ok(_) => {}
                Err(RuntimeError::NotFound(_)) => {
                    warn!(service = name, id = %id, "container vanished outside the orchestrator");
                    slot.state.lock().await.detach();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.runtime.remove_container(&id, force).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => {
                warn!(service = name, id = %id, "container already gone from runtime");
            }
            Err(e) => return Err(e.into()),
        }
        slot.state.lock().await.detach();
        Ok(())
    }

    /// Replaces the container of `name` with one built from `config`:
    /// stop, remove, pull, create, start. A failure once the old container is
    /// gone leaves the service without any container.
    pub async fn update_container(&self, name: &str, config: ServiceConfig) -> Result<()> {
        self.ensure_connected()?;
        let result = match self.lock_existing(name).await {
            Ok((slot, _guard)) => {
                let result = self.update_locked(name, &slot, &config).await;
                self.release_if_absent(name, &slot).await;
                result
            }
            Err(e) => Err(e),
        };
        logged("update", name, result)
    }

    async fn update_locked(
        &self,
        name: &str,
        slot: &ServiceSlot,
        config: &ServiceConfig,
    ) -> Result<()> {
        // Reject a bad config before the running instance is touched.
        LaunchSpec::build(name, config, &self.network)?;

        // A non-forced removal stops a running container first and treats one
        // that vanished from the runtime as already gone.
        if slot.handle().await.is_some() {
            self.remove_locked(name, slot, false).await?;
        }

        let result = self.replace_locked(name, slot, config).await;
        if result.is_err() {
            if let Some(id) = slot.handle().await {
                match self.runtime.remove_container(&id, true).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => slot.state.lock().await.detach(),
                    Err(e) => {
                        error!(service = name, id = %id, error = %e, "failed to discard replacement container");
                        slot.set_status(ContainerStatus::Error).await;
                    }
                }
            }
        }
        result
    }

    async fn replace_locked(
        &self,
        name: &str,
        slot: &ServiceSlot,
        config: &ServiceConfig,
    ) -> Result<()> {
        self.runtime.pull_image(&config.image).await?;
        self.create_locked(name, slot, config).await?;
        self.start_locked(name, slot).await
    }

    /// Fetches `reference`. Not retried here.
    pub async fn pull_image(&self, reference: &str) -> Result<()> {
        self.ensure_connected()?;
        match self.runtime.pull_image(reference).await {
            Ok(()) => {
                info!(image = reference, "pulled image");
                Ok(())
            }
            Err(e) => {
                error!(image = reference, error = %e, "failed to pull image");
                Err(e.into())
            }
        }
    }

    /// Reconciled snapshot of every registered service, re-read from the
    /// runtime. Containers that vanished externally are reported with an
    /// `error` status instead of being dropped.
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.ensure_connected()?;
        let slots: Vec<(String, Arc<ServiceSlot>)> = self
            .services
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let snapshots = join_all(
            slots
                .iter()
                .map(|(name, slot)| self.reconcile(name, slot)),
        )
        .await;

        let mut infos: Vec<ContainerInfo> = snapshots.into_iter().flatten().collect();
        infos.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(infos)
    }

    async fn reconcile(&self, name: &str, slot: &ServiceSlot) -> Option<ContainerInfo> {
        let id = slot.handle().await?;
        match self.runtime.inspect_container(&id).await {
            Ok(container) => {
                slot.observe(&id, container.status).await;
                Some(ContainerInfo::from_runtime(name, container))
            }
            Err(e) => {
                slot.observe(&id, ContainerStatus::Error).await;
                let message = match e {
                    RuntimeError::NotFound(_) => {
                        format!("container {id} no longer exists in the runtime")
                    }
                    other => format!("failed to inspect container {id}: {other}"),
                };
                Some(ContainerInfo::with_error(name, Some(id), message))
            }
        }
    }

    /// Runtime-reported status; `Unknown` for names that are not registered.
    pub async fn get_container_status(&self, name: &str) -> ContainerStatus {
        let Some(slot) = self.slot(name).await else {
            return ContainerStatus::Unknown;
        };
        let Some(id) = slot.handle().await else {
            return ContainerStatus::Absent;
        };
        if self.ensure_connected().is_err() {
            return ContainerStatus::Error;
        }

        match self.runtime.inspect_container(&id).await {
            Ok(container) => {
                slot.observe(&id, container.status).await;
                container.status
            }
            Err(e) => {
                warn!(service = name, error = %e, "failed to read container status");
                ContainerStatus::Error
            }
        }
    }

    pub async fn get_container_logs(&self, name: &str, tail: usize) -> Option<String> {
        let id = self.readable_handle(name).await?;
        match self.runtime.container_logs(&id, tail).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                error!(service = name, error = %e, "failed to read container logs");
                None
            }
        }
    }

    pub async fn get_container_stats(&self, name: &str) -> Option<serde_json::Value> {
        let id = self.readable_handle(name).await?;
        match self.runtime.container_stats(&id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(service = name, error = %e, "failed to read container stats");
                None
            }
        }
    }

    async fn readable_handle(&self, name: &str) -> Option<String> {
        if self.ensure_connected().is_err() {
            return None;
        }
        self.slot(name).await?.handle().await
    }

    /// Desired configuration the current container was created from, if the
    /// orchestrator created it (discovered containers carry none).
    pub async fn service_config(&self, name: &str) -> Option<ServiceConfig> {
        self.slot(name).await?.state.lock().await.config.clone()
    }

    pub async fn managed_count(&self) -> usize {
        self.services.read().await.len()
    }

    /// Releases the runtime connection; later runtime calls fail with
    /// `RuntimeUnavailable`.
    pub async fn cleanup(&self) {
        self.released.store(true, Ordering::SeqCst);
        info!("container runtime connection released");
    }
}

fn logged<T>(op: &str, name: &str, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => info!(service = name, "{} succeeded", op),
        Err(e) => error!(service = name, error = %e, "{} failed", op),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::super::fake::FakeRuntime;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    async fn manager() -> (Arc<FakeRuntime>, LifecycleManager) {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = LifecycleManager::new(runtime.clone(), "homie_network", TIMEOUT);
        manager.initialize().await.unwrap();
        (runtime, manager)
    }

    #[tokio::test]
    async fn initialize_fails_fatally_when_runtime_is_unreachable() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_reachable(false);
        let manager = LifecycleManager::new(runtime, "homie_network", TIMEOUT);

        assert!(matches!(
            manager.initialize().await,
            Err(OrchestratorError::RuntimeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn initialize_creates_labelled_network_once() {
        let (runtime, manager) = manager().await;
        let labels = runtime.network_labels("homie_network").unwrap();
        assert_eq!(labels.get(NETWORK_LABEL).map(String::as_str), Some("true"));

        manager.initialize().await.unwrap();
        assert_eq!(runtime.calls_to("create_network"), 1);
    }

    #[tokio::test]
    async fn initialize_rediscovers_managed_containers() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed_managed("db", ContainerStatus::Running);
        runtime.seed_unmanaged("stray");
        let manager = LifecycleManager::new(runtime.clone(), "homie_network", TIMEOUT);
        manager.initialize().await.unwrap();

        let listed = manager.list_containers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].service, "db");
        assert_eq!(manager.get_container_status("db").await, ContainerStatus::Running);
        assert!(manager.service_config("db").await.is_none());
    }

    #[tokio::test]
    async fn created_container_is_listed_in_created_state() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx:1.27"))
            .await
            .unwrap();

        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Created);
        let listed = manager.list_containers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].service, "web");
        assert_eq!(listed[0].image.as_deref(), Some("nginx:1.27"));
        assert_eq!(listed[0].name.as_deref(), Some("homie_web"));

        let container = runtime.container_named("homie_web").unwrap();
        assert_eq!(container.labels.get(SERVICE_LABEL).map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let (_runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();

        assert!(matches!(
            manager
                .create_container("web", ServiceConfig::new("nginx"))
                .await,
            Err(OrchestratorError::Conflict(_))
        ));
        assert_eq!(manager.managed_count().await, 1);
    }

    #[tokio::test]
    async fn failed_create_leaves_no_registry_entry() {
        let (runtime, manager) = manager().await;
        runtime.fail("create_container");

        assert!(
            manager
                .create_container("web", ServiceConfig::new("nginx"))
                .await
                .is_err()
        );
        assert_eq!(manager.managed_count().await, 0);
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Unknown);

        let mut bad = ServiceConfig::new("nginx");
        bad.memory_limit = Some("plenty".to_string());
        runtime.heal("create_container");
        assert!(matches!(
            manager.create_container("web", bad).await,
            Err(OrchestratorError::InvalidConfig(_))
        ));
        assert_eq!(manager.managed_count().await, 0);
    }

    #[tokio::test]
    async fn failed_network_attach_discards_the_container() {
        let (runtime, manager) = manager().await;
        runtime.fail("connect_network");
        let mut config = ServiceConfig::new("nginx");
        config.networks.push("frontend".to_string());

        assert!(manager.create_container("web", config).await.is_err());
        assert!(runtime.container_named("homie_web").is_none());
        assert_eq!(manager.managed_count().await, 0);
    }

    #[tokio::test]
    async fn lifecycle_calls_on_unknown_service_return_not_found() {
        let (_runtime, manager) = manager().await;

        assert!(matches!(
            manager.start_container("ghost").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            manager.stop_container("ghost", TIMEOUT).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            manager.restart_container("ghost", TIMEOUT).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert_eq!(manager.get_container_status("ghost").await, ContainerStatus::Unknown);
        assert!(manager.get_container_logs("ghost", 10).await.is_none());
        assert!(manager.get_container_stats("ghost").await.is_none());
    }

    #[tokio::test]
    async fn start_stop_restart_track_status() {
        let (_runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();

        manager.start_container("web").await.unwrap();
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Running);

        manager.stop_container("web", TIMEOUT).await.unwrap();
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Exited);

        manager.restart_container("web", TIMEOUT).await.unwrap();
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Running);

        assert!(manager.get_container_logs("web", 5).await.is_some());
        assert!(manager.get_container_stats("web").await.is_some());
    }

    #[tokio::test]
    async fn remove_stops_a_running_container_first() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();

        manager.remove_container("web", false).await.unwrap();

        let calls = runtime.calls();
        let stop = calls.iter().position(|c| c == "stop_container").unwrap();
        let remove = calls.iter().position(|c| c == "remove_container").unwrap();
        assert!(stop < remove);
        assert!(runtime.container_named("homie_web").is_none());
        assert_eq!(manager.managed_count().await, 0);
    }

    #[tokio::test]
    async fn forced_remove_skips_the_stop() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();

        manager.remove_container("web", true).await.unwrap();

        assert_eq!(runtime.calls_to("stop_container"), 0);
        assert!(runtime.container_named("homie_web").is_none());
    }

    #[tokio::test]
    async fn second_remove_reports_not_found() {
        let (_runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();

        manager.remove_container("web", false).await.unwrap();
        assert!(matches!(
            manager.remove_container("web", false).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_replaces_container_with_new_image() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx:1.26"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();
        let old_id = runtime.container_named("homie_web").unwrap().id;

        manager
            .update_container("web", ServiceConfig::new("nginx:1.27"))
            .await
            .unwrap();

        let container = runtime.container_named("homie_web").unwrap();
        assert_ne!(container.id, old_id);
        assert_eq!(container.image, "nginx:1.27");
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Running);
        assert_eq!(
            manager.service_config("web").await.map(|c| c.image),
            Some("nginx:1.27".to_string())
        );

        let calls = runtime.calls();
        let first_stop = calls.iter().position(|c| c == "stop_container").unwrap();
        let order: Vec<&str> = calls[first_stop..]
            .iter()
            .map(String::as_str)
            .filter(|c| *c != "inspect_container")
            .collect();
        assert_eq!(
            order,
            vec![
                "stop_container",
                "remove_container",
                "pull_image",
                "create_container",
                "start_container"
            ]
        );
    }

    #[tokio::test]
    async fn update_failure_after_removal_leaves_service_absent() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx:1.26"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();
        runtime.fail("pull_image");

        assert!(
            manager
                .update_container("web", ServiceConfig::new("nginx:1.27"))
                .await
                .is_err()
        );

        let status = manager.get_container_status("web").await;
        assert!(matches!(status, ContainerStatus::Unknown | ContainerStatus::Absent));
        assert!(runtime.container_named("homie_web").is_none());
        assert!(manager.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_failure_on_start_discards_the_replacement() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx:1.26"))
            .await
            .unwrap();
        runtime.fail("start_container");

        assert!(
            manager
                .update_container("web", ServiceConfig::new("nginx:1.27"))
                .await
                .is_err()
        );
        assert!(runtime.container_named("homie_web").is_none());
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Unknown);
    }

    #[tokio::test]
    async fn update_with_invalid_config_keeps_the_running_instance() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx:1.26"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();

        let mut bad = ServiceConfig::new("nginx:1.27");
        bad.ports.push("not-a-port".to_string());
        assert!(matches!(
            manager.update_container("web", bad).await,
            Err(OrchestratorError::InvalidConfig(_))
        ));
        assert_eq!(runtime.calls_to("stop_container"), 0);
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn update_recovers_a_container_that_vanished_externally() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx:1.26"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();
        runtime.vanish("homie_web");

        manager
            .update_container("web", ServiceConfig::new("nginx:1.27"))
            .await
            .unwrap();

        let container = runtime.container_named("homie_web").unwrap();
        assert_eq!(container.image, "nginx:1.27");
        assert_eq!(container.status, ContainerStatus::Running);
        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Running);
        assert_eq!(runtime.calls_to("stop_container"), 0);
    }

    #[tokio::test]
    async fn vanished_container_is_reported_as_error_not_dropped() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();
        manager
            .create_container("db", ServiceConfig::new("postgres"))
            .await
            .unwrap();
        runtime.vanish("homie_web");

        let listed = manager.list_containers().await.unwrap();
        assert_eq!(listed.len(), 2);
        let web = listed.iter().find(|c| c.service == "web").unwrap();
        assert_eq!(web.status, ContainerStatus::Error);
        assert!(web.error.is_some());
        let db = listed.iter().find(|c| c.service == "db").unwrap();
        assert_eq!(db.status, ContainerStatus::Created);
    }

    #[tokio::test]
    async fn external_drift_surfaces_on_next_read() {
        let (runtime, manager) = manager().await;
        manager
            .create_container("web", ServiceConfig::new("nginx"))
            .await
            .unwrap();
        manager.start_container("web").await.unwrap();
        runtime.set_status("homie_web", ContainerStatus::Exited);

        assert_eq!(manager.get_container_status("web").await, ContainerStatus::Exited);
    }

    #[tokio::test]
    async fn concurrent_operations_on_one_name_stay_consistent() {
        let (runtime, manager) = manager().await;
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let _ = manager
                    .create_container("web", ServiceConfig::new("nginx"))
                    .await;
                let _ = manager.start_container("web").await;
                let _ = manager.remove_container("web", false).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let registered = manager.managed_count().await;
        let live = runtime.container_named("homie_web").is_some();
        assert_eq!(registered == 1, live);
    }

    #[tokio::test]
    async fn released_runtime_rejects_lifecycle_calls() {
        let (_runtime, manager) = manager().await;
        manager.cleanup().await;

        assert!(matches!(
            manager
                .create_container("web", ServiceConfig::new("nginx"))
                .await,
            Err(OrchestratorError::RuntimeUnavailable(_))
        ));
        assert!(manager.list_containers().await.is_err());
    }
}
