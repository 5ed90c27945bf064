use std::collections::BTreeMap;

use super::types::ServiceConfig;
use crate::lib::error::{OrchestratorError, Result};

pub const MANAGED_LABEL: &str = "io.homie.managed";
pub const SERVICE_LABEL: &str = "io.homie.service";
pub const NETWORK_LABEL: &str = "io.homie.orchestrator";
pub const CONTAINER_PREFIX: &str = "homie_";

/// CFS period the CPU quota is expressed against, in microseconds.
pub const CPU_PERIOD_US: i64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    /// Runtime key, e.g. `80/tcp`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGrant {
    pub host_path: String,
    pub container_path: String,
    pub permissions: String,
}

/// Runtime-ready launch specification for one container, with every value
/// already translated into the runtime's native units.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub binds: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub devices: Vec<DeviceGrant>,
    pub memory_bytes: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub restart_policy: String,
    pub privileged: bool,
    pub network: String,
}

impl LaunchSpec {
    pub fn build(service: &str, config: &ServiceConfig, network: &str) -> Result<Self> {
        if config.image.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "service {service} has no image"
            )));
        }

        // Orchestrator labels win over user labels of the same key.
        let mut labels = config.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SERVICE_LABEL.to_string(), service.to_string());

        let ports = config
            .ports
            .iter()
            .map(|p| parse_port(p))
            .collect::<Result<Vec<_>>>()?;
        let binds = config
            .volumes
            .iter()
            .map(|v| parse_volume(v))
            .collect::<Result<Vec<_>>>()?;
        let devices = config
            .devices
            .iter()
            .map(|d| parse_device(d))
            .collect::<Result<Vec<_>>>()?;
        let memory_bytes = config.memory_limit.as_deref().map(parse_memory).transpose()?;
        let cpu_quota = config.cpu_limit.map(cpu_quota).transpose()?;

        Ok(LaunchSpec {
            name: container_name(service),
            image: config.image.clone(),
            env: config
                .environment
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            cmd: config.command.as_deref().map(split_words),
            entrypoint: config.entrypoint.as_deref().map(split_words),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            labels,
            ports,
            binds,
            cap_add: config.cap_add.clone(),
            cap_drop: config.cap_drop.clone(),
            devices,
            memory_bytes,
            cpu_period: cpu_quota.map(|_| CPU_PERIOD_US),
            cpu_quota,
            restart_policy: config.restart_policy.clone(),
            privileged: config.privileged,
            network: network.to_string(),
        })
    }
}

pub fn container_name(service: &str) -> String {
    format!("{CONTAINER_PREFIX}{service}")
}

pub fn managed_filter() -> String {
    format!("{MANAGED_LABEL}=true")
}

fn split_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

fn invalid(kind: &str, value: &str) -> OrchestratorError {
    OrchestratorError::InvalidConfig(format!("malformed {kind} {value:?}"))
}

/// `container`, `host:container` or either followed by `/proto`.
pub fn parse_port(value: &str) -> Result<PortMapping> {
    let (ports, protocol) = match value.split_once('/') {
        Some((ports, proto)) => (ports, proto.to_ascii_lowercase()),
        None => (value, "tcp".to_string()),
    };
    if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
        return Err(invalid("port protocol", value));
    }

    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid("port", value));
    let (host_port, container_port) = match ports.split_once(':') {
        Some((host, container)) => (Some(parse(host)?), parse(container)?),
        None => (None, parse(ports)?),
    };
    if container_port == 0 {
        return Err(invalid("port", value));
    }

    Ok(PortMapping {
        host_port,
        container_port,
        protocol,
    })
}

/// `host:container` or `host:container:mode`, returned in the runtime's bind form.
pub fn parse_volume(value: &str) -> Result<String> {
    let parts: Vec<&str> = value.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host, container] => (*host, *container, "rw"),
        [host, container, mode] => (*host, *container, *mode),
        _ => return Err(invalid("volume", value)),
    };
    if host.is_empty() || !container.starts_with('/') {
        return Err(invalid("volume", value));
    }
    if !matches!(mode, "ro" | "rw") {
        return Err(invalid("volume mode", value));
    }
    Ok(format!("{host}:{container}:{mode}"))
}

/// `host`, `host:container` or `host:container:perms`.
pub fn parse_device(value: &str) -> Result<DeviceGrant> {
    let parts: Vec<&str> = value.split(':').collect();
    let grant = match parts.as_slice() {
        [host] => (*host, *host, "rwm"),
        [host, container] => (*host, *container, "rwm"),
        [host, container, perms] => (*host, *container, *perms),
        _ => return Err(invalid("device", value)),
    };
    if grant.0.is_empty()
        || grant.1.is_empty()
        || grant.2.is_empty()
        || !grant.2.chars().all(|c| matches!(c, 'r' | 'w' | 'm'))
    {
        return Err(invalid("device", value));
    }
    Ok(DeviceGrant {
        host_path: grant.0.to_string(),
        container_path: grant.1.to_string(),
        permissions: grant.2.to_string(),
    })
}

/// Plain bytes or a `b`/`k`/`m`/`g` suffixed amount (`512m`, `1g`, `64kb`).
pub fn parse_memory(value: &str) -> Result<i64> {
    let lower = value.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let amount: i64 = digits.parse().map_err(|_| invalid("memory limit", value))?;
    if amount <= 0 {
        return Err(invalid("memory limit", value));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("memory limit", value))
}

pub fn cpu_quota(cpus: f64) -> Result<i64> {
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(OrchestratorError::InvalidConfig(format!(
            "cpu limit must be positive, got {cpus}"
        )));
    }
    Ok((cpus * CPU_PERIOD_US as f64).round() as i64)
}

/// Splits `repo[:tag]` into repository and tag, defaulting the tag to `latest`.
/// Digest references are passed through untouched.
pub fn split_image_reference(reference: &str) -> (String, String) {
    if reference.contains('@') {
        return (reference.to_string(), String::new());
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}
