use serde::{Serialize, Serializer};
use sysinfo::{Disks, System};

const MIB: u64 = 1024 * 1024;

/// Resource usage of the host the orchestrator runs on. Byte counts are kept
/// raw and rendered in MB; percentages are rendered with two decimals.
#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub hostname: String,
    pub system_name: String,
    pub total_cpus: usize,
    #[serde(serialize_with = "percent")]
    pub cpu_usage: f32,
    pub load_average: [f64; 3],
    pub memory: Usage,
    pub swap: Usage,
    #[serde(serialize_with = "percent")]
    pub disk_usage: f32,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Usage {
    #[serde(serialize_with = "megabytes")]
    pub total: u64,
    #[serde(serialize_with = "megabytes")]
    pub used: u64,
}

fn percent<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{value:.2}%"))
}

fn megabytes<S: Serializer>(bytes: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{} MB", bytes / MIB))
}

/// Refreshes the CPU and memory counters of `sysinfo` and takes a snapshot.
pub fn host_stats(sysinfo: &mut System) -> HostStats {
    sysinfo.refresh_cpu_usage();
    sysinfo.refresh_memory();
    let load = System::load_average();

    HostStats {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        system_name: System::name().unwrap_or_else(|| "unknown".to_string()),
        total_cpus: sysinfo.cpus().len(),
        cpu_usage: sysinfo.global_cpu_usage(),
        load_average: [load.one, load.five, load.fifteen],
        memory: Usage {
            total: sysinfo.total_memory(),
            used: sysinfo.used_memory(),
        },
        swap: Usage {
            total: sysinfo.total_swap(),
            used: sysinfo.used_swap(),
        },
        disk_usage: disk_usage_percent(&Disks::new_with_refreshed_list()),
        uptime_secs: System::uptime(),
    }
}

fn disk_usage_percent(disks: &Disks) -> f32 {
    let (total, available) = disks.iter().fold((0u64, 0u64), |(total, available), disk| {
        (total + disk.total_space(), available + disk.available_space())
    });
    if total == 0 {
        return 0.0;
    }
    (total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32
}
