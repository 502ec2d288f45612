//! Loading of instance configuration files and device metadata.
//!
//! - `{instance}/configs/remote_functions.json`: names to host URLs for the
//!   `rpcCall` import, created empty when absent and read-only after startup.
//! - `{instance}/configs/device-description.json`: static Web of Things
//!   document served at `/.well-known/wot-thing-description`.
//! - Live platform information (CPU, memory, network) gathered with `sysinfo`
//!   for the device description and the health probe.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::error;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::{Networks, System};

use crate::util::constants::{INSTANCE_PATH, SUPERVISOR_INTERFACES};

/// One entry of the remote-functions table.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFunctionSpec {
    pub host: String,
}

/// Process-wide remote-functions table, loaded once at startup.
pub static REMOTE_FUNCTIONS: Lazy<HashMap<String, RemoteFunctionSpec>> =
    Lazy::new(load_remote_functions);

static SYSTEM: Lazy<Mutex<System>> = Lazy::new(|| Mutex::new(System::new_all()));

/// Path to the config directory: `{instance}/configs`.
pub fn config_dir() -> PathBuf {
    INSTANCE_PATH.join("configs")
}

/// Open a JSON file, creating it with the given default content when missing.
pub fn check_open(path: &Path, default_obj: &Value) -> io::Result<String> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let content =
            serde_json::to_string_pretty(default_obj).unwrap_or_else(|_| "{}".to_string());
        file.write_all(content.as_bytes())?;
    }
    fs::read_to_string(path)
}

fn load_remote_functions() -> HashMap<String, RemoteFunctionSpec> {
    let path = config_dir().join("remote_functions.json");
    let content = match check_open(&path, &json!({})) {
        Ok(content) => content,
        Err(e) => {
            error!("Could not open or create {}: {}", path.display(), e);
            return HashMap::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(table) => table,
        Err(e) => {
            error!("Invalid JSON in {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

/// Device description advertised to the orchestrator: live platform info plus
/// the host imports this supervisor provides.
pub fn get_device_description() -> Value {
    json!({
        "platform": get_device_platform_info(),
        "supervisorInterfaces": SUPERVISOR_INTERFACES.to_vec(),
    })
}

/// The static Web of Things Thing Description from the config directory.
pub fn get_wot_td() -> anyhow::Result<Value> {
    let path = config_dir().join("device-description.json");
    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Live CPU, memory and network figures gathered with `sysinfo`.
pub fn get_device_platform_info() -> Value {
    let (memory_bytes, cpu_name, cpu_architecture, clock_speed_hz, core_count, system) = {
        let mut sys = SYSTEM.lock();
        sys.refresh_all();

        let cpu0 = sys.cpus().first();
        (
            sys.total_memory(),
            cpu0.map(|c| c.brand().to_string()).unwrap_or_default(),
            System::cpu_arch(),
            cpu0.map(|c| c.frequency() * 1_000_000).unwrap_or_default(),
            sys.cpus().len(),
            json!({
                "hostName": System::host_name().unwrap_or_default(),
                "kernel": System::kernel_version().unwrap_or_default(),
                "name": System::name().unwrap_or_default(),
                "os": System::os_version().unwrap_or_default(),
            }),
        )
    };

    let networks = Networks::new_with_refreshed_list();
    let network_map: HashMap<String, Vec<String>> = networks
        .iter()
        .map(|(if_name, data)| {
            let ips = data.ip_networks().iter().map(|ip| ip.to_string()).collect();
            (if_name.clone(), ips)
        })
        .collect();

    json!({
        "cpu": {
            "architecture": cpu_architecture,
            "clockSpeedHz": clock_speed_hz,
            "coreCount": core_count,
            "humanReadableName": cpu_name,
        },
        "memory": { "totalBytes": memory_bytes },
        "network": network_map,
        "system": system,
    })
}

/// Current CPU and memory usage for the health probe.
pub fn get_health_report() -> Value {
    let mut sys = SYSTEM.lock();
    sys.refresh_cpu_all();
    sys.refresh_memory();
    let memory_usage = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64
    } else {
        0.0
    };
    json!({
        "cpuUsage": sys.global_cpu_usage(),
        "memoryUsage": memory_usage,
    })
}
