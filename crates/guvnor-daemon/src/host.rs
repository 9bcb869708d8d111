//! Facts about the machine the daemon runs on.

use std::time::Instant;

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Point-in-time resource figures. Memory is in bytes, uptimes in seconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Unix time in milliseconds.
    pub time: i64,
    pub uptime: u64,
    pub daemon_uptime: u64,
    pub free_memory: u64,
    pub total_memory: u64,
    pub load_average: LoadAverage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetails {
    pub hostname: String,
    #[serde(rename = "type")]
    pub os_type: String,
    pub platform: String,
    pub arch: String,
    pub release: String,
    pub guvnor: String,
}

/// Collects [`ServerStatus`] and [`ServerDetails`]; remembers when the daemon
/// started.
#[derive(Debug)]
pub struct HostInfo {
    started: Instant,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self { started: Instant::now() }
    }
}

impl HostInfo {
    pub fn status(&self) -> ServerStatus {
        let mut sys = System::new();
        sys.refresh_memory();
        let load = System::load_average();

        ServerStatus {
            time: chrono::Utc::now().timestamp_millis(),
            uptime: System::uptime(),
            daemon_uptime: self.started.elapsed().as_secs(),
            free_memory: sys.available_memory(),
            total_memory: sys.total_memory(),
            load_average: LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            },
        }
    }

    pub fn details(&self) -> ServerDetails {
        let unknown = || "unknown".to_string();
        ServerDetails {
            hostname: System::host_name().unwrap_or_else(unknown),
            os_type: System::name().unwrap_or_else(unknown),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            release: System::kernel_version().unwrap_or_else(unknown),
            guvnor: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
