//! Host resource probes.
//!
//! The admission controller never measures the host itself; it samples an
//! injected [`ResourceProbe`] so tests can simulate arbitrary memory and
//! load conditions.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

/// One point-in-time reading of host pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Used physical memory as a percentage of total.
    pub memory_used_percent: f64,
    /// One-minute load average.
    pub load_average: f64,
}

#[cfg_attr(test, automock)]
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceSample>;
}

/// Probe backed by /proc on Linux.
pub struct SystemResourceProbe;

impl ResourceProbe for SystemResourceProbe {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Result<ResourceSample> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let loadavg = std::fs::read_to_string("/proc/loadavg")?;
        Ok(ResourceSample {
            memory_used_percent: parse_memory_used_percent(&meminfo)?,
            load_average: parse_load_average(&loadavg)?,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Result<ResourceSample> {
        anyhow::bail!("system resource probe is only implemented for Linux; inject a probe")
    }
}

#[cfg(target_os = "linux")]
fn parse_meminfo_kb(meminfo: &str, key: &str) -> Result<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("missing '{key}' in /proc/meminfo"))
}

#[cfg(target_os = "linux")]
fn parse_memory_used_percent(meminfo: &str) -> Result<f64> {
    let total = parse_meminfo_kb(meminfo, "MemTotal:")?;
    let available = parse_meminfo_kb(meminfo, "MemAvailable:")?;
    if total == 0 {
        anyhow::bail!("MemTotal reported as zero");
    }
    let used = total.saturating_sub(available);
    Ok(used as f64 / total as f64 * 100.0)
}

#[cfg(target_os = "linux")]
fn parse_load_average(loadavg: &str) -> Result<f64> {
    loadavg
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed /proc/loadavg"))
}
