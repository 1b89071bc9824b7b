//! Accelerator capability probing via nvidia-smi.
//!
//! Total device memory cannot change at runtime, so the probe result is
//! cached for the process lifetime. Usage queries are never cached.

use std::process::Command;
use std::sync::OnceLock;

use crate::log_info;

pub const MIB_PER_GIB: f64 = 1024.0;

static TOTAL_VRAM_GB: OnceLock<Option<f64>> = OnceLock::new();

/// Total device memory in GiB, or `None` when no compatible accelerator is
/// present. Safe to call repeatedly; the first answer is cached.
pub fn probe_total_vram_gb() -> Option<f64> {
    *TOTAL_VRAM_GB.get_or_init(|| {
        let probed = query_smi("memory.total").and_then(|out| parse_smi_mib(&out));
        match probed {
            Some(gb) => log_info!("Detected {gb:.1}GB total VRAM"),
            None => log_info!("No compatible accelerator detected (nvidia-smi unavailable)"),
        }
        probed
    })
}

/// Current (used, total) device memory in GiB. Uncached; feeds status
/// reporting and is allowed to fail quietly on accelerator-less hosts.
pub fn query_vram_usage_gb() -> Option<(f64, f64)> {
    let out = query_smi("memory.used,memory.total")?;
    parse_smi_used_total(&out)
}

fn query_smi(fields: &str) -> Option<String> {
    let query = format!("--query-gpu={fields}");
    let output = Command::new("nvidia-smi")
        .args([query.as_str(), "--format=csv,noheader,nounits"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Parse a single MiB value from nvidia-smi csv output into GiB.
pub(crate) fn parse_smi_mib(raw: &str) -> Option<f64> {
    // Multi-GPU hosts report one line per device; the pipeline only ever
    // occupies device 0.
    let first_line = raw.lines().next()?;
    first_line
        .trim()
        .parse::<f64>()
        .ok()
        .map(|mib| mib / MIB_PER_GIB)
}

/// Parse a "used, total" MiB pair into GiB.
pub(crate) fn parse_smi_used_total(raw: &str) -> Option<(f64, f64)> {
    let first_line = raw.lines().next()?;
    let mut fields = first_line.split(',');
    let used = fields.next()?.trim().parse::<f64>().ok()?;
    let total = fields.next()?.trim().parse::<f64>().ok()?;
    Some((used / MIB_PER_GIB, total / MIB_PER_GIB))
}
