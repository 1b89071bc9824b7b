//! Offload strategy selection.
//!
//! Maps a detected VRAM budget to one of a closed set of offload tiers, each
//! carrying the flags the render backend needs: precision mode, attention
//! slicing, and whether offload happens per component or per submodule.
//! Selection is a pure function of the budget and the threshold table.

use serde::{Deserialize, Serialize};

use crate::log_warn;

// Default tier boundaries in GiB. A budget equal to a boundary lands in the
// tier whose lower bound it is. Overridable via FLUX_TIER_*_GB.
pub const FULL_RESIDENT_MIN_GB: f64 = 24.0;
pub const BALANCED_OFFLOAD_MIN_GB: f64 = 16.0;
pub const LOW_MEMORY_FLOOR_GB: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffloadTier {
    /// Entire pipeline resident on the accelerator. Fastest.
    FullResident,
    /// Component-level CPU offload. Balanced speed and footprint.
    BalancedOffload,
    /// Submodule-level CPU offload. Slowest, smallest footprint.
    SequentialOffload,
}

impl OffloadTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffloadTier::FullResident => "full-resident",
            OffloadTier::BalancedOffload => "balanced-offload",
            OffloadTier::SequentialOffload => "sequential-offload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Cpu,
}

/// The full offload policy handed to the backend at construction time.
/// Derived once per load; never changed mid-session except through an
/// explicit model switch or reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadStrategy {
    pub tier: OffloadTier,
    pub device: DeviceKind,
    /// bf16 weights instead of f32.
    pub reduced_precision: bool,
    /// Memory-efficient attention / slicing enabled.
    pub attention_slicing: bool,
    /// Submodule-level offload (as opposed to component-level).
    pub sequential_offload: bool,
    /// Budget is below the comfortable floor; quality or resolution may
    /// need reduction.
    pub low_memory: bool,
}

/// Tier boundary table. Thresholds are configuration, not constants baked
/// into the selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub full_gb: f64,
    pub balanced_gb: f64,
    pub low_gb: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        TierThresholds {
            full_gb: FULL_RESIDENT_MIN_GB,
            balanced_gb: BALANCED_OFFLOAD_MIN_GB,
            low_gb: LOW_MEMORY_FLOOR_GB,
        }
    }
}

impl TierThresholds {
    pub fn from_env() -> Self {
        let defaults = TierThresholds::default();
        TierThresholds {
            full_gb: env_threshold("FLUX_TIER_FULL_GB", defaults.full_gb),
            balanced_gb: env_threshold("FLUX_TIER_BALANCED_GB", defaults.balanced_gb),
            low_gb: env_threshold("FLUX_TIER_LOW_GB", defaults.low_gb),
        }
    }
}

fn env_threshold(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_threshold(&v))
        .unwrap_or(default)
}

fn parse_threshold(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// Select the offload strategy for a detected VRAM budget.
pub fn select(budget_gb: f64, thresholds: &TierThresholds) -> OffloadStrategy {
    let tier = if budget_gb >= thresholds.full_gb {
        OffloadTier::FullResident
    } else if budget_gb >= thresholds.balanced_gb {
        OffloadTier::BalancedOffload
    } else {
        OffloadTier::SequentialOffload
    };

    let low_memory = budget_gb < thresholds.low_gb;
    if low_memory {
        log_warn!(
            "Only {budget_gb:.1}GB VRAM detected (floor {:.1}GB): quality or resolution may need reduction",
            thresholds.low_gb
        );
    }

    OffloadStrategy {
        tier,
        device: DeviceKind::Cuda,
        reduced_precision: true,
        attention_slicing: tier != OffloadTier::FullResident,
        sequential_offload: tier == OffloadTier::SequentialOffload,
        low_memory,
    }
}

/// Strategy for hosts without a compatible accelerator. Legal but very slow;
/// the pipeline runs entirely on the CPU in full precision.
pub fn cpu_fallback() -> OffloadStrategy {
    OffloadStrategy {
        tier: OffloadTier::SequentialOffload,
        device: DeviceKind::Cpu,
        reduced_precision: false,
        attention_slicing: true,
        sequential_offload: true,
        low_memory: true,
    }
}
