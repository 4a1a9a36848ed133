//! Remote storage accounting
//!
//! Figures come from listing metadata alone; no record is downloaded or
//! decrypted to compute them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw storage statistics of a vault
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Bytes used by records and image assets
    pub total_bytes: u64,
    pub record_count: u64,
    pub asset_count: u64,
}

impl UsageStats {
    /// Mean encrypted size of an object
    pub fn average_object_size(&self) -> u64 {
        let objects = self.record_count + self.asset_count;
        if objects == 0 {
            0
        } else {
            self.total_bytes / objects
        }
    }
}

/// Storage statistics prepared for display
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub stats: UsageStats,
    pub quota_bytes: Option<u64>,
}

impl UsageReport {
    pub fn new(stats: UsageStats, quota_bytes: Option<u64>) -> Self {
        UsageReport { stats, quota_bytes }
    }

    /// Quota utilization as a percentage, if a quota is configured
    pub fn utilization(&self) -> Option<f64> {
        match self.quota_bytes {
            Some(0) => Some(0.0),
            Some(quota) => Some((self.stats.total_bytes as f64 / quota as f64) * 100.0),
            None => None,
        }
    }

    /// Bytes left before the quota is reached
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.quota_bytes
            .map(|quota| quota.saturating_sub(self.stats.total_bytes))
    }

    pub fn total_human(&self) -> String {
        format_bytes(self.stats.total_bytes)
    }
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} records and {} images (avg {})",
            self.total_human(),
            self.stats.record_count,
            self.stats.asset_count,
            format_bytes(self.stats.average_object_size())
        )?;
        if let (Some(quota), Some(utilization)) = (self.quota_bytes, self.utilization()) {
            write!(f, ", {:.1}% of {}", utilization, format_bytes(quota))?;
        }
        Ok(())
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
