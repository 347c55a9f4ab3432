//! Configuration for the czar and the worker. Loaded once at startup;
//! there is no hot reload.

use serde::{Deserialize, Serialize};

/// Czar-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CzarConfig {
    /// Database that holds merge tables.
    pub result_db: String,
    /// Name under which this czar registers in the query metadata.
    pub czar_name: String,
    /// Per-job dispatch timeout in milliseconds (0 = no timeout).
    #[serde(default)]
    pub dispatch_timeout_ms: u64,
    /// Rows per response frame before the worker starts a continuation chain.
    #[serde(default = "default_max_rows_per_frame")]
    pub max_rows_per_frame: usize,
}

fn default_max_rows_per_frame() -> usize {
    10_000
}

impl Default for CzarConfig {
    fn default() -> Self {
        Self {
            result_db: "condor_result".into(),
            czar_name: "czar0".into(),
            dispatch_timeout_ms: 0,
            max_rows_per_frame: default_max_rows_per_frame(),
        }
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name reported in the first frame of every response stream.
    pub name: String,
    /// Concurrent scan slots (runner threads).
    #[serde(default = "default_scan_slots")]
    pub scan_slots: usize,
    /// Maximum chunks the scheduler may have active at once.
    #[serde(default = "default_max_active_chunks")]
    pub max_active_chunks: usize,
    #[serde(default)]
    pub mem_man: MemManConfig,
}

fn default_scan_slots() -> usize {
    4
}

fn default_max_active_chunks() -> usize {
    2
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker0".into(),
            scan_slots: default_scan_slots(),
            max_active_chunks: default_max_active_chunks(),
            mem_man: MemManConfig::default(),
        }
    }
}

/// Memory-manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemManConfig {
    /// Byte budget available for locked table pages.
    pub budget_bytes: u64,
    /// Assumed size of one locked table when the catalog has no estimate.
    #[serde(default = "default_table_bytes")]
    pub default_table_bytes: u64,
}

fn default_table_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for MemManConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 4 * 1024 * 1024 * 1024,
            default_table_bytes: default_table_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CzarConfig::default();
        assert_eq!(c.result_db, "condor_result");
        assert_eq!(c.max_rows_per_frame, 10_000);

        let w = WorkerConfig::default();
        assert_eq!(w.scan_slots, 4);
        assert_eq!(w.max_active_chunks, 2);
        assert!(w.mem_man.budget_bytes > 0);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let w: WorkerConfig =
            serde_json::from_str(r#"{"name": "w1", "mem_man": {"budget_bytes": 1024}}"#).unwrap();
        assert_eq!(w.name, "w1");
        assert_eq!(w.scan_slots, 4);
        assert_eq!(w.mem_man.budget_bytes, 1024);
        assert_eq!(w.mem_man.default_table_bytes, 64 * 1024 * 1024);
    }
}
