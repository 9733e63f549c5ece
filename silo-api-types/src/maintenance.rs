use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Counters reported by the maintenance (colour/sweep) passes.
pub struct MaintenanceStatus {
    /// Number of live packfiles examined.
    pub packfiles_examined: usize,
    /// Number of packfiles tombstoned by the colour pass.
    pub packfiles_coloured: usize,
    /// Number of unknown packfiles adopted (tombstoned) by the colour pass.
    pub packfiles_adopted: usize,
    /// Number of packfiles physically removed by the sweep pass.
    pub packfiles_swept: usize,
    /// Number of tombstoned packfiles re-referenced and un-coloured.
    pub packfiles_uncoloured: usize,
    /// Number of tombstoned packfiles still inside the grace window.
    pub packfiles_pending: usize,
    /// Bytes reclaimed by the sweep pass.
    pub removed_bytes: u64,
    /// Number of blob records tombstoned alongside swept packfiles.
    pub blobs_tombstoned: usize,
    /// Number of orphan blob records tombstoned.
    pub orphans_tombstoned: usize,
    /// Per-item failures that were logged and skipped.
    pub item_errors: usize,
}

impl Default for MaintenanceStatus {
    fn default() -> Self {
        MaintenanceStatus {
            packfiles_examined: 0,
            packfiles_coloured: 0,
            packfiles_adopted: 0,
            packfiles_swept: 0,
            packfiles_uncoloured: 0,
            packfiles_pending: 0,
            removed_bytes: 0,
            blobs_tombstoned: 0,
            orphans_tombstoned: 0,
            item_errors: 0,
        }
    }
}
