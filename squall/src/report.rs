// Session report accounting
//
// Every drained stream and every compile batch folds its numbers in
// here. The analyzer can snapshot this at any time with a state
// request, and the final snapshot goes out when the session ends.
//
// Austin Shafer - 2025

extern crate serde;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    /// Messages the GPU exported across all streams
    pub exported_messages: u64,
    /// Messages that survived the filter pre-pass and reached handlers
    pub filtered_messages: u64,
    /// Stream overflow occurrences (not message counts)
    pub overflows: u64,
    /// Messages written after the latent readback snapshot was taken
    pub latent_undershoots: u64,
    /// Readback snapshots that claimed more than the final count
    pub latent_overshoots: u64,

    /// Per-feature report counts
    pub uninitialized_reports: u64,
    pub out_of_bounds_reports: u64,
    pub descriptor_mismatch_reports: u64,
    /// Messages suppressed because the resource was untracked
    pub suppressed_untracked: u64,

    /// Instrumentation batch bookkeeping
    pub shader_compiles: u64,
    pub failed_shader_compiles: u64,
    pub pipeline_compiles: u64,
    pub failed_pipeline_compiles: u64,
    /// Milliseconds spent in completed compile batches
    pub compile_millis: u64,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a copy of the current totals for egress
    pub fn snapshot(&self) -> Report {
        self.clone()
    }
}
