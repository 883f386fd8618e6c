use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target row count for batches produced by operators that build new batches.
    pub batch_size_rows: usize,
    /// Soft memory budget shared by all pipeline breakers of one plan.
    pub mem_budget_bytes: usize,
    /// Sink queue depth (in batches) above which the input edge is paused.
    pub sink_pause_watermark: usize,
    /// Sink queue depth at or below which a paused input edge is resumed.
    pub sink_resume_watermark: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            mem_budget_bytes: 512 * 1024 * 1024,
            sink_pause_watermark: 8,
            sink_resume_watermark: 2,
        }
    }
}
