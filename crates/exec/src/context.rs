//! Execution context bound to one plan.

use std::sync::Arc;

use brook_common::{BrookError, EngineConfig, MemoryPool, MetricsRegistry, Result};

/// Capabilities and knobs handed to a plan at construction.
///
/// Immutable once the plan is created. The memory pool is shared by the
/// plan's pipeline breakers; the runtime handle, when present, runs source
/// pull loops as spawned tasks (without it, sources drain synchronously on
/// the thread that calls `start_producing`).
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Target row count for operators that build new batches.
    pub batch_size_rows: usize,
    /// Breaker accumulator budget.
    pub memory: Arc<MemoryPool>,
    /// Optional executor for asynchronous source production.
    pub runtime: Option<tokio::runtime::Handle>,
    /// Node-level counters.
    pub metrics: MetricsRegistry,
    /// Sink queue depth above which the sink pauses its input.
    pub sink_pause_watermark: usize,
    /// Sink queue depth at or below which a paused input is resumed.
    pub sink_resume_watermark: usize,
}

impl ExecContext {
    /// Build a context from engine config, optionally with an executor.
    pub fn from_config(config: &EngineConfig, runtime: Option<tokio::runtime::Handle>) -> Self {
        Self {
            batch_size_rows: config.batch_size_rows,
            memory: MemoryPool::new(
                config.mem_budget_bytes,
                config.batch_size_rows,
                (config.batch_size_rows / 32).max(1),
            ),
            runtime,
            metrics: MetricsRegistry::new(),
            sink_pause_watermark: config.sink_pause_watermark,
            sink_resume_watermark: config.sink_resume_watermark,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size_rows == 0 {
            return Err(BrookError::InvalidConfig(
                "batch_size_rows must be positive".to_string(),
            ));
        }
        if self.sink_resume_watermark >= self.sink_pause_watermark {
            return Err(BrookError::InvalidConfig(format!(
                "sink resume watermark {} must be below pause watermark {}",
                self.sink_resume_watermark, self.sink_pause_watermark
            )));
        }
        Ok(())
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), None)
    }
}

/// Shared context alias used across node constructors.
pub type SharedExecContext = Arc<ExecContext>;
