//! Shared memory-budget helpers.
//!
//! This module provides a lightweight plan-level budget tracker shared by
//! pipeline breakers. Callers reserve bytes for accumulator growth and
//! receive pressure guidance used to shrink target batch sizes when the
//! budget is tight.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pressure level derived from requested vs granted memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Plenty of budget available.
    Normal,
    /// Budget is tight; prefer smaller batches.
    Elevated,
    /// Budget is heavily constrained.
    Critical,
}

/// Runtime hints derived from memory pressure.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressureSignal {
    /// Pressure classification.
    pub pressure: MemoryPressure,
    /// Bytes actually granted to this reservation.
    pub granted_bytes: usize,
    /// Recommended target batch size under this pressure.
    pub suggested_batch_size_rows: usize,
}

/// Shared plan-level budget tracker.
#[derive(Debug)]
pub struct MemoryPool {
    budget_bytes: usize,
    in_use_bytes: AtomicUsize,
    base_batch_size_rows: usize,
    min_batch_size_rows: usize,
}

impl MemoryPool {
    /// Create a pool with a plan-level budget and batch-size bounds.
    #[must_use]
    pub fn new(
        budget_bytes: usize,
        base_batch_size_rows: usize,
        min_batch_size_rows: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
            base_batch_size_rows: base_batch_size_rows.max(1),
            min_batch_size_rows: min_batch_size_rows.max(1),
        })
    }

    /// Bytes currently reserved out of the budget.
    #[must_use]
    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Reserve bytes for one consumer and compute pressure guidance.
    ///
    /// Grants are clamped to the remaining budget rather than failing; the
    /// pressure signal tells the caller how constrained the grant was.
    #[must_use]
    pub fn reserve(self: &Arc<Self>, requested_bytes: usize) -> MemoryReservation {
        if self.budget_bytes == usize::MAX || requested_bytes == 0 {
            let signal = MemoryPressureSignal {
                pressure: MemoryPressure::Normal,
                granted_bytes: requested_bytes,
                suggested_batch_size_rows: self.base_batch_size_rows,
            };
            return MemoryReservation {
                pool: Arc::clone(self),
                reserved_bytes: 0,
                signal,
            };
        }

        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let available = self.budget_bytes.saturating_sub(current);
            let granted = requested_bytes.min(available);
            let next = current.saturating_add(granted);
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let signal = self.signal_for(requested_bytes, granted);
                return MemoryReservation {
                    pool: Arc::clone(self),
                    reserved_bytes: granted,
                    signal,
                };
            }
        }
    }

    fn signal_for(&self, requested: usize, granted: usize) -> MemoryPressureSignal {
        if requested == 0 {
            return MemoryPressureSignal {
                pressure: MemoryPressure::Normal,
                granted_bytes: granted,
                suggested_batch_size_rows: self.base_batch_size_rows,
            };
        }
        let ratio = granted as f64 / requested as f64;
        if ratio >= 0.75 {
            MemoryPressureSignal {
                pressure: MemoryPressure::Normal,
                granted_bytes: granted,
                suggested_batch_size_rows: self.base_batch_size_rows,
            }
        } else if ratio >= 0.40 {
            MemoryPressureSignal {
                pressure: MemoryPressure::Elevated,
                granted_bytes: granted,
                suggested_batch_size_rows: (self.base_batch_size_rows / 2)
                    .max(self.min_batch_size_rows),
            }
        } else {
            MemoryPressureSignal {
                pressure: MemoryPressure::Critical,
                granted_bytes: granted,
                suggested_batch_size_rows: (self.base_batch_size_rows / 4)
                    .max(self.min_batch_size_rows),
            }
        }
    }
}

/// RAII reservation that releases pool budget on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    reserved_bytes: usize,
    signal: MemoryPressureSignal,
}

impl MemoryReservation {
    /// Pressure signal for this reservation.
    #[must_use]
    pub fn signal(&self) -> MemoryPressureSignal {
        self.signal
    }

    /// Grow this reservation by `additional_bytes`, re-deriving the signal.
    pub fn grow(&mut self, additional_bytes: usize) {
        if self.pool.budget_bytes == usize::MAX || additional_bytes == 0 {
            return;
        }
        loop {
            let current = self.pool.in_use_bytes.load(Ordering::Acquire);
            let available = self.pool.budget_bytes.saturating_sub(current);
            let granted = additional_bytes.min(available);
            let next = current.saturating_add(granted);
            if self
                .pool
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.reserved_bytes = self.reserved_bytes.saturating_add(granted);
                self.signal = self
                    .pool
                    .signal_for(self.reserved_bytes.max(1), self.reserved_bytes);
                if granted < additional_bytes {
                    self.signal.pressure = MemoryPressure::Critical;
                    self.signal.suggested_batch_size_rows = self.pool.min_batch_size_rows;
                }
                return;
            }
        }
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.reserved_bytes > 0 {
            self.pool
                .in_use_bytes
                .fetch_sub(self.reserved_bytes, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_releases_budget_on_drop() {
        let pool = MemoryPool::new(100, 1024, 128);
        {
            let r1 = pool.reserve(80);
            assert_eq!(r1.signal().granted_bytes, 80);
            let r2 = pool.reserve(80);
            assert_eq!(r2.signal().granted_bytes, 20);
            assert_eq!(r2.signal().pressure, MemoryPressure::Critical);
            assert_eq!(pool.in_use_bytes(), 100);
        }
        let r3 = pool.reserve(100);
        assert_eq!(r3.signal().granted_bytes, 100);
        assert_eq!(r3.signal().pressure, MemoryPressure::Normal);
    }

    #[test]
    fn grow_clamps_to_budget() {
        let pool = MemoryPool::new(100, 1024, 128);
        let mut r = pool.reserve(60);
        r.grow(60);
        assert_eq!(pool.in_use_bytes(), 100);
        assert_eq!(r.signal().pressure, MemoryPressure::Critical);
        drop(r);
        assert_eq!(pool.in_use_bytes(), 0);
    }

    #[test]
    fn unbounded_pool_never_tracks() {
        let pool = MemoryPool::new(usize::MAX, 1024, 128);
        let r = pool.reserve(1 << 40);
        assert_eq!(r.signal().pressure, MemoryPressure::Normal);
        assert_eq!(pool.in_use_bytes(), 0);
    }
}
